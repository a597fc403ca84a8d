//! Fire-and-forget side effects of payment state changes.
//!
//! Request paths submit onto a bounded queue and never wait for the work.
//! A full queue drops the task with a warning; the order side re-reads
//! payment state on its own schedule, so a lost recheck delays but never
//! loses a settlement.

use crate::database::order_repository::OrderGateway;
use crate::payments::types::PaymentRecord;
use crate::services::notification::{NotificationService, NotificationType};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum BackgroundTask {
    /// Ask the order domain to re-evaluate payment state.
    RecheckOrderPayment { order_id: String, payment_id: Uuid },
    /// Tell the buyer about a terminal payment.
    Notify { payment: Box<PaymentRecord> },
}

impl BackgroundTask {
    pub fn kind(&self) -> &'static str {
        match self {
            BackgroundTask::RecheckOrderPayment { .. } => "recheck_order_payment",
            BackgroundTask::Notify { .. } => "notify",
        }
    }
}

/// Submission side of the queue. Cheap to clone.
#[derive(Clone)]
pub struct TaskQueue {
    sender: mpsc::Sender<BackgroundTask>,
}

impl TaskQueue {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<BackgroundTask>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Never blocks. Returns false when the task was dropped.
    pub fn submit(&self, task: BackgroundTask) -> bool {
        let kind = task.kind();
        match self.sender.try_send(task) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(task = kind, "background queue full, task dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(task = kind, "background worker stopped, task dropped");
                false
            }
        }
    }
}

pub struct BackgroundWorker {
    orders: Arc<dyn OrderGateway>,
    notifications: NotificationService,
}

impl BackgroundWorker {
    pub fn new(orders: Arc<dyn OrderGateway>, notifications: NotificationService) -> Self {
        Self {
            orders,
            notifications,
        }
    }

    pub async fn run(
        self,
        mut receiver: mpsc::Receiver<BackgroundTask>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("background task worker started");

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                task = receiver.recv() => match task {
                    Some(task) => self.handle(task).await,
                    None => break,
                },
            }
        }

        // Finish what was already accepted.
        receiver.close();
        while let Some(task) = receiver.recv().await {
            self.handle(task).await;
        }

        info!("background task worker stopped");
    }

    /// Execute one task. Failures are logged, never retried here.
    pub async fn handle(&self, task: BackgroundTask) {
        match task {
            BackgroundTask::RecheckOrderPayment {
                order_id,
                payment_id,
            } => match self.orders.recheck_order_payment(&order_id).await {
                Ok(()) => debug!(order_id = %order_id, payment_id = %payment_id, "order payment rechecked"),
                Err(e) => warn!(
                    order_id = %order_id,
                    payment_id = %payment_id,
                    error = %e,
                    "order payment recheck failed"
                ),
            },
            BackgroundTask::Notify { payment } => {
                if let Some(kind) = NotificationType::for_record(&payment) {
                    self.notifications.send_notification(&payment, kind).await;
                }
            }
        }
    }
}
