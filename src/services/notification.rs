use crate::payments::types::PaymentRecord;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NotificationType {
    PaymentSucceeded,
    PaymentFailed,
    PaymentCancelled,
    PaymentRefunded,
}

impl NotificationType {
    /// Notification for a terminal status, if one is sent.
    pub fn for_record(record: &PaymentRecord) -> Option<Self> {
        use crate::payments::types::PaymentStatus;

        match record.status {
            PaymentStatus::Success => Some(NotificationType::PaymentSucceeded),
            PaymentStatus::Failed => Some(NotificationType::PaymentFailed),
            PaymentStatus::Cancelled => Some(NotificationType::PaymentCancelled),
            PaymentStatus::Refunded => Some(NotificationType::PaymentRefunded),
            PaymentStatus::Pending => None,
        }
    }
}

/// Buyer notifications. Delivery (email, SMS, push) is owned elsewhere; this
/// service records the event as a structured log line.
#[derive(Debug, Default, Clone)]
pub struct NotificationService;

impl NotificationService {
    pub fn new() -> Self {
        Self
    }

    pub async fn send_notification(
        &self,
        record: &PaymentRecord,
        notification_type: NotificationType,
    ) {
        let channel = record
            .channel_code
            .map(|c| c.to_string())
            .unwrap_or_default();

        match notification_type {
            NotificationType::PaymentSucceeded => {
                info!(
                    payment_id = %record.id,
                    order_id = %record.order_id,
                    user_id = %record.user_id,
                    amount = %record.amount,
                    currency = %record.currency,
                    channel = %channel,
                    "🔔 NOTIFICATION: Payment succeeded"
                );
            }
            NotificationType::PaymentFailed => {
                warn!(
                    payment_id = %record.id,
                    order_id = %record.order_id,
                    user_id = %record.user_id,
                    result_code = record.result_code.as_deref().unwrap_or(""),
                    "🔔 NOTIFICATION: Payment failed"
                );
            }
            NotificationType::PaymentCancelled => {
                info!(
                    payment_id = %record.id,
                    order_id = %record.order_id,
                    user_id = %record.user_id,
                    "🔔 NOTIFICATION: Payment cancelled"
                );
            }
            NotificationType::PaymentRefunded => {
                info!(
                    payment_id = %record.id,
                    order_id = %record.order_id,
                    user_id = %record.user_id,
                    amount = %record.amount,
                    currency = %record.currency,
                    "🔔 NOTIFICATION: Payment refunded"
                );
            }
        }
    }
}
