//! Short-lived checkout tickets.
//!
//! A ticket lets the buyer's client poll one payment by an opaque short id
//! while the provider completes out of band. Tickets are read-only after
//! issue and disappear with their TTL.

use crate::cache::keys::checkout::TicketKey;
use crate::cache::{Cache, CacheError, RedisCache};
use crate::database::error::DatabaseError;
use crate::database::order_repository::{OrderGateway, OrderStatus};
use crate::database::payment_repository::PaymentLedger;
use crate::error::{AppError, AppErrorKind, DomainError};
use crate::payments::types::{ChannelCode, PaymentRecord, PaymentStatus};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Stored entries outlive `expires_at` by this much so a late read reports
/// `Expired` rather than `NotFound`.
const EXPIRED_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckoutTicket {
    pub checkout_id: String,
    pub user_id: String,
    pub order_id: String,
    pub payment_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl CheckoutTicket {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// 12 URL-safe characters from 72 random bits.
pub fn generate_checkout_id() -> String {
    URL_SAFE_NO_PAD.encode(&Uuid::new_v4().as_bytes()[..9])
}

#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn put(&self, ticket: &CheckoutTicket, ttl: Duration) -> Result<(), CacheError>;

    async fn get(&self, checkout_id: &str) -> Result<Option<CheckoutTicket>, CacheError>;
}

#[async_trait]
impl TicketStore for RedisCache {
    async fn put(&self, ticket: &CheckoutTicket, ttl: Duration) -> Result<(), CacheError> {
        let key = TicketKey::new(&ticket.checkout_id).to_string();
        <RedisCache as Cache<CheckoutTicket>>::set(self, &key, ticket, Some(ttl + EXPIRED_RETENTION))
            .await
    }

    async fn get(&self, checkout_id: &str) -> Result<Option<CheckoutTicket>, CacheError> {
        let key = TicketKey::new(checkout_id).to_string();
        <RedisCache as Cache<CheckoutTicket>>::get(self, &key).await
    }
}

/// Process-local store for tests and `SKIP_EXTERNALS` runs.
#[derive(Default)]
pub struct InMemoryTicketStore {
    tickets: Mutex<HashMap<String, CheckoutTicket>>,
}

impl InMemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TicketStore for InMemoryTicketStore {
    async fn put(&self, ticket: &CheckoutTicket, _ttl: Duration) -> Result<(), CacheError> {
        self.tickets
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(ticket.checkout_id.clone(), ticket.clone());
        Ok(())
    }

    async fn get(&self, checkout_id: &str) -> Result<Option<CheckoutTicket>, CacheError> {
        Ok(self
            .tickets
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(checkout_id)
            .cloned())
    }
}

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("checkout {checkout_id} not found")]
    NotFound { checkout_id: String },

    #[error("checkout {checkout_id} expired")]
    Expired { checkout_id: String },

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("ledger error: {0}")]
    Ledger(#[from] DatabaseError),
}

impl From<CheckoutError> for AppError {
    fn from(err: CheckoutError) -> Self {
        match err {
            CheckoutError::NotFound { checkout_id } => {
                AppError::new(AppErrorKind::Domain(DomainError::CheckoutNotFound { checkout_id }))
            }
            CheckoutError::Expired { checkout_id } => {
                AppError::new(AppErrorKind::Domain(DomainError::CheckoutExpired { checkout_id }))
            }
            CheckoutError::Cache(e) => e.into(),
            CheckoutError::Ledger(e) => e.into(),
        }
    }
}

/// Payment fields a polling client needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckoutPayment {
    pub payment_id: Uuid,
    pub status: PaymentStatus,
    pub channel_code: Option<ChannelCode>,
    pub redirect_url: Option<String>,
    pub client_token: Option<String>,
    /// Buyer-facing reason for a failed or cancelled attempt.
    pub reason: Option<String>,
}

impl From<&PaymentRecord> for CheckoutPayment {
    fn from(record: &PaymentRecord) -> Self {
        Self {
            payment_id: record.id,
            status: record.status,
            channel_code: record.channel_code,
            redirect_url: record.redirect_url.clone(),
            client_token: record.client_token.clone(),
            reason: record.client_reason(),
        }
    }
}

/// Combined order and payment state behind a checkout id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckoutStatus {
    pub checkout_id: String,
    pub order_id: String,
    /// `None` when the order side no longer knows the order.
    pub order_status: Option<OrderStatus>,
    pub payment: Option<CheckoutPayment>,
    pub expires_at: DateTime<Utc>,
}

pub struct CheckoutService {
    store: Arc<dyn TicketStore>,
    orders: Arc<dyn OrderGateway>,
    ledger: Arc<dyn PaymentLedger>,
    ttl: Duration,
}

impl CheckoutService {
    pub fn new(
        store: Arc<dyn TicketStore>,
        orders: Arc<dyn OrderGateway>,
        ledger: Arc<dyn PaymentLedger>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            orders,
            ledger,
            ttl,
        }
    }

    /// Issue a ticket for a pending payment. A cache failure only costs the
    /// client its polling shortcut, so it is logged and `None` returned.
    pub async fn issue(&self, record: &PaymentRecord) -> Option<String> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::minutes(15));
        let ticket = CheckoutTicket {
            checkout_id: generate_checkout_id(),
            user_id: record.user_id.clone(),
            order_id: record.order_id.clone(),
            payment_id: record.id,
            expires_at: Utc::now() + ttl,
        };

        match self.store.put(&ticket, self.ttl).await {
            Ok(()) => {
                debug!(checkout_id = %ticket.checkout_id, payment_id = %record.id, "checkout ticket issued");
                Some(ticket.checkout_id)
            }
            Err(e) => {
                warn!(payment_id = %record.id, error = %e, "checkout ticket could not be stored");
                None
            }
        }
    }

    /// Read a ticket on behalf of `caller`. Another user's ticket is
    /// indistinguishable from a missing one.
    pub async fn get(&self, checkout_id: &str, caller: &str) -> Result<CheckoutStatus, CheckoutError> {
        let not_found = || CheckoutError::NotFound {
            checkout_id: checkout_id.to_string(),
        };

        let ticket = self.store.get(checkout_id).await?.ok_or_else(not_found)?;
        if ticket.user_id != caller {
            return Err(not_found());
        }
        if ticket.is_expired(Utc::now()) {
            return Err(CheckoutError::Expired {
                checkout_id: checkout_id.to_string(),
            });
        }

        let order_status = self
            .orders
            .fetch_order(&ticket.order_id)
            .await?
            .map(|order| order.status);
        let payment = self
            .ledger
            .find_by_id(ticket.payment_id)
            .await?
            .map(|record| CheckoutPayment::from(&record));

        Ok(CheckoutStatus {
            checkout_id: ticket.checkout_id,
            order_id: ticket.order_id,
            order_status,
            payment,
            expires_at: ticket.expires_at,
        })
    }
}
