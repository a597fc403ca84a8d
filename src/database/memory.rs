//! In-process implementations of the persistence ports, used by tests and by
//! `SKIP_EXTERNALS=true` runs.

use crate::database::error::DatabaseError;
use crate::database::order_repository::{OrderGateway, OrderSnapshot};
use crate::database::payment_repository::{
    InsertOutcome, PaymentLedger, RecordPatch, TransitionOutcome,
};
use crate::database::route_repository::RouteSource;
use crate::payments::types::{ChannelAccount, ChannelCode, ChannelRoute, PaymentRecord, PaymentStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, RwLock};
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// All records behind one mutex, which also serialises inserts.
#[derive(Default)]
pub struct InMemoryPaymentLedger {
    records: Mutex<HashMap<Uuid, PaymentRecord>>,
}

impl InMemoryPaymentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all_for_order(&self, order_id: &str) -> Vec<PaymentRecord> {
        let mut records: Vec<PaymentRecord> = lock(&self.records)
            .values()
            .filter(|r| r.order_id == order_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Overwrite a stored record, e.g. to age it in a test.
    pub fn put(&self, record: PaymentRecord) {
        lock(&self.records).insert(record.id, record);
    }

    fn active_for(records: &HashMap<Uuid, PaymentRecord>, order_id: &str) -> Option<PaymentRecord> {
        records
            .values()
            .filter(|r| r.order_id == order_id && r.status.is_active())
            .max_by_key(|r| r.created_at)
            .cloned()
    }
}

#[async_trait]
impl PaymentLedger for InMemoryPaymentLedger {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentRecord>, DatabaseError> {
        Ok(lock(&self.records).get(&id).cloned())
    }

    async fn find_by_channel_payment_id(
        &self,
        channel: ChannelCode,
        channel_payment_id: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        Ok(lock(&self.records)
            .values()
            .filter(|r| {
                r.channel_code == Some(channel)
                    && r.channel_payment_id.as_deref() == Some(channel_payment_id)
            })
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn find_active(&self, order_id: &str) -> Result<Option<PaymentRecord>, DatabaseError> {
        Ok(Self::active_for(&lock(&self.records), order_id))
    }

    async fn insert_pending(&self, record: PaymentRecord) -> Result<InsertOutcome, DatabaseError> {
        let mut records = lock(&self.records);
        if let Some(existing) = Self::active_for(&records, &record.order_id) {
            return Ok(InsertOutcome::Existing(existing));
        }
        records.insert(record.id, record.clone());
        Ok(InsertOutcome::Created(record))
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: &[PaymentStatus],
        patch: &RecordPatch,
    ) -> Result<TransitionOutcome, DatabaseError> {
        let mut records = lock(&self.records);
        let Some(record) = records.get_mut(&id) else {
            return Ok(TransitionOutcome::Missing);
        };
        if !expected.contains(&record.status) {
            return Ok(TransitionOutcome::Unchanged(record.clone()));
        }
        patch.apply_to(record);
        Ok(TransitionOutcome::Applied(record.clone()))
    }
}

#[derive(Default)]
pub struct InMemoryRouteSource {
    routes: RwLock<Vec<ChannelRoute>>,
    accounts: RwLock<Vec<ChannelAccount>>,
}

impl InMemoryRouteSource {
    pub fn new(routes: Vec<ChannelRoute>, accounts: Vec<ChannelAccount>) -> Self {
        Self {
            routes: RwLock::new(routes),
            accounts: RwLock::new(accounts),
        }
    }

    pub fn set_routes(&self, routes: Vec<ChannelRoute>) {
        *self.routes.write().unwrap_or_else(|p| p.into_inner()) = routes;
    }

    pub fn set_accounts(&self, accounts: Vec<ChannelAccount>) {
        *self.accounts.write().unwrap_or_else(|p| p.into_inner()) = accounts;
    }
}

#[async_trait]
impl RouteSource for InMemoryRouteSource {
    async fn load_routes(&self) -> Result<Vec<ChannelRoute>, DatabaseError> {
        Ok(self.routes.read().unwrap_or_else(|p| p.into_inner()).clone())
    }

    async fn load_accounts(&self) -> Result<Vec<ChannelAccount>, DatabaseError> {
        Ok(self
            .accounts
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|a| a.is_enabled)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryOrderGateway {
    orders: Mutex<HashMap<String, OrderSnapshot>>,
    rechecks: Mutex<Vec<String>>,
}

impl InMemoryOrderGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, order: OrderSnapshot) {
        lock(&self.orders).insert(order.order_id.clone(), order);
    }

    /// Order ids passed to `recheck_order_payment`, in call order.
    pub fn rechecks(&self) -> Vec<String> {
        lock(&self.rechecks).clone()
    }
}

#[async_trait]
impl OrderGateway for InMemoryOrderGateway {
    async fn fetch_order(&self, order_id: &str) -> Result<Option<OrderSnapshot>, DatabaseError> {
        Ok(lock(&self.orders).get(order_id).cloned())
    }

    async fn recheck_order_payment(&self, order_id: &str) -> Result<(), DatabaseError> {
        lock(&self.rechecks).push(order_id.to_string());
        Ok(())
    }
}
