use crate::database::error::DatabaseError;
use crate::database::route_repository::RouteSource;
use crate::payments::factory::AdapterBuilder;
use crate::payments::provider::ChannelAdapter;
use crate::payments::types::{ChannelAccount, ChannelCode, ChannelRoute};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to load routing configuration: {0}")]
    Load(#[from] DatabaseError),
}

/// Immutable view of routes and live adapters for one load cycle.
pub struct RegistrySnapshot {
    routes: Vec<ChannelRoute>,
    adapters: HashMap<String, Arc<dyn ChannelAdapter>>,
    accounts: HashMap<String, ChannelAccount>,
    loaded_at: DateTime<Utc>,
}

impl RegistrySnapshot {
    pub fn empty() -> Self {
        Self {
            routes: Vec::new(),
            adapters: HashMap::new(),
            accounts: HashMap::new(),
            loaded_at: Utc::now(),
        }
    }

    /// Routes in configuration order.
    pub fn routes(&self) -> &[ChannelRoute] {
        &self.routes
    }

    pub fn adapter(&self, account_id: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(account_id).cloned()
    }

    pub fn adapter_count(&self) -> usize {
        self.adapters.len()
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSummary {
    pub routes: usize,
    pub adapters: usize,
    pub reused: usize,
    pub failed: usize,
}

/// Holds the current snapshot. A refresh builds a complete new snapshot off to
/// the side and swaps it in, so readers never see a partially built map.
pub struct ChannelRegistry {
    source: Arc<dyn RouteSource>,
    builder: Arc<dyn AdapterBuilder>,
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl ChannelRegistry {
    pub fn new(source: Arc<dyn RouteSource>, builder: Arc<dyn AdapterBuilder>) -> Self {
        Self {
            source,
            builder,
            current: RwLock::new(Arc::new(RegistrySnapshot::empty())),
        }
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn adapter(&self, account_id: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.snapshot().adapter(account_id)
    }

    /// Reload routes and accounts. On a load failure the previous snapshot
    /// stays in place. Adapters whose account is unchanged are carried over so
    /// cached tokens survive.
    pub async fn refresh(&self) -> Result<RefreshSummary, RegistryError> {
        let routes = self.source.load_routes().await?;
        let accounts = self.source.load_accounts().await?;
        let previous = self.snapshot();

        let mut adapters: HashMap<String, Arc<dyn ChannelAdapter>> = HashMap::new();
        let mut account_map = HashMap::new();
        let mut reused = 0;
        let mut failed = 0;

        for account in accounts {
            if !account.is_enabled || account.channel_code.is_internal() {
                continue;
            }
            let unchanged = previous
                .accounts
                .get(&account.account_id)
                .map(|old| old == &account)
                .unwrap_or(false);

            let adapter = match previous.adapters.get(&account.account_id) {
                Some(existing) if unchanged => {
                    reused += 1;
                    Some(existing.clone())
                }
                _ => match self.builder.build(&account) {
                    Ok(adapter) => Some(adapter),
                    Err(err) => {
                        failed += 1;
                        warn!(
                            account_id = %account.account_id,
                            channel = %account.channel_code,
                            error = %err,
                            "channel account could not be initialised; routes to it are unavailable"
                        );
                        None
                    }
                },
            };

            if let Some(adapter) = adapter {
                adapters.insert(account.account_id.clone(), adapter);
                account_map.insert(account.account_id.clone(), account);
            }
        }

        let summary = RefreshSummary {
            routes: routes.len(),
            adapters: adapters.len(),
            reused,
            failed,
        };
        let snapshot = Arc::new(RegistrySnapshot {
            routes,
            adapters,
            accounts: account_map,
            loaded_at: Utc::now(),
        });

        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = snapshot;

        info!(
            routes = summary.routes,
            adapters = summary.adapters,
            reused = summary.reused,
            failed = summary.failed,
            "channel registry refreshed"
        );
        Ok(summary)
    }

    /// First registered adapter for a channel; used when a webhook arrives
    /// before the record it refers to can be resolved.
    pub fn adapter_for_channel(&self, code: ChannelCode) -> Option<Arc<dyn ChannelAdapter>> {
        let snapshot = self.snapshot();
        let mut ids: Vec<&String> = snapshot
            .adapters
            .iter()
            .filter(|(_, a)| a.channel_code() == code)
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        ids.first().and_then(|id| snapshot.adapter(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::InMemoryRouteSource;
    use crate::payments::error::PaymentResult;
    use crate::payments::factory::ChannelAdapterFactory;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBuilder {
        inner: ChannelAdapterFactory,
        builds: AtomicUsize,
    }

    impl AdapterBuilder for CountingBuilder {
        fn build(&self, account: &ChannelAccount) -> PaymentResult<Arc<dyn ChannelAdapter>> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            self.inner.build(account)
        }
    }

    fn account(id: &str, code: ChannelCode, settings: serde_json::Value) -> ChannelAccount {
        ChannelAccount {
            account_id: id.to_string(),
            channel_code: code,
            is_enabled: true,
            settings,
            updated_at: DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[tokio::test]
    async fn refresh_swaps_snapshot_and_reuses_unchanged_adapters() {
        let fw = account(
            "fw-rw",
            ChannelCode::Flutterwave,
            serde_json::json!({"secret_key": "sk", "webhook_secret": "h"}),
        );
        let source = Arc::new(InMemoryRouteSource::new(Vec::new(), vec![fw.clone()]));
        let builder = Arc::new(CountingBuilder {
            inner: ChannelAdapterFactory::new("https://pay.example.com"),
            builds: AtomicUsize::new(0),
        });
        let registry = ChannelRegistry::new(source.clone(), builder.clone());
        assert!(registry.adapter("fw-rw").is_none());

        let before = registry.snapshot();
        registry.refresh().await.unwrap();
        assert!(registry.adapter("fw-rw").is_some());
        // Readers holding the old snapshot keep a consistent view.
        assert_eq!(before.adapter_count(), 0);

        let first = registry.adapter("fw-rw").unwrap();
        let summary = registry.refresh().await.unwrap();
        assert_eq!(summary.reused, 1);
        assert_eq!(builder.builds.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &registry.adapter("fw-rw").unwrap()));

        source.set_accounts(vec![account(
            "fw-rw",
            ChannelCode::Flutterwave,
            serde_json::json!({"secret_key": "rotated", "webhook_secret": "h"}),
        )]);
        registry.refresh().await.unwrap();
        assert_eq!(builder.builds.load(Ordering::SeqCst), 2);
        assert!(!Arc::ptr_eq(&first, &registry.adapter("fw-rw").unwrap()));
    }

    #[tokio::test]
    async fn broken_account_is_skipped_not_fatal() {
        let source = Arc::new(InMemoryRouteSource::new(
            Vec::new(),
            vec![
                account("broken", ChannelCode::Paystack, serde_json::json!({})),
                account(
                    "ps-ng",
                    ChannelCode::Paystack,
                    serde_json::json!({"secret_key": "sk"}),
                ),
            ],
        ));
        let registry = ChannelRegistry::new(
            source,
            Arc::new(ChannelAdapterFactory::new("https://pay.example.com")),
        );
        let summary = registry.refresh().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert!(registry.adapter("broken").is_none());
        assert!(registry
            .adapter_for_channel(ChannelCode::Paystack)
            .is_some());
        assert!(registry.adapter_for_channel(ChannelCode::Mpesa).is_none());
    }
}
