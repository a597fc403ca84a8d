use crate::payments::provider::ChannelAdapter;
use crate::payments::registry::{ChannelRegistry, RegistrySnapshot};
use crate::payments::types::{ChannelRoute, PaymentMethod};
use bigdecimal::BigDecimal;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RoutingError {
    #[error("no channel route for method={method} currency={currency} region={region} amount={amount}")]
    NotFound {
        method: PaymentMethod,
        currency: String,
        region: String,
        amount: BigDecimal,
    },
}

/// The chosen route and the adapter that serves it.
#[derive(Clone)]
pub struct RouteSelection {
    pub route: ChannelRoute,
    pub adapter: Arc<dyn ChannelAdapter>,
}

impl std::fmt::Debug for RouteSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteSelection")
            .field("route", &self.route)
            .field("account", &self.adapter.account_id())
            .finish()
    }
}

/// Picks a channel account for a payment from the current registry snapshot.
pub struct Router {
    registry: Arc<ChannelRegistry>,
}

impl Router {
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self { registry }
    }

    pub fn select_route(
        &self,
        method: PaymentMethod,
        currency: &str,
        region: &str,
        amount: &BigDecimal,
    ) -> Result<RouteSelection, RoutingError> {
        let snapshot = self.registry.snapshot();
        match select_from(&snapshot, method, currency, region, amount) {
            Some(selection) => {
                debug!(
                    router_id = %selection.route.router_id,
                    account = %selection.route.channel_account_id,
                    channel = %selection.route.channel_code,
                    "route selected"
                );
                Ok(selection)
            }
            None => {
                info!(
                    method = %method,
                    currency = %currency,
                    region = %region,
                    amount = %amount,
                    "no channel route matched"
                );
                Err(RoutingError::NotFound {
                    method,
                    currency: currency.to_string(),
                    region: region.to_string(),
                    amount: amount.clone(),
                })
            }
        }
    }
}

/// Deterministic selection: filter by method, region, currency and amount
/// range, then take the lowest priority whose account is registered. Equal
/// priorities fall back to configuration position, then router id.
pub fn select_from(
    snapshot: &RegistrySnapshot,
    method: PaymentMethod,
    currency: &str,
    region: &str,
    amount: &BigDecimal,
) -> Option<RouteSelection> {
    let mut candidates: Vec<&ChannelRoute> = snapshot
        .routes()
        .iter()
        .filter(|route| route.matches_method(method))
        .filter(|route| route.matches_region(region))
        .filter(|route| route.covers_amount(currency, amount))
        .collect();

    candidates.sort_by(|a, b| {
        (a.priority, a.position, &a.router_id).cmp(&(b.priority, b.position, &b.router_id))
    });

    candidates.into_iter().find_map(|route| {
        let adapter = snapshot.adapter(&route.channel_account_id)?;
        if route.channel_code != adapter.channel_code() {
            return None;
        }
        if route.is_method_wildcard() && !adapter.supports_method(method) {
            return None;
        }
        Some(RouteSelection {
            route: route.clone(),
            adapter,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::InMemoryRouteSource;
    use crate::payments::factory::ChannelAdapterFactory;
    use crate::payments::types::{ChannelAccount, ChannelCode};

    fn route(
        id: &str,
        code: ChannelCode,
        account: &str,
        method: &str,
        region: &str,
        priority: i32,
        position: i32,
    ) -> ChannelRoute {
        ChannelRoute {
            router_id: id.to_string(),
            channel_code: code,
            channel_account_id: account.to_string(),
            payment_method: method.to_string(),
            currency: "KES".to_string(),
            region: region.to_string(),
            min_amount: BigDecimal::from(10),
            max_amount: Some(BigDecimal::from(150_000)),
            priority,
            position,
        }
    }

    fn accounts() -> Vec<ChannelAccount> {
        vec![
            ChannelAccount {
                account_id: "mpesa-ke".to_string(),
                channel_code: ChannelCode::Mpesa,
                is_enabled: true,
                settings: serde_json::json!({
                    "consumer_key": "ck", "consumer_secret": "cs",
                    "passkey": "pk", "shortcode": "174379",
                    "callback_secret": "cb"
                }),
                updated_at: chrono::Utc::now(),
            },
            ChannelAccount {
                account_id: "fw-ke".to_string(),
                channel_code: ChannelCode::Flutterwave,
                is_enabled: true,
                settings: serde_json::json!({"secret_key": "sk", "webhook_secret": "h"}),
                updated_at: chrono::Utc::now(),
            },
        ]
    }

    async fn router_with(routes: Vec<ChannelRoute>) -> Router {
        let source = Arc::new(InMemoryRouteSource::new(routes, accounts()));
        let registry = Arc::new(ChannelRegistry::new(
            source,
            Arc::new(ChannelAdapterFactory::new("https://pay.example.com")),
        ));
        registry.refresh().await.unwrap();
        Router::new(registry)
    }

    #[tokio::test]
    async fn lowest_priority_wins_and_ties_keep_configuration_order() {
        let router = router_with(vec![
            route("r1", ChannelCode::Flutterwave, "fw-ke", "mobile_money", "*", 2, 0),
            route("r2", ChannelCode::Mpesa, "mpesa-ke", "mobile_money", "KE", 1, 1),
            route("r3", ChannelCode::Flutterwave, "fw-ke", "mobile_money", "KE", 1, 2),
        ])
        .await;

        for _ in 0..5 {
            let selection = router
                .select_route(
                    PaymentMethod::MobileMoney,
                    "KES",
                    "KE",
                    &BigDecimal::from(5000),
                )
                .unwrap();
            assert_eq!(selection.route.router_id, "r2");
        }
    }

    #[tokio::test]
    async fn equal_priority_and_position_break_ties_by_router_id() {
        let routes = vec![
            route("r-b", ChannelCode::Mpesa, "mpesa-ke", "mobile_money", "KE", 1, 0),
            route("r-a", ChannelCode::Flutterwave, "fw-ke", "mobile_money", "KE", 1, 0),
        ];
        let mut reversed = routes.clone();
        reversed.reverse();

        for routes in [routes, reversed] {
            let router = router_with(routes).await;
            let selection = router
                .select_route(
                    PaymentMethod::MobileMoney,
                    "KES",
                    "KE",
                    &BigDecimal::from(5000),
                )
                .unwrap();
            assert_eq!(selection.route.router_id, "r-a");
        }
    }

    #[tokio::test]
    async fn wildcard_method_requires_adapter_support() {
        let router = router_with(vec![
            route("card-any", ChannelCode::Mpesa, "mpesa-ke", "*", "*", 1, 0),
            route("card-fw", ChannelCode::Flutterwave, "fw-ke", "*", "*", 2, 1),
        ])
        .await;

        let card = router
            .select_route(PaymentMethod::Card, "KES", "KE", &BigDecimal::from(500))
            .unwrap();
        assert_eq!(card.route.router_id, "card-fw");

        let momo = router
            .select_route(
                PaymentMethod::MobileMoney,
                "KES",
                "KE",
                &BigDecimal::from(500),
            )
            .unwrap();
        assert_eq!(momo.route.router_id, "card-any");
    }

    #[tokio::test]
    async fn out_of_range_or_unregistered_is_not_found() {
        let router = router_with(vec![
            route("r1", ChannelCode::Mpesa, "mpesa-ke", "mobile_money", "KE", 1, 0),
            route("ghost", ChannelCode::Paystack, "ps-missing", "mobile_money", "*", 0, 1),
        ])
        .await;

        let too_big = router.select_route(
            PaymentMethod::MobileMoney,
            "KES",
            "KE",
            &BigDecimal::from(150_001),
        );
        assert!(matches!(too_big, Err(RoutingError::NotFound { .. })));

        let wrong_region = router.select_route(
            PaymentMethod::MobileMoney,
            "KES",
            "UG",
            &BigDecimal::from(500),
        );
        assert!(wrong_region.is_err());

        let ok = router
            .select_route(
                PaymentMethod::MobileMoney,
                "KES",
                "ke",
                &BigDecimal::from(150_000),
            )
            .unwrap();
        assert_eq!(ok.route.router_id, "r1");
    }
}
