use crate::database::error::DatabaseError;
use crate::payments::types::{ChannelAccount, ChannelCode, ChannelRoute};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use tracing::warn;

/// Where routing rules and channel accounts are loaded from.
#[async_trait]
pub trait RouteSource: Send + Sync {
    /// Routes in configuration order.
    async fn load_routes(&self) -> Result<Vec<ChannelRoute>, DatabaseError>;

    /// Enabled accounts only.
    async fn load_accounts(&self) -> Result<Vec<ChannelAccount>, DatabaseError>;
}

#[derive(Debug, Clone, FromRow)]
struct RouteRow {
    router_id: String,
    channel_code: String,
    channel_account_id: String,
    payment_method: String,
    currency: String,
    region: String,
    min_amount: BigDecimal,
    max_amount: Option<BigDecimal>,
    priority: i32,
    position: i32,
}

#[derive(Debug, Clone, FromRow)]
struct AccountRow {
    account_id: String,
    channel_code: String,
    is_enabled: bool,
    settings: serde_json::Value,
    updated_at: chrono::DateTime<chrono::Utc>,
}

/// Reads `channel_routes` and `channel_accounts`.
pub struct PgRouteSource {
    pool: PgPool,
}

impl PgRouteSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RouteSource for PgRouteSource {
    async fn load_routes(&self) -> Result<Vec<ChannelRoute>, DatabaseError> {
        let rows = sqlx::query_as::<_, RouteRow>(
            "SELECT router_id, channel_code, channel_account_id, payment_method, currency,
                    region, min_amount, max_amount, priority, position
             FROM channel_routes
             WHERE is_active = true
             ORDER BY position ASC, router_id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        // A row with an unknown channel is skipped rather than failing the
        // whole refresh, so one bad row cannot take routing down.
        Ok(rows
            .into_iter()
            .filter_map(|row| match ChannelCode::from_str(&row.channel_code) {
                Ok(channel_code) => Some(ChannelRoute {
                    router_id: row.router_id,
                    channel_code,
                    channel_account_id: row.channel_account_id,
                    payment_method: row.payment_method,
                    currency: row.currency.to_uppercase(),
                    region: row.region,
                    min_amount: row.min_amount,
                    max_amount: row.max_amount,
                    priority: row.priority,
                    position: row.position,
                }),
                Err(_) => {
                    warn!(router_id = %row.router_id, channel = %row.channel_code, "skipping route with unknown channel");
                    None
                }
            })
            .collect())
    }

    async fn load_accounts(&self) -> Result<Vec<ChannelAccount>, DatabaseError> {
        let rows = sqlx::query_as::<_, AccountRow>(
            "SELECT account_id, channel_code, is_enabled, settings, updated_at
             FROM channel_accounts
             WHERE is_enabled = true
             ORDER BY account_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match ChannelCode::from_str(&row.channel_code) {
                Ok(channel_code) => Some(ChannelAccount {
                    account_id: row.account_id,
                    channel_code,
                    is_enabled: row.is_enabled,
                    settings: row.settings,
                    updated_at: row.updated_at,
                }),
                Err(_) => {
                    warn!(account_id = %row.account_id, channel = %row.channel_code, "skipping account with unknown channel");
                    None
                }
            })
            .collect())
    }
}
