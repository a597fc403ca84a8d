use crate::database::error::DatabaseError;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use tracing::info;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    AwaitingPayment,
    Paid,
    Cancelled,
    Closed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::AwaitingPayment => "awaiting_payment",
            OrderStatus::Paid => "paid",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Closed => "closed",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "awaiting_payment" | "pending_payment" => OrderStatus::AwaitingPayment,
            "paid" => OrderStatus::Paid,
            "cancelled" => OrderStatus::Cancelled,
            _ => OrderStatus::Closed,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the payment side needs to know about an order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderSnapshot {
    pub order_id: String,
    pub user_id: String,
    pub amount: BigDecimal,
    pub currency: String,
    pub region: String,
    pub status: OrderStatus,
    /// Test orders settle through the sandbox channel.
    pub is_test: bool,
}

/// Port onto the order domain, which this crate does not own.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn fetch_order(&self, order_id: &str) -> Result<Option<OrderSnapshot>, DatabaseError>;

    /// Ask the order side to re-evaluate payment state after a settlement.
    async fn recheck_order_payment(&self, order_id: &str) -> Result<(), DatabaseError>;
}

#[derive(Debug, Clone, FromRow)]
struct OrderRow {
    order_id: String,
    user_id: String,
    total_amount: BigDecimal,
    currency: String,
    region: String,
    status: String,
    is_test: bool,
}

/// Reads the marketplace `orders` table.
pub struct PgOrderGateway {
    pool: PgPool,
}

impl PgOrderGateway {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderGateway for PgOrderGateway {
    async fn fetch_order(&self, order_id: &str) -> Result<Option<OrderSnapshot>, DatabaseError> {
        let row = sqlx::query_as::<_, OrderRow>(
            "SELECT order_id, user_id, total_amount, currency, region, status, is_test
             FROM orders
             WHERE order_id = $1",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(row.map(|row| OrderSnapshot {
            order_id: row.order_id,
            user_id: row.user_id,
            amount: row.total_amount,
            currency: row.currency.to_uppercase(),
            region: row.region,
            status: OrderStatus::parse(&row.status),
            is_test: row.is_test,
        }))
    }

    async fn recheck_order_payment(&self, order_id: &str) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE orders SET status = 'paid', updated_at = NOW()
             WHERE order_id = $1
               AND status = 'awaiting_payment'
               AND EXISTS (
                   SELECT 1 FROM payments
                   WHERE payments.order_id = $1 AND payments.status = 'success'
               )",
        )
        .bind(order_id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if result.rows_affected() > 0 {
            info!(order_id = %order_id, "order marked paid");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_order_states_are_not_chargeable() {
        assert_eq!(
            OrderStatus::parse("awaiting_payment"),
            OrderStatus::AwaitingPayment
        );
        assert_eq!(OrderStatus::parse("shipped"), OrderStatus::Closed);
    }
}
