//! Health check module
//! Provides health status for the application and its dependencies

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, info};

use crate::cache::RedisPool;
use crate::payments::registry::ChannelRegistry;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Health status response
#[derive(Debug, Serialize, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: HashMap<String, ComponentHealth>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Overall health state
#[derive(Debug, Serialize, Clone, PartialEq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Individual component health status
#[derive(Debug, Serialize, Clone)]
pub struct ComponentHealth {
    pub status: ComponentState,
    pub response_time_ms: Option<u128>,
    pub details: Option<String>,
}

/// Component state
#[derive(Debug, Serialize, Clone, PartialEq)]
pub enum ComponentState {
    Up,
    Down,
    Warning,
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            status: HealthState::Healthy,
            checks: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, HealthState::Healthy)
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentHealth {
    pub fn up(response_time_ms: Option<u128>) -> Self {
        Self {
            status: ComponentState::Up,
            response_time_ms,
            details: None,
        }
    }

    pub fn down(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Down,
            response_time_ms: None,
            details,
        }
    }

    pub fn warning(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Warning,
            response_time_ms: None,
            details,
        }
    }
}

/// Health checker for the application. Stores that were skipped at start-up
/// are simply not reported.
#[derive(Clone)]
pub struct HealthChecker {
    db_pool: Option<sqlx::PgPool>,
    cache_pool: Option<RedisPool>,
    registry: Arc<ChannelRegistry>,
}

impl HealthChecker {
    pub fn new(
        db_pool: Option<sqlx::PgPool>,
        cache_pool: Option<RedisPool>,
        registry: Arc<ChannelRegistry>,
    ) -> Self {
        Self {
            db_pool,
            cache_pool,
            registry,
        }
    }

    /// Perform comprehensive health check
    pub async fn check_health(&self) -> HealthStatus {
        let mut health_status = HealthStatus::new();
        let mut overall_healthy = true;

        if let Some(pool) = &self.db_pool {
            let start = Instant::now();
            let check = timeout(HEALTH_TIMEOUT, crate::database::health_check(pool)).await;
            let component =
                timed_component("database", start, check.map(|r| r.map_err(|e| e.to_string())));
            overall_healthy &= component.status == ComponentState::Up;
            health_status.checks.insert("database".to_string(), component);
        }

        if let Some(pool) = &self.cache_pool {
            let start = Instant::now();
            let check = timeout(HEALTH_TIMEOUT, crate::cache::health_check(pool)).await;
            let component =
                timed_component("cache", start, check.map(|r| r.map_err(|e| e.to_string())));
            overall_healthy &= component.status == ComponentState::Up;
            health_status.checks.insert("cache".to_string(), component);
        }

        // No adapters means every non-internal charge answers "no payment
        // service available"; the process itself is still serving.
        let snapshot = self.registry.snapshot();
        let channels = if snapshot.adapter_count() == 0 {
            ComponentHealth::warning(Some("no channel adapters registered".to_string()))
        } else {
            ComponentHealth {
                details: Some(format!(
                    "{} adapters, {} routes, loaded at {}",
                    snapshot.adapter_count(),
                    snapshot.routes().len(),
                    snapshot.loaded_at()
                )),
                ..ComponentHealth::up(None)
            }
        };
        let degraded = channels.status == ComponentState::Warning;
        health_status.checks.insert("channels".to_string(), channels);

        health_status.status = if !overall_healthy {
            HealthState::Unhealthy
        } else if degraded {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };

        health_status
    }
}

fn timed_component(
    name: &str,
    start: Instant,
    check: Result<Result<(), String>, tokio::time::error::Elapsed>,
) -> ComponentHealth {
    match check {
        Ok(Ok(())) => {
            let elapsed = start.elapsed().as_millis();
            info!(component = name, response_time_ms = elapsed as u64, "health check ok");
            ComponentHealth::up(Some(elapsed))
        }
        Ok(Err(e)) => {
            error!(component = name, error = %e, "health check failed");
            ComponentHealth::down(Some(e))
        }
        Err(_) => {
            error!(component = name, "health check timed out");
            ComponentHealth::down(Some("Timeout".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::InMemoryRouteSource;
    use crate::payments::factory::ChannelAdapterFactory;

    #[tokio::test]
    async fn empty_registry_reports_degraded() {
        let registry = Arc::new(ChannelRegistry::new(
            Arc::new(InMemoryRouteSource::default()),
            Arc::new(ChannelAdapterFactory::new("http://localhost:8000")),
        ));
        let checker = HealthChecker::new(None, None, registry);

        let status = checker.check_health().await;
        assert_eq!(status.status, HealthState::Degraded);
        assert_eq!(status.checks["channels"].status, ComponentState::Warning);
        assert!(!status.checks.contains_key("database"));
    }
}
