use anyhow::Context;
use marketpay_backend::api::{self, ApiServices};
use marketpay_backend::cache::{init_cache_pool, CacheConfig, RedisCache};
use marketpay_backend::config::AppConfig;
use marketpay_backend::database::memory::{
    InMemoryOrderGateway, InMemoryPaymentLedger, InMemoryRouteSource,
};
use marketpay_backend::database::order_repository::{OrderGateway, PgOrderGateway};
use marketpay_backend::database::payment_repository::{PaymentLedger, PgPaymentLedger};
use marketpay_backend::database::route_repository::{PgRouteSource, RouteSource};
use marketpay_backend::database::init_pool_from_config;
use marketpay_backend::health::HealthChecker;
use marketpay_backend::logging::init_tracing;
use marketpay_backend::payments::factory::ChannelAdapterFactory;
use marketpay_backend::payments::registry::ChannelRegistry;
use marketpay_backend::services::checkout::{CheckoutService, InMemoryTicketStore, TicketStore};
use marketpay_backend::services::notification::NotificationService;
use marketpay_backend::services::payment_orchestrator::{OrchestratorConfig, PaymentOrchestrator};
use marketpay_backend::services::webhook_processor::WebhookProcessor;
use marketpay_backend::workers::{BackgroundWorker, RouteRefreshWorker, TaskQueue};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("failed to load configuration")?;
    init_tracing(&config.logging);
    config.validate().context("invalid configuration")?;

    info!(
        skip_externals = config.skip_externals,
        sandbox_mode = config.payment.sandbox_mode,
        "🚀 Starting marketplace payment backend"
    );

    let (db_pool, ledger, orders, routes): (
        _,
        Arc<dyn PaymentLedger>,
        Arc<dyn OrderGateway>,
        Arc<dyn RouteSource>,
    ) = match &config.database {
        Some(database) => {
            info!("📊 Initializing database connection pool...");
            let pool = init_pool_from_config(database)
                .await
                .context("failed to initialize database pool")?;
            (
                Some(pool.clone()),
                Arc::new(PgPaymentLedger::new(pool.clone())),
                Arc::new(PgOrderGateway::new(pool.clone())),
                Arc::new(PgRouteSource::new(pool)),
            )
        }
        None => {
            info!("⏭️  Skipping database initialization (SKIP_EXTERNALS=true), using in-memory stores");
            (
                None,
                Arc::new(InMemoryPaymentLedger::new()),
                Arc::new(InMemoryOrderGateway::new()),
                Arc::new(InMemoryRouteSource::default()),
            )
        }
    };

    let (cache_pool, tickets): (_, Arc<dyn TicketStore>) = if config.skip_externals {
        info!("⏭️  Skipping Redis initialization (SKIP_EXTERNALS=true)");
        (None, Arc::new(InMemoryTicketStore::new()))
    } else {
        info!("🔄 Initializing Redis cache connection pool...");
        let pool = init_cache_pool(CacheConfig::from(&config.cache))
            .await
            .context("failed to initialize Redis pool")?;
        (Some(pool.clone()), Arc::new(RedisCache::new(pool)))
    };

    let registry = Arc::new(ChannelRegistry::new(
        routes,
        Arc::new(ChannelAdapterFactory::new(&config.payment.callback_base_url)),
    ));
    match registry.refresh().await {
        Ok(summary) => info!(
            routes = summary.routes,
            adapters = summary.adapters,
            failed = summary.failed,
            "✅ Channel registry loaded"
        ),
        Err(e) => warn!(error = %e, "Initial route load failed, starting with no channels"),
    }

    let (tasks, task_rx) = TaskQueue::channel(config.payment.background_queue_capacity);
    let checkout = Arc::new(CheckoutService::new(
        tickets,
        orders.clone(),
        ledger.clone(),
        Duration::from_secs(config.payment.checkout_ticket_ttl_secs),
    ));
    let orchestrator = Arc::new(PaymentOrchestrator::new(
        ledger.clone(),
        orders.clone(),
        registry.clone(),
        checkout.clone(),
        tasks,
        OrchestratorConfig::from(&config.payment),
    ));
    let webhooks = Arc::new(WebhookProcessor::new(
        registry.clone(),
        ledger,
        orchestrator.clone(),
    ));

    let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);
    let background_handle = tokio::spawn(
        BackgroundWorker::new(orders, NotificationService::new())
            .run(task_rx, worker_shutdown_rx.clone()),
    );
    let refresh_handle = tokio::spawn(
        RouteRefreshWorker::new(
            registry.clone(),
            Duration::from_secs(config.payment.route_refresh_interval_secs),
        )
        .run(worker_shutdown_rx),
    );

    let app = api::router(ApiServices {
        orchestrator,
        webhooks,
        checkout,
        health: HealthChecker::new(db_pool, cache_pool, registry),
    });
    info!("✅ Routes configured");

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(address = %addr, "✅ Server is ready to accept connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(worker_shutdown_tx.clone()))
        .await
        .context("server error")?;

    let _ = worker_shutdown_tx.send(true);
    for (name, handle) in [("background", background_handle), ("route_refresh", refresh_handle)] {
        match tokio::time::timeout(Duration::from_secs(10), handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(worker = name, error = %e, "Worker task panicked"),
            Err(_) => error!(worker = name, "Timed out waiting for worker shutdown"),
        }
    }

    info!("👋 Server shutdown complete");
    Ok(())
}
