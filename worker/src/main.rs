//! Editions worker.
//!
//! Runs settlement, email delivery and edition jobs off the shared Postgres
//! queue until SIGINT/SIGTERM.

use anyhow::Context;
use editions_core::environment::{Clock, SystemClock};
use editions_core::queue::{JobQueue, QueueName};
use editions_core::store::EntitlementStore;
use editions_pipeline::{
    CacheConfig, ConsoleMailer, EditionJobHandler, EntitlementCache, FanoutConfig,
    MessageDispatcher, NotificationFanout, ReleaseConfig, ReleaseEngine, SettlementConfig,
    SettlementWorker,
};
use editions_postgres::{PostgresEntitlementStore, PostgresEventLedger, PostgresJobQueue};
use editions_redis::RedisCacheStore;
use editions_runtime::metrics::MetricsServer;
use editions_runtime::{JobHandler, QueueWorker, WorkerConfig};
use editions_worker::config::{Config, QueueConfig};
use editions_worker::timers;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "editions=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting editions worker");

    let config = Config::from_env();
    config.validate().context("invalid configuration")?;
    info!(
        redis_url = %config.redis.url,
        batch_size = config.notification.batch_size,
        release_check_secs = config.release.check_interval,
        "Configuration loaded"
    );

    let mut metrics = None;
    if config.metrics.enabled {
        let mut server = MetricsServer::new(config.metrics.addr()?);
        server.start().context("failed to start metrics server")?;
        metrics = Some(server);
    }

    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.postgres.max_connections)
        .min_connections(config.postgres.min_connections)
        .acquire_timeout(Duration::from_secs(config.postgres.connect_timeout))
        .connect(&config.postgres.url)
        .await
        .context("failed to connect to Postgres")?;
    editions_postgres::migrate(&pool)
        .await
        .context("failed to run migrations")?;
    info!("Database ready");

    info!("Connecting to Redis...");
    let cache_store = Arc::new(
        RedisCacheStore::connect(&config.redis.url)
            .await
            .context("failed to connect to Redis")?
            .with_prefix(config.redis.key_prefix.clone()),
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn EntitlementStore> = Arc::new(PostgresEntitlementStore::new(pool.clone()));
    let queue: Arc<dyn JobQueue> = Arc::new(PostgresJobQueue::new(pool.clone()));
    let ledger = Arc::new(PostgresEventLedger::new(pool.clone()));

    let cache = Arc::new(
        EntitlementCache::new(cache_store, Arc::clone(&store), Arc::clone(&clock)).with_config(
            CacheConfig::default().with_ttl(Duration::from_secs(config.redis.cache_ttl)),
        ),
    );
    let fanout = Arc::new(
        NotificationFanout::new(Arc::clone(&queue)).with_config(
            FanoutConfig::default()
                .with_batch_size(config.notification.batch_size)
                .with_max_attempts(config.notification.max_attempts),
        ),
    );
    let engine = Arc::new(
        ReleaseEngine::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&fanout),
            Arc::clone(&clock),
        )
        .with_config(ReleaseConfig::default().with_notifications(config.release.notify)),
    );

    let mut settlement_config = SettlementConfig::default();
    if let Some(admin_email) = &config.notification.admin_email {
        settlement_config = settlement_config.with_admin_email(admin_email.clone());
    }
    let settlement = SettlementWorker::new(
        ledger,
        Arc::clone(&store),
        Arc::clone(&cache),
        Arc::clone(&fanout),
        Arc::clone(&clock),
    )
    .with_config(settlement_config);
    let dispatcher = MessageDispatcher::new(Arc::new(ConsoleMailer::new()), Arc::clone(&fanout));

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    let mut handles = Vec::new();

    let queues: [(QueueName, Arc<dyn JobHandler>, usize); 3] = [
        (QueueName::Payments, Arc::new(settlement), config.queue.payments_concurrency),
        (QueueName::Email, Arc::new(dispatcher), config.queue.email_concurrency),
        (
            QueueName::Editions,
            Arc::new(EditionJobHandler::new(engine)),
            config.queue.editions_concurrency,
        ),
    ];
    for (name, handler, concurrency) in queues {
        let worker = QueueWorker::new(name, Arc::clone(&queue), handler, Arc::clone(&clock))
            .with_config(worker_config(&config.queue, concurrency));
        handles.extend(worker.spawn(&shutdown_rx));
        info!(queue = %name, concurrency, "Queue workers started");
    }

    handles.push(timers::spawn_release_timer(
        Arc::clone(&queue),
        Arc::clone(&clock),
        config.release.check_interval(),
        shutdown_tx.subscribe(),
    ));
    handles.push(timers::spawn_expiry_timer(
        Arc::clone(&queue),
        config.release.expiry_interval(),
        shutdown_tx.subscribe(),
    ));

    shutdown_signal().await;

    if shutdown_tx.send(()).is_err() {
        warn!("No running tasks to stop");
    }
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Worker task ended abnormally");
        }
    }

    pool.close().await;
    drop(metrics);
    info!("Editions worker stopped");
    Ok(())
}

fn worker_config(queue: &QueueConfig, concurrency: usize) -> WorkerConfig {
    WorkerConfig::default()
        .with_concurrency(concurrency)
        .with_poll_interval(queue.poll_interval())
        .with_lease(queue.lease())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        () = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down gracefully...");
        },
        () = terminate => {
            info!("Received SIGTERM signal, shutting down gracefully...");
        },
    }
}
