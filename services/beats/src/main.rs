use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use beats_service::blob_gateway::BlobGateway;
use beats_service::blob_store::S3BlobStore;
use beats_service::config::Settings;
use beats_service::consumer::{EventConsumer, EventDispatcher, TokioSleeper};
use beats_service::coordinator::Coordinator;
use beats_service::events::{KafkaDeadLetterSink, KafkaEventPublisher};
use beats_service::handlers::UserDeletedHandler;
use beats_service::limiter::ConcurrencyLimiter;
use beats_service::load_guard::LoadGuard;
use beats_service::repository::PgBeatRepository;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let settings = Settings::new().context("loading configuration")?;

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], settings.service.metrics_port))
        .install()
        .context("installing Prometheus exporter")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        metrics_port = settings.service.metrics_port,
        "beats service starting"
    );

    let repo = Arc::new(
        PgBeatRepository::connect(&settings.database.url, settings.database.max_connections)
            .await
            .context("connecting to the database")?,
    );

    let store = Arc::new(
        S3BlobStore::new(&settings.s3)
            .await
            .context("initializing the blob store")?,
    );

    let guard = LoadGuard::new(settings.limits.overload_threshold());
    let sampler = guard.spawn_sampler(settings.limits.lag_sample_interval());

    let limiter = ConcurrencyLimiter::new(settings.limits.max_concurrent_blob_ops);
    let gateway = BlobGateway::new(
        store,
        guard,
        limiter,
        settings.limits.upload_url_ttl(),
        settings.limits.download_url_ttl(),
    );

    let publisher = Arc::new(
        KafkaEventPublisher::new(&settings.kafka.brokers, &settings.kafka.beat_events_topic)
            .context("creating the event publisher")?,
    );
    let dead_letters = Arc::new(
        KafkaDeadLetterSink::new(&settings.kafka.brokers, &settings.kafka.dead_letter_topic)
            .context("creating the dead-letter sink")?,
    );

    let coordinator = Arc::new(Coordinator::new(repo, gateway, publisher));

    let mut dispatcher = EventDispatcher::new(dead_letters);
    dispatcher.register(Arc::new(UserDeletedHandler::new(coordinator)));

    let consumer = EventConsumer::new(
        &settings.kafka.brokers,
        &settings.kafka.group_id,
        &settings.kafka.user_events_topic,
        settings.kafka.retry_policy(),
        dispatcher,
        Arc::new(TokioSleeper),
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let consumer_task = tokio::spawn(consumer.run(shutdown_rx));

    shutdown_signal().await;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(());
    consumer_task.await.context("joining the consumer task")?;
    sampler.abort();

    info!("beats service stopped");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM (what container runtimes send on stop).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
