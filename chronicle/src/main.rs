use std::{future::ready, sync::Arc, time::Duration};

use axum::{routing::get, Router};
use chrono::Duration as ChronoDuration;
use chronicle::{
    alerts::AlertEmitter,
    app_context::AppContext,
    config::Config,
    dead_letter::DeadLetterQueue,
    extract::{Clock, SystemClock},
    history_worker_loop, intake_loop, realtime_worker_loop,
    router::ObjectRouter,
    scd2::HistoryProcessor,
    schema::SchemaRegistry,
    sinks::{history::PostgresHistoryStore, raw::RawTableWriter},
    validate::{ValidationStats, Validator},
};
use common_kafka::kafka_consumer::SingleTopicConsumer;
use common_metrics::{serve, setup_metrics_routes};
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let log_layer: tracing_subscriber::filter::Filtered<
        tracing_subscriber::fmt::Layer<tracing_subscriber::Registry>,
        EnvFilter,
        tracing_subscriber::Registry,
    > = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "CDC history tracking service"
}

fn start_health_liveness_server(config: &Config, context: Arc<AppContext>) -> JoinHandle<()> {
    let config = config.clone();
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route(
            "/_liveness",
            get(move || ready(context.liveness.get_status())),
        );
    let router = setup_metrics_routes(router);
    let bind = format!("{}:{}", config.host, config.port);
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    })
}

#[tokio::main]
async fn main() -> Result<(), chronicle::error::Error> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_with_defaults()?;

    let consumer = SingleTopicConsumer::new(config.kafka.clone(), config.consumer.clone())?;
    let context = Arc::new(AppContext::new(&config).await?);

    info!(
        "Subscribed to topic: {}",
        config.consumer.kafka_consumer_topic
    );

    start_health_liveness_server(&config, context.clone());

    let registry = Arc::new(SchemaRegistry::with_defaults());
    let stats = Arc::new(ValidationStats::default());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let validator = Arc::new(Validator::new(registry.clone(), stats.clone(), &config));
    let alerts = Arc::new(AlertEmitter::new(
        context.producer.clone(),
        &config,
        stats,
        clock.clone(),
    ));
    let dead_letters = Arc::new(DeadLetterQueue::new(
        context.producer.clone(),
        &config,
        clock.clone(),
    ));
    let writer = Arc::new(RawTableWriter::new(context.pool.clone(), &config));
    let store = Arc::new(PostgresHistoryStore::new(
        context.pool.clone(),
        config.history_table_suffix.clone(),
    ));
    let processor = Arc::new(HistoryProcessor::new(
        store,
        clock.clone(),
        config.anomaly_policy,
        config.sink_write_max_attempts,
        config.sink_retry_delay_ms,
    ));

    let realtime_window = ChronoDuration::seconds(config.realtime_window_secs as i64);
    let history_window = ChronoDuration::seconds(config.history_window_secs as i64);
    let lateness = ChronoDuration::seconds(config.allowed_lateness_secs as i64);

    let mut workers = Vec::new();

    let mut realtime_senders = Vec::with_capacity(config.realtime_worker_count);
    for i in 0..config.realtime_worker_count {
        let (tx, rx) = mpsc::channel(config.worker_channel_capacity);
        realtime_senders.push(tx);
        let liveness = context
            .liveness
            .register(format!("realtime-{i}"), Duration::from_secs(60))
            .await;
        workers.push(tokio::spawn(realtime_worker_loop(
            rx,
            writer.clone(),
            dead_letters.clone(),
            clock.clone(),
            realtime_window,
            lateness,
            liveness,
        )));
    }

    let mut history_senders = Vec::with_capacity(config.history_worker_count);
    for i in 0..config.history_worker_count {
        let (tx, rx) = mpsc::channel(config.worker_channel_capacity);
        history_senders.push(tx);
        let liveness = context
            .liveness
            .register(format!("history-{i}"), Duration::from_secs(60))
            .await;
        workers.push(tokio::spawn(history_worker_loop(
            rx,
            processor.clone(),
            alerts.clone(),
            dead_letters.clone(),
            clock.clone(),
            history_window,
            lateness,
            liveness,
        )));
    }

    let router = ObjectRouter::new(registry, realtime_senders, history_senders);
    let intake_liveness = context
        .liveness
        .register("intake".to_string(), Duration::from_secs(60))
        .await;
    let shutdown = CancellationToken::new();
    let intake = tokio::spawn(intake_loop(
        consumer,
        validator,
        clock,
        router,
        alerts,
        dead_letters,
        intake_liveness,
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for shutdown signal");
    info!("Shutdown signal received, draining in-flight windows");
    shutdown.cancel();
    intake.await.expect("intake task panicked");

    // The intake owned the only senders; once it exits, every worker sees
    // its channel close, flushes its open windows, and returns
    for result in join_all(workers).await {
        result.expect("worker task panicked");
    }
    info!("Drained, exiting");
    Ok(())
}
