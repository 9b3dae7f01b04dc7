mod config;
mod telemetry;

use config::ServiceConfig;
use conveyor_clickhouse::{buffered_mirror, ensure_outcomes_table, ClickHouseClient};
use conveyor_domain::{BackoffPolicy, Coordinator, CoordinatorConfig, SaleOrderTransform};
use conveyor_nats::{JetStreamSource, NatsClient};
use conveyor_postgres::{PostgresClient, PostgresRecordSink};
use conveyor_runner::Runner;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = telemetry::init_telemetry(&config.log_level) {
        eprintln!("Failed to initialize telemetry: {}", e);
        std::process::exit(1);
    }

    info!(
        partitions = config.partitions,
        stream = %config.orders_stream,
        "Starting conveyor-server"
    );
    debug!("Configuration: {:?}", config);

    // A startup failure is the only thing allowed to take the process down
    let deps = match initialize_dependencies(&config).await {
        Ok(deps) => deps,
        Err(e) => {
            error!("Failed to initialize dependencies: {:#}", e);
            std::process::exit(1);
        }
    };

    let (mirror, flusher) = buffered_mirror(
        deps.clickhouse,
        config.outcomes_table.clone(),
        config.mirror_buffer_capacity,
        Duration::from_millis(config.mirror_flush_interval_ms),
        config.mirror_flush_max_batch,
    );
    let mirror = Arc::new(mirror);
    let transform = Arc::new(SaleOrderTransform::new());

    let coordinator_config = CoordinatorConfig {
        max_batch: config.batch_size,
        poll_timeout: Duration::from_secs(config.poll_wait_secs),
        retry_budget: config.retry_budget,
        backoff: BackoffPolicy {
            base: Duration::from_millis(config.backoff_base_ms),
            factor: config.backoff_factor,
            cap: Duration::from_millis(config.backoff_cap_ms),
            jitter: config.backoff_jitter,
        },
    };

    let mut runner = Runner::new();

    // One coordinator per partition, each with its own broker consumer; the
    // partitions share nothing but the process
    for partition in 0..config.partitions {
        let consumer_name = format!("{}-p{}", config.consumer_prefix, partition);
        let subject = format!("{}.{}", config.orders_subject_prefix, partition);

        let source = match JetStreamSource::new(
            deps.nats.jetstream(),
            &config.orders_stream,
            &consumer_name,
            &subject,
            partition,
        )
        .await
        {
            Ok(source) => source,
            Err(e) => {
                error!(partition, "Failed to create consumer: {:#}", e);
                std::process::exit(1);
            }
        };

        let coordinator = Coordinator::new(
            partition,
            Arc::new(source),
            transform.clone(),
            deps.sink.clone(),
            mirror.clone(),
            coordinator_config.clone(),
        );

        runner = runner.with_named_process(format!("coordinator_p{}", partition), move |ctx| {
            async move { coordinator.run(ctx).await }
        });
    }

    runner = runner.with_named_process("outcome_flusher", move |ctx| {
        async move { flusher.run(ctx).await }
    });

    runner = runner
        .with_closer({
            let nats_for_close = deps.nats;
            move || async move {
                info!("Running cleanup tasks...");
                if let Ok(client) = Arc::try_unwrap(nats_for_close) {
                    client.close().await;
                }
                info!("Cleanup complete");
                Ok(())
            }
        })
        .with_closer_timeout(Duration::from_secs(10));

    runner.run().await;
}

struct Dependencies {
    nats: Arc<NatsClient>,
    sink: Arc<PostgresRecordSink>,
    clickhouse: ClickHouseClient,
}

async fn initialize_dependencies(config: &ServiceConfig) -> anyhow::Result<Dependencies> {
    info!("Initializing PostgreSQL...");
    let postgres = PostgresClient::new(
        &config.postgres_host,
        config.postgres_port,
        &config.postgres_database,
        &config.postgres_username,
        &config.postgres_password,
        config.postgres_pool_size,
    )?;
    postgres.ping().await?;
    let sink = PostgresRecordSink::new(postgres, config.orders_table.clone());
    sink.ensure_schema().await?;

    info!("Initializing ClickHouse...");
    let clickhouse = ClickHouseClient::new(
        &config.clickhouse_url,
        &config.clickhouse_database,
        &config.clickhouse_username,
        &config.clickhouse_password,
    );
    clickhouse.ping().await?;
    ensure_outcomes_table(&clickhouse, &config.outcomes_table).await?;

    info!("Initializing NATS...");
    let nats = Arc::new(
        NatsClient::connect(
            &config.nats_url,
            Duration::from_secs(config.startup_timeout_secs),
        )
        .await?,
    );
    let subjects = (0..config.partitions)
        .map(|p| format!("{}.{}", config.orders_subject_prefix, p))
        .collect();
    nats.ensure_stream(&config.orders_stream, subjects).await?;

    Ok(Dependencies {
        nats,
        sink: Arc::new(sink),
        clickhouse,
    })
}
