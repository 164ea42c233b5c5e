mod config;
mod telemetry;

use bidwatch_domain::{ChangeFeedSource, CheckpointStore, NotificationDispatcher};
use bidwatch_materialize::{
    FeedConfig, MaterializeChangeFeed, MaterializeClient, MaterializeConfig, SqlCheckpointStore,
};
use bidwatch_novu::{NovuConfig, NovuDispatcher};
use bidwatch_runner::Runner;
use config::ServiceConfig;
use notify_worker::{NotifyConfig, NotifyWorker};
use std::sync::Arc;
use std::time::Duration;
use telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig, TelemetryProviders};
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let telemetry_providers: Option<TelemetryProviders> = match init_telemetry(&TelemetryConfig {
        service_name: config.otel_service_name.clone(),
        otel_endpoint: config.otel_endpoint.clone(),
        otel_enabled: config.otel_enabled,
        log_level: config.log_level.clone(),
    }) {
        Ok(providers) => providers,
        Err(e) => {
            eprintln!("Failed to initialize telemetry: {e}");
            std::process::exit(1);
        }
    };

    info!(
        relation = %config.feed_relation,
        subscription = %config.subscription_name,
        "starting bidwatch service"
    );
    debug!("configuration: {:?}", config);

    let collaborators = match initialize_collaborators(&config).await {
        Ok(deps) => deps,
        Err(e) => {
            error!("failed to initialize collaborators: {e}");
            std::process::exit(1);
        }
    };
    let Collaborators {
        feed,
        checkpoints,
        dispatcher,
        materialize_client,
    } = collaborators;

    let worker = NotifyWorker::new(feed, checkpoints, dispatcher, build_notify_config(&config));

    let runner = Runner::new()
        .with_named_process("notify_worker", worker.into_runner_process())
        .with_closer(move || async move {
            info!("running cleanup tasks...");
            materialize_client.close();
            shutdown_telemetry(telemetry_providers);
            info!("cleanup complete");
            Ok(())
        })
        .with_closer_timeout(Duration::from_secs(10));

    runner.run().await;
}

struct Collaborators {
    feed: Arc<dyn ChangeFeedSource>,
    checkpoints: Arc<dyn CheckpointStore>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    materialize_client: MaterializeClient,
}

async fn initialize_collaborators(config: &ServiceConfig) -> anyhow::Result<Collaborators> {
    info!("initializing materialize...");
    let materialize_client = MaterializeClient::new(MaterializeConfig {
        host: config.materialize_host.clone(),
        port: config.materialize_port,
        database: config.materialize_database.clone(),
        user: config.materialize_user.clone(),
        password: config.materialize_password.clone(),
        pool_size: config.materialize_pool_size,
    })?;
    materialize_client.ping().await?;

    let checkpoints = SqlCheckpointStore::new(materialize_client.clone());
    checkpoints.ensure_schema().await?;

    let feed = MaterializeChangeFeed::new(
        materialize_client.clone(),
        FeedConfig {
            relation: config.feed_relation.clone(),
            id_column: config.feed_id_column.clone(),
            recipient_column: config.feed_recipient_column.clone(),
        },
    );

    info!("initializing novu dispatcher...");
    let dispatcher = NovuDispatcher::new(NovuConfig {
        api_url: config.novu_api_url.clone(),
        api_key: config.novu_api_key.clone(),
        timeout: Duration::from_secs(config.novu_timeout_secs),
    })?;

    Ok(Collaborators {
        feed: Arc::new(feed),
        checkpoints: Arc::new(checkpoints),
        dispatcher: Arc::new(dispatcher),
        materialize_client,
    })
}

fn build_notify_config(config: &ServiceConfig) -> NotifyConfig {
    NotifyConfig {
        subscription_name: config.subscription_name.clone(),
        workflow_id: config.workflow_id.clone(),
        poll_interval_ms: config.poll_interval_ms,
        resume_on_restart: config.resume_on_restart,
        retry_min_backoff_ms: config.retry_min_backoff_ms,
        retry_max_backoff_ms: config.retry_max_backoff_ms,
        max_retry_attempts: config.max_retry_attempts,
    }
}
