use anyhow::Result;
use log::{error, info};
use relay_gateway::api::{AppState, RestApi};
use relay_gateway::cli::{self, Command};
use relay_gateway::config::{self, Config};
use relay_gateway::db::DatabaseService;
use relay_gateway::engine::RelayEngineFactory;
use relay_gateway::session::{PortPolicy, StreamUrls};
use relay_gateway::{HubHandle, Orchestrator, PublishAuthorizer, StreamRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn run_app() -> Result<()> {
    let config_path = std::env::var_os("GATEWAY_CONFIG").map(PathBuf::from);
    let config = config::load_config(config_path.as_deref())?;

    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.api.log_level.as_str()),
    )
    .init();

    let command = Command::parse(std::env::args().skip(1))?;

    let database = DatabaseService::new(&config.database).await?;
    let registry = StreamRegistry::new(database.pool.clone());
    let urls = StreamUrls::new(&config.ingest, &config.packaging)?;

    match command {
        Command::Serve => serve(config, database, registry, urls).await,
        command => cli::run_command(command, &registry, &urls, &mut std::io::stdout()).await,
    }
}

async fn serve(
    config: Config,
    database: DatabaseService,
    registry: StreamRegistry,
    urls: StreamUrls,
) -> Result<()> {
    info!("Starting relay gateway");
    let shutdown = CancellationToken::new();

    let authorizer = PublishAuthorizer::new(registry.clone());
    let (hub, _hub_task) = HubHandle::spawn(&config.hub);

    let factory = Arc::new(RelayEngineFactory::new(
        Arc::new(authorizer.clone()),
        &config.ingest.app_name,
        config.packaging.tag_buffer,
    ));
    let plan = Arc::new(PortPolicy::new(&config.ingest, &config.packaging)?);
    let orchestrator = Orchestrator::new(factory, plan, shutdown.child_token());
    let sessions = orchestrator.subscribe();

    let reconcile_interval = match config.orchestrator.reconcile_interval_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    let orchestrator_task = tokio::spawn(orchestrator.run(registry.clone(), reconcile_interval));

    let state = AppState {
        db_pool: database.pool.clone(),
        registry,
        authorizer,
        hub,
        sessions,
        urls,
        web: config.web.clone(),
        shutdown: shutdown.clone(),
    };
    let api = RestApi::new(&config.api, state);
    let mut api_task = tokio::spawn(async move { api.run().await });

    // Wait for termination signals, or for the gateway to fail on its own
    let api_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutting down...");
            None
        }
        result = &mut api_task => Some(result),
    };

    shutdown.cancel();

    if let Err(e) = orchestrator_task.await {
        error!("Orchestrator task failed: {}", e);
    }
    info!("All sessions stopped");

    let api_result = match api_result {
        Some(result) => result,
        None => api_task.await,
    };
    api_result??;

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run_app().await {
        eprintln!("Application error: {:#}", e);
        std::process::exit(1);
    }
}
