use anyhow::Context;
use clap::{Parser, Subcommand};
use parity_server::{
    clients::{
        api::ServerApiClient,
        artifacts::{ArtifactStore, HttpArtifactStore, HttpArtifactStoreArgs},
        webhook::{HttpWebhookClient, WebhookClient},
    },
    config::Config,
    keystore,
    repositories::{
        runner::{RunnerRepository, SqliteRunnerRepository},
        sqlite::SqliteDb,
        task::{SqliteTaskRepository, TaskRepository},
    },
    routes::{AppState, Services, build_router},
    services::{
        settlement::{DevWalletSettlement, OnChainSettlementArgs, SettlementClient, connect_onchain},
        task::{DefaultTaskService, TaskService, TaskServiceArgs},
    },
    workers::{
        events::EventBus,
        heartbeat::{HeartbeatMonitor, HeartbeatMonitorArgs},
        matchmaker::{Matchmaker, MatchmakerArgs},
        webhook::{
            WebhookDispatcher, WebhookDispatcherArgs, WebhookFanout, WebhookFanoutArgs, WebhookRegistry,
        },
    },
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    signal::{self, unix::SignalKind},
    sync::broadcast,
};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::filter::EnvFilter;
use uuid::Uuid;

const SETTLEMENT_TIMEOUT: Duration = Duration::from_secs(30);
const HTTP_DRAIN_GRACE: Duration = Duration::from_secs(15);

/// Control plane for the compute marketplace: tracks tasks and runners,
/// matches work, verifies results and settles rewards.
#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store a wallet private key in the local keystore.
    Auth {
        /// The private key, 64 hex characters.
        #[clap(long)]
        private_key: String,
    },

    /// Run the control plane server.
    Server {
        /// The path to the config file.
        #[clap(short, long)]
        config_path: Option<String>,
    },

    /// Manually dispatch a pending task to a runner.
    PushTask {
        /// The task to dispatch.
        #[clap(long)]
        task_id: Uuid,

        /// The runner to dispatch it to.
        #[clap(long)]
        runner_id: String,

        /// The server to talk to.
        #[clap(long, env = "PARITY_SERVER_URL", default_value = "http://127.0.0.1:8080")]
        server_url: String,
    },
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    let terminate = async {
        signal::unix::signal(SignalKind::terminate()).expect("failed to install signal handler").recv().await;
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received ctrl-c");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}

fn run_auth(private_key: String) -> anyhow::Result<()> {
    let signer = keystore::parse_private_key(&private_key)?;
    let path = keystore::default_path()?;
    keystore::store(&path, &private_key)?;
    println!("Stored key for address {} in {}", signer.address(), path.display());
    Ok(())
}

async fn run_push_task(task_id: Uuid, runner_id: String, server_url: String) -> anyhow::Result<()> {
    let client = ServerApiClient::new(server_url)?;
    client.assign_task(task_id, &runner_id).await?;
    println!("Task {task_id} dispatched to {runner_id}");
    Ok(())
}

async fn build_settlement(config: &Config) -> anyhow::Result<Arc<dyn SettlementClient>> {
    if !config.chain.enabled {
        info!("Chain settlement disabled, using dev wallet");
        return Ok(Arc::new(DevWalletSettlement::new(config.stake.dev_stake)));
    }
    let private_key = match &config.chain.private_key {
        Some(key) => key.clone(),
        None => keystore::load(&keystore::default_path()?)?.private_key,
    };
    let signer = keystore::parse_private_key(&private_key)?;
    let stake_vault_address =
        config.chain.stake_vault_address.parse().context("Invalid stake vault address")?;
    info!("Using on-chain settlement on chain {}", config.chain.chain_id);
    let settlement = connect_onchain(OnChainSettlementArgs {
        rpc_endpoint: config.chain.rpc_endpoint.clone(),
        signer,
        stake_vault_address,
        token_decimals: config.chain.token_decimals,
        call_timeout: SETTLEMENT_TIMEOUT,
    })
    .await?;
    Ok(Arc::new(settlement))
}

async fn run_server(config_path: Option<String>) -> anyhow::Result<()> {
    let config = Config::load(config_path.as_deref())?;
    let db = SqliteDb::connect(&config.database.url).await?;
    let tasks: Arc<dyn TaskRepository> = Arc::new(SqliteTaskRepository::new(db.clone()));
    let runners: Arc<dyn RunnerRepository> = Arc::new(SqliteRunnerRepository::new(db));
    let events = EventBus::new();
    let (shutdown, _) = broadcast::channel(1);

    let settlement = build_settlement(&config).await?;
    let service: Arc<dyn TaskService> = Arc::new(DefaultTaskService::new(TaskServiceArgs {
        tasks: tasks.clone(),
        runners: runners.clone(),
        settlement,
        events: events.clone(),
        minimum_stake: config.stake.minimum,
    }));

    let webhook_client: Arc<dyn WebhookClient> =
        Arc::new(HttpWebhookClient::new(config.webhook.request_timeout)?);
    let registry = Arc::new(WebhookRegistry::default());
    let notifier = WebhookDispatcher::spawn(
        WebhookDispatcherArgs {
            tasks: tasks.clone(),
            runners: runners.clone(),
            service: service.clone(),
            client: webhook_client.clone(),
        },
        shutdown.subscribe(),
    );
    WebhookFanout::spawn(
        WebhookFanoutArgs {
            registry: registry.clone(),
            tasks: tasks.clone(),
            client: webhook_client,
            max_in_flight: config.webhook.fanout_limit,
        },
        events.subscribe(),
        shutdown.subscribe(),
    );
    HeartbeatMonitor::spawn(
        HeartbeatMonitorArgs {
            runners: runners.clone(),
            tasks: tasks.clone(),
            events: events.clone(),
            check_interval: config.scheduler.check_interval,
            heartbeat_timeout: Duration::from_secs(config.scheduler.heartbeat_timeout_minutes * 60),
        },
        shutdown.subscribe(),
    );
    Matchmaker::spawn(
        MatchmakerArgs {
            service: service.clone(),
            runners: runners.clone(),
            notifier,
            events: events.clone(),
            tick_interval: config.scheduler.matchmaker_tick,
        },
        shutdown.subscribe(),
    );

    let artifacts: Option<Arc<dyn ArtifactStore>> = match &config.blob {
        Some(blob) => {
            let store = HttpArtifactStore::new(HttpArtifactStoreArgs {
                endpoint: blob.endpoint.clone(),
                bucket: blob.bucket.clone(),
                api_key: blob.api_key.clone(),
            })?;
            Some(Arc::new(store))
        }
        None => None,
    };

    let state = AppState { services: Services { task: service }, runners, registry, artifacts, events };
    let mut prefix = config.server.endpoint_prefix.clone();
    if !prefix.is_empty() && !prefix.starts_with('/') {
        prefix.insert(0, '/');
    }
    let router = build_router(state, &prefix);

    let endpoint: SocketAddr =
        format!("{}:{}", config.server.host, config.server.port).parse().context("Invalid bind endpoint")?;
    info!("Listening on {endpoint}");
    let handle = axum_server::Handle::new();
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutting down");
            let _ = shutdown.send(());
            handle.graceful_shutdown(Some(HTTP_DRAIN_GRACE));
        });
    }
    axum_server::bind(endpoint).handle(handle).serve(router.into_make_service()).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::builder().with_default_directive(LevelFilter::INFO.into()).from_env_lossy())
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Auth { private_key } => run_auth(private_key),
        Command::Server { config_path } => run_server(config_path).await,
        Command::PushTask { task_id, runner_id, server_url } => {
            run_push_task(task_id, runner_id, server_url).await
        }
    };
    if let Err(e) = result {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
    Ok(())
}
