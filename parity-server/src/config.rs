use serde::Deserialize;
use serde_with::{DurationSeconds, serde_as};
use std::time::Duration;

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    /// The HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// The database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// The on-chain settlement configuration.
    #[serde(default)]
    pub chain: ChainConfig,

    /// The blob storage for large container image artifacts, if any.
    #[serde(default)]
    pub blob: Option<BlobConfig>,

    /// The background scheduling configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// The stake requirements.
    #[serde(default)]
    pub stake: StakeConfig,

    /// The webhook delivery configuration.
    #[serde(default)]
    pub webhook: WebhookConfig,
}

impl Config {
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Environment::with_prefix("PARITY").separator("__"));
        if let Some(path) = path {
            builder = builder.add_source(config::File::new(path, config::FileFormat::Yaml));
        }
        let config = builder.build()?;
        let config = config.try_deserialize()?;
        Ok(config)
    }
}

#[derive(Deserialize, Debug)]
pub struct ServerConfig {
    /// The host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// The port to bind to.
    #[serde(default = "default_port")]
    pub port: u16,

    /// A prefix nested in front of every API route.
    #[serde(default)]
    pub endpoint_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_port(), endpoint_prefix: String::new() }
    }
}

#[derive(Deserialize, Debug)]
pub struct DatabaseConfig {
    /// The database URL.
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: default_database_url() }
    }
}

#[derive(Deserialize, Debug)]
pub struct ChainConfig {
    /// Whether rewards settle on chain. When disabled an in-memory dev
    /// wallet is used instead.
    #[serde(default)]
    pub enabled: bool,

    /// The RPC endpoint to use.
    #[serde(default = "default_rpc_endpoint")]
    pub rpc_endpoint: String,

    /// The chain id settlements are expected on.
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,

    /// The stake vault contract address.
    #[serde(default)]
    pub stake_vault_address: String,

    /// The decimals of the payment token.
    #[serde(default = "default_token_decimals")]
    pub token_decimals: u8,

    /// The private key used to sign settlement transactions. Falls back to
    /// the local keystore when unset.
    #[serde(default)]
    pub private_key: Option<String>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rpc_endpoint: default_rpc_endpoint(),
            chain_id: default_chain_id(),
            stake_vault_address: String::new(),
            token_decimals: default_token_decimals(),
            private_key: None,
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct BlobConfig {
    /// The blob storage gateway endpoint.
    pub endpoint: String,

    /// The bucket artifacts are stored in.
    pub bucket: String,

    /// The API key used to authenticate uploads.
    #[serde(default)]
    pub api_key: String,
}

#[serde_as]
#[derive(Deserialize, Debug)]
pub struct SchedulerConfig {
    /// How long a runner may stay silent before it is considered dead, in
    /// minutes.
    #[serde(default = "default_heartbeat_timeout_minutes")]
    pub heartbeat_timeout_minutes: u64,

    /// How often the heartbeat monitor scans the runner directory.
    #[serde(default = "default_check_interval")]
    #[serde_as(as = "DurationSeconds")]
    pub check_interval: Duration,

    /// How often the matchmaker sweeps pending tasks.
    #[serde(default = "default_matchmaker_tick")]
    #[serde_as(as = "DurationSeconds")]
    pub matchmaker_tick: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_minutes: default_heartbeat_timeout_minutes(),
            check_interval: default_check_interval(),
            matchmaker_tick: default_matchmaker_tick(),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct StakeConfig {
    /// The minimum stake a creator must hold to submit tasks.
    #[serde(default = "default_minimum_stake")]
    pub minimum: f64,

    /// The stake granted to every identity when running with the dev wallet.
    #[serde(default = "default_dev_stake")]
    pub dev_stake: f64,
}

impl Default for StakeConfig {
    fn default() -> Self {
        Self { minimum: default_minimum_stake(), dev_stake: default_dev_stake() }
    }
}

#[serde_as]
#[derive(Deserialize, Debug)]
pub struct WebhookConfig {
    /// The timeout for a single webhook POST.
    #[serde(default = "default_webhook_timeout")]
    #[serde_as(as = "DurationSeconds")]
    pub request_timeout: Duration,

    /// The maximum number of concurrent fan-out POSTs.
    #[serde(default = "default_fanout_limit")]
    pub fanout_limit: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self { request_timeout: default_webhook_timeout(), fanout_limit: default_fanout_limit() }
    }
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8080
}

fn default_database_url() -> String {
    "sqlite://parity-server.db".into()
}

fn default_rpc_endpoint() -> String {
    "ws://127.0.0.1:8545".into()
}

fn default_chain_id() -> u64 {
    1
}

fn default_token_decimals() -> u8 {
    18
}

fn default_heartbeat_timeout_minutes() -> u64 {
    5
}

fn default_check_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_matchmaker_tick() -> Duration {
    Duration::from_secs(5)
}

fn default_minimum_stake() -> f64 {
    1.0
}

fn default_dev_stake() -> f64 {
    100.0
}

fn default_webhook_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_fanout_limit() -> usize {
    10
}
