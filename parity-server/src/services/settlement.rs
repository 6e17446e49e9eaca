use alloy::{
    primitives::{
        Address,
        utils::{format_units, parse_units},
    },
    providers::{ProviderBuilder, WsConnect},
    signers::local::PrivateKeySigner,
    sol,
};
use alloy_provider::Provider;
use async_trait::async_trait;
use std::{collections::HashMap, str::FromStr, sync::Mutex, time::Duration};
use tokio::time::timeout;
use tracing::info;

sol! {
    #[sol(rpc)]
    contract StakeVault {
        function stakeOf(address account) external view returns (uint256);
        function settle(address from, address to, uint256 amount) external returns (bool);
    }
}

/// The creator's on-chain collateral.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StakeInfo {
    pub exists: bool,
    pub amount: f64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SettlementClient: Send + Sync {
    /// Look up the stake held by an identity.
    async fn stake_info(&self, identity: &str) -> Result<StakeInfo, SettlementError>;

    /// Move a verified reward from creator to solver.
    async fn transfer_payment(&self, creator: &str, solver: &str, amount: f64) -> Result<(), SettlementError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("settlement unavailable: {0}")]
    Unavailable(String),

    #[error("invalid settlement address: {0}")]
    InvalidAddress(String),

    #[error("chain error: {0}")]
    Chain(String),
}

fn parse_identity(identity: &str) -> Result<Address, SettlementError> {
    Address::from_str(identity).map_err(|_| SettlementError::InvalidAddress(identity.into()))
}

pub struct OnChainSettlementArgs {
    pub rpc_endpoint: String,
    pub signer: PrivateKeySigner,
    pub stake_vault_address: Address,
    pub token_decimals: u8,
    pub call_timeout: Duration,
}

/// Settlement backed by the stake vault contract. Every call is bounded by a
/// wall-clock timeout so a stuck RPC endpoint surfaces as `Unavailable`
/// instead of hanging result ingestion.
pub struct OnChainSettlement<P> {
    vault: StakeVault::StakeVaultInstance<P>,
    token_decimals: u8,
    call_timeout: Duration,
}

pub async fn connect_onchain(args: OnChainSettlementArgs) -> anyhow::Result<OnChainSettlement<impl Provider>> {
    let OnChainSettlementArgs { rpc_endpoint, signer, stake_vault_address, token_decimals, call_timeout } = args;
    info!("Settling through wallet {}", signer.address());
    let ws = WsConnect::new(&rpc_endpoint).with_max_retries(u32::MAX);
    let provider = ProviderBuilder::new()
        .wallet(signer)
        .with_simple_nonce_management()
        .with_gas_estimation()
        .connect_ws(ws)
        .await?;
    info!("Connected to RPC endpoint {rpc_endpoint}");
    let vault = StakeVault::new(stake_vault_address, provider);
    Ok(OnChainSettlement { vault, token_decimals, call_timeout })
}

#[async_trait]
impl<P: Provider + 'static> SettlementClient for OnChainSettlement<P> {
    async fn stake_info(&self, identity: &str) -> Result<StakeInfo, SettlementError> {
        let address = parse_identity(identity)?;
        let builder = self.vault.stakeOf(address);
        let amount = timeout(self.call_timeout, builder.call())
            .await
            .map_err(|_| SettlementError::Unavailable("stake lookup timed out".into()))?
            .map_err(|e| SettlementError::Chain(e.to_string()))?;
        let amount: f64 = format_units(amount, self.token_decimals)
            .map_err(|e| SettlementError::Chain(e.to_string()))?
            .parse()
            .map_err(|e| SettlementError::Chain(format!("malformed stake amount: {e}")))?;
        Ok(StakeInfo { exists: amount > 0.0, amount })
    }

    async fn transfer_payment(&self, creator: &str, solver: &str, amount: f64) -> Result<(), SettlementError> {
        let from = parse_identity(creator)?;
        let to = parse_identity(solver)?;
        let units = format!("{:.*}", self.token_decimals as usize, amount);
        let amount = parse_units(&units, self.token_decimals)
            .map_err(|e| SettlementError::Chain(e.to_string()))?
            .get_absolute();
        let call = self.vault.settle(from, to, amount);
        let receipt = timeout(self.call_timeout, async {
            let pending = call.send().await.map_err(|e| SettlementError::Chain(e.to_string()))?;
            pending.get_receipt().await.map_err(|e| SettlementError::Chain(e.to_string()))
        })
        .await
        .map_err(|_| SettlementError::Unavailable("payment transfer timed out".into()))??;
        if !receipt.status() {
            return Err(SettlementError::Chain(format!(
                "payment transaction {} reverted",
                receipt.transaction_hash
            )));
        }
        info!("Settled {units} from {from} to {to} in transaction {}", receipt.transaction_hash);
        Ok(())
    }
}

/// Chainless settlement for local deployments: every identity is treated as
/// staked with a fixed amount and payments move through an in-memory ledger.
pub struct DevWalletSettlement {
    default_stake: f64,
    ledger: Mutex<HashMap<String, f64>>,
}

impl DevWalletSettlement {
    pub fn new(default_stake: f64) -> Self {
        Self { default_stake, ledger: Mutex::new(HashMap::new()) }
    }

    #[cfg(test)]
    fn balance(&self, identity: &str) -> f64 {
        self.ledger.lock().expect("lock poisoned").get(identity).copied().unwrap_or_default()
    }
}

#[async_trait]
impl SettlementClient for DevWalletSettlement {
    async fn stake_info(&self, _identity: &str) -> Result<StakeInfo, SettlementError> {
        Ok(StakeInfo { exists: self.default_stake > 0.0, amount: self.default_stake })
    }

    async fn transfer_payment(&self, creator: &str, solver: &str, amount: f64) -> Result<(), SettlementError> {
        let mut ledger = self.ledger.lock().expect("lock poisoned");
        *ledger.entry(creator.into()).or_default() -= amount;
        *ledger.entry(solver.into()).or_default() += amount;
        info!("Recorded dev wallet payment of {amount} from {creator} to {solver}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_parsing() {
        parse_identity("0x0000000000000000000000000000000000000001").expect("valid address rejected");
        let err = parse_identity("device-123").expect_err("device id accepted");
        assert!(matches!(err, SettlementError::InvalidAddress(_)), "{err}");
    }

    #[tokio::test]
    async fn dev_wallet_stake() {
        let settlement = DevWalletSettlement::new(100.0);
        let info = settlement.stake_info("anyone").await.expect("lookup failed");
        assert_eq!(info, StakeInfo { exists: true, amount: 100.0 });

        let settlement = DevWalletSettlement::new(0.0);
        let info = settlement.stake_info("anyone").await.expect("lookup failed");
        assert!(!info.exists);
    }

    #[tokio::test]
    async fn dev_wallet_ledger() {
        let settlement = DevWalletSettlement::new(100.0);
        settlement.transfer_payment("creator", "solver", 0.5).await.expect("transfer failed");
        settlement.transfer_payment("creator", "solver", 0.25).await.expect("transfer failed");
        assert_eq!(settlement.balance("creator"), -0.75);
        assert_eq!(settlement.balance("solver"), 0.75);
    }
}
