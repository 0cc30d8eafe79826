use crate::ledger::SigningHandle;
use crate::ledger_config::LedgerConfig;
use crate::rpc_ledger::EthersLedger;
use async_trait::async_trait;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider, ProviderError, RpcError};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, U256};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;

/// EIP-1193 "user rejected request".
const USER_REJECTED_CODE: i64 = 4001;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("Wallet unavailable: {0}")]
    Unavailable(String),

    #[error("Connection rejected: {0}")]
    Rejected(String),
}

/// Source of a connected, signing-capable ledger session.
///
/// Implementations may prompt the user the first time; once connected,
/// further calls hand back the same session.
#[async_trait]
pub trait SigningProvider: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn SigningHandle>, WalletError>;
}

// ── Injected wallet ───────────────────────────────────────────────────────────

/// A wallet that exposes accounts over JSON-RPC and signs on its side
/// (browser-extension bridges, desktop wallets, a node with unlocked
/// accounts).
pub struct InjectedWalletProvider {
    url: String,
    config: LedgerConfig,
    session: OnceCell<Arc<dyn SigningHandle>>,
}

impl InjectedWalletProvider {
    pub fn new(url: impl Into<String>, config: LedgerConfig) -> Self {
        Self {
            url: url.into(),
            config,
            session: OnceCell::new(),
        }
    }

    async fn open_session(&self) -> Result<Arc<dyn SigningHandle>, WalletError> {
        let provider = Provider::<Http>::try_from(self.url.as_str()).map_err(|e| {
            WalletError::Unavailable(format!("invalid wallet endpoint {}: {e}", self.url))
        })?;

        let accounts: Vec<Address> = provider
            .request("eth_requestAccounts", ())
            .await
            .map_err(classify_request_error)?;
        let account = accounts
            .into_iter()
            .next()
            .ok_or_else(|| WalletError::Rejected("wallet exposed no accounts".to_string()))?;

        let ledger = EthersLedger::new(Arc::new(provider.with_sender(account)), account, &self.config)
            .map_err(|e| WalletError::Unavailable(e.to_string()))?;
        tracing::info!(account = ?account, wallet = %self.url, "Wallet connected");
        Ok(Arc::new(ledger))
    }
}

#[async_trait]
impl SigningProvider for InjectedWalletProvider {
    async fn connect(&self) -> Result<Arc<dyn SigningHandle>, WalletError> {
        self.session
            .get_or_try_init(|| self.open_session())
            .await
            .map(Arc::clone)
    }
}

fn classify_request_error(err: ProviderError) -> WalletError {
    match err.as_error_response() {
        Some(resp) if resp.code == USER_REJECTED_CODE => {
            WalletError::Rejected(resp.message.clone())
        }
        Some(resp) => WalletError::Unavailable(format!("{} (code {})", resp.message, resp.code)),
        None => WalletError::Unavailable(err.to_string()),
    }
}

// ── Local key ─────────────────────────────────────────────────────────────────

/// Signs with a private key held by this process.
pub struct LocalKeyProvider {
    rpc_url: String,
    private_key: Option<String>,
    config: LedgerConfig,
    session: OnceCell<Arc<dyn SigningHandle>>,
}

impl LocalKeyProvider {
    pub fn new(
        rpc_url: impl Into<String>,
        private_key: Option<String>,
        config: LedgerConfig,
    ) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            private_key,
            config,
            session: OnceCell::new(),
        }
    }

    async fn open_session(&self) -> Result<Arc<dyn SigningHandle>, WalletError> {
        let key = self
            .private_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| WalletError::Unavailable("no signer key configured".to_string()))?;
        let wallet: LocalWallet = key
            .trim()
            .trim_start_matches("0x")
            .parse()
            .map_err(|e| WalletError::Unavailable(format!("invalid signer key: {e}")))?;

        let provider = Provider::<Http>::try_from(self.rpc_url.as_str()).map_err(|e| {
            WalletError::Unavailable(format!("invalid RPC endpoint {}: {e}", self.rpc_url))
        })?;
        let chain_id = provider
            .get_chainid()
            .await
            .map_err(|e| WalletError::Unavailable(format!("cannot reach {}: {e}", self.rpc_url)))?;
        if chain_id != U256::from(self.config.chain_id) {
            return Err(WalletError::Rejected(format!(
                "node is on chain {chain_id}, expected {} ({})",
                self.config.chain_id, self.config.name
            )));
        }

        let wallet = wallet.with_chain_id(self.config.chain_id);
        let account = wallet.address();
        let client = SignerMiddleware::new(provider, wallet);
        let ledger = EthersLedger::new(Arc::new(client), account, &self.config)
            .map_err(|e| WalletError::Unavailable(e.to_string()))?;
        tracing::info!(account = ?account, chain_id = self.config.chain_id, "Local signer ready");
        Ok(Arc::new(ledger))
    }
}

#[async_trait]
impl SigningProvider for LocalKeyProvider {
    async fn connect(&self) -> Result<Arc<dyn SigningHandle>, WalletError> {
        self.session
            .get_or_try_init(|| self.open_session())
            .await
            .map(Arc::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger_config::anvil_local;

    #[tokio::test]
    async fn test_local_key_missing_is_unavailable() {
        let provider = LocalKeyProvider::new("http://127.0.0.1:9", None, anvil_local());
        let err = provider.connect().await.err().unwrap();
        assert!(matches!(err, WalletError::Unavailable(ref m) if m.contains("no signer key")));
    }

    #[tokio::test]
    async fn test_local_key_blank_is_unavailable() {
        let provider =
            LocalKeyProvider::new("http://127.0.0.1:9", Some("  ".to_string()), anvil_local());
        assert!(matches!(
            provider.connect().await.err().unwrap(),
            WalletError::Unavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_local_key_malformed_is_unavailable() {
        let provider = LocalKeyProvider::new(
            "http://127.0.0.1:9",
            Some("0xnot-a-key".to_string()),
            anvil_local(),
        );
        let err = provider.connect().await.err().unwrap();
        assert!(matches!(err, WalletError::Unavailable(ref m) if m.contains("invalid signer key")));
    }

    #[tokio::test]
    async fn test_local_key_unreachable_node_is_unavailable() {
        // Well-known anvil dev key #0.
        let key = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
        let provider =
            LocalKeyProvider::new("http://127.0.0.1:9", Some(key.to_string()), anvil_local());
        assert!(matches!(
            provider.connect().await.err().unwrap(),
            WalletError::Unavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_injected_wallet_unreachable_is_unavailable() {
        let provider = InjectedWalletProvider::new("http://127.0.0.1:9", anvil_local());
        assert!(matches!(
            provider.connect().await.err().unwrap(),
            WalletError::Unavailable(_)
        ));
    }

    #[test]
    fn test_wallet_error_display() {
        assert_eq!(
            WalletError::Rejected("User rejected the request.".to_string()).to_string(),
            "Connection rejected: User rejected the request."
        );
    }
}
