use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use utoipa::ToSchema;

// ── Configuration constants ───────────────────────────────────────────────────

/// Consecutive failed health checks before an endpoint is tripped.
const CIRCUIT_BREAKER_THRESHOLD: u64 = 3;

/// How long a tripped endpoint is skipped.
const CIRCUIT_BREAKER_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Timeout for the `eth_blockNumber` health check.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

// ── Types ─────────────────────────────────────────────────────────────────────

/// One EVM JSON-RPC endpoint.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct RpcProvider {
    pub name: String,
    pub url: String,
}

impl RpcProvider {
    /// Parse a comma-separated URL list. Endpoints are named by position.
    pub fn from_url_list(urls: &str) -> Vec<RpcProvider> {
        urls.split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .enumerate()
            .map(|(i, url)| RpcProvider {
                name: format!("rpc-{i}"),
                url: url.to_string(),
            })
            .collect()
    }
}

/// Point-in-time health of one endpoint, as reported by `/health`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProviderHealth {
    pub name: String,
    pub url: String,
    pub available: bool,
    pub consecutive_failures: u64,
    /// Last block number seen; zero until the first successful health check.
    pub latest_block: u64,
}

#[derive(Debug)]
struct ProviderState {
    provider: RpcProvider,
    consecutive_failures: AtomicU64,
    /// `None` while healthy.
    tripped_at: RwLock<Option<Instant>>,
    latest_block: AtomicU64,
}

/// Tracks endpoint health so the service can pick a working node at start-up
/// and report it later. Ledger calls themselves are never retried here.
pub struct ProviderRegistry {
    states: Vec<Arc<ProviderState>>,
    client: Client,
}

impl ProviderRegistry {
    /// Order is priority: the first endpoint wins while healthy.
    pub fn new(providers: Vec<RpcProvider>) -> Arc<Self> {
        let states = providers
            .into_iter()
            .map(|p| {
                Arc::new(ProviderState {
                    provider: p,
                    consecutive_failures: AtomicU64::new(0),
                    tripped_at: RwLock::new(None),
                    latest_block: AtomicU64::new(0),
                })
            })
            .collect();

        Arc::new(Self {
            states,
            client: Client::new(),
        })
    }

    /// Check every endpoint once, then return the best available one.
    pub async fn first_healthy(&self) -> Option<RpcProvider> {
        self.refresh().await;
        self.states
            .iter()
            .find(|s| s.consecutive_failures.load(Ordering::Relaxed) == 0)
            .map(|s| s.provider.clone())
    }

    pub async fn snapshot(&self) -> Vec<ProviderHealth> {
        let mut out = Vec::with_capacity(self.states.len());
        for state in &self.states {
            out.push(ProviderHealth {
                name: state.provider.name.clone(),
                url: state.provider.url.clone(),
                available: is_available(state).await,
                consecutive_failures: state.consecutive_failures.load(Ordering::Relaxed),
                latest_block: state.latest_block.load(Ordering::Relaxed),
            });
        }
        out
    }

    // ── Background health checker ─────────────────────────────────────────

    pub fn spawn_health_checker(
        self: &Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.refresh().await;
            }
        })
    }

    /// One round of health checks against every endpoint. This is the only
    /// place the circuit breaker is driven from.
    pub async fn refresh(&self) {
        for state in &self.states {
            match self.check_endpoint(&state.provider).await {
                Ok(block) => {
                    state.latest_block.store(block, Ordering::Relaxed);
                    state.consecutive_failures.store(0, Ordering::Relaxed);
                    *state.tripped_at.write().await = None;
                    tracing::debug!(provider = %state.provider.name, block, "Health check OK");
                }
                Err(e) => {
                    tracing::warn!(provider = %state.provider.name, error = %e, "Health check failed");
                    record_failure(state).await;
                }
            }
        }
    }

    async fn check_endpoint(&self, provider: &RpcProvider) -> Result<u64, String> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_blockNumber",
            "params": []
        });

        let response = tokio::time::timeout(
            HEALTH_CHECK_TIMEOUT,
            self.client.post(&provider.url).json(&body).send(),
        )
        .await
        .map_err(|_| "timeout".to_string())?
        .map_err(|e| format!("request error: {e}"))?;

        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status().as_u16()));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| format!("parse error: {e}"))?;
        parse_block_number(&json)
    }
}

async fn is_available(state: &ProviderState) -> bool {
    match *state.tripped_at.read().await {
        None => true,
        Some(when) => when.elapsed() >= CIRCUIT_BREAKER_COOLDOWN,
    }
}

async fn record_failure(state: &ProviderState) {
    let failures = state.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
    if failures >= CIRCUIT_BREAKER_THRESHOLD {
        let mut tripped = state.tripped_at.write().await;
        if tripped.is_none() {
            tracing::warn!(
                provider = %state.provider.name,
                url = %state.provider.url,
                failures,
                "Circuit breaker tripped, endpoint excluded for {:?}",
                CIRCUIT_BREAKER_COOLDOWN
            );
        }
        *tripped = Some(Instant::now());
    }
}

/// Pull the block number out of an `eth_blockNumber` response.
fn parse_block_number(json: &serde_json::Value) -> Result<u64, String> {
    if let Some(err) = json.get("error") {
        return Err(format!("rpc error: {err}"));
    }
    let hex = json["result"]
        .as_str()
        .ok_or_else(|| "missing result in response".to_string())?;
    u64::from_str_radix(hex.trim_start_matches("0x"), 16)
        .map_err(|e| format!("bad block number {hex}: {e}"))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn make_provider(name: &str, url: &str) -> RpcProvider {
        RpcProvider {
            name: name.to_string(),
            url: url.to_string(),
        }
    }

    #[test]
    fn test_from_url_list() {
        let providers =
            RpcProvider::from_url_list(" https://a.test , ,https://b.test/rpc ");
        assert_eq!(providers.len(), 2);
        assert_eq!(providers[0].name, "rpc-0");
        assert_eq!(providers[0].url, "https://a.test");
        assert_eq!(providers[1].url, "https://b.test/rpc");
        assert!(RpcProvider::from_url_list("").is_empty());
    }

    #[test]
    fn test_parse_block_number() {
        let ok = serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": "0x5bad55"});
        assert_eq!(parse_block_number(&ok), Ok(0x5bad55));

        let err = serde_json::json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32601}});
        assert!(parse_block_number(&err).unwrap_err().starts_with("rpc error"));

        let garbage = serde_json::json!({"result": "0xzz"});
        assert!(parse_block_number(&garbage).is_err());
        assert!(parse_block_number(&serde_json::json!({})).is_err());
    }

    // Nothing listens on the discard port.
    const UNREACHABLE: &str = "http://127.0.0.1:9";

    #[tokio::test]
    async fn test_snapshot_reports_failures() {
        let registry = ProviderRegistry::new(vec![make_provider("dead", UNREACHABLE)]);
        registry.refresh().await;

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].available);
        assert_eq!(snapshot[0].consecutive_failures, 1);
        assert_eq!(snapshot[0].latest_block, 0);
    }

    #[tokio::test]
    async fn test_refresh_trips_breaker_after_threshold() {
        let registry = ProviderRegistry::new(vec![make_provider("dead", UNREACHABLE)]);
        for _ in 0..CIRCUIT_BREAKER_THRESHOLD - 1 {
            registry.refresh().await;
        }
        assert!(registry.snapshot().await[0].available);

        registry.refresh().await;
        let snapshot = registry.snapshot().await;
        assert!(!snapshot[0].available);
        assert_eq!(snapshot[0].consecutive_failures, CIRCUIT_BREAKER_THRESHOLD);
    }

    #[tokio::test]
    async fn test_first_healthy_skips_unreachable() {
        let registry = ProviderRegistry::new(vec![make_provider("dead", UNREACHABLE)]);
        assert!(registry.first_healthy().await.is_none());
        assert_eq!(registry.snapshot().await[0].consecutive_failures, 1);
    }
}
