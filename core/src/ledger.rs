//! Ledger-facing capabilities consumed by the orchestrator.
//!
//! Everything here is owned by the external ledger. Values returned are
//! point-in-time copies; callers re-read instead of caching them.

use async_trait::async_trait;
use ethers::types::{Address, TransactionReceipt, H256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    #[error("Reverted: {0}")]
    Reverted(String),

    #[error("Transaction {0:?} was dropped before confirmation")]
    Dropped(H256),

    #[error("Subscription {0} does not exist")]
    NotFound(U256),

    #[error("Unexpected ledger data: {0}")]
    Decode(String),
}

impl LedgerError {
    /// `true` when the ledger answered and refused, as opposed to not
    /// answering at all.
    pub fn is_revert(&self) -> bool {
        matches!(self, Self::Reverted(_))
    }
}

/// On-ledger subscription record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: U256,
    pub user: Address,
    pub merchant: Address,
    pub amount: U256,
    /// Seconds between payments; zero means on-demand (direct debit).
    pub interval: U256,
    pub active: bool,
    pub use_treasury: bool,
}

/// Read-only queries. Each call is an independent round-trip with no retry.
#[async_trait]
pub trait LedgerReader: Send + Sync {
    async fn token_balance(&self, owner: Address) -> Result<U256, LedgerError>;

    async fn allowance(&self, owner: Address, spender: Address) -> Result<U256, LedgerError>;

    async fn treasury_balance(&self, sub_id: U256) -> Result<U256, LedgerError>;

    async fn subscription_by_id(&self, sub_id: U256) -> Result<Subscription, LedgerError>;

    /// Whether any contract code is deployed at `address`.
    async fn has_code(&self, address: Address) -> Result<bool, LedgerError>;
}

/// Mutating calls. Every method returns only once the write is confirmed;
/// a reverted write is an error, never a receipt.
#[async_trait]
pub trait LedgerWriter: Send + Sync {
    async fn approve(
        &self,
        spender: Address,
        amount: U256,
    ) -> Result<TransactionReceipt, LedgerError>;

    async fn set_subscription_manager(
        &self,
        manager: Address,
    ) -> Result<TransactionReceipt, LedgerError>;

    async fn create_subscription(
        &self,
        merchant: Address,
        amount: U256,
        interval: U256,
        use_treasury: bool,
    ) -> Result<TransactionReceipt, LedgerError>;

    async fn deposit(&self, sub_id: U256, amount: U256)
        -> Result<TransactionReceipt, LedgerError>;

    async fn execute_payment(&self, sub_id: U256) -> Result<TransactionReceipt, LedgerError>;
}

/// A connected account able to both read and sign.
pub trait SigningHandle: LedgerReader + LedgerWriter {
    fn account(&self) -> Address;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_error_display() {
        let err = LedgerError::Reverted("ERC20: insufficient allowance".to_string());
        assert_eq!(err.to_string(), "Reverted: ERC20: insufficient allowance");
        assert!(err.is_revert());

        let err = LedgerError::NotFound(U256::from(7u64));
        assert_eq!(err.to_string(), "Subscription 7 does not exist");
        assert!(!err.is_revert());
    }

    #[test]
    fn test_subscription_serialization() {
        let sub = Subscription {
            id: U256::from(3u64),
            user: Address::repeat_byte(0x01),
            merchant: Address::repeat_byte(0x02),
            amount: U256::from(15_990_000u64),
            interval: U256::zero(),
            active: true,
            use_treasury: false,
        };
        let json = serde_json::to_string(&sub).unwrap();
        assert!(json.contains("\"active\":true"));
        let back: Subscription = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sub);
    }
}
