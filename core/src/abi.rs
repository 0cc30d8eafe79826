//! Human-readable interfaces of the three contracts the client talks to.
//!
//! Only the functions and events actually used are declared. The same
//! definitions back both the RPC bindings and receipt log decoding.

use ethers::abi::{parse_abi, Abi};
use thiserror::Error;

/// Event emitted by the subscription manager when a record is created.
pub const SUBSCRIPTION_CREATED: &str = "SubscriptionCreated";

/// Name of the id parameter carried by [`SUBSCRIPTION_CREATED`].
pub const SUBSCRIPTION_ID_PARAM: &str = "subId";

pub const TOKEN_ABI: &[&str] = &[
    "function approve(address spender, uint256 amount) external returns (bool)",
    "function allowance(address owner, address spender) external view returns (uint256)",
    "function balanceOf(address owner) external view returns (uint256)",
    "event Transfer(address indexed from, address indexed to, uint256 value)",
    "event Approval(address indexed owner, address indexed spender, uint256 value)",
];

pub const TREASURY_ABI: &[&str] = &[
    "function setSubscriptionManager(address manager) external",
    "function deposit(uint256 subId, uint256 amount) external",
    "function balances(uint256 subId) external view returns (uint256)",
    "event Deposited(uint256 indexed subId, address indexed from, uint256 amount)",
];

pub const SUBSCRIPTION_MANAGER_ABI: &[&str] = &[
    "function createSubscription(address merchant, uint256 amount, uint256 interval, bool useTreasury) external returns (uint256)",
    "function executePayment(uint256 subId) external",
    "function subscriptions(uint256 subId) external view returns (address user, address merchant, uint256 amount, uint256 interval, bool active, bool useTreasury)",
    "event SubscriptionCreated(uint256 indexed subId, address indexed user, address indexed merchant, uint256 amount, uint256 interval, bool useTreasury)",
    "event PaymentExecuted(uint256 indexed subId, address indexed merchant, uint256 amount)",
];

#[derive(Error, Debug)]
#[error("Invalid {contract} ABI: {details}")]
pub struct AbiError {
    pub contract: &'static str,
    pub details: String,
}

pub fn token_abi() -> Result<Abi, AbiError> {
    parse("token", TOKEN_ABI)
}

pub fn treasury_abi() -> Result<Abi, AbiError> {
    parse("treasury", TREASURY_ABI)
}

pub fn subscription_manager_abi() -> Result<Abi, AbiError> {
    parse("subscription manager", SUBSCRIPTION_MANAGER_ABI)
}

fn parse(contract: &'static str, signatures: &[&str]) -> Result<Abi, AbiError> {
    parse_abi(signatures).map_err(|e| AbiError {
        contract,
        details: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_interfaces_parse() {
        assert!(token_abi().is_ok());
        assert!(treasury_abi().is_ok());
        assert!(subscription_manager_abi().is_ok());
    }

    #[test]
    fn test_subscription_created_indexes_id() {
        let abi = subscription_manager_abi().unwrap();
        let event = abi.event(SUBSCRIPTION_CREATED).unwrap();
        let id = event
            .inputs
            .iter()
            .find(|p| p.name == SUBSCRIPTION_ID_PARAM)
            .unwrap();
        assert!(id.indexed);
    }

    #[test]
    fn test_manager_exposes_write_surface() {
        let abi = subscription_manager_abi().unwrap();
        assert!(abi.function("createSubscription").is_ok());
        assert!(abi.function("executePayment").is_ok());
        assert!(abi.function("subscriptions").is_ok());
    }
}
