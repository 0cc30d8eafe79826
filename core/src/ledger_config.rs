use ethers::types::{Address, H160};
use serde::{Deserialize, Serialize};

// ── Deployed contract addresses ───────────────────────────────────────────────

/// PYUSD on Sepolia.
const SEPOLIA_TOKEN: Address = H160([
    0xca, 0xc5, 0x24, 0xbc, 0xa2, 0x92, 0xaa, 0xad, 0xe2, 0xdf, 0x8a, 0x05, 0xcc, 0x58, 0xf0, 0xa6,
    0x5b, 0x1b, 0x3b, 0xb9,
]);
const SEPOLIA_TREASURY: Address = H160([
    0x75, 0x0b, 0x11, 0x71, 0x81, 0x66, 0x32, 0x4b, 0x08, 0xf1, 0x55, 0x3e, 0xe7, 0x03, 0x3e, 0xa6,
    0xe7, 0xe3, 0xe1, 0x58,
]);
const SEPOLIA_SUBSCRIPTION_MANAGER: Address = H160([
    0xf1, 0x1f, 0xa9, 0xf4, 0x78, 0x67, 0x9a, 0x10, 0x91, 0x8a, 0x82, 0xec, 0x1d, 0xb0, 0xff, 0xa6,
    0xf3, 0x22, 0x07, 0x78,
]);

// First three deployments from the default anvil account.
const ANVIL_TOKEN: Address = H160([
    0x5f, 0xbd, 0xb2, 0x31, 0x56, 0x78, 0xaf, 0xec, 0xb3, 0x67, 0xf0, 0x32, 0xd9, 0x3f, 0x64, 0x2f,
    0x64, 0x18, 0x0a, 0xa3,
]);
const ANVIL_TREASURY: Address = H160([
    0xe7, 0xf1, 0x72, 0x5e, 0x77, 0x34, 0xce, 0x28, 0x8f, 0x83, 0x67, 0xe1, 0xbb, 0x14, 0x3e, 0x90,
    0xbb, 0x3f, 0x05, 0x12,
]);
const ANVIL_SUBSCRIPTION_MANAGER: Address = H160([
    0x9f, 0xe4, 0x67, 0x36, 0x67, 0x9d, 0x2d, 0x9a, 0x65, 0xf0, 0x99, 0x2f, 0x22, 0x72, 0xde, 0x9f,
    0x3c, 0x7f, 0xa6, 0xe0,
]);

/// Token precision shared by every preset.
pub const TOKEN_DECIMALS: u8 = 6;

// ── Configuration ─────────────────────────────────────────────────────────────

/// Where the three ledger services live and how the token is denominated.
///
/// Built once and handed to the orchestrator; nothing else in the crate
/// hard-codes an address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerConfig {
    /// Human-readable label for this deployment.
    pub name: String,
    /// EIP-155 chain id the contracts are deployed on.
    pub chain_id: u64,
    pub token_address: Address,
    pub treasury_address: Address,
    pub subscription_manager_address: Address,
    /// Fractional digits of the token.
    pub decimals: u8,
    /// Blocks to wait after inclusion before a write counts as confirmed.
    pub confirmations: usize,
}

impl LedgerConfig {
    /// Return a copy with any of the three addresses replaced.
    pub fn with_overrides(
        mut self,
        token: Option<Address>,
        treasury: Option<Address>,
        subscription_manager: Option<Address>,
    ) -> Self {
        if let Some(addr) = token {
            self.token_address = addr;
        }
        if let Some(addr) = treasury {
            self.treasury_address = addr;
        }
        if let Some(addr) = subscription_manager {
            self.subscription_manager_address = addr;
        }
        self
    }
}

// ── Presets ───────────────────────────────────────────────────────────────────

/// Sepolia testnet deployment.
pub fn sepolia() -> LedgerConfig {
    LedgerConfig {
        name: "Sepolia".to_string(),
        chain_id: 11_155_111,
        token_address: SEPOLIA_TOKEN,
        treasury_address: SEPOLIA_TREASURY,
        subscription_manager_address: SEPOLIA_SUBSCRIPTION_MANAGER,
        decimals: TOKEN_DECIMALS,
        confirmations: 1,
    }
}

/// Local anvil node with the contracts deployed in order token, treasury,
/// subscription manager.
pub fn anvil_local() -> LedgerConfig {
    LedgerConfig {
        name: "Local anvil".to_string(),
        chain_id: 31_337,
        token_address: ANVIL_TOKEN,
        treasury_address: ANVIL_TREASURY,
        subscription_manager_address: ANVIL_SUBSCRIPTION_MANAGER,
        decimals: TOKEN_DECIMALS,
        confirmations: 1,
    }
}

/// Resolve a preset name to the corresponding `LedgerConfig`.
///
/// Recognised names (case-insensitive):
/// - `"sepolia"` / `"testnet"`
/// - `"anvil"` / `"local"` / `"dev"`
pub fn resolve_preset(name: &str) -> Option<LedgerConfig> {
    match name.to_lowercase().as_str() {
        "sepolia" | "testnet" => Some(sepolia()),
        "anvil" | "local" | "dev" => Some(anvil_local()),
        _ => None,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_address;

    #[test]
    fn test_sepolia_addresses_match_deployment() {
        let cfg = sepolia();
        assert_eq!(
            cfg.token_address,
            parse_address("0xCaC524BcA292aaade2DF8A05cC58F0a65B1B3bB9").unwrap()
        );
        assert_eq!(
            cfg.treasury_address,
            parse_address("0x750b11718166324b08f1553ee7033EA6e7E3E158").unwrap()
        );
        assert_eq!(
            cfg.subscription_manager_address,
            parse_address("0xF11Fa9F478679a10918a82eC1DB0ffa6f3220778").unwrap()
        );
    }

    #[test]
    fn test_all_presets_use_six_decimals() {
        assert_eq!(sepolia().decimals, 6);
        assert_eq!(anvil_local().decimals, 6);
    }

    #[test]
    fn test_resolve_preset_case_insensitive() {
        assert_eq!(resolve_preset("Sepolia").unwrap().chain_id, 11_155_111);
        assert_eq!(resolve_preset("TESTNET").unwrap().chain_id, 11_155_111);
        assert_eq!(resolve_preset("anvil").unwrap().chain_id, 31_337);
        assert_eq!(resolve_preset("Local").unwrap().chain_id, 31_337);
        assert!(resolve_preset("mainnet").is_none());
    }

    #[test]
    fn test_with_overrides_replaces_only_given_addresses() {
        let treasury = Address::repeat_byte(0x11);
        let cfg = sepolia().with_overrides(None, Some(treasury), None);
        assert_eq!(cfg.treasury_address, treasury);
        assert_eq!(cfg.token_address, sepolia().token_address);
        assert_eq!(
            cfg.subscription_manager_address,
            sepolia().subscription_manager_address
        );
    }

    #[test]
    fn test_ledger_config_serialization() {
        let cfg = anvil_local();
        let json = serde_json::to_string(&cfg).unwrap();
        let deserialized: LedgerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, deserialized);
    }
}
