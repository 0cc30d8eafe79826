use crate::abi::{subscription_manager_abi, AbiError, SUBSCRIPTION_ID_PARAM};
use ethers::abi::{Abi, LogParam, RawLog, Token};
use ethers::types::{Address, Log, TransactionReceipt, U256};

/// A receipt log decoded against a known interface.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub name: String,
    /// Contract that emitted the log.
    pub address: Address,
    pub params: Vec<LogParam>,
}

impl DecodedEvent {
    pub fn param(&self, name: &str) -> Option<&Token> {
        self.params.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    pub fn uint(&self, name: &str) -> Option<U256> {
        match self.param(name)? {
            Token::Uint(value) => Some(*value),
            _ => None,
        }
    }
}

/// Picks events out of transaction receipts.
///
/// A receipt carries every log emitted during the transaction, including
/// token transfers and approvals from other contracts. Logs that do not
/// decode against the interface are skipped, never treated as errors.
pub struct EventDecoder {
    abi: Abi,
}

impl EventDecoder {
    pub fn new(abi: Abi) -> Self {
        Self { abi }
    }

    /// Decoder for the subscription manager's events.
    pub fn subscription_manager() -> Result<Self, AbiError> {
        Ok(Self::new(subscription_manager_abi()?))
    }

    /// Decode a single log, or `None` if it belongs to some other interface
    /// or is malformed.
    pub fn decode(&self, log: &Log) -> Option<DecodedEvent> {
        let topic0 = log.topics.first()?;
        let event = self
            .abi
            .events()
            .find(|e| !e.anonymous && e.signature() == *topic0)?;

        let raw = RawLog {
            topics: log.topics.clone(),
            data: log.data.to_vec(),
        };
        match event.parse_log(raw) {
            Ok(parsed) => Some(DecodedEvent {
                name: event.name.clone(),
                address: log.address,
                params: parsed.params,
            }),
            Err(e) => {
                tracing::debug!(event = %event.name, address = ?log.address, error = %e, "Skipping undecodable log");
                None
            }
        }
    }

    /// First log in `receipt` whose decoded event name is `name`.
    pub fn find_event(&self, receipt: &TransactionReceipt, name: &str) -> Option<DecodedEvent> {
        receipt
            .logs
            .iter()
            .filter_map(|log| self.decode(log))
            .find(|event| event.name == name)
    }
}

/// The ledger-assigned id carried by a `SubscriptionCreated` event.
pub fn subscription_id(event: &DecodedEvent) -> Option<U256> {
    event.uint(SUBSCRIPTION_ID_PARAM)
}
