//! Direct-debit subscriptions over an EVM token ledger.
//!
//! The entry point is [`SubscriptionOrchestrator::create_direct_debit_subscription`],
//! which validates a request, then drives approval, creation, the optional
//! treasury deposit and the first payment as a fixed sequence of confirmed
//! writes. Ledger access, signing, notifications and progress reporting are
//! all injected, so the same flow runs against a live node or against
//! the simulated ledger in `testing`.

pub mod abi;
pub mod approval;
pub mod diagnostics;
pub mod events;
pub mod ledger;
pub mod ledger_config;
pub mod notify;
pub mod orchestrator;
pub mod parser;
pub mod rpc_ledger;
pub mod rpc_provider;
pub mod wallet;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use diagnostics::{DiagnosticReport, Finding, Severity};
pub use ledger::{LedgerError, LedgerReader, LedgerWriter, SigningHandle, Subscription};
pub use ledger_config::{resolve_preset, LedgerConfig};
pub use notify::{NoticeSeverity, NotificationSink, ProgressIndicator};
pub use orchestrator::{FlowState, SubscriptionError, SubscriptionOrchestrator, SubscriptionRequest};
pub use wallet::{SigningProvider, WalletError};
