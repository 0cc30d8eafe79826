//! `createDirectDebitSubscription`: one user intent turned into an ordered
//! series of confirmed ledger writes.
//!
//! ```text
//! Idle ─► PreconditionsChecked ─► Approved ─► Created ─┬─────────────► PaymentExecuted ─► Done
//!                                                      └─► Deposited ─┘
//! ```
//!
//! Every write is committed on its own. A failure at step N leaves steps
//! 1..N-1 on the ledger; nothing is rolled back, and
//! [`SubscriptionError::committed_through`] reports how far the flow got.

use crate::abi::{AbiError, SUBSCRIPTION_CREATED};
use crate::approval::{
    ApprovalManager, ApprovalPlan, TreasuryAuthorizer, DIRECT_DEBIT_ALLOWANCE_MULTIPLIER,
};
use crate::diagnostics::{DiagnosticReport, DiagnosticReporter, DiagnosticRule};
use crate::events::{subscription_id, EventDecoder};
use crate::ledger::{LedgerError, SigningHandle};
use crate::ledger_config::LedgerConfig;
use crate::notify::{
    NoticeSeverity, NotificationSink, ProgressGuard, ProgressIndicator,
    DEFAULT_NOTICE_DURATION_MS,
};
use crate::parser::{format_amount, parse_address, parse_amount, ParserError};
use crate::wallet::{SigningProvider, WalletError};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use utoipa::ToSchema;

/// Interval value meaning "on demand": the merchant side triggers payments.
pub const DIRECT_DEBIT_INTERVAL: u64 = 0;

pub const PROGRESS_LABEL: &str = "Processing subscription...";

// ── Request ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    /// Hex address of the payee.
    pub merchant: String,
    /// Decimal token amount, e.g. `"15.99"`.
    #[serde(rename = "amountPyusd", alias = "amount")]
    pub amount: String,
    /// Pre-fund the subscription in the treasury instead of pulling from
    /// the payer's wallet.
    #[serde(default)]
    pub use_treasury: bool,
}

/// A request after local validation.
#[derive(Debug, Clone, Copy)]
struct ValidatedRequest {
    merchant: Address,
    amount: U256,
    use_treasury: bool,
    approval: ApprovalPlan,
}

// ── State machine ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "subscriptionId")]
pub enum FlowState {
    Idle,
    PreconditionsChecked,
    Approved,
    Created(U256),
    Deposited(U256),
    PaymentExecuted(U256),
    Done(U256),
}

// ── Errors ────────────────────────────────────────────────────────────────────

fn units(amount: &U256, decimals: &u8) -> String {
    format_amount(*amount, *decimals)
}

#[derive(Error, Debug, Clone)]
pub enum SubscriptionError {
    #[error("{0}")]
    WalletUnavailable(String),

    #[error("{0}")]
    ConnectionRejected(String),

    #[error("Invalid merchant address: {0}")]
    InvalidMerchantAddress(#[source] ParserError),

    #[error("Invalid amount: {0}")]
    InvalidAmount(#[source] ParserError),

    #[error(
        "Insufficient PYUSD balance: have {}, need {}",
        units(.have, .decimals),
        units(.need, .decimals)
    )]
    InsufficientFunds { have: U256, need: U256, decimals: u8 },

    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(#[source] LedgerError),

    #[error("Approval of {amount} for {spender:?} failed: {source}")]
    ApprovalFailed {
        spender: Address,
        amount: U256,
        #[source]
        source: LedgerError,
    },

    #[error("Subscription creation failed: {0}")]
    SubscriptionCreationFailed(#[source] LedgerError),

    /// The creation transaction is committed; the record can be found by
    /// looking up `tx_hash`.
    #[error("Subscription created in {tx_hash:?} but its id could not be found in the receipt")]
    SubscriptionIdNotFound { tx_hash: H256 },

    #[error("Deposit into treasury for subscription {sub_id} failed: {source}")]
    DepositFailed {
        sub_id: U256,
        #[source]
        source: LedgerError,
    },

    #[error("Payment execution for subscription {sub_id} failed: {source}")]
    PaymentExecutionFailed {
        sub_id: U256,
        #[source]
        source: LedgerError,
        diagnostics: Box<DiagnosticReport>,
        committed_through: FlowState,
    },
}

impl From<WalletError> for SubscriptionError {
    fn from(err: WalletError) -> Self {
        match err {
            WalletError::Unavailable(msg) => Self::WalletUnavailable(msg),
            WalletError::Rejected(msg) => Self::ConnectionRejected(msg),
        }
    }
}

impl SubscriptionError {
    /// Last state whose ledger effects are committed. Anything after it did
    /// not happen.
    ///
    /// For `SubscriptionIdNotFound` this is `Approved`: the creation write
    /// did land, but without an id the flow cannot name the record.
    pub fn committed_through(&self) -> FlowState {
        match self {
            Self::WalletUnavailable(_)
            | Self::ConnectionRejected(_)
            | Self::InvalidMerchantAddress(_)
            | Self::InvalidAmount(_)
            | Self::InsufficientFunds { .. }
            | Self::LedgerUnavailable(_) => FlowState::Idle,
            Self::ApprovalFailed { .. } => FlowState::PreconditionsChecked,
            Self::SubscriptionCreationFailed(_) | Self::SubscriptionIdNotFound { .. } => {
                FlowState::Approved
            }
            Self::DepositFailed { sub_id, .. } => FlowState::Created(*sub_id),
            Self::PaymentExecutionFailed {
                committed_through, ..
            } => *committed_through,
        }
    }

    pub fn diagnostics(&self) -> Option<&DiagnosticReport> {
        match self {
            Self::PaymentExecutionFailed { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }

    /// `true` if the failure happened before any ledger write.
    pub fn is_precondition(&self) -> bool {
        self.committed_through() == FlowState::Idle
    }
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

pub struct SubscriptionOrchestrator {
    config: LedgerConfig,
    signer: Arc<dyn SigningProvider>,
    notifier: Arc<dyn NotificationSink>,
    progress: Arc<dyn ProgressIndicator>,
    decoder: EventDecoder,
    extra_rules: Vec<Arc<dyn DiagnosticRule>>,
}

impl SubscriptionOrchestrator {
    pub fn new(
        config: LedgerConfig,
        signer: Arc<dyn SigningProvider>,
        notifier: Arc<dyn NotificationSink>,
        progress: Arc<dyn ProgressIndicator>,
    ) -> Result<Self, AbiError> {
        Ok(Self {
            config,
            signer,
            notifier,
            progress,
            decoder: EventDecoder::subscription_manager()?,
            extra_rules: Vec::new(),
        })
    }

    /// Extra rule consulted, after the built-ins, when a first payment fails.
    pub fn with_diagnostic_rule(mut self, rule: Arc<dyn DiagnosticRule>) -> Self {
        self.extra_rules.push(rule);
        self
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Connected signing session, prompting the wallet on first use.
    pub async fn session(&self) -> Result<Arc<dyn SigningHandle>, SubscriptionError> {
        Ok(self.signer.connect().await?)
    }

    /// Create a direct-debit subscription and execute its first payment.
    /// Returns the ledger-assigned subscription id in decimal.
    pub async fn create_direct_debit_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<String, SubscriptionError> {
        let _progress = ProgressGuard::begin(self.progress.as_ref(), PROGRESS_LABEL);

        let result = self.run(request).await;
        match &result {
            Ok(id) => self.notifier.notify(
                &format!("Subscription {id} created"),
                NoticeSeverity::Success,
                DEFAULT_NOTICE_DURATION_MS,
            ),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    committed_through = ?e.committed_through(),
                    "Subscription flow failed"
                );
                self.notifier.notify(
                    &e.to_string(),
                    NoticeSeverity::Error,
                    DEFAULT_NOTICE_DURATION_MS,
                );
            }
        }
        result
    }

    async fn run(&self, request: &SubscriptionRequest) -> Result<String, SubscriptionError> {
        let order = self.validate(request)?;
        let handle = self.session().await?;
        let handle = handle.as_ref();

        tracing::info!(
            account = ?handle.account(),
            merchant = ?order.merchant,
            amount = %order.amount,
            use_treasury = order.use_treasury,
            "Starting subscription flow"
        );

        let mut state = FlowState::Idle;
        loop {
            let next = self.step(handle, &order, state).await?;
            tracing::debug!(from = ?state, to = ?next, "Flow transition");
            state = next;
            if let FlowState::Done(id) = state {
                return Ok(id.to_string());
            }
        }
    }

    fn validate(&self, request: &SubscriptionRequest) -> Result<ValidatedRequest, SubscriptionError> {
        let merchant =
            parse_address(&request.merchant).map_err(SubscriptionError::InvalidMerchantAddress)?;
        let amount = parse_amount(&request.amount, self.config.decimals)
            .map_err(SubscriptionError::InvalidAmount)?;
        let approval = ApprovalPlan::for_request(&self.config, amount, request.use_treasury)
            .ok_or_else(|| {
                SubscriptionError::InvalidAmount(ParserError::InvalidAmount {
                    input: request.amount.clone(),
                    details: format!(
                        "a {DIRECT_DEBIT_ALLOWANCE_MULTIPLIER}x direct-debit allowance does not fit in uint256"
                    ),
                })
            })?;
        Ok(ValidatedRequest {
            merchant,
            amount,
            use_treasury: request.use_treasury,
            approval,
        })
    }

    async fn step(
        &self,
        handle: &dyn SigningHandle,
        order: &ValidatedRequest,
        state: FlowState,
    ) -> Result<FlowState, SubscriptionError> {
        match state {
            FlowState::Idle => {
                self.check_balance(handle, order).await?;
                Ok(FlowState::PreconditionsChecked)
            }
            FlowState::PreconditionsChecked => {
                self.approve(handle, order).await?;
                Ok(FlowState::Approved)
            }
            FlowState::Approved => self.create(handle, order).await.map(FlowState::Created),
            FlowState::Created(id) if order.use_treasury => {
                self.deposit(handle, id, order.amount).await?;
                Ok(FlowState::Deposited(id))
            }
            FlowState::Created(id) | FlowState::Deposited(id) => {
                self.execute(handle, id, order.merchant, state).await?;
                Ok(FlowState::PaymentExecuted(id))
            }
            FlowState::PaymentExecuted(id) | FlowState::Done(id) => Ok(FlowState::Done(id)),
        }
    }

    // ── Steps ─────────────────────────────────────────────────────────────

    async fn check_balance(
        &self,
        handle: &dyn SigningHandle,
        order: &ValidatedRequest,
    ) -> Result<(), SubscriptionError> {
        let have = handle
            .token_balance(handle.account())
            .await
            .map_err(SubscriptionError::LedgerUnavailable)?;
        if have < order.amount {
            return Err(SubscriptionError::InsufficientFunds {
                have,
                need: order.amount,
                decimals: self.config.decimals,
            });
        }
        tracing::info!(balance = %have, "Balance check passed");
        Ok(())
    }

    async fn approve(
        &self,
        handle: &dyn SigningHandle,
        order: &ValidatedRequest,
    ) -> Result<(), SubscriptionError> {
        if order.use_treasury {
            // Non-fatal; the authorizer reports its own warning.
            TreasuryAuthorizer::new(
                handle,
                self.config.subscription_manager_address,
                self.notifier.as_ref(),
            )
            .ensure_authorized()
            .await;
        }

        let plan = order.approval;
        ApprovalManager::new(handle)
            .approve(plan.spender, plan.amount)
            .await
            .map_err(|source| SubscriptionError::ApprovalFailed {
                spender: plan.spender,
                amount: plan.amount,
                source,
            })?;
        Ok(())
    }

    async fn create(
        &self,
        handle: &dyn SigningHandle,
        order: &ValidatedRequest,
    ) -> Result<U256, SubscriptionError> {
        let receipt = handle
            .create_subscription(
                order.merchant,
                order.amount,
                U256::from(DIRECT_DEBIT_INTERVAL),
                order.use_treasury,
            )
            .await
            .map_err(SubscriptionError::SubscriptionCreationFailed)?;

        let id = self
            .decoder
            .find_event(&receipt, SUBSCRIPTION_CREATED)
            .as_ref()
            .and_then(subscription_id)
            .ok_or(SubscriptionError::SubscriptionIdNotFound {
                tx_hash: receipt.transaction_hash,
            })?;
        tracing::info!(sub_id = %id, tx = ?receipt.transaction_hash, "Subscription created");
        Ok(id)
    }

    async fn deposit(
        &self,
        handle: &dyn SigningHandle,
        sub_id: U256,
        amount: U256,
    ) -> Result<(), SubscriptionError> {
        let before = handle.treasury_balance(sub_id).await;
        handle
            .deposit(sub_id, amount)
            .await
            .map_err(|source| SubscriptionError::DepositFailed { sub_id, source })?;
        let after = handle.treasury_balance(sub_id).await;

        // Confirmation only; the ledger is authoritative either way.
        match (before, after) {
            (Ok(before), Ok(after)) => {
                let delta = after.saturating_sub(before);
                if delta == amount {
                    tracing::info!(sub_id = %sub_id, before = %before, after = %after, "Treasury deposit confirmed");
                } else {
                    tracing::warn!(
                        sub_id = %sub_id,
                        expected = %amount,
                        observed = %delta,
                        "Treasury balance moved by an unexpected amount"
                    );
                }
            }
            (before, after) => tracing::warn!(
                sub_id = %sub_id,
                before = ?before.err(),
                after = ?after.err(),
                "Could not confirm treasury deposit"
            ),
        }
        Ok(())
    }

    async fn execute(
        &self,
        handle: &dyn SigningHandle,
        sub_id: U256,
        merchant: Address,
        committed_through: FlowState,
    ) -> Result<(), SubscriptionError> {
        match handle.execute_payment(sub_id).await {
            Ok(receipt) => {
                tracing::info!(sub_id = %sub_id, tx = ?receipt.transaction_hash, "First payment executed");
                Ok(())
            }
            Err(source) => {
                tracing::error!(sub_id = %sub_id, error = %source, "Payment execution failed");
                let mut reporter = DiagnosticReporter::new(handle, &self.config);
                for rule in &self.extra_rules {
                    reporter.add_rule(Arc::clone(rule));
                }
                let report = reporter
                    .explain_payment_failure(sub_id, Some(merchant))
                    .await;
                if let Some(cause) = report.likely_cause() {
                    tracing::warn!(sub_id = %sub_id, rule = %cause.rule, "{}", cause.message);
                }
                Err(SubscriptionError::PaymentExecutionFailed {
                    sub_id,
                    source,
                    diagnostics: Box::new(report),
                    committed_through,
                })
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
