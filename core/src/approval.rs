use crate::ledger::{LedgerError, LedgerWriter};
use crate::ledger_config::LedgerConfig;
use crate::notify::{NotificationSink, NoticeSeverity, DEFAULT_NOTICE_DURATION_MS};
use ethers::types::{Address, TransactionReceipt, U256};
use thiserror::Error;

/// Direct-debit allowances cover this many payments so later executions do
/// not need a fresh approval each cycle.
pub const DIRECT_DEBIT_ALLOWANCE_MULTIPLIER: u64 = 10;

/// Who gets spending authority, and how much.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalPlan {
    pub spender: Address,
    pub amount: U256,
}

impl ApprovalPlan {
    /// Treasury-funded subscriptions move the amount into custody once, so
    /// the treasury gets exactly `amount`. Direct debits are pulled by the
    /// subscription manager on every execution and get a multiple.
    ///
    /// `None` when the direct-debit multiple does not fit in a `U256`.
    pub fn for_request(config: &LedgerConfig, amount: U256, use_treasury: bool) -> Option<Self> {
        if use_treasury {
            Some(Self {
                spender: config.treasury_address,
                amount,
            })
        } else {
            Some(Self {
                spender: config.subscription_manager_address,
                amount: amount.checked_mul(U256::from(DIRECT_DEBIT_ALLOWANCE_MULTIPLIER))?,
            })
        }
    }
}

/// Grants a fresh token allowance. Never assumes one already exists.
pub struct ApprovalManager<'a, W: ?Sized> {
    writer: &'a W,
}

impl<'a, W: LedgerWriter + ?Sized> ApprovalManager<'a, W> {
    pub fn new(writer: &'a W) -> Self {
        Self { writer }
    }

    /// Blocks until the approval is confirmed.
    pub async fn approve(
        &self,
        spender: Address,
        amount: U256,
    ) -> Result<TransactionReceipt, LedgerError> {
        tracing::info!(spender = ?spender, amount = %amount, "Approving token allowance");
        let receipt = self.writer.approve(spender, amount).await?;
        tracing::info!(tx = ?receipt.transaction_hash, "Allowance approved");
        Ok(receipt)
    }
}

/// Non-fatal outcome of [`TreasuryAuthorizer::ensure_authorized`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Treasury authorization of {manager:?} skipped: {reason}")]
pub struct TreasuryAuthorizationWarning {
    pub manager: Address,
    pub reason: LedgerError,
}

/// Makes sure the treasury accepts calls from the subscription manager.
///
/// Best effort: the call reverts when a previous run already configured the
/// treasury or when the connected account is not the treasury owner. Either
/// way the flow continues; the failure is only reported.
pub struct TreasuryAuthorizer<'a, W: ?Sized> {
    writer: &'a W,
    manager: Address,
    notifier: &'a dyn NotificationSink,
}

impl<'a, W: LedgerWriter + ?Sized> TreasuryAuthorizer<'a, W> {
    pub fn new(writer: &'a W, manager: Address, notifier: &'a dyn NotificationSink) -> Self {
        Self {
            writer,
            manager,
            notifier,
        }
    }

    pub async fn ensure_authorized(&self) -> Option<TreasuryAuthorizationWarning> {
        match self.writer.set_subscription_manager(self.manager).await {
            Ok(receipt) => {
                tracing::info!(
                    manager = ?self.manager,
                    tx = ?receipt.transaction_hash,
                    "Treasury authorized subscription manager"
                );
                None
            }
            Err(reason) => {
                let warning = TreasuryAuthorizationWarning {
                    manager: self.manager,
                    reason,
                };
                tracing::warn!(error = %warning, "Continuing without treasury authorization");
                self.notifier.notify(
                    &warning.to_string(),
                    NoticeSeverity::Warning,
                    DEFAULT_NOTICE_DURATION_MS,
                );
                Some(warning)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger_config::anvil_local;
    use crate::testing::{Faults, LedgerCall, RecordingNotifier, SimulatedLedger};

    fn user() -> Address {
        Address::repeat_byte(0xaa)
    }

    #[test]
    fn test_plan_treasury_is_exact_amount() {
        let cfg = anvil_local();
        let plan = ApprovalPlan::for_request(&cfg, U256::from(5_000_000u64), true).unwrap();
        assert_eq!(plan.spender, cfg.treasury_address);
        assert_eq!(plan.amount, U256::from(5_000_000u64));
    }

    #[test]
    fn test_plan_direct_is_ten_times() {
        let cfg = anvil_local();
        let plan = ApprovalPlan::for_request(&cfg, U256::from(5_000_000u64), false).unwrap();
        assert_eq!(plan.spender, cfg.subscription_manager_address);
        assert_eq!(plan.amount, U256::from(50_000_000u64));
    }

    #[test]
    fn test_plan_direct_overflow_is_refused() {
        let cfg = anvil_local();
        let ten = U256::from(10u64);
        assert!(ApprovalPlan::for_request(&cfg, U256::MAX, false).is_none());
        assert!(ApprovalPlan::for_request(&cfg, U256::MAX / ten + U256::one(), false).is_none());

        let edge = ApprovalPlan::for_request(&cfg, U256::MAX / ten, false).unwrap();
        assert_eq!(edge.amount, (U256::MAX / ten) * ten);
        // The treasury path never multiplies.
        assert_eq!(
            ApprovalPlan::for_request(&cfg, U256::MAX, true).unwrap().amount,
            U256::MAX
        );
    }

    #[tokio::test]
    async fn test_approve_sets_fresh_allowance() {
        let cfg = anvil_local();
        let ledger = SimulatedLedger::new(cfg.clone(), user());
        let manager = ApprovalManager::new(&ledger);
        manager
            .approve(cfg.treasury_address, U256::from(7u64))
            .await
            .unwrap();
        assert_eq!(
            ledger.allowance_of(user(), cfg.treasury_address),
            U256::from(7u64)
        );
    }

    #[tokio::test]
    async fn test_approve_revert_is_returned() {
        let ledger = SimulatedLedger::new(anvil_local(), user()).with_faults(Faults {
            revert_approval: Some("token paused".to_string()),
            ..Default::default()
        });
        let err = ApprovalManager::new(&ledger)
            .approve(Address::repeat_byte(0x01), U256::one())
            .await
            .unwrap_err();
        assert!(err.is_revert());
    }

    #[tokio::test]
    async fn test_authorizer_success_is_silent() {
        let cfg = anvil_local();
        let ledger = SimulatedLedger::new(cfg.clone(), user());
        let notifier = RecordingNotifier::default();
        let warning = TreasuryAuthorizer::new(&ledger, cfg.subscription_manager_address, &notifier)
            .ensure_authorized()
            .await;
        assert!(warning.is_none());
        assert!(notifier.notices().is_empty());
        assert_eq!(
            ledger.calls(),
            vec![LedgerCall::SetSubscriptionManager(
                cfg.subscription_manager_address
            )]
        );
    }

    #[tokio::test]
    async fn test_authorizer_revert_is_warning_not_error() {
        let cfg = anvil_local();
        let ledger = SimulatedLedger::new(cfg.clone(), user()).with_faults(Faults {
            revert_authorization: Some("Ownable: caller is not the owner".to_string()),
            ..Default::default()
        });
        let notifier = RecordingNotifier::default();
        let warning = TreasuryAuthorizer::new(&ledger, cfg.subscription_manager_address, &notifier)
            .ensure_authorized()
            .await
            .unwrap();

        assert!(warning.reason.is_revert());
        let notices = notifier.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].severity, NoticeSeverity::Warning);
        assert!(notices[0].message.contains("caller is not the owner"));
    }
}
