use crate::ledger::{LedgerReader, Subscription};
use crate::ledger_config::LedgerConfig;
use crate::parser::format_amount;
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::sync::Arc;

// ── Types ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// One suspected cause of a failed payment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Finding {
    pub severity: Severity,
    pub rule: String,
    pub message: String,
    pub suggested_fix: String,
}

/// Ledger state re-read after a payment execution failed.
///
/// Every fact is optional: a read that fails leaves its fact empty and adds
/// a line to `notes` instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiagnosticReport {
    pub sub_id: U256,
    pub subscription: Option<Subscription>,
    /// Merchant the code check was run against.
    pub merchant: Option<Address>,
    pub merchant_has_code: Option<bool>,
    /// Custody balance for the subscription (treasury-funded only).
    pub treasury_balance: Option<U256>,
    /// Payer wallet balance (direct debit only).
    pub payer_balance: Option<U256>,
    /// Payer allowance to the subscription manager (direct debit only).
    pub payer_allowance: Option<U256>,
    pub notes: Vec<String>,
    pub findings: Vec<Finding>,
}

impl DiagnosticReport {
    fn empty(sub_id: U256) -> Self {
        Self {
            sub_id,
            subscription: None,
            merchant: None,
            merchant_has_code: None,
            treasury_balance: None,
            payer_balance: None,
            payer_allowance: None,
            notes: Vec::new(),
            findings: Vec::new(),
        }
    }

    /// Most severe finding; the earliest one wins a tie.
    pub fn likely_cause(&self) -> Option<&Finding> {
        self.findings.iter().min_by_key(|f| Reverse(f.severity))
    }
}

// ── Rule trait ────────────────────────────────────────────────────────────────

/// Implement this to teach the reporter a new failure cause.
pub trait DiagnosticRule: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(&self, report: &DiagnosticReport, decimals: u8) -> Vec<Finding>;
}

// ── Built-in rules ────────────────────────────────────────────────────────────

/// Merchants without deployed code are accepted at creation time but are a
/// frequent reason for the payment call to revert.
pub struct NonContractMerchantRule;

impl DiagnosticRule for NonContractMerchantRule {
    fn name(&self) -> &str {
        "non_contract_merchant"
    }

    fn evaluate(&self, report: &DiagnosticReport, _decimals: u8) -> Vec<Finding> {
        match (report.merchant, report.merchant_has_code) {
            (Some(merchant), Some(false)) => vec![Finding {
                severity: Severity::Critical,
                rule: self.name().to_string(),
                message: format!("Merchant {merchant:?} has no deployed contract code"),
                suggested_fix: "Confirm the merchant address; payments that call back into \
                                the merchant need a deployed receiver contract."
                    .to_string(),
            }],
            _ => Vec::new(),
        }
    }
}

pub struct InactiveSubscriptionRule;

impl DiagnosticRule for InactiveSubscriptionRule {
    fn name(&self) -> &str {
        "inactive_subscription"
    }

    fn evaluate(&self, report: &DiagnosticReport, _decimals: u8) -> Vec<Finding> {
        match &report.subscription {
            Some(sub) if !sub.active => vec![Finding {
                severity: Severity::Critical,
                rule: self.name().to_string(),
                message: format!("Subscription {} is not active", sub.id),
                suggested_fix: "Create a new subscription; inactive records cannot be charged."
                    .to_string(),
            }],
            _ => Vec::new(),
        }
    }
}

pub struct TreasuryShortfallRule;

impl DiagnosticRule for TreasuryShortfallRule {
    fn name(&self) -> &str {
        "treasury_shortfall"
    }

    fn evaluate(&self, report: &DiagnosticReport, decimals: u8) -> Vec<Finding> {
        let (Some(sub), Some(balance)) = (&report.subscription, report.treasury_balance) else {
            return Vec::new();
        };
        if !sub.use_treasury || balance >= sub.amount {
            return Vec::new();
        }
        vec![Finding {
            severity: Severity::Critical,
            rule: self.name().to_string(),
            message: format!(
                "Treasury holds {} for subscription {} but a payment needs {}",
                format_amount(balance, decimals),
                sub.id,
                format_amount(sub.amount, decimals)
            ),
            suggested_fix: "Deposit at least one payment's worth into the treasury for this \
                            subscription."
                .to_string(),
        }]
    }
}

pub struct PayerBalanceRule;

impl DiagnosticRule for PayerBalanceRule {
    fn name(&self) -> &str {
        "payer_balance"
    }

    fn evaluate(&self, report: &DiagnosticReport, decimals: u8) -> Vec<Finding> {
        let (Some(sub), Some(balance)) = (&report.subscription, report.payer_balance) else {
            return Vec::new();
        };
        if sub.use_treasury || balance >= sub.amount {
            return Vec::new();
        }
        vec![Finding {
            severity: Severity::Critical,
            rule: self.name().to_string(),
            message: format!(
                "Payer {:?} holds {} but a payment needs {}",
                sub.user,
                format_amount(balance, decimals),
                format_amount(sub.amount, decimals)
            ),
            suggested_fix: "Top up the paying wallet.".to_string(),
        }]
    }
}

pub struct AllowanceShortfallRule;

impl DiagnosticRule for AllowanceShortfallRule {
    fn name(&self) -> &str {
        "allowance_shortfall"
    }

    fn evaluate(&self, report: &DiagnosticReport, decimals: u8) -> Vec<Finding> {
        let (Some(sub), Some(allowance)) = (&report.subscription, report.payer_allowance) else {
            return Vec::new();
        };
        if sub.use_treasury || allowance >= sub.amount {
            return Vec::new();
        }
        vec![Finding {
            severity: Severity::Critical,
            rule: self.name().to_string(),
            message: format!(
                "Subscription manager may pull {} but a payment needs {}",
                format_amount(allowance, decimals),
                format_amount(sub.amount, decimals)
            ),
            suggested_fix: "Approve the subscription manager for a larger allowance.".to_string(),
        }]
    }
}

// ── Reporter ──────────────────────────────────────────────────────────────────

/// Explains failed payment executions from fresh ledger reads.
///
/// Never fails: the report is an attachment to the original error, so any
/// read problem becomes a note instead of an error of its own.
pub struct DiagnosticReporter<'a, R: ?Sized> {
    reader: &'a R,
    config: &'a LedgerConfig,
    rules: Vec<Arc<dyn DiagnosticRule>>,
}

impl<'a, R: LedgerReader + ?Sized> DiagnosticReporter<'a, R> {
    /// Reporter pre-loaded with all built-in rules.
    pub fn new(reader: &'a R, config: &'a LedgerConfig) -> Self {
        Self {
            reader,
            config,
            rules: vec![
                Arc::new(NonContractMerchantRule),
                Arc::new(InactiveSubscriptionRule),
                Arc::new(TreasuryShortfallRule),
                Arc::new(PayerBalanceRule),
                Arc::new(AllowanceShortfallRule),
            ],
        }
    }

    /// Rules added here run after the built-ins, so on equal severity a
    /// built-in finding stays the likely cause.
    pub fn add_rule(&mut self, rule: Arc<dyn DiagnosticRule>) {
        self.rules.push(rule);
    }

    /// `merchant_hint` is used for the code check when the subscription
    /// record itself cannot be read.
    pub async fn explain_payment_failure(
        &self,
        sub_id: U256,
        merchant_hint: Option<Address>,
    ) -> DiagnosticReport {
        let mut report = DiagnosticReport::empty(sub_id);

        match self.reader.subscription_by_id(sub_id).await {
            Ok(sub) => report.subscription = Some(sub),
            Err(e) => report
                .notes
                .push(format!("could not read subscription {sub_id}: {e}")),
        }

        report.merchant = report
            .subscription
            .as_ref()
            .map(|s| s.merchant)
            .or(merchant_hint);
        match report.merchant {
            Some(merchant) => match self.reader.has_code(merchant).await {
                Ok(has_code) => report.merchant_has_code = Some(has_code),
                Err(e) => report
                    .notes
                    .push(format!("could not check code at merchant {merchant:?}: {e}")),
            },
            None => report
                .notes
                .push("merchant unknown, code check skipped".to_string()),
        }

        if let Some(sub) = report.subscription.clone() {
            if sub.use_treasury {
                match self.reader.treasury_balance(sub_id).await {
                    Ok(balance) => report.treasury_balance = Some(balance),
                    Err(e) => report
                        .notes
                        .push(format!("could not read treasury balance: {e}")),
                }
            } else {
                match self.reader.token_balance(sub.user).await {
                    Ok(balance) => report.payer_balance = Some(balance),
                    Err(e) => report
                        .notes
                        .push(format!("could not read payer balance: {e}")),
                }
                match self
                    .reader
                    .allowance(sub.user, self.config.subscription_manager_address)
                    .await
                {
                    Ok(allowance) => report.payer_allowance = Some(allowance),
                    Err(e) => report
                        .notes
                        .push(format!("could not read payer allowance: {e}")),
                }
            }
        }

        let findings: Vec<Finding> = self
            .rules
            .iter()
            .flat_map(|rule| rule.evaluate(&report, self.config.decimals))
            .collect();
        report.findings = findings;

        tracing::warn!(
            sub_id = %sub_id,
            merchant_has_code = ?report.merchant_has_code,
            findings = report.findings.len(),
            notes = report.notes.len(),
            "Payment failure diagnostics gathered"
        );
        report
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerWriter;
    use crate::ledger_config::anvil_local;
    use crate::testing::{Faults, SimulatedLedger};

    fn user() -> Address {
        Address::repeat_byte(0xaa)
    }

    fn merchant() -> Address {
        Address::repeat_byte(0xbb)
    }

    fn pyusd(units: u64) -> U256 {
        U256::from(units) * U256::exp10(6)
    }

    async fn ledger_with_subscription(use_treasury: bool, faults: Faults) -> SimulatedLedger {
        let cfg = anvil_local();
        let ledger = SimulatedLedger::new(cfg.clone(), user())
            .with_balance(user(), pyusd(100))
            .with_faults(faults);
        ledger
            .create_subscription(merchant(), pyusd(10), U256::zero(), use_treasury)
            .await
            .unwrap();
        ledger
    }

    fn sample_report() -> DiagnosticReport {
        DiagnosticReport::empty(U256::one())
    }

    // ── Rules ─────────────────────────────────────────────────────────────

    #[test]
    fn test_non_contract_merchant_rule() {
        let mut report = sample_report();
        report.merchant = Some(merchant());
        report.merchant_has_code = Some(false);
        let findings = NonContractMerchantRule.evaluate(&report, 6);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Critical);

        report.merchant_has_code = Some(true);
        assert!(NonContractMerchantRule.evaluate(&report, 6).is_empty());

        report.merchant_has_code = None;
        assert!(NonContractMerchantRule.evaluate(&report, 6).is_empty());
    }

    #[test]
    fn test_treasury_shortfall_rule_formats_amounts() {
        let mut report = sample_report();
        report.subscription = Some(Subscription {
            id: U256::one(),
            user: user(),
            merchant: merchant(),
            amount: U256::from(15_990_000u64),
            interval: U256::zero(),
            active: true,
            use_treasury: true,
        });
        report.treasury_balance = Some(U256::from(5_000_000u64));
        let findings = TreasuryShortfallRule.evaluate(&report, 6);
        assert_eq!(findings.len(), 1);
        assert!(findings[0].message.contains("holds 5 "));
        assert!(findings[0].message.contains("needs 15.99"));
    }

    #[test]
    fn test_likely_cause_prefers_severity_then_order() {
        let mut report = sample_report();
        let finding = |severity, rule: &str| Finding {
            severity,
            rule: rule.to_string(),
            message: String::new(),
            suggested_fix: String::new(),
        };
        report.findings = vec![
            finding(Severity::Warning, "a"),
            finding(Severity::Critical, "b"),
            finding(Severity::Critical, "c"),
        ];
        assert_eq!(report.likely_cause().unwrap().rule, "b");
        assert!(sample_report().likely_cause().is_none());
    }

    // ── Reporter ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_report_flags_non_contract_merchant() {
        let cfg = anvil_local();
        let ledger = ledger_with_subscription(false, Faults::default()).await;
        let report = DiagnosticReporter::new(&ledger, &cfg)
            .explain_payment_failure(U256::one(), None)
            .await;

        assert_eq!(report.subscription.as_ref().unwrap().merchant, merchant());
        assert_eq!(report.merchant_has_code, Some(false));
        assert!(report.notes.is_empty());
        assert_eq!(report.likely_cause().unwrap().rule, "non_contract_merchant");
    }

    #[tokio::test]
    async fn test_report_survives_code_check_failure() {
        let cfg = anvil_local();
        let ledger = ledger_with_subscription(
            false,
            Faults {
                fail_has_code: true,
                ..Default::default()
            },
        )
        .await;
        let report = DiagnosticReporter::new(&ledger, &cfg)
            .explain_payment_failure(U256::one(), None)
            .await;

        assert!(report.subscription.is_some());
        assert_eq!(report.merchant_has_code, None);
        assert!(report
            .notes
            .iter()
            .any(|n| n.contains("could not check code at merchant")));
    }

    #[tokio::test]
    async fn test_report_uses_hint_when_record_unreadable() {
        let cfg = anvil_local();
        let ledger = ledger_with_subscription(
            false,
            Faults {
                fail_subscription_read: true,
                ..Default::default()
            },
        )
        .await
        .with_code(merchant());
        let report = DiagnosticReporter::new(&ledger, &cfg)
            .explain_payment_failure(U256::one(), Some(merchant()))
            .await;

        assert!(report.subscription.is_none());
        assert_eq!(report.merchant, Some(merchant()));
        assert_eq!(report.merchant_has_code, Some(true));
        assert!(report.notes[0].contains("could not read subscription 1"));
        assert!(report.payer_balance.is_none());
    }

    #[tokio::test]
    async fn test_report_direct_debit_allowance_shortfall() {
        let cfg = anvil_local();
        // No approval was ever granted to the manager.
        let ledger = ledger_with_subscription(false, Faults::default())
            .await
            .with_code(merchant());
        let report = DiagnosticReporter::new(&ledger, &cfg)
            .explain_payment_failure(U256::one(), None)
            .await;

        assert_eq!(report.payer_balance, Some(pyusd(100)));
        assert_eq!(report.payer_allowance, Some(U256::zero()));
        assert!(report.treasury_balance.is_none());
        assert_eq!(report.likely_cause().unwrap().rule, "allowance_shortfall");
    }

    #[tokio::test]
    async fn test_report_treasury_shortfall() {
        let cfg = anvil_local();
        let ledger = ledger_with_subscription(true, Faults::default())
            .await
            .with_code(merchant());
        let report = DiagnosticReporter::new(&ledger, &cfg)
            .explain_payment_failure(U256::one(), None)
            .await;

        assert_eq!(report.treasury_balance, Some(U256::zero()));
        assert!(report.payer_balance.is_none());
        assert_eq!(report.likely_cause().unwrap().rule, "treasury_shortfall");
    }

    struct PausedMerchantRule;

    impl DiagnosticRule for PausedMerchantRule {
        fn name(&self) -> &str {
            "paused_merchant"
        }

        fn evaluate(&self, report: &DiagnosticReport, _decimals: u8) -> Vec<Finding> {
            if report.merchant != Some(merchant()) {
                return vec![];
            }
            vec![Finding {
                severity: Severity::Critical,
                rule: self.name().to_string(),
                message: "Merchant is paused by the operator".to_string(),
                suggested_fix: "Ask the merchant to resume billing.".to_string(),
            }]
        }
    }

    #[tokio::test]
    async fn test_added_rule_runs_after_builtins() {
        let cfg = anvil_local();
        let ledger = ledger_with_subscription(false, Faults::default()).await;
        let mut reporter = DiagnosticReporter::new(&ledger, &cfg);
        reporter.add_rule(Arc::new(PausedMerchantRule));
        let report = reporter.explain_payment_failure(U256::one(), None).await;

        let rules: Vec<&str> = report.findings.iter().map(|f| f.rule.as_str()).collect();
        assert_eq!(rules.first(), Some(&"non_contract_merchant"));
        assert_eq!(rules.last(), Some(&"paused_merchant"));
        assert_eq!(report.likely_cause().unwrap().rule, "non_contract_merchant");
    }

    #[tokio::test]
    async fn test_report_unknown_subscription() {
        let cfg = anvil_local();
        let ledger = SimulatedLedger::new(cfg.clone(), user());
        let report = DiagnosticReporter::new(&ledger, &cfg)
            .explain_payment_failure(U256::from(99u64), None)
            .await;

        assert!(report.subscription.is_none());
        assert_eq!(report.merchant_has_code, None);
        assert_eq!(report.notes.len(), 2);
        assert!(report.findings.is_empty());
    }
}
