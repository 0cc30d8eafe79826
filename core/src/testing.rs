//! In-memory ledger, wallet and notification doubles.
//!
//! `SimulatedLedger` keeps just enough token, treasury and subscription state
//! for the orchestrator to behave as it would against a real node, and
//! records every call so tests can assert on ordering.

use crate::ledger::{LedgerError, LedgerReader, LedgerWriter, SigningHandle, Subscription};
use crate::ledger_config::LedgerConfig;
use crate::notify::{NoticeSeverity, NotificationSink, ProgressIndicator};
use crate::wallet::{SigningProvider, WalletError};
use async_trait::async_trait;
use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, Log, TransactionReceipt, H256, U256, U64};
use ethers::utils::keccak256;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

// ── Log builders ──────────────────────────────────────────────────────────────

fn event_topic(signature: &str) -> H256 {
    H256::from(keccak256(signature.as_bytes()))
}

fn address_topic(address: Address) -> H256 {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_bytes());
    H256(word)
}

fn uint_topic(value: U256) -> H256 {
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    H256(word)
}

/// `SubscriptionCreated` exactly as the subscription manager emits it.
pub fn subscription_created_log(
    emitter: Address,
    sub_id: U256,
    user: Address,
    merchant: Address,
    amount: U256,
    interval: U256,
    use_treasury: bool,
) -> Log {
    Log {
        address: emitter,
        topics: vec![
            event_topic("SubscriptionCreated(uint256,address,address,uint256,uint256,bool)"),
            uint_topic(sub_id),
            address_topic(user),
            address_topic(merchant),
        ],
        data: Bytes::from(encode(&[
            Token::Uint(amount),
            Token::Uint(interval),
            Token::Bool(use_treasury),
        ])),
        ..Default::default()
    }
}

/// ERC-20 `Transfer`.
pub fn transfer_log(token: Address, from: Address, to: Address, value: U256) -> Log {
    Log {
        address: token,
        topics: vec![
            event_topic("Transfer(address,address,uint256)"),
            address_topic(from),
            address_topic(to),
        ],
        data: Bytes::from(encode(&[Token::Uint(value)])),
        ..Default::default()
    }
}

/// ERC-20 `Approval`.
pub fn approval_log(token: Address, owner: Address, spender: Address, value: U256) -> Log {
    Log {
        address: token,
        topics: vec![
            event_topic("Approval(address,address,uint256)"),
            address_topic(owner),
            address_topic(spender),
        ],
        data: Bytes::from(encode(&[Token::Uint(value)])),
        ..Default::default()
    }
}

/// A successful receipt carrying `logs`.
pub fn receipt_with_logs(logs: Vec<Log>) -> TransactionReceipt {
    TransactionReceipt {
        transaction_hash: H256::from_low_u64_be(1),
        status: Some(U64::from(1u64)),
        logs,
        ..Default::default()
    }
}

// ── Simulated ledger ──────────────────────────────────────────────────────────

/// One remote call as seen by the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerCall {
    TokenBalance(Address),
    Allowance { owner: Address, spender: Address },
    TreasuryBalance(U256),
    SubscriptionById(U256),
    HasCode(Address),
    SetSubscriptionManager(Address),
    Approve { spender: Address, amount: U256 },
    CreateSubscription {
        merchant: Address,
        amount: U256,
        interval: U256,
        use_treasury: bool,
    },
    Deposit { sub_id: U256, amount: U256 },
    ExecutePayment(U256),
}

impl LedgerCall {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::SetSubscriptionManager(_)
                | Self::Approve { .. }
                | Self::CreateSubscription { .. }
                | Self::Deposit { .. }
                | Self::ExecutePayment(_)
        )
    }
}

/// Failure knobs. Reverts carry the reason the ledger reports.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Every read fails as if the node were unreachable.
    pub unavailable: bool,
    /// Reads succeed but every write fails to reach the node.
    pub unavailable_writes: bool,
    pub revert_authorization: Option<String>,
    pub revert_approval: Option<String>,
    pub revert_creation: Option<String>,
    pub revert_deposit: Option<String>,
    pub revert_payment: Option<String>,
    /// Creation succeeds but its receipt lacks `SubscriptionCreated`.
    pub omit_creation_event: bool,
    pub fail_has_code: bool,
    pub fail_subscription_read: bool,
    pub fail_treasury_read: bool,
    /// Token logs placed around the creation event.
    pub unrelated_logs_before: usize,
    pub unrelated_logs_after: usize,
}

#[derive(Default)]
struct State {
    balances: HashMap<Address, U256>,
    allowances: HashMap<(Address, Address), U256>,
    treasury: HashMap<U256, U256>,
    subscriptions: HashMap<U256, Subscription>,
    code: HashSet<Address>,
    next_id: u64,
    tx_count: u64,
    calls: Vec<LedgerCall>,
}

pub struct SimulatedLedger {
    config: LedgerConfig,
    account: Address,
    faults: Faults,
    state: Mutex<State>,
}

impl SimulatedLedger {
    pub fn new(config: LedgerConfig, account: Address) -> Self {
        let mut state = State {
            next_id: 1,
            ..Default::default()
        };
        state.code.insert(config.token_address);
        state.code.insert(config.treasury_address);
        state.code.insert(config.subscription_manager_address);
        Self {
            config,
            account,
            faults: Faults::default(),
            state: Mutex::new(state),
        }
    }

    pub fn with_balance(self, owner: Address, amount: U256) -> Self {
        self.lock().balances.insert(owner, amount);
        self
    }

    /// Mark `address` as a deployed contract.
    pub fn with_code(self, address: Address) -> Self {
        self.lock().code.insert(address);
        self
    }

    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }

    pub fn calls(&self) -> Vec<LedgerCall> {
        self.lock().calls.clone()
    }

    pub fn writes(&self) -> Vec<LedgerCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.is_write())
            .cloned()
            .collect()
    }

    pub fn balance_of(&self, owner: Address) -> U256 {
        self.lock().balances.get(&owner).copied().unwrap_or_default()
    }

    pub fn allowance_of(&self, owner: Address, spender: Address) -> U256 {
        self.lock()
            .allowances
            .get(&(owner, spender))
            .copied()
            .unwrap_or_default()
    }

    pub fn treasury_of(&self, sub_id: U256) -> U256 {
        self.lock().treasury.get(&sub_id).copied().unwrap_or_default()
    }

    pub fn subscription(&self, sub_id: U256) -> Option<Subscription> {
        self.lock().subscriptions.get(&sub_id).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: LedgerCall) -> MutexGuard<'_, State> {
        let mut state = self.lock();
        state.calls.push(call);
        state
    }

    fn check_reachable(&self) -> Result<(), LedgerError> {
        if self.faults.unavailable {
            return Err(LedgerError::Unavailable(
                "connection refused (simulated)".to_string(),
            ));
        }
        Ok(())
    }

    fn check_submittable(&self) -> Result<(), LedgerError> {
        if self.faults.unavailable || self.faults.unavailable_writes {
            return Err(LedgerError::Unavailable(
                "eth_sendRawTransaction: connection reset (simulated)".to_string(),
            ));
        }
        Ok(())
    }

    fn receipt(state: &mut State, logs: Vec<Log>) -> TransactionReceipt {
        state.tx_count += 1;
        TransactionReceipt {
            transaction_hash: H256::from_low_u64_be(state.tx_count),
            status: Some(U64::from(1u64)),
            logs,
            ..Default::default()
        }
    }

    fn unrelated_logs(&self, count: usize) -> Vec<Log> {
        (0..count)
            .map(|i| {
                transfer_log(
                    self.config.token_address,
                    self.account,
                    Address::from_low_u64_be(i as u64 + 1),
                    U256::from(i as u64 + 1),
                )
            })
            .collect()
    }

    /// Spend `amount` of `owner`'s allowance to `spender` and move the tokens
    /// out of the owner's balance.
    fn pull(
        state: &mut State,
        owner: Address,
        spender: Address,
        amount: U256,
    ) -> Result<(), LedgerError> {
        let allowance = state
            .allowances
            .get(&(owner, spender))
            .copied()
            .unwrap_or_default();
        if allowance < amount {
            return Err(LedgerError::Reverted(
                "ERC20: insufficient allowance".to_string(),
            ));
        }
        let balance = state.balances.get(&owner).copied().unwrap_or_default();
        if balance < amount {
            return Err(LedgerError::Reverted(
                "ERC20: transfer amount exceeds balance".to_string(),
            ));
        }
        state.allowances.insert((owner, spender), allowance - amount);
        state.balances.insert(owner, balance - amount);
        Ok(())
    }
}

#[async_trait]
impl LedgerReader for SimulatedLedger {
    async fn token_balance(&self, owner: Address) -> Result<U256, LedgerError> {
        let state = self.record(LedgerCall::TokenBalance(owner));
        self.check_reachable()?;
        Ok(state.balances.get(&owner).copied().unwrap_or_default())
    }

    async fn allowance(&self, owner: Address, spender: Address) -> Result<U256, LedgerError> {
        let state = self.record(LedgerCall::Allowance { owner, spender });
        self.check_reachable()?;
        Ok(state
            .allowances
            .get(&(owner, spender))
            .copied()
            .unwrap_or_default())
    }

    async fn treasury_balance(&self, sub_id: U256) -> Result<U256, LedgerError> {
        let state = self.record(LedgerCall::TreasuryBalance(sub_id));
        self.check_reachable()?;
        if self.faults.fail_treasury_read {
            return Err(LedgerError::Unavailable("treasury read timed out".to_string()));
        }
        Ok(state.treasury.get(&sub_id).copied().unwrap_or_default())
    }

    async fn subscription_by_id(&self, sub_id: U256) -> Result<Subscription, LedgerError> {
        let state = self.record(LedgerCall::SubscriptionById(sub_id));
        self.check_reachable()?;
        if self.faults.fail_subscription_read {
            return Err(LedgerError::Unavailable(
                "subscription read timed out".to_string(),
            ));
        }
        state
            .subscriptions
            .get(&sub_id)
            .cloned()
            .ok_or(LedgerError::NotFound(sub_id))
    }

    async fn has_code(&self, address: Address) -> Result<bool, LedgerError> {
        let state = self.record(LedgerCall::HasCode(address));
        self.check_reachable()?;
        if self.faults.fail_has_code {
            return Err(LedgerError::Unavailable("eth_getCode timed out".to_string()));
        }
        Ok(state.code.contains(&address))
    }
}

#[async_trait]
impl LedgerWriter for SimulatedLedger {
    async fn approve(
        &self,
        spender: Address,
        amount: U256,
    ) -> Result<TransactionReceipt, LedgerError> {
        let mut state = self.record(LedgerCall::Approve { spender, amount });
        self.check_submittable()?;
        if let Some(reason) = &self.faults.revert_approval {
            return Err(LedgerError::Reverted(reason.clone()));
        }
        state.allowances.insert((self.account, spender), amount);
        let log = approval_log(self.config.token_address, self.account, spender, amount);
        Ok(Self::receipt(&mut state, vec![log]))
    }

    async fn set_subscription_manager(
        &self,
        manager: Address,
    ) -> Result<TransactionReceipt, LedgerError> {
        let mut state = self.record(LedgerCall::SetSubscriptionManager(manager));
        self.check_submittable()?;
        if let Some(reason) = &self.faults.revert_authorization {
            return Err(LedgerError::Reverted(reason.clone()));
        }
        Ok(Self::receipt(&mut state, Vec::new()))
    }

    async fn create_subscription(
        &self,
        merchant: Address,
        amount: U256,
        interval: U256,
        use_treasury: bool,
    ) -> Result<TransactionReceipt, LedgerError> {
        let mut state = self.record(LedgerCall::CreateSubscription {
            merchant,
            amount,
            interval,
            use_treasury,
        });
        self.check_submittable()?;
        if let Some(reason) = &self.faults.revert_creation {
            return Err(LedgerError::Reverted(reason.clone()));
        }

        let id = U256::from(state.next_id);
        state.next_id += 1;
        state.subscriptions.insert(
            id,
            Subscription {
                id,
                user: self.account,
                merchant,
                amount,
                interval,
                active: true,
                use_treasury,
            },
        );

        let mut logs = self.unrelated_logs(self.faults.unrelated_logs_before);
        if !self.faults.omit_creation_event {
            logs.push(subscription_created_log(
                self.config.subscription_manager_address,
                id,
                self.account,
                merchant,
                amount,
                interval,
                use_treasury,
            ));
        }
        logs.extend(self.unrelated_logs(self.faults.unrelated_logs_after));
        Ok(Self::receipt(&mut state, logs))
    }

    async fn deposit(
        &self,
        sub_id: U256,
        amount: U256,
    ) -> Result<TransactionReceipt, LedgerError> {
        let mut state = self.record(LedgerCall::Deposit { sub_id, amount });
        self.check_submittable()?;
        if let Some(reason) = &self.faults.revert_deposit {
            return Err(LedgerError::Reverted(reason.clone()));
        }
        if !state.subscriptions.contains_key(&sub_id) {
            return Err(LedgerError::Reverted("Treasury: unknown subscription".to_string()));
        }
        let treasury = self.config.treasury_address;
        Self::pull(&mut state, self.account, treasury, amount)?;
        *state.treasury.entry(sub_id).or_default() += amount;
        let log = transfer_log(self.config.token_address, self.account, treasury, amount);
        Ok(Self::receipt(&mut state, vec![log]))
    }

    async fn execute_payment(&self, sub_id: U256) -> Result<TransactionReceipt, LedgerError> {
        let mut state = self.record(LedgerCall::ExecutePayment(sub_id));
        self.check_submittable()?;
        if let Some(reason) = &self.faults.revert_payment {
            return Err(LedgerError::Reverted(reason.clone()));
        }
        let sub = state
            .subscriptions
            .get(&sub_id)
            .cloned()
            .ok_or_else(|| LedgerError::Reverted("Subscription does not exist".to_string()))?;
        if !sub.active {
            return Err(LedgerError::Reverted("Subscription inactive".to_string()));
        }

        let payer = if sub.use_treasury {
            let held = state.treasury.get(&sub_id).copied().unwrap_or_default();
            if held < sub.amount {
                return Err(LedgerError::Reverted(
                    "Treasury: insufficient balance".to_string(),
                ));
            }
            state.treasury.insert(sub_id, held - sub.amount);
            self.config.treasury_address
        } else {
            let manager = self.config.subscription_manager_address;
            Self::pull(&mut state, sub.user, manager, sub.amount)?;
            sub.user
        };
        *state.balances.entry(sub.merchant).or_default() += sub.amount;

        let log = transfer_log(self.config.token_address, payer, sub.merchant, sub.amount);
        Ok(Self::receipt(&mut state, vec![log]))
    }
}

impl SigningHandle for SimulatedLedger {
    fn account(&self) -> Address {
        self.account
    }
}

// ── Simulated wallet ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalletMode {
    Ready,
    Missing,
    Rejecting,
}

pub struct SimulatedWallet {
    mode: WalletMode,
    ledger: Option<Arc<SimulatedLedger>>,
    connects: AtomicUsize,
}

impl SimulatedWallet {
    /// Connects to `ledger` without prompting.
    pub fn ready(ledger: Arc<SimulatedLedger>) -> Self {
        Self {
            mode: WalletMode::Ready,
            ledger: Some(ledger),
            connects: AtomicUsize::new(0),
        }
    }

    /// No wallet installed.
    pub fn missing() -> Self {
        Self {
            mode: WalletMode::Missing,
            ledger: None,
            connects: AtomicUsize::new(0),
        }
    }

    /// User dismisses the connection prompt.
    pub fn rejecting() -> Self {
        Self {
            mode: WalletMode::Rejecting,
            ledger: None,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SigningProvider for SimulatedWallet {
    async fn connect(&self) -> Result<Arc<dyn SigningHandle>, WalletError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match (self.mode, &self.ledger) {
            (WalletMode::Ready, Some(ledger)) => Ok(Arc::clone(ledger) as Arc<dyn SigningHandle>),
            (WalletMode::Rejecting, _) => Err(WalletError::Rejected(
                "User rejected the request.".to_string(),
            )),
            _ => Err(WalletError::Unavailable("no wallet detected".to_string())),
        }
    }
}

// ── Recording notifier / progress ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub message: String,
    pub severity: NoticeSeverity,
    pub duration_ms: u64,
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl NotificationSink for RecordingNotifier {
    fn notify(&self, message: &str, severity: NoticeSeverity, duration_ms: u64) {
        self.notices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Notice {
                message: message.to_string(),
                severity,
                duration_ms,
            });
    }
}

#[derive(Debug, Default)]
pub struct RecordingProgress {
    begun: Mutex<Vec<String>>,
    ended: AtomicUsize,
}

impl RecordingProgress {
    pub fn begun(&self) -> Vec<String> {
        self.begun.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn ended(&self) -> usize {
        self.ended.load(Ordering::SeqCst)
    }
}

impl ProgressIndicator for RecordingProgress {
    fn begin(&self, label: &str) {
        self.begun
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(label.to_string());
    }

    fn end(&self) {
        self.ended.fetch_add(1, Ordering::SeqCst);
    }
}
