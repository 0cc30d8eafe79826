use crate::abi::{subscription_manager_abi, token_abi, treasury_abi, AbiError};
use crate::ledger::{LedgerError, LedgerReader, LedgerWriter, SigningHandle, Subscription};
use crate::ledger_config::LedgerConfig;
use async_trait::async_trait;
use ethers::abi::{Detokenize, Tokenize};
use ethers::contract::{Contract, ContractCall, ContractError};
use ethers::providers::Middleware;
use ethers::types::{Address, TransactionReceipt, U256, U64};
use std::sync::Arc;

/// Ledger client backed by `ethers` contract bindings.
///
/// Generic over the middleware so the same client works for a wallet that
/// signs remotely (`Provider` with a default sender) and for a local key
/// (`SignerMiddleware`).
pub struct EthersLedger<M> {
    client: Arc<M>,
    account: Address,
    token: Contract<M>,
    treasury: Contract<M>,
    manager: Contract<M>,
    confirmations: usize,
}

impl<M: Middleware + 'static> EthersLedger<M> {
    pub fn new(client: Arc<M>, account: Address, config: &LedgerConfig) -> Result<Self, AbiError> {
        Ok(Self {
            token: Contract::new(config.token_address, token_abi()?, client.clone()),
            treasury: Contract::new(config.treasury_address, treasury_abi()?, client.clone()),
            manager: Contract::new(
                config.subscription_manager_address,
                subscription_manager_abi()?,
                client.clone(),
            ),
            client,
            account,
            confirmations: config.confirmations.max(1),
        })
    }

    fn prepare<T: Tokenize, D: Detokenize>(
        contract: &Contract<M>,
        method: &str,
        args: T,
    ) -> Result<ContractCall<M, D>, LedgerError> {
        contract
            .method::<T, D>(method, args)
            .map_err(|e| LedgerError::Decode(format!("{method}: {e}")))
    }

    async fn read<T: Tokenize + Send, D: Detokenize + Send + Sync>(
        &self,
        contract: &Contract<M>,
        method: &str,
        args: T,
    ) -> Result<D, LedgerError> {
        let call = Self::prepare::<T, D>(contract, method, args)?;
        call.call().await.map_err(|e| classify(method, e))
    }

    /// Submit a write from the connected account and wait for confirmation.
    async fn write<T: Tokenize + Send>(
        &self,
        contract: &Contract<M>,
        method: &str,
        args: T,
    ) -> Result<TransactionReceipt, LedgerError> {
        let call = Self::prepare::<T, ()>(contract, method, args)?.from(self.account);
        let pending = call.send().await.map_err(|e| classify(method, e))?;
        let tx_hash = pending.tx_hash();
        tracing::debug!(method, tx = ?tx_hash, "Transaction submitted");

        let receipt = pending
            .confirmations(self.confirmations)
            .await
            .map_err(|e| LedgerError::Unavailable(format!("{method}: {e}")))?
            .ok_or(LedgerError::Dropped(tx_hash))?;

        if receipt.status == Some(U64::zero()) {
            return Err(LedgerError::Reverted(format!(
                "{method}: transaction {tx_hash:?} reverted"
            )));
        }
        tracing::debug!(method, tx = ?tx_hash, block = ?receipt.block_number, "Transaction confirmed");
        Ok(receipt)
    }
}

/// Split contract errors into "the ledger said no" and "the ledger could not
/// be reached", keeping the decoded revert string when there is one.
fn classify<M: Middleware>(method: &str, err: ContractError<M>) -> LedgerError {
    if err.is_revert() {
        let reason = err
            .decode_revert::<String>()
            .unwrap_or_else(|| err.to_string());
        LedgerError::Reverted(format!("{method}: {reason}"))
    } else {
        LedgerError::Unavailable(format!("{method}: {err}"))
    }
}

#[async_trait]
impl<M: Middleware + 'static> LedgerReader for EthersLedger<M> {
    async fn token_balance(&self, owner: Address) -> Result<U256, LedgerError> {
        self.read(&self.token, "balanceOf", owner).await
    }

    async fn allowance(&self, owner: Address, spender: Address) -> Result<U256, LedgerError> {
        self.read(&self.token, "allowance", (owner, spender)).await
    }

    async fn treasury_balance(&self, sub_id: U256) -> Result<U256, LedgerError> {
        self.read(&self.treasury, "balances", sub_id).await
    }

    async fn subscription_by_id(&self, sub_id: U256) -> Result<Subscription, LedgerError> {
        let (user, merchant, amount, interval, active, use_treasury): (
            Address,
            Address,
            U256,
            U256,
            bool,
            bool,
        ) = self.read(&self.manager, "subscriptions", sub_id).await?;

        // Unset mapping slots read back as all zeroes.
        if user.is_zero() {
            return Err(LedgerError::NotFound(sub_id));
        }
        Ok(Subscription {
            id: sub_id,
            user,
            merchant,
            amount,
            interval,
            active,
            use_treasury,
        })
    }

    async fn has_code(&self, address: Address) -> Result<bool, LedgerError> {
        let code = self
            .client
            .get_code(address, None)
            .await
            .map_err(|e| LedgerError::Unavailable(format!("getCode: {e}")))?;
        Ok(!code.is_empty())
    }
}

#[async_trait]
impl<M: Middleware + 'static> LedgerWriter for EthersLedger<M> {
    async fn approve(
        &self,
        spender: Address,
        amount: U256,
    ) -> Result<TransactionReceipt, LedgerError> {
        self.write(&self.token, "approve", (spender, amount)).await
    }

    async fn set_subscription_manager(
        &self,
        manager: Address,
    ) -> Result<TransactionReceipt, LedgerError> {
        self.write(&self.treasury, "setSubscriptionManager", manager)
            .await
    }

    async fn create_subscription(
        &self,
        merchant: Address,
        amount: U256,
        interval: U256,
        use_treasury: bool,
    ) -> Result<TransactionReceipt, LedgerError> {
        self.write(
            &self.manager,
            "createSubscription",
            (merchant, amount, interval, use_treasury),
        )
        .await
    }

    async fn deposit(
        &self,
        sub_id: U256,
        amount: U256,
    ) -> Result<TransactionReceipt, LedgerError> {
        self.write(&self.treasury, "deposit", (sub_id, amount)).await
    }

    async fn execute_payment(&self, sub_id: U256) -> Result<TransactionReceipt, LedgerError> {
        self.write(&self.manager, "executePayment", sub_id).await
    }
}

impl<M: Middleware + 'static> SigningHandle for EthersLedger<M> {
    fn account(&self) -> Address {
        self.account
    }
}
