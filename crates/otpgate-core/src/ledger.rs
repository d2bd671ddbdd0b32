//! Balance Ledger - the only place account balances change

use otpgate_common::types::AccountId;
use otpgate_common::{Error, Result};
use otpgate_storage::repository::AccountRepository;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Affordability of an amount, without touching the balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceCheck {
    pub balance: Decimal,
    pub credit_limit: Decimal,
    pub required: Decimal,
    pub sufficient: bool,
}

/// A completed debit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Debit {
    pub amount: Decimal,
    pub balance_after: Decimal,
}

/// Serializes balance changes per account
pub struct Ledger {
    accounts: Arc<dyn AccountRepository>,
    locks: RwLock<HashMap<AccountId, Arc<Mutex<()>>>>,
}

impl Ledger {
    pub fn new(accounts: Arc<dyn AccountRepository>) -> Self {
        Self {
            accounts,
            locks: RwLock::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, account_id: AccountId) -> Arc<Mutex<()>> {
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(&account_id) {
                return lock.clone();
            }
        }

        let mut locks = self.locks.write().await;
        locks.entry(account_id).or_default().clone()
    }

    /// Whether `amount` fits within balance plus credit limit
    pub async fn check(&self, account_id: AccountId, amount: Decimal) -> Result<BalanceCheck> {
        let account = self
            .accounts
            .get(account_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("account {}", account_id)))?;

        Ok(BalanceCheck {
            balance: account.balance,
            credit_limit: account.credit_limit,
            required: amount,
            sufficient: account.balance - amount >= -account.credit_limit,
        })
    }

    /// Debit `amount` or fail with `InsufficientBalance` leaving the balance unchanged.
    pub async fn check_and_debit(&self, account_id: AccountId, amount: Decimal) -> Result<Debit> {
        if amount.is_sign_negative() {
            return Err(Error::Internal(format!(
                "refusing to debit negative amount {}",
                amount
            )));
        }

        let lock = self.lock_for(account_id).await;
        let _guard = lock.lock().await;

        match self.accounts.debit(account_id, amount).await? {
            Some(balance_after) => {
                debug!(%account_id, %amount, %balance_after, "Debited account");
                Ok(Debit {
                    amount,
                    balance_after,
                })
            }
            None => {
                let available = self
                    .accounts
                    .get(account_id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("account {}", account_id)))?
                    .available();
                warn!(%account_id, %amount, %available, "Insufficient balance");
                Err(Error::InsufficientBalance {
                    required: amount,
                    available,
                })
            }
        }
    }

    /// Return `amount` to the account after a send could not be recorded
    pub async fn credit(&self, account_id: AccountId, amount: Decimal) -> Result<Decimal> {
        let lock = self.lock_for(account_id).await;
        let _guard = lock.lock().await;

        let balance = self.accounts.credit(account_id, amount).await?;
        info!(%account_id, %amount, %balance, "Credited account");
        Ok(balance)
    }
}
