//! Account repository

use crate::db::DatabasePool;
use crate::models::{Account, NewAccount};
use async_trait::async_trait;
use chrono::Utc;
use otpgate_common::types::{AccountId, AccountStatus};
use otpgate_common::{Error, Result};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Account repository trait
#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// Create a new account
    async fn create(&self, input: NewAccount) -> Result<Account>;

    /// Get an account by ID
    async fn get(&self, id: AccountId) -> Result<Option<Account>>;

    /// Subtract `amount` if the balance stays at or above `-credit_limit`.
    ///
    /// Returns the new balance, or `None` when the account lacks funds.
    async fn debit(&self, id: AccountId, amount: Decimal) -> Result<Option<Decimal>>;

    /// Add `amount` back to the balance and return the new balance
    async fn credit(&self, id: AccountId, amount: Decimal) -> Result<Decimal>;
}

const ACCOUNT_COLUMNS: &str = "id, name, balance, credit_limit, currency, rate_limit_rps, \
     allowed_ips, status, created_at, updated_at";

/// PostgreSQL account repository
pub struct DbAccountRepository {
    pool: DatabasePool,
}

impl DbAccountRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountRepository for DbAccountRepository {
    async fn create(&self, input: NewAccount) -> Result<Account> {
        let rps = input.rate_limit_rps.map(|rps| rps as i32);
        sqlx::query_as::<_, Account>(&format!(
            r#"
            INSERT INTO accounts (id, name, balance, credit_limit, currency, rate_limit_rps,
                                  allowed_ips, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), NOW())
            ON CONFLICT (id) DO UPDATE SET updated_at = accounts.updated_at
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        ))
        .bind(input.id)
        .bind(&input.name)
        .bind(input.balance)
        .bind(input.credit_limit)
        .bind(&input.currency)
        .bind(rps)
        .bind(&input.allowed_ips)
        .bind(AccountStatus::Active.as_str())
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get(&self, id: AccountId) -> Result<Option<Account>> {
        sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts WHERE id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn debit(&self, id: AccountId, amount: Decimal) -> Result<Option<Decimal>> {
        let balance: Option<(Decimal,)> = sqlx::query_as(
            r#"
            UPDATE accounts
            SET balance = balance - $2, updated_at = NOW()
            WHERE id = $1 AND balance - $2 >= -credit_limit
            RETURNING balance
            "#,
        )
        .bind(id)
        .bind(amount)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(balance.map(|(b,)| b))
    }

    async fn credit(&self, id: AccountId, amount: Decimal) -> Result<Decimal> {
        let balance: Option<(Decimal,)> = sqlx::query_as(
            r#"
            UPDATE accounts
            SET balance = balance + $2, updated_at = NOW()
            WHERE id = $1
            RETURNING balance
            "#,
        )
        .bind(id)
        .bind(amount)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        balance
            .map(|(b,)| b)
            .ok_or_else(|| Error::NotFound(format!("account {}", id)))
    }
}

/// In-memory account repository
#[derive(Default)]
pub struct MemoryAccountRepository {
    accounts: RwLock<HashMap<AccountId, Account>>,
}

impl MemoryAccountRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountRepository for MemoryAccountRepository {
    async fn create(&self, input: NewAccount) -> Result<Account> {
        let mut accounts = self.accounts.write().await;
        if let Some(existing) = accounts.get(&input.id) {
            return Ok(existing.clone());
        }

        let now = Utc::now();
        let account = Account {
            id: input.id,
            name: input.name,
            balance: input.balance,
            credit_limit: input.credit_limit,
            currency: input.currency,
            rate_limit_rps: input.rate_limit_rps.map(|rps| rps as i32),
            allowed_ips: input.allowed_ips,
            status: AccountStatus::Active.as_str().to_string(),
            created_at: now,
            updated_at: now,
        };
        accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get(&self, id: AccountId) -> Result<Option<Account>> {
        Ok(self.accounts.read().await.get(&id).cloned())
    }

    async fn debit(&self, id: AccountId, amount: Decimal) -> Result<Option<Decimal>> {
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("account {}", id)))?;

        if account.balance - amount < -account.credit_limit {
            return Ok(None);
        }
        account.balance -= amount;
        account.updated_at = Utc::now();
        Ok(Some(account.balance))
    }

    async fn credit(&self, id: AccountId, amount: Decimal) -> Result<Decimal> {
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("account {}", id)))?;

        account.balance += amount;
        account.updated_at = Utc::now();
        Ok(account.balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn new_account(balance: Decimal, credit_limit: Decimal) -> NewAccount {
        NewAccount {
            id: Uuid::new_v4(),
            name: "acme".to_string(),
            balance,
            credit_limit,
            currency: "UZS".to_string(),
            rate_limit_rps: Some(5),
            allowed_ips: vec![],
        }
    }

    #[tokio::test]
    async fn test_debit_respects_credit_limit() {
        let repo = MemoryAccountRepository::new();
        let account = repo.create(new_account(dec!(100), dec!(50))).await.unwrap();

        assert_eq!(repo.debit(account.id, dec!(120)).await.unwrap(), Some(dec!(-20)));
        assert_eq!(repo.debit(account.id, dec!(31)).await.unwrap(), None);
        assert_eq!(repo.debit(account.id, dec!(30)).await.unwrap(), Some(dec!(-50)));

        let stored = repo.get(account.id).await.unwrap().unwrap();
        assert_eq!(stored.balance, dec!(-50));
        assert_eq!(stored.available(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_credit_restores_balance() {
        let repo = MemoryAccountRepository::new();
        let account = repo.create(new_account(dec!(10), Decimal::ZERO)).await.unwrap();

        repo.debit(account.id, dec!(10)).await.unwrap();
        assert_eq!(repo.credit(account.id, dec!(10)).await.unwrap(), dec!(10));
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let repo = MemoryAccountRepository::new();
        assert!(repo.get(Uuid::new_v4()).await.unwrap().is_none());
        assert!(matches!(
            repo.debit(Uuid::new_v4(), dec!(1)).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_is_idempotent_per_id() {
        let repo = MemoryAccountRepository::new();
        let input = new_account(dec!(10), Decimal::ZERO);
        let first = repo.create(input.clone()).await.unwrap();
        repo.debit(first.id, dec!(4)).await.unwrap();

        let second = repo.create(input).await.unwrap();
        assert_eq!(second.balance, dec!(6));
        assert_eq!(second.rate_limit(), Some(5));
        assert!(second.is_active());
    }
}
