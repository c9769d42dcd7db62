use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::domain::{BankAccount, NewBankAccount, NewTransaction, PotRecord, Transaction};

/// Inclusive range of calendar dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    #[cfg(test)]
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// Postgres caps a single statement at this many bind parameters.
const MAX_BIND_PARAMS: usize = u16::MAX as usize;
const BINDS_PER_TRANSACTION: usize = 14;
const ROWS_PER_INSERT: usize = MAX_BIND_PARAMS / BINDS_PER_TRANSACTION;

fn insert_query(rows: &[NewTransaction]) -> QueryBuilder<'_, Postgres> {
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "
            INSERT INTO transactions (
                user_id,
                bank_id,
                item_id,
                amount,
                category,
                category_id,
                date,
                date_time,
                currency,
                merchant_name,
                name,
                transaction_code,
                transaction_id,
                transaction_type
            )
        ",
    );
    builder.push_values(rows, |mut b, row| {
        b.push_bind(&row.user_id)
            .push_bind(&row.bank_id)
            .push_bind(&row.item_id)
            .push_bind(row.amount)
            .push_bind(&row.category)
            .push_bind(&row.category_id)
            .push_bind(row.date)
            .push_bind(row.date_time)
            .push_bind(&row.currency)
            .push_bind(&row.merchant_name)
            .push_bind(&row.name)
            .push_bind(&row.transaction_code)
            .push_bind(&row.transaction_id)
            .push_bind(&row.transaction_type);
    });
    builder.push(" ON CONFLICT (transaction_id) DO NOTHING RETURNING *");
    builder
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn set_user_access_token(&self, user_id: &str, access_token: &str)
    -> Result<(), sqlx::Error>;

    async fn upsert_bank_account(&self, account: &NewBankAccount)
    -> Result<BankAccount, sqlx::Error>;

    async fn bank_account_by_item(&self, item_id: &str)
    -> Result<Option<BankAccount>, sqlx::Error>;

    async fn bank_account_by_access_token(
        &self,
        user_id: &str,
        access_token: &str,
    ) -> Result<Option<BankAccount>, sqlx::Error>;

    async fn bank_accounts_for_user(&self, user_id: &str) -> Result<Vec<BankAccount>, sqlx::Error>;

    async fn update_sync_cursor(&self, item_id: &str, cursor: &str) -> Result<(), sqlx::Error>;

    /// Removes the bank account and every transaction attached to it.
    async fn delete_bank_account(
        &self,
        user_id: &str,
        bank_id: Uuid,
        access_token: &str,
    ) -> Result<Option<BankAccount>, sqlx::Error>;

    async fn transactions_by_external_ids(
        &self,
        transaction_ids: &[String],
    ) -> Result<Vec<Transaction>, sqlx::Error>;

    async fn transactions_for_item(
        &self,
        item_id: &str,
        window: Option<DateWindow>,
    ) -> Result<Vec<Transaction>, sqlx::Error>;

    async fn transactions_for_user_by_ids(
        &self,
        user_id: &str,
        transaction_ids: &[String],
    ) -> Result<Vec<Transaction>, sqlx::Error>;

    /// Inserts the batch atomically and returns the rows actually written.
    async fn insert_transactions(&self, rows: &[NewTransaction])
    -> Result<Vec<Transaction>, sqlx::Error>;

    async fn pots_for_user(&self, user_id: &str) -> Result<Vec<PotRecord>, sqlx::Error>;

    async fn insert_pot(&self, pot: &PotRecord) -> Result<PotRecord, sqlx::Error>;

    async fn update_pot(&self, pot: &PotRecord) -> Result<Option<PotRecord>, sqlx::Error>;

    async fn delete_pot(&self, user_id: &str, id: Uuid) -> Result<bool, sqlx::Error>;
}

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPool::connect(database_url).await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn set_user_access_token(
        &self,
        user_id: &str,
        access_token: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "
                INSERT INTO users (id, access_token) VALUES ($1, $2)
                ON CONFLICT (id)
                DO UPDATE SET access_token = EXCLUDED.access_token
            ",
        )
        .bind(user_id)
        .bind(access_token)
        .execute(&self.pool)
        .await
        .map(|_| ())
    }

    async fn upsert_bank_account(
        &self,
        account: &NewBankAccount,
    ) -> Result<BankAccount, sqlx::Error> {
        sqlx::query_as::<_, BankAccount>(
            "
                INSERT INTO bank_accounts (
                    access_token,
                    bank_name,
                    item_id,
                    user_id
                ) VALUES ($1, $2, $3, $4)
                ON CONFLICT (item_id)
                DO UPDATE SET
                    access_token = EXCLUDED.access_token,
                    bank_name = EXCLUDED.bank_name,
                    user_id = EXCLUDED.user_id
                RETURNING *
            ",
        )
        .bind(&account.access_token)
        .bind(&account.bank_name)
        .bind(&account.item_id)
        .bind(&account.user_id)
        .fetch_one(&self.pool)
        .await
        .inspect_err(|err| {
            tracing::error!(
                "Failed to upsert bank account item_id={} user_id={}: {}",
                &account.item_id,
                &account.user_id,
                err
            );
        })
    }

    async fn bank_account_by_item(
        &self,
        item_id: &str,
    ) -> Result<Option<BankAccount>, sqlx::Error> {
        sqlx::query_as::<_, BankAccount>(
            "
                SELECT * FROM bank_accounts
                WHERE item_id = $1
            ",
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn bank_account_by_access_token(
        &self,
        user_id: &str,
        access_token: &str,
    ) -> Result<Option<BankAccount>, sqlx::Error> {
        sqlx::query_as::<_, BankAccount>(
            "
                SELECT * FROM bank_accounts
                WHERE user_id = $1 AND access_token = $2
            ",
        )
        .bind(user_id)
        .bind(access_token)
        .fetch_optional(&self.pool)
        .await
    }

    async fn bank_accounts_for_user(&self, user_id: &str) -> Result<Vec<BankAccount>, sqlx::Error> {
        sqlx::query_as::<_, BankAccount>(
            "
                SELECT * FROM bank_accounts
                WHERE user_id = $1
                ORDER BY created_at
            ",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
    }

    async fn update_sync_cursor(&self, item_id: &str, cursor: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE bank_accounts SET sync_cursor = $2 WHERE item_id = $1")
            .bind(item_id)
            .bind(cursor)
            .execute(&self.pool)
            .await
            .map(|_| ())
    }

    async fn delete_bank_account(
        &self,
        user_id: &str,
        bank_id: Uuid,
        access_token: &str,
    ) -> Result<Option<BankAccount>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let account = sqlx::query_as::<_, BankAccount>(
            "
                SELECT * FROM bank_accounts
                WHERE id = $1 AND user_id = $2 AND access_token = $3
                FOR UPDATE
            ",
        )
        .bind(bank_id)
        .bind(user_id)
        .bind(access_token)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(account) = account else {
            return Ok(None);
        };

        let removed = sqlx::query("DELETE FROM transactions WHERE item_id = $1")
            .bind(&account.item_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM bank_accounts WHERE id = $1")
            .bind(account.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            "Deleted bank account id={} and {} transactions",
            account.id,
            removed.rows_affected()
        );
        Ok(Some(account))
    }

    async fn transactions_by_external_ids(
        &self,
        transaction_ids: &[String],
    ) -> Result<Vec<Transaction>, sqlx::Error> {
        sqlx::query_as::<_, Transaction>(
            "
                SELECT * FROM transactions
                WHERE transaction_id = ANY($1)
                ORDER BY date DESC
            ",
        )
        .bind(transaction_ids)
        .fetch_all(&self.pool)
        .await
    }

    async fn transactions_for_item(
        &self,
        item_id: &str,
        window: Option<DateWindow>,
    ) -> Result<Vec<Transaction>, sqlx::Error> {
        sqlx::query_as::<_, Transaction>(
            "
                SELECT * FROM transactions
                WHERE item_id = $1
                    AND ($2::date IS NULL OR date >= $2)
                    AND ($3::date IS NULL OR date <= $3)
                ORDER BY date DESC
            ",
        )
        .bind(item_id)
        .bind(window.map(|w| w.start))
        .bind(window.map(|w| w.end))
        .fetch_all(&self.pool)
        .await
    }

    async fn transactions_for_user_by_ids(
        &self,
        user_id: &str,
        transaction_ids: &[String],
    ) -> Result<Vec<Transaction>, sqlx::Error> {
        sqlx::query_as::<_, Transaction>(
            "
                SELECT * FROM transactions
                WHERE user_id = $1 AND transaction_id = ANY($2)
            ",
        )
        .bind(user_id)
        .bind(transaction_ids)
        .fetch_all(&self.pool)
        .await
    }

    async fn insert_transactions(
        &self,
        rows: &[NewTransaction],
    ) -> Result<Vec<Transaction>, sqlx::Error> {
        if rows.is_empty() {
            return Ok(vec![]);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(rows.len());
        for chunk in rows.chunks(ROWS_PER_INSERT) {
            let stored = insert_query(chunk)
                .build_query_as::<Transaction>()
                .fetch_all(&mut *tx)
                .await
                .inspect_err(|err| {
                    tracing::error!(
                        "Failed to insert {} of {} transactions: {}",
                        chunk.len(),
                        rows.len(),
                        err
                    )
                })?;
            inserted.extend(stored);
        }
        tx.commit().await?;

        Ok(inserted)
    }

    async fn pots_for_user(&self, user_id: &str) -> Result<Vec<PotRecord>, sqlx::Error> {
        sqlx::query_as::<_, PotRecord>(
            "
                SELECT * FROM pots
                WHERE user_id = $1
            ",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
    }

    async fn insert_pot(&self, pot: &PotRecord) -> Result<PotRecord, sqlx::Error> {
        sqlx::query_as::<_, PotRecord>(
            "
                INSERT INTO pots (
                    id,
                    label,
                    amount,
                    color,
                    user_id,
                    transaction_ids
                ) VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING *
            ",
        )
        .bind(pot.id)
        .bind(&pot.label)
        .bind(&pot.amount)
        .bind(&pot.color)
        .bind(&pot.user_id)
        .bind(&pot.transaction_ids)
        .fetch_one(&self.pool)
        .await
    }

    async fn update_pot(&self, pot: &PotRecord) -> Result<Option<PotRecord>, sqlx::Error> {
        sqlx::query_as::<_, PotRecord>(
            "
                UPDATE pots SET
                    label = $3,
                    amount = $4,
                    color = $5,
                    transaction_ids = $6
                WHERE id = $1 AND user_id = $2
                RETURNING *
            ",
        )
        .bind(pot.id)
        .bind(&pot.user_id)
        .bind(&pot.label)
        .bind(&pot.amount)
        .bind(&pot.color)
        .bind(&pot.transaction_ids)
        .fetch_optional(&self.pool)
        .await
    }

    async fn delete_pot(&self, user_id: &str, id: Uuid) -> Result<bool, sqlx::Error> {
        sqlx::query("DELETE FROM pots WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map(|res| res.rows_affected() > 0)
    }
}
