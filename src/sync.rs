use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Datelike, NaiveDate};

use crate::{
    db::{DateWindow, Store},
    domain::{BankAccount, DateBundle, NewBankAccount, NewTransaction, Transaction},
    error::AppError,
    notifier::{Notifier, PushEvent},
    plaid::{Aggregator, PlaidTransaction},
};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SyncOutcome {
    /// Rows written by this run.
    pub inserted: usize,
    /// Stored rows matching the fetch, or every stored row for the account
    /// (and window) when the fetch came back empty.
    pub transactions: Vec<Transaction>,
}

/// Drives linking a bank and pulling its transactions into the store.
pub struct SyncEngine {
    aggregator: Arc<dyn Aggregator>,
    store: Arc<dyn Store>,
    notifier: Notifier,
    page_size: u32,
}

impl SyncEngine {
    pub fn new(
        aggregator: Arc<dyn Aggregator>,
        store: Arc<dyn Store>,
        notifier: Notifier,
        page_size: u32,
    ) -> Self {
        SyncEngine {
            aggregator,
            store,
            notifier,
            page_size,
        }
    }

    pub async fn exchange_and_onboard(
        &self,
        public_token: &str,
        user_id: &str,
    ) -> Result<BankAccount, AppError> {
        let exchange = self.aggregator.exchange_public_token(public_token).await?;
        tracing::info!(
            "Exchanged public token for item_id={} user_id={}",
            &exchange.item_id,
            user_id
        );

        self.store
            .set_user_access_token(user_id, &exchange.access_token)
            .await?;

        let bank_name = match self
            .aggregator
            .item_institution_name(&exchange.access_token)
            .await
        {
            Ok(name) => name,
            Err(err) => {
                tracing::warn!(
                    "Institution lookup failed for item_id={}, storing without a name: {}",
                    &exchange.item_id,
                    err
                );
                None
            }
        };

        let account = self
            .store
            .upsert_bank_account(&NewBankAccount {
                access_token: exchange.access_token,
                bank_name: bank_name.unwrap_or_default(),
                item_id: exchange.item_id,
                user_id: user_id.to_string(),
            })
            .await?;
        tracing::info!("Bank account added for item_id={}", &account.item_id);

        match self.sync_transactions(&account.item_id).await {
            Ok(outcome) => tracing::info!(
                "Initial sync stored {} transactions for item_id={}",
                outcome.inserted,
                &account.item_id
            ),
            Err(err) => tracing::error!(
                "Initial sync failed for item_id={}, waiting for the next webhook: {}",
                &account.item_id,
                err
            ),
        }

        self.notifier
            .broadcast(PushEvent::NewBankCardReady {
                item_id: account.item_id.clone(),
            })
            .await;

        Ok(account)
    }

    /// Cursor-based incremental sync. Only `added` transactions are applied.
    pub async fn sync_transactions(&self, item_id: &str) -> Result<SyncOutcome, AppError> {
        let Some(account) = self.store.bank_account_by_item(item_id).await? else {
            tracing::warn!("No bank account found for item_id={}, skipping sync", item_id);
            return Ok(SyncOutcome::default());
        };

        let mut cursor = account.sync_cursor.clone();
        let mut added = Vec::new();
        loop {
            let page = self
                .aggregator
                .transactions_sync(&account.access_token, cursor.as_deref())
                .await?;

            if !page.modified.is_empty() || !page.removed.is_empty() {
                let removed_ids = page
                    .removed
                    .iter()
                    .map(|removed| removed.transaction_id.as_str())
                    .collect::<Vec<_>>();
                tracing::debug!(
                    "Ignoring {} modified and {} removed transactions for item_id={}: removed={:?}",
                    page.modified.len(),
                    page.removed.len(),
                    item_id,
                    removed_ids
                );
            }
            added.extend(page.added);

            let advanced = cursor.as_deref() != Some(page.next_cursor.as_str());
            cursor = Some(page.next_cursor);
            if !page.has_more || !advanced {
                break;
            }
        }

        let outcome = self.persist_unseen(&account, added, None).await?;

        if let Some(cursor) = cursor.filter(|c| Some(c) != account.sync_cursor.as_ref()) {
            self.store.update_sync_cursor(item_id, &cursor).await?;
        }

        Ok(outcome)
    }

    /// Date-range fetch for one window. A single page of `page_size` rows is
    /// requested; anything past it is not fetched.
    pub async fn refresh_window(
        &self,
        account: &BankAccount,
        window: DateWindow,
    ) -> Result<SyncOutcome, AppError> {
        let fetched = self
            .aggregator
            .transactions_by_date_range(
                &account.access_token,
                window.start,
                window.end,
                self.page_size,
            )
            .await?;
        tracing::info!(
            "Retrieved {} transactions for item_id={}",
            fetched.len(),
            &account.item_id
        );

        self.persist_unseen(account, fetched, Some(window)).await
    }

    async fn persist_unseen(
        &self,
        account: &BankAccount,
        fetched: Vec<PlaidTransaction>,
        window: Option<DateWindow>,
    ) -> Result<SyncOutcome, AppError> {
        if fetched.is_empty() {
            let existing = self
                .store
                .transactions_for_item(&account.item_id, window)
                .await?;
            return Ok(SyncOutcome {
                inserted: 0,
                transactions: existing,
            });
        }

        let ids: Vec<String> = fetched.iter().map(|tx| tx.transaction_id.clone()).collect();
        let mut stored = self.store.transactions_by_external_ids(&ids).await?;

        let rows: Vec<NewTransaction> = unseen(fetched, &stored)
            .iter()
            .map(|tx| NewTransaction::from_plaid(tx, account))
            .collect();

        if rows.is_empty() {
            tracing::info!("No new transactions to insert for item_id={}", &account.item_id);
            return Ok(SyncOutcome {
                inserted: 0,
                transactions: stored,
            });
        }

        tracing::info!(
            "Inserting {} new transactions for item_id={}",
            rows.len(),
            &account.item_id
        );
        let inserted = self.store.insert_transactions(&rows).await?;
        let count = inserted.len();
        stored.extend(inserted);

        Ok(SyncOutcome {
            inserted: count,
            transactions: stored,
        })
    }
}

/// Fetched transactions whose external id is neither stored already nor
/// repeated earlier in the same batch.
pub fn unseen(fetched: Vec<PlaidTransaction>, existing: &[Transaction]) -> Vec<PlaidTransaction> {
    let mut seen: HashSet<String> = existing
        .iter()
        .map(|tx| tx.transaction_id.clone())
        .collect();

    fetched
        .into_iter()
        .filter(|tx| seen.insert(tx.transaction_id.clone()))
        .collect()
}

/// First and last calendar day of the month containing `raw`, which is either
/// an RFC 3339 timestamp or a `YYYY-MM-DD` date.
pub fn month_window(raw: &str) -> Result<DateWindow, AppError> {
    let date = DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.to_utc().date_naive())
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .map_err(|_| AppError::BadRequest(format!("Invalid currentMonth: {}", raw)))?;

    let (next_year, next_month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };

    let start = date.with_day(1);
    let end = NaiveDate::from_ymd_opt(next_year, next_month, 1).and_then(|d| d.pred_opt());

    match (start, end) {
        (Some(start), Some(end)) => Ok(DateWindow { start, end }),
        _ => Err(AppError::BadRequest(format!("Invalid currentMonth: {}", raw))),
    }
}

/// Buckets transactions by calendar day, most recent day first.
pub fn group_by_date(transactions: Vec<Transaction>) -> Vec<DateBundle> {
    let mut days: BTreeMap<NaiveDate, Vec<Transaction>> = BTreeMap::new();
    for tx in transactions {
        days.entry(tx.date).or_default().push(tx);
    }

    days.into_iter()
        .rev()
        .map(|(date, transactions)| DateBundle {
            date: date.format("%d/%m/%Y").to_string(),
            transactions,
        })
        .collect()
}
