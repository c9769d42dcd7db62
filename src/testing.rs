//! In-memory stand-ins for Plaid, Postgres and Supabase used by unit tests.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde_json::json;
use url::Url;
use uuid::Uuid;

use crate::{
    AppState,
    auth::{AuthError, IdentityProvider},
    db::{DateWindow, Store},
    domain::{BankAccount, NewBankAccount, NewTransaction, PotRecord, Transaction},
    notifier::Notifier,
    plaid::{
        Aggregator, ExchangeResponse, LinkTokenResponse, PlaidError, PlaidTransaction, SyncPage,
    },
    session::BearerCache,
    sync::SyncEngine,
};

pub fn plaid_tx(id: &str, amount: f64, date: NaiveDate) -> PlaidTransaction {
    PlaidTransaction {
        transaction_id: id.to_string(),
        account_id: "plaid-account".to_string(),
        amount,
        iso_currency_code: Some("USD".to_string()),
        category: None,
        personal_finance_category: None,
        date,
        datetime: None,
        merchant_name: None,
        name: format!("Transaction {}", id),
        transaction_code: None,
        transaction_type: None,
    }
}

pub fn stored_tx(account: &BankAccount, id: &str, date: NaiveDate) -> Transaction {
    let row = NewTransaction::from_plaid(&plaid_tx(id, 1.0, date), account);
    materialise(row)
}

fn materialise(row: NewTransaction) -> Transaction {
    Transaction {
        id: Uuid::new_v4(),
        user_id: row.user_id,
        bank_id: row.bank_id,
        item_id: row.item_id,
        amount: row.amount,
        category: row.category,
        category_id: row.category_id,
        date: row.date,
        date_time: row.date_time,
        currency: row.currency,
        merchant_name: row.merchant_name,
        name: row.name,
        transaction_code: row.transaction_code,
        transaction_id: row.transaction_id,
        transaction_type: row.transaction_type,
    }
}

fn plaid_error(status: u16, code: &str) -> PlaidError {
    PlaidError::Api {
        status,
        body: json!({
            "error_type": "INVALID_INPUT",
            "error_code": code,
            "error_message": "fake failure",
        }),
    }
}

#[derive(Default)]
pub struct FakeAggregator {
    link: Option<(String, String, String)>,
    institution: Mutex<Option<Result<Option<String>, ()>>>,
    sync_pages: Mutex<Vec<SyncPage>>,
    sync_fails: Mutex<bool>,
    range: Mutex<Vec<PlaidTransaction>>,
    range_failures: Mutex<Vec<String>>,
    sync_calls: AtomicUsize,
    removed_items: Mutex<Vec<String>>,
}

impl FakeAggregator {
    /// Exchanges `public_token` for the given access token and item id; any
    /// other public token is rejected.
    pub fn linking(public_token: &str, access_token: &str, item_id: &str) -> Self {
        FakeAggregator {
            link: Some((
                public_token.to_string(),
                access_token.to_string(),
                item_id.to_string(),
            )),
            ..Default::default()
        }
    }

    pub fn set_institution(&self, result: Result<Option<String>, ()>) {
        *self.institution.lock().unwrap() = Some(result);
    }

    pub fn set_sync_added(&self, added: Vec<PlaidTransaction>) {
        self.set_sync_pages(vec![(added, "cursor-1", false)]);
    }

    pub fn set_sync_pages(&self, pages: Vec<(Vec<PlaidTransaction>, &str, bool)>) {
        *self.sync_pages.lock().unwrap() = pages
            .into_iter()
            .map(|(added, cursor, has_more)| SyncPage {
                added,
                modified: vec![],
                removed: vec![],
                next_cursor: cursor.to_string(),
                has_more,
            })
            .collect();
    }

    pub fn fail_sync(&self) {
        *self.sync_fails.lock().unwrap() = true;
    }

    pub fn set_range(&self, transactions: Vec<PlaidTransaction>) {
        *self.range.lock().unwrap() = transactions;
    }

    pub fn fail_range_for(&self, access_token: &str) {
        self.range_failures
            .lock()
            .unwrap()
            .push(access_token.to_string());
    }

    pub fn sync_calls(&self) -> usize {
        self.sync_calls.load(Ordering::SeqCst)
    }

    pub fn removed_items(&self) -> Vec<String> {
        self.removed_items.lock().unwrap().clone()
    }
}

#[async_trait]
impl Aggregator for FakeAggregator {
    async fn create_link_token(
        &self,
        client_user_id: &str,
    ) -> Result<LinkTokenResponse, PlaidError> {
        Ok(LinkTokenResponse {
            link_token: format!("link-sandbox-{}", client_user_id),
            expiration: "2030-01-01T00:00:00Z".to_string(),
            hosted_link_url: None,
            request_id: "req-1".to_string(),
        })
    }

    async fn exchange_public_token(
        &self,
        public_token: &str,
    ) -> Result<ExchangeResponse, PlaidError> {
        match &self.link {
            Some((expected, access_token, item_id)) if expected == public_token => {
                Ok(ExchangeResponse {
                    access_token: access_token.clone(),
                    item_id: item_id.clone(),
                })
            }
            _ => Err(plaid_error(400, "INVALID_PUBLIC_TOKEN")),
        }
    }

    async fn item_institution_name(
        &self,
        _access_token: &str,
    ) -> Result<Option<String>, PlaidError> {
        match self.institution.lock().unwrap().clone() {
            None => Ok(None),
            Some(Ok(name)) => Ok(name),
            Some(Err(())) => Err(plaid_error(500, "INTERNAL_SERVER_ERROR")),
        }
    }

    async fn transactions_by_date_range(
        &self,
        access_token: &str,
        start_date: NaiveDate,
        end_date: NaiveDate,
        count: u32,
    ) -> Result<Vec<PlaidTransaction>, PlaidError> {
        if self
            .range_failures
            .lock()
            .unwrap()
            .iter()
            .any(|token| token == access_token)
        {
            return Err(plaid_error(400, "ITEM_LOGIN_REQUIRED"));
        }
        let window = DateWindow {
            start: start_date,
            end: end_date,
        };
        Ok(self
            .range
            .lock()
            .unwrap()
            .iter()
            .filter(|tx| window.contains(tx.date))
            .take(count as usize)
            .cloned()
            .collect())
    }

    async fn transactions_sync(
        &self,
        _access_token: &str,
        cursor: Option<&str>,
    ) -> Result<SyncPage, PlaidError> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        if *self.sync_fails.lock().unwrap() {
            return Err(plaid_error(400, "ITEM_LOGIN_REQUIRED"));
        }

        let pages = self.sync_pages.lock().unwrap();
        if pages.is_empty() {
            return Ok(SyncPage {
                added: vec![],
                modified: vec![],
                removed: vec![],
                next_cursor: cursor.unwrap_or("cursor-0").to_string(),
                has_more: false,
            });
        }

        let index = cursor
            .and_then(|cursor| pages.iter().position(|page| page.next_cursor == cursor))
            .map(|position| (position + 1).min(pages.len() - 1))
            .unwrap_or(0);
        Ok(pages[index].clone())
    }

    async fn remove_item(&self, access_token: &str) -> Result<(), PlaidError> {
        self.removed_items
            .lock()
            .unwrap()
            .push(access_token.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct MemoryInner {
    users: HashMap<String, String>,
    accounts: Vec<BankAccount>,
    transactions: Vec<Transaction>,
    pots: Vec<PotRecord>,
    fail_inserts: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn add_bank_account(&self, user_id: &str, item_id: &str, access_token: &str) -> BankAccount {
        let account = BankAccount {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            access_token: access_token.to_string(),
            bank_name: "Acme Bank".to_string(),
            item_id: item_id.to_string(),
            user_id: user_id.to_string(),
            sync_cursor: None,
        };
        self.inner.lock().unwrap().accounts.push(account.clone());
        account
    }

    pub fn bank_account(&self, item_id: &str) -> Option<BankAccount> {
        self.inner
            .lock()
            .unwrap()
            .accounts
            .iter()
            .find(|account| account.item_id == item_id)
            .cloned()
    }

    pub fn user_access_token(&self, user_id: &str) -> Option<String> {
        self.inner.lock().unwrap().users.get(user_id).cloned()
    }

    pub fn push_transaction(&self, tx: Transaction) {
        self.inner.lock().unwrap().transactions.push(tx);
    }

    pub fn transaction_count(&self) -> usize {
        self.inner.lock().unwrap().transactions.len()
    }

    pub fn transaction_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .transactions
            .iter()
            .map(|tx| tx.transaction_id.clone())
            .collect()
    }

    pub fn pot_count(&self) -> usize {
        self.inner.lock().unwrap().pots.len()
    }

    pub fn fail_inserts(&self) {
        self.inner.lock().unwrap().fail_inserts = true;
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn set_user_access_token(
        &self,
        user_id: &str,
        access_token: &str,
    ) -> Result<(), sqlx::Error> {
        self.inner
            .lock()
            .unwrap()
            .users
            .insert(user_id.to_string(), access_token.to_string());
        Ok(())
    }

    async fn upsert_bank_account(
        &self,
        account: &NewBankAccount,
    ) -> Result<BankAccount, sqlx::Error> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner
            .accounts
            .iter_mut()
            .find(|existing| existing.item_id == account.item_id)
        {
            existing.access_token = account.access_token.clone();
            existing.bank_name = account.bank_name.clone();
            existing.user_id = account.user_id.clone();
            return Ok(existing.clone());
        }

        let created = BankAccount {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            access_token: account.access_token.clone(),
            bank_name: account.bank_name.clone(),
            item_id: account.item_id.clone(),
            user_id: account.user_id.clone(),
            sync_cursor: None,
        };
        inner.accounts.push(created.clone());
        Ok(created)
    }

    async fn bank_account_by_item(
        &self,
        item_id: &str,
    ) -> Result<Option<BankAccount>, sqlx::Error> {
        Ok(self.bank_account(item_id))
    }

    async fn bank_account_by_access_token(
        &self,
        user_id: &str,
        access_token: &str,
    ) -> Result<Option<BankAccount>, sqlx::Error> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .accounts
            .iter()
            .find(|a| a.user_id == user_id && a.access_token == access_token)
            .cloned())
    }

    async fn bank_accounts_for_user(&self, user_id: &str) -> Result<Vec<BankAccount>, sqlx::Error> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .accounts
            .iter()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn update_sync_cursor(&self, item_id: &str, cursor: &str) -> Result<(), sqlx::Error> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(account) = inner.accounts.iter_mut().find(|a| a.item_id == item_id) {
            account.sync_cursor = Some(cursor.to_string());
        }
        Ok(())
    }

    async fn delete_bank_account(
        &self,
        user_id: &str,
        bank_id: Uuid,
        access_token: &str,
    ) -> Result<Option<BankAccount>, sqlx::Error> {
        let mut inner = self.inner.lock().unwrap();
        let Some(position) = inner.accounts.iter().position(|a| {
            a.id == bank_id && a.user_id == user_id && a.access_token == access_token
        }) else {
            return Ok(None);
        };

        let account = inner.accounts.remove(position);
        inner.transactions.retain(|tx| tx.item_id != account.item_id);
        Ok(Some(account))
    }

    async fn transactions_by_external_ids(
        &self,
        transaction_ids: &[String],
    ) -> Result<Vec<Transaction>, sqlx::Error> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .transactions
            .iter()
            .filter(|tx| transaction_ids.contains(&tx.transaction_id))
            .cloned()
            .collect())
    }

    async fn transactions_for_item(
        &self,
        item_id: &str,
        window: Option<DateWindow>,
    ) -> Result<Vec<Transaction>, sqlx::Error> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .transactions
            .iter()
            .filter(|tx| tx.item_id == item_id)
            .filter(|tx| window.is_none_or(|w| w.contains(tx.date)))
            .cloned()
            .collect())
    }

    async fn transactions_for_user_by_ids(
        &self,
        user_id: &str,
        transaction_ids: &[String],
    ) -> Result<Vec<Transaction>, sqlx::Error> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .transactions
            .iter()
            .filter(|tx| tx.user_id == user_id && transaction_ids.contains(&tx.transaction_id))
            .cloned()
            .collect())
    }

    async fn insert_transactions(
        &self,
        rows: &[NewTransaction],
    ) -> Result<Vec<Transaction>, sqlx::Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_inserts {
            return Err(sqlx::Error::Protocol("insert rejected".to_string()));
        }

        let mut inserted = Vec::new();
        for row in rows {
            if inner
                .transactions
                .iter()
                .any(|tx| tx.transaction_id == row.transaction_id)
            {
                continue;
            }
            let tx = materialise(row.clone());
            inner.transactions.push(tx.clone());
            inserted.push(tx);
        }
        Ok(inserted)
    }

    async fn pots_for_user(&self, user_id: &str) -> Result<Vec<PotRecord>, sqlx::Error> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .pots
            .iter()
            .filter(|pot| pot.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn insert_pot(&self, pot: &PotRecord) -> Result<PotRecord, sqlx::Error> {
        self.inner.lock().unwrap().pots.push(pot.clone());
        Ok(pot.clone())
    }

    async fn update_pot(&self, pot: &PotRecord) -> Result<Option<PotRecord>, sqlx::Error> {
        let mut inner = self.inner.lock().unwrap();
        let Some(existing) = inner
            .pots
            .iter_mut()
            .find(|existing| existing.id == pot.id && existing.user_id == pot.user_id)
        else {
            return Ok(None);
        };
        *existing = pot.clone();
        Ok(Some(pot.clone()))
    }

    async fn delete_pot(&self, user_id: &str, id: Uuid) -> Result<bool, sqlx::Error> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.pots.len();
        inner.pots.retain(|pot| !(pot.id == id && pot.user_id == user_id));
        Ok(inner.pots.len() != before)
    }
}

/// Accepts `tok-<user>` as the bearer token of `<user>`.
pub struct FakeIdentity;

#[async_trait]
impl IdentityProvider for FakeIdentity {
    async fn user_id(&self, bearer: &str) -> Result<String, AuthError> {
        bearer
            .strip_prefix("tok-")
            .map(str::to_string)
            .ok_or(AuthError::Rejected)
    }
}

pub fn app_state(aggregator: Arc<FakeAggregator>, store: Arc<MemoryStore>) -> Arc<AppState> {
    app_state_at(aggregator, store, Url::parse("http://127.0.0.1:9").unwrap())
}

/// Like [`app_state`], with webhook loopbacks sent to `api_base_url`.
pub fn app_state_at(
    aggregator: Arc<FakeAggregator>,
    store: Arc<MemoryStore>,
    api_base_url: Url,
) -> Arc<AppState> {
    let notifier = Notifier::new();
    Arc::new(AppState {
        aggregator: aggregator.clone(),
        store: store.clone(),
        identity: Arc::new(FakeIdentity),
        engine: SyncEngine::new(aggregator, store, notifier.clone(), 50),
        sessions: BearerCache::new(),
        notifier,
        http: reqwest::Client::builder().no_proxy().build().unwrap(),
        api_base_url,
    })
}
