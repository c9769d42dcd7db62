use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::plaid::PlaidTransaction;

/// Stored in place of absent merchant names and transaction types.
pub const NONE_FOUND: &str = "none found";

#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Serialize)]
pub struct BankAccount {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub access_token: String,
    pub bank_name: String,
    pub item_id: String,
    pub user_id: String,
    #[serde(skip_serializing)]
    pub sync_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewBankAccount {
    pub access_token: String,
    pub bank_name: String,
    pub item_id: String,
    pub user_id: String,
}

#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: String,
    pub bank_id: String,
    pub item_id: String,
    pub amount: f64,
    pub category: String,
    pub category_id: String,
    pub date: NaiveDate,
    pub date_time: Option<DateTime<Utc>>,
    pub currency: Option<String>,
    pub merchant_name: String,
    pub name: String,
    pub transaction_code: Option<String>,
    pub transaction_id: String,
    pub transaction_type: String,
}

/// A transaction row that has not been inserted yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub user_id: String,
    pub bank_id: String,
    pub item_id: String,
    pub amount: f64,
    pub category: String,
    pub category_id: String,
    pub date: NaiveDate,
    pub date_time: Option<DateTime<Utc>>,
    pub currency: Option<String>,
    pub merchant_name: String,
    pub name: String,
    pub transaction_code: Option<String>,
    pub transaction_id: String,
    pub transaction_type: String,
}

impl NewTransaction {
    pub fn from_plaid(tx: &PlaidTransaction, account: &BankAccount) -> Self {
        let category = tx
            .category
            .as_ref()
            .and_then(|category| serde_json::to_string(category).ok())
            .unwrap_or_default();
        let date_time = tx.datetime.as_deref().and_then(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .inspect_err(|err| {
                    tracing::warn!(
                        "Ignoring unparsable datetime for transaction_id={}: {}",
                        &tx.transaction_id,
                        err
                    )
                })
                .ok()
                .map(|dt| dt.to_utc())
        });

        NewTransaction {
            user_id: account.user_id.clone(),
            bank_id: tx.account_id.clone(),
            item_id: account.item_id.clone(),
            amount: tx.amount,
            category,
            category_id: tx
                .personal_finance_category
                .as_ref()
                .map(|pfc| pfc.detailed.clone())
                .unwrap_or_default(),
            date: tx.date,
            date_time,
            currency: tx.iso_currency_code.clone(),
            merchant_name: tx
                .merchant_name
                .clone()
                .unwrap_or_else(|| NONE_FOUND.to_string()),
            name: tx.name.clone(),
            transaction_code: tx.transaction_code.clone(),
            transaction_id: tx.transaction_id.clone(),
            transaction_type: tx
                .transaction_type
                .clone()
                .unwrap_or_else(|| NONE_FOUND.to_string()),
        }
    }
}

/// Pot as stored: transactions are kept as external transaction ids.
#[derive(sqlx::FromRow, Debug, Clone, PartialEq)]
pub struct PotRecord {
    pub id: Uuid,
    pub label: String,
    pub amount: String,
    pub color: String,
    pub user_id: String,
    pub transaction_ids: Vec<String>,
}

/// Pot as served, with its transaction references resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pot {
    pub id: Uuid,
    pub label: String,
    pub amount: String,
    pub color: String,
    pub user_id: String,
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionRef {
    pub transaction_id: String,
}

/// Pot fields sent by the client. Attached transactions may be full rows;
/// only their `transaction_id` is kept.
#[derive(Debug, Clone, Deserialize)]
pub struct PotInput {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub label: String,
    pub amount: String,
    pub color: String,
    #[serde(default)]
    pub transactions: Vec<TransactionRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DateBundle {
    pub date: String,
    pub transactions: Vec<Transaction>,
}
