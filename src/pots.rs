use std::{cmp::Ordering, collections::HashMap, str::FromStr};

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::{
    db::Store,
    domain::{Pot, PotInput, PotRecord, Transaction},
    error::AppError,
};

fn parse_amount(amount: &str) -> Option<Decimal> {
    Decimal::from_str(amount.trim()).ok()
}

/// Largest amount first; amounts that do not parse go last.
fn by_amount_desc(a: &PotRecord, b: &PotRecord) -> Ordering {
    match (parse_amount(&a.amount), parse_amount(&b.amount)) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn record_from_input(id: Uuid, user_id: &str, input: PotInput) -> Result<PotRecord, AppError> {
    if parse_amount(&input.amount).is_none() {
        return Err(AppError::BadRequest(format!(
            "Pot amount must be a decimal, got '{}'",
            input.amount
        )));
    }

    let mut transaction_ids: Vec<String> = Vec::with_capacity(input.transactions.len());
    for tx in input.transactions {
        if !transaction_ids.contains(&tx.transaction_id) {
            transaction_ids.push(tx.transaction_id);
        }
    }

    Ok(PotRecord {
        id,
        label: input.label,
        amount: input.amount,
        color: input.color,
        user_id: user_id.to_string(),
        transaction_ids,
    })
}

/// Swaps stored transaction ids for the current transaction rows. Ids whose
/// transaction is gone are left out.
async fn resolve(
    store: &dyn Store,
    user_id: &str,
    records: Vec<PotRecord>,
) -> Result<Vec<Pot>, AppError> {
    let ids: Vec<String> = records
        .iter()
        .flat_map(|pot| pot.transaction_ids.iter().cloned())
        .collect();

    let transactions = if ids.is_empty() {
        vec![]
    } else {
        store.transactions_for_user_by_ids(user_id, &ids).await?
    };
    let by_id: HashMap<&str, &Transaction> = transactions
        .iter()
        .map(|tx| (tx.transaction_id.as_str(), tx))
        .collect();

    Ok(records
        .into_iter()
        .map(|record| Pot {
            transactions: record
                .transaction_ids
                .iter()
                .filter_map(|id| by_id.get(id.as_str()).map(|tx| (*tx).clone()))
                .collect(),
            id: record.id,
            label: record.label,
            amount: record.amount,
            color: record.color,
            user_id: record.user_id,
        })
        .collect())
}

async fn resolve_one(store: &dyn Store, user_id: &str, record: PotRecord) -> Result<Pot, AppError> {
    resolve(store, user_id, vec![record])
        .await?
        .pop()
        .ok_or_else(|| AppError::NotFound("pot".to_string()))
}

pub async fn list(store: &dyn Store, user_id: &str) -> Result<Vec<Pot>, AppError> {
    let mut records = store.pots_for_user(user_id).await?;
    records.sort_by(by_amount_desc);
    resolve(store, user_id, records).await
}

pub async fn create(store: &dyn Store, user_id: &str, input: PotInput) -> Result<Pot, AppError> {
    let record = record_from_input(Uuid::new_v4(), user_id, input)?;
    let record = store.insert_pot(&record).await?;
    tracing::info!("Created pot id={} for user_id={}", record.id, user_id);
    resolve_one(store, user_id, record).await
}

/// Overwrites every field of the pot matching `input.id` and `user_id`.
pub async fn update(store: &dyn Store, user_id: &str, input: PotInput) -> Result<Pot, AppError> {
    let id = input
        .id
        .ok_or_else(|| AppError::BadRequest("Pot id is required for updates".to_string()))?;
    let record = record_from_input(id, user_id, input)?;
    let record = store
        .update_pot(&record)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("pot {}", id)))?;
    resolve_one(store, user_id, record).await
}

pub async fn delete(store: &dyn Store, user_id: &str, id: Uuid) -> Result<(), AppError> {
    if store.delete_pot(user_id, id).await? {
        tracing::info!("Deleted pot id={} for user_id={}", id, user_id);
        Ok(())
    } else {
        Err(AppError::NotFound(format!("pot {}", id)))
    }
}
