use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::{
    AppState,
    auth::{AuthError, CurrentUser, MaybeUser, PotOwner},
    domain::{BankAccount, DateBundle, Pot, PotInput},
    error::AppError,
    notifier::ws_handler,
    plaid::LinkTokenResponse,
    pots,
    sync::{group_by_date, month_window},
};

#[derive(Debug, Deserialize)]
pub struct ExchangeRequest {
    pub public_token: String,
    #[serde(default)]
    pub link_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum AccessTokens {
    One(String),
    Many(Vec<String>),
}

impl AccessTokens {
    fn into_vec(self) -> Vec<String> {
        match self {
            AccessTokens::One(token) => vec![token],
            AccessTokens::Many(tokens) => tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BalanceRequest {
    #[serde(rename = "currentMonth")]
    pub current_month: String,
    #[serde(default)]
    pub access_token: Option<AccessTokens>,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub transactions: Vec<DateBundle>,
    pub inserted: usize,
}

#[derive(Debug, Deserialize)]
pub struct DeleteBankRequest {
    pub access_token: String,
    pub bank_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct DeletePotRequest {
    pub id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct PotsResponse {
    pub pots: Vec<Pot>,
}

pub fn api_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/set-tokens", get(set_tokens))
        .route("/api/create_link_token", get(create_link_token))
        .route("/api/exchange_public_token", post(exchange_public_token))
        .route("/api/balance", post(balance))
        .route("/api/get-banks", get(get_banks))
        .route("/api/delete-bank-account", post(delete_bank_account))
        .route("/api/get-pots", get(get_pots))
        .route("/api/add-pot", post(add_pot))
        .route("/api/update-pot", post(update_pot))
        .route("/api/delete-pot", post(delete_pot))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

pub async fn set_tokens(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
) -> Json<Value> {
    state.sessions.set_current_user(&user.token).await;
    tracing::info!("Cached bearer token for user_id={}", &user.id);
    Json(json!({ "message": "Token has been set" }))
}

pub async fn create_link_token(
    State(state): State<Arc<AppState>>,
    MaybeUser(user): MaybeUser,
) -> Result<Json<LinkTokenResponse>, AppError> {
    let client_user_id = user
        .as_ref()
        .map(|user| user.id.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let response = state.aggregator.create_link_token(&client_user_id).await?;

    if let Some(user) = user {
        let expires_at = DateTime::parse_from_rfc3339(&response.expiration)
            .map(|expiration| expiration.to_utc())
            .inspect_err(|err| {
                tracing::warn!("Unparsable link token expiration {}: {}", &response.expiration, err)
            })
            .ok();
        state
            .sessions
            .remember_link(&response.link_token, &user.id, expires_at)
            .await;
    }

    Ok(Json(response))
}

/// Identity for an exchange: the request's own bearer, then whoever opened
/// the link session, then the last cached bearer token.
async fn exchange_owner(
    state: &AppState,
    user: Option<CurrentUser>,
    link_token: Option<&str>,
) -> Result<String, AppError> {
    if let Some(user) = user {
        return Ok(user.id);
    }

    if let Some(link_token) = link_token {
        if let Some(owner) = state.sessions.link_owner(link_token).await {
            return Ok(owner);
        }
    }

    let token = state
        .sessions
        .current_user()
        .await
        .ok_or(AuthError::Missing)?;
    Ok(state.identity.user_id(&token).await?)
}

pub async fn exchange_public_token(
    State(state): State<Arc<AppState>>,
    MaybeUser(user): MaybeUser,
    Json(request): Json<ExchangeRequest>,
) -> Result<Json<bool>, AppError> {
    if request.public_token.is_empty() {
        return Err(AppError::BadRequest(String::from(
            "Empty public_token received",
        )));
    }

    let user_id = exchange_owner(&state, user, request.link_token.as_deref()).await?;

    state
        .engine
        .exchange_and_onboard(&request.public_token, &user_id)
        .await?;

    if let Some(link_token) = request.link_token.as_deref() {
        state.sessions.forget_link(link_token).await;
    }

    Ok(Json(true))
}

pub async fn balance(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Json(request): Json<BalanceRequest>,
) -> Result<Json<BalanceResponse>, AppError> {
    let window = month_window(&request.current_month)?;

    let accounts: Vec<BankAccount> = match request.access_token.map(AccessTokens::into_vec) {
        Some(tokens) if !tokens.is_empty() => {
            let mut accounts = Vec::with_capacity(tokens.len());
            for token in tokens.iter() {
                match state.store.bank_account_by_access_token(&user.id, token).await? {
                    Some(account) => accounts.push(account),
                    None => tracing::warn!(
                        "Ignoring access token that is not linked to user_id={}",
                        &user.id
                    ),
                }
            }
            accounts
        }
        _ => state.store.bank_accounts_for_user(&user.id).await?,
    };

    let mut inserted = 0;
    let mut transactions = Vec::new();
    for account in accounts.iter() {
        match state.engine.refresh_window(account, window).await {
            Ok(outcome) => {
                inserted += outcome.inserted;
                transactions.extend(outcome.transactions);
            }
            Err(AppError::Upstream(err)) => tracing::warn!(
                "Skipping item_id={} in balance, Plaid fetch failed: {}",
                &account.item_id,
                err
            ),
            Err(err) => return Err(err),
        }
    }

    Ok(Json(BalanceResponse {
        transactions: group_by_date(transactions),
        inserted,
    }))
}

pub async fn get_banks(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
) -> Result<Json<Vec<BankAccount>>, AppError> {
    let accounts = state
        .store
        .bank_accounts_for_user(&user.id)
        .await
        .inspect_err(|err| tracing::error!("Error querying bank accounts in get_banks: {:#?}", err))?;
    Ok(Json(accounts))
}

pub async fn delete_bank_account(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Json(request): Json<DeleteBankRequest>,
) -> Result<Json<Value>, AppError> {
    let account = state
        .store
        .delete_bank_account(&user.id, request.bank_id, &request.access_token)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("bank account {}", request.bank_id)))?;

    if let Err(err) = state.aggregator.remove_item(&account.access_token).await {
        tracing::warn!(
            "Plaid item removal failed for item_id={}, local rows already deleted: {}",
            &account.item_id,
            err
        );
    }

    Ok(Json(json!({ "deleted": account.id })))
}

pub async fn get_pots(
    State(state): State<Arc<AppState>>,
    PotOwner(user_id): PotOwner,
) -> Result<Json<PotsResponse>, AppError> {
    let pots = pots::list(state.store.as_ref(), &user_id).await?;
    Ok(Json(PotsResponse { pots }))
}

pub async fn add_pot(
    State(state): State<Arc<AppState>>,
    PotOwner(user_id): PotOwner,
    Json(input): Json<PotInput>,
) -> Result<(StatusCode, Json<Pot>), AppError> {
    let pot = pots::create(state.store.as_ref(), &user_id, input).await?;
    Ok((StatusCode::CREATED, Json(pot)))
}

pub async fn update_pot(
    State(state): State<Arc<AppState>>,
    PotOwner(user_id): PotOwner,
    Json(input): Json<PotInput>,
) -> Result<Json<Pot>, AppError> {
    let pot = pots::update(state.store.as_ref(), &user_id, input).await?;
    Ok(Json(pot))
}

pub async fn delete_pot(
    State(state): State<Arc<AppState>>,
    PotOwner(user_id): PotOwner,
    Json(request): Json<DeletePotRequest>,
) -> Result<StatusCode, AppError> {
    pots::delete(state.store.as_ref(), &user_id, request.id).await?;
    Ok(StatusCode::NO_CONTENT)
}
