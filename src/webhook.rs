use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{AppState, error::AppError, notifier::PushEvent};

#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub webhook_type: String,
    pub webhook_code: String,
    #[serde(default)]
    pub item_id: Option<String>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub public_tokens: Vec<String>,
    #[serde(default)]
    pub link_token: Option<String>,
}

/// Catch-all answer for anything that goes wrong while handling a webhook.
#[derive(Debug)]
pub struct WebhookError(AppError);

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        tracing::error!("Webhook handling failed: {}", &self.0);
        let body = match &self.0 {
            AppError::Upstream(err) => err.payload().cloned(),
            _ => None,
        }
        .unwrap_or_else(|| {
            json!({
                "error_code": "OTHER_ERROR",
                "error_message": self.0.to_string(),
            })
        });

        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

pub fn webhook_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/server/receive_webhook", post(receive_webhook))
        .with_state(state)
}

pub async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, WebhookError> {
    let event = serde_json::from_slice::<WebhookEvent>(&body).map_err(|err| {
        WebhookError(AppError::BadRequest(format!(
            "Unable to parse webhook body: {}",
            err
        )))
    })?;

    tracing::info!(
        "Received webhook for product {} with code {}",
        &event.webhook_type,
        &event.webhook_code
    );

    dispatch(&state, &event).await.map_err(WebhookError)?;

    Ok(Json(json!({ "status": "received" })))
}

async fn dispatch(state: &AppState, event: &WebhookEvent) -> Result<(), AppError> {
    match event.webhook_type.as_str() {
        "ITEM" => handle_item(event),
        "TRANSACTIONS" => handle_transactions(state, event).await?,
        "LINK" => handle_link(state, event).await,
        other => tracing::info!("Can't handle webhook product {}", other),
    }
    Ok(())
}

fn handle_item(event: &WebhookEvent) {
    let item_id = event.item_id.as_deref().unwrap_or("<unknown>");
    let error_message = event
        .error
        .as_ref()
        .and_then(|err| err.get("error_message"))
        .and_then(|message| message.as_str())
        .unwrap_or("<no message>");
    match event.webhook_code.as_str() {
        "ERROR" => tracing::warn!(
            "Item {} reported an error, the user should relink it: {}",
            item_id,
            error_message
        ),
        "NEW_ACCOUNTS_AVAILABLE" => {
            tracing::info!("New accounts are available for item {}", item_id)
        }
        "PENDING_EXPIRATION" => {
            tracing::warn!("Consent for item {} expires soon, the user should relink", item_id)
        }
        "USER_PERMISSION_REVOKED" => {
            tracing::warn!("The user revoked access to item {}", item_id)
        }
        "WEBHOOK_UPDATE_ACKNOWLEDGED" => {
            tracing::info!("Webhook URL update acknowledged for item {}", item_id)
        }
        "SUCCESS" => tracing::info!("Item {} was successfully added", item_id),
        "INITIAL_UPDATE" => tracing::info!("Item {} is ready for use", item_id),
        other => tracing::info!("Can't handle ITEM webhook code {}", other),
    }
}

async fn handle_transactions(state: &AppState, event: &WebhookEvent) -> Result<(), AppError> {
    match event.webhook_code.as_str() {
        "SYNC_UPDATES_AVAILABLE" => {
            let item_id = event.item_id.as_deref().ok_or_else(|| {
                AppError::BadRequest(String::from(
                    "SYNC_UPDATES_AVAILABLE webhook without item_id",
                ))
            })?;

            let outcome = state.engine.sync_transactions(item_id).await?;
            tracing::info!(
                "Webhook sync stored {} transactions for item_id={}",
                outcome.inserted,
                item_id
            );

            if outcome.inserted > 0 {
                state
                    .notifier
                    .broadcast(PushEvent::TransactionsUpdated {
                        item_id: item_id.to_string(),
                        inserted: outcome.inserted,
                    })
                    .await;
            }
        }
        other => tracing::info!("Can't handle TRANSACTIONS webhook code {}", other),
    }
    Ok(())
}

/// Hands the finished link session's public token to the API's own exchange
/// endpoint. Failures are logged; Plaid has nothing to retry.
async fn handle_link(state: &AppState, event: &WebhookEvent) {
    match event.webhook_code.as_str() {
        "SESSION_FINISHED" => {
            let Some(public_token) = event.public_tokens.first() else {
                tracing::warn!("SESSION_FINISHED webhook carried no public token");
                return;
            };

            let url = match state.api_base_url.join("api/exchange_public_token") {
                Ok(url) => url,
                Err(err) => {
                    tracing::error!("Invalid API base URL for exchange loopback: {}", err);
                    return;
                }
            };

            let result = state
                .http
                .post(url)
                .json(&json!({
                    "public_token": public_token,
                    "link_token": event.link_token,
                }))
                .send()
                .await
                .and_then(|res| res.error_for_status());

            match result {
                Ok(_) => tracing::info!("Exchanged public token from finished link session"),
                Err(err) => tracing::error!("Exchange loopback failed: {:#?}", err),
            }
        }
        other => tracing::info!("Can't handle LINK webhook code {}", other),
    }
}
