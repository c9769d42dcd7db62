use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::{auth::AuthError, plaid::PlaidError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Upstream(#[from] PlaidError),
    #[error(transparent)]
    Persistence(#[from] sqlx::Error),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
}

fn upstream_status(err: &PlaidError) -> StatusCode {
    match err {
        PlaidError::Api { status, .. } if (400..500).contains(status) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::Auth(err) => {
                tracing::info!("Rejected request without a valid identity: {}", &err);
                (StatusCode::BAD_REQUEST, json!({ "error": err.to_string() }))
            }
            AppError::Upstream(err) => {
                tracing::error!("Plaid request failed: {}", &err);
                let status = upstream_status(&err);
                match err {
                    PlaidError::Api { body, .. } => (status, body),
                    PlaidError::Request(err) => (
                        status,
                        json!({
                            "error": format!(
                                "Internal request failed with status_code={}",
                                err.status().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                            )
                        }),
                    ),
                }
            }
            AppError::Persistence(err) => {
                tracing::error!("Database error: {:#?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Database error" }),
                )
            }
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                json!({ "error": format!("{} not found", what) }),
            ),
            AppError::BadRequest(msg) => {
                tracing::info!("Bad request: {}", &msg);
                (StatusCode::BAD_REQUEST, json!({ "error": msg }))
            }
        };

        (status, Json(body)).into_response()
    }
}
