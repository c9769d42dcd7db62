use std::sync::Arc;

use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::{AppState, error::AppError};

const USER_ID_HEADER: &str = "user_id";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("User not logged in, or no user token found")]
    Missing,
    #[error("Bearer token was rejected")]
    Rejected,
    #[error("Identity lookup failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Maps a bearer token to the id of the user it belongs to.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn user_id(&self, bearer: &str) -> Result<String, AuthError>;
}

#[derive(Debug, Deserialize)]
struct SupabaseUser {
    id: String,
}

pub struct SupabaseAuth {
    http: reqwest::Client,
    user_endpoint: Url,
    api_key: String,
}

impl SupabaseAuth {
    pub fn new(supabase_url: &Url, api_key: String) -> Result<Self, url::ParseError> {
        Ok(SupabaseAuth {
            http: reqwest::Client::new(),
            user_endpoint: supabase_url.join("auth/v1/user")?,
            api_key,
        })
    }
}

#[async_trait]
impl IdentityProvider for SupabaseAuth {
    async fn user_id(&self, bearer: &str) -> Result<String, AuthError> {
        let res = self
            .http
            .get(self.user_endpoint.clone())
            .header("apikey", &self.api_key)
            .bearer_auth(bearer)
            .send()
            .await
            .inspect_err(|err| {
                tracing::error!("Error occurred in request to Supabase auth API: {:#?}", err)
            })?;

        if matches!(res.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(AuthError::Rejected);
        }

        let user = res.error_for_status()?.json::<SupabaseUser>().await?;
        Ok(user.id)
    }
}

async fn bearer_token(parts: &mut Parts, state: &Arc<AppState>) -> Option<String> {
    TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
        .await
        .ok()
        .map(|TypedHeader(auth)| auth.token().to_string())
}

/// Caller identity resolved from the request's own bearer token.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: String,
    pub token: String,
}

impl FromRequestParts<Arc<AppState>> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts, state)
            .await
            .ok_or(AuthError::Missing)?;
        let id = state.identity.user_id(&token).await?;
        Ok(CurrentUser { id, token })
    }
}

/// Like [`CurrentUser`], but a request without an `Authorization` header is
/// let through as `None`. A header that fails validation is still rejected.
#[derive(Debug, Clone)]
pub struct MaybeUser(pub Option<CurrentUser>);

impl FromRequestParts<Arc<AppState>> for MaybeUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Some(token) = bearer_token(parts, state).await else {
            return Ok(MaybeUser(None));
        };
        let id = state.identity.user_id(&token).await?;
        Ok(MaybeUser(Some(CurrentUser { id, token })))
    }
}

/// Owner of pot requests: the bearer's user when present, otherwise the
/// `user_id` header the mobile client sends.
#[derive(Debug, Clone)]
pub struct PotOwner(pub String);

impl FromRequestParts<Arc<AppState>> for PotOwner {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        if let MaybeUser(Some(user)) = MaybeUser::from_request_parts(parts, state).await? {
            return Ok(PotOwner(user.id));
        }

        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(|value| PotOwner(value.to_string()))
            .ok_or(AppError::Auth(AuthError::Missing))
    }
}
