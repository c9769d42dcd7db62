use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;

const PLAID_VERSION: &str = "2020-09-14";
const CLIENT_NAME: &str = "Savings Apps";
const PRODUCTS: [&str; 2] = ["auth", "transactions"];
const COUNTRY_CODES: [&str; 7] = ["US", "CA", "ES", "FR", "GB", "IE", "NL"];

#[derive(Debug, Error)]
pub enum PlaidError {
    #[error("request to Plaid failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Plaid answered with status {status}: {body}")]
    Api { status: u16, body: Value },
}

impl PlaidError {
    /// The error body Plaid sent, if the request got that far.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            PlaidError::Api { body, .. } => Some(body),
            PlaidError::Request(_) => None,
        }
    }
}

/// Platform-specific part of a link token request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum LinkPlatform {
    Ios { redirect_uri: String },
    Android { android_package_name: String },
}

#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub platform: LinkPlatform,
    pub webhook: Option<String>,
    pub completion_redirect_uri: String,
}

#[derive(Debug, Serialize)]
struct LinkUser<'a> {
    client_user_id: &'a str,
}

#[derive(Debug, Serialize)]
struct HostedLink<'a> {
    is_mobile_app: bool,
    completion_redirect_uri: &'a str,
}

#[derive(Debug, Serialize)]
struct LinkTokenCreateRequest<'a> {
    user: LinkUser<'a>,
    client_name: &'static str,
    language: &'static str,
    products: [&'static str; 2],
    country_codes: [&'static str; 7],
    #[serde(skip_serializing_if = "Option::is_none")]
    webhook: Option<&'a str>,
    hosted_link: HostedLink<'a>,
    #[serde(flatten)]
    platform: &'a LinkPlatform,
}

impl<'a> LinkTokenCreateRequest<'a> {
    fn new(settings: &'a LinkSettings, client_user_id: &'a str) -> Self {
        LinkTokenCreateRequest {
            user: LinkUser { client_user_id },
            client_name: CLIENT_NAME,
            language: "en",
            products: PRODUCTS,
            country_codes: COUNTRY_CODES,
            webhook: settings.webhook.as_deref(),
            hosted_link: HostedLink {
                is_mobile_app: false,
                completion_redirect_uri: &settings.completion_redirect_uri,
            },
            platform: &settings.platform,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LinkTokenResponse {
    pub link_token: String,
    pub expiration: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosted_link_url: Option<String>,
    #[serde(default)]
    pub request_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeResponse {
    pub access_token: String,
    pub item_id: String,
}

#[derive(Debug, Deserialize)]
struct Item {
    institution_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ItemGetResponse {
    item: Item,
}

#[derive(Debug, Deserialize)]
struct Institution {
    name: String,
}

#[derive(Debug, Deserialize)]
struct InstitutionResponse {
    institution: Institution,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PersonalFinanceCategory {
    pub primary: String,
    pub detailed: String,
}

/// A transaction as Plaid returns it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlaidTransaction {
    pub transaction_id: String,
    pub account_id: String,
    pub amount: f64,
    #[serde(default)]
    pub iso_currency_code: Option<String>,
    #[serde(default)]
    pub category: Option<Vec<String>>,
    #[serde(default)]
    pub personal_finance_category: Option<PersonalFinanceCategory>,
    pub date: NaiveDate,
    #[serde(default)]
    pub datetime: Option<String>,
    #[serde(default)]
    pub merchant_name: Option<String>,
    pub name: String,
    #[serde(default)]
    pub transaction_code: Option<String>,
    #[serde(default)]
    pub transaction_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransactionsGetResponse {
    transactions: Vec<PlaidTransaction>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemovedTransaction {
    pub transaction_id: String,
}

/// One page of `/transactions/sync`.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncPage {
    #[serde(default)]
    pub added: Vec<PlaidTransaction>,
    #[serde(default)]
    pub modified: Vec<PlaidTransaction>,
    #[serde(default)]
    pub removed: Vec<RemovedTransaction>,
    pub next_cursor: String,
    #[serde(default)]
    pub has_more: bool,
}

#[async_trait]
pub trait Aggregator: Send + Sync {
    async fn create_link_token(&self, client_user_id: &str)
    -> Result<LinkTokenResponse, PlaidError>;

    async fn exchange_public_token(&self, public_token: &str)
    -> Result<ExchangeResponse, PlaidError>;

    /// `None` when the item is not attached to a known institution.
    async fn item_institution_name(&self, access_token: &str) -> Result<Option<String>, PlaidError>;

    async fn transactions_by_date_range(
        &self,
        access_token: &str,
        start_date: NaiveDate,
        end_date: NaiveDate,
        count: u32,
    ) -> Result<Vec<PlaidTransaction>, PlaidError>;

    async fn transactions_sync(
        &self,
        access_token: &str,
        cursor: Option<&str>,
    ) -> Result<SyncPage, PlaidError>;

    async fn remove_item(&self, access_token: &str) -> Result<(), PlaidError>;
}

pub struct PlaidClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    secret: String,
    link: LinkSettings,
}

impl PlaidClient {
    pub fn new(base_url: &str, client_id: String, secret: String, link: LinkSettings) -> Self {
        PlaidClient {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id,
            secret,
            link,
        }
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, PlaidError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let res = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header("PLAID-CLIENT-ID", &self.client_id)
            .header("PLAID-SECRET", &self.secret)
            .header("Plaid-Version", PLAID_VERSION)
            .json(body)
            .send()
            .await
            .inspect_err(|err| {
                tracing::error!("Error occurred in request to Plaid {}: {:#?}", path, err)
            })?;

        let status = res.status();
        if !status.is_success() {
            let body = res.json::<Value>().await.unwrap_or(Value::Null);
            tracing::error!("Plaid {} returned status={} body={}", path, status, &body);
            return Err(PlaidError::Api {
                status: status.as_u16(),
                body,
            });
        }

        res.json::<R>().await.map_err(|err| {
            tracing::error!(
                "Error occurred while deserialising Plaid {} response: {:#?}",
                path,
                err
            );
            PlaidError::from(err)
        })
    }
}

#[async_trait]
impl Aggregator for PlaidClient {
    async fn create_link_token(
        &self,
        client_user_id: &str,
    ) -> Result<LinkTokenResponse, PlaidError> {
        tracing::info!("Creating link token for client_user_id={}", client_user_id);
        let request = LinkTokenCreateRequest::new(&self.link, client_user_id);
        self.post("/link/token/create", &request).await
    }

    async fn exchange_public_token(
        &self,
        public_token: &str,
    ) -> Result<ExchangeResponse, PlaidError> {
        tracing::info!("Exchanging public token...");
        self.post(
            "/item/public_token/exchange",
            &serde_json::json!({ "public_token": public_token }),
        )
        .await
    }

    async fn item_institution_name(&self, access_token: &str) -> Result<Option<String>, PlaidError> {
        let item: ItemGetResponse = self
            .post("/item/get", &serde_json::json!({ "access_token": access_token }))
            .await?;

        let Some(institution_id) = item.item.institution_id else {
            return Ok(None);
        };

        let institution: InstitutionResponse = self
            .post(
                "/institutions/get_by_id",
                &serde_json::json!({
                    "institution_id": institution_id,
                    "country_codes": COUNTRY_CODES,
                }),
            )
            .await?;

        Ok(Some(institution.institution.name))
    }

    async fn transactions_by_date_range(
        &self,
        access_token: &str,
        start_date: NaiveDate,
        end_date: NaiveDate,
        count: u32,
    ) -> Result<Vec<PlaidTransaction>, PlaidError> {
        tracing::info!(
            "Listing transactions between {} and {} (count={})",
            start_date,
            end_date,
            count
        );
        let res: TransactionsGetResponse = self
            .post(
                "/transactions/get",
                &serde_json::json!({
                    "access_token": access_token,
                    "start_date": start_date.format("%Y-%m-%d").to_string(),
                    "end_date": end_date.format("%Y-%m-%d").to_string(),
                    "options": { "count": count },
                }),
            )
            .await?;
        Ok(res.transactions)
    }

    async fn transactions_sync(
        &self,
        access_token: &str,
        cursor: Option<&str>,
    ) -> Result<SyncPage, PlaidError> {
        let mut body = serde_json::json!({ "access_token": access_token });
        if let Some(cursor) = cursor {
            body["cursor"] = Value::from(cursor);
        }
        self.post("/transactions/sync", &body).await
    }

    async fn remove_item(&self, access_token: &str) -> Result<(), PlaidError> {
        self.post::<_, Value>("/item/remove", &serde_json::json!({ "access_token": access_token }))
            .await
            .map(|_| ())
    }
}
