mod args;
mod auth;
mod db;
mod domain;
mod error;
mod handlers;
mod logging;
mod notifier;
mod plaid;
mod pots;
mod session;
mod sync;
#[cfg(test)]
mod testing;
mod webhook;

use std::{error::Error, future::IntoFuture, sync::Arc};

use args::parse_args;
use auth::{IdentityProvider, SupabaseAuth};
use db::{PgStore, Store, create_pool, run_migrations};
use handlers::api_router;
use logging::setup_logging;
use notifier::Notifier;
use plaid::{Aggregator, PlaidClient};
use session::BearerCache;
use sync::SyncEngine;
use url::Url;
use webhook::webhook_router;

pub struct AppState {
    aggregator: Arc<dyn Aggregator>,
    store: Arc<dyn Store>,
    identity: Arc<dyn IdentityProvider>,
    engine: SyncEngine,
    sessions: BearerCache,
    notifier: Notifier,
    http: reqwest::Client,
    api_base_url: Url,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();
    let args = parse_args();

    setup_logging(Some(args.base_log_dir.as_str()).filter(|dir| !dir.is_empty()));

    let link_settings = args.link_settings()?;

    let pool = create_pool(&args.database_url)
        .await
        .inspect_err(|err| tracing::error!("Failed to create PostgreSQL pool: {}", err))?;

    if args.migrate {
        tracing::info!("Running database migrations...");
        run_migrations(&pool).await?;
    }

    let aggregator: Arc<dyn Aggregator> = Arc::new(PlaidClient::new(
        args.plaid_env.base_url(),
        args.plaid_client_id.clone(),
        args.plaid_secret.clone(),
        link_settings,
    ));
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));
    let identity: Arc<dyn IdentityProvider> = Arc::new(SupabaseAuth::new(
        &args.supabase_url,
        args.supabase_service_role_key.clone(),
    )?);
    let notifier = Notifier::new();

    let app_state = Arc::new(AppState {
        engine: SyncEngine::new(
            aggregator.clone(),
            store.clone(),
            notifier.clone(),
            args.transactions_page_size,
        ),
        aggregator,
        store,
        identity,
        sessions: BearerCache::new(),
        notifier,
        http: reqwest::Client::new(),
        api_base_url: args.api_base_url.clone(),
    });

    let api_address = format!("0.0.0.0:{}", args.port);
    let webhook_address = format!("0.0.0.0:{}", args.webhook_port);

    let api_listener = tokio::net::TcpListener::bind(&api_address).await?;
    let webhook_listener = tokio::net::TcpListener::bind(&webhook_address).await?;

    tracing::info!("Server listening on {}...", api_address);
    tracing::info!("Webhook receiver listening on {}...", webhook_address);

    tokio::try_join!(
        axum::serve(api_listener, api_router(app_state.clone())).into_future(),
        axum::serve(webhook_listener, webhook_router(app_state)).into_future(),
    )?;

    Ok(())
}
