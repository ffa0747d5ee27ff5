use std::collections::HashMap;
use std::sync::Arc;

use beacon_common::config::AppConfig;
use beacon_common::db;
use beacon_common::types::Channel;
use beacon_notifier::BulkDispatcher;
use beacon_notifier::provider::{
    DeliveryProvider, HttpSmsProvider, LogProvider, ResendEmailProvider,
};
use beacon_notifier::resolver::PgRecipientResolver;
use beacon_notifier::store::PgJobStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon_notifier=info,beacon_common=info".into()),
        )
        .json()
        .init();

    tracing::info!("Beacon notifier starting...");

    let config = AppConfig::from_env()?;

    // Connect to database and apply migrations
    let pool = db::connect(&config).await?;

    let dispatcher = BulkDispatcher::new(
        &config.dispatch,
        Arc::new(PgRecipientResolver::new(pool.clone())),
        Arc::new(PgJobStore::new(pool)),
        build_providers(&config),
    );

    let recovered = dispatcher.recover().await?;
    if recovered > 0 {
        tracing::info!(recovered, "Resuming jobs from previous run");
    }

    dispatcher.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");

    dispatcher.shutdown().await;

    tracing::info!("Beacon notifier stopped.");
    Ok(())
}

/// Real providers where credentials are configured, dry-run otherwise.
fn build_providers(config: &AppConfig) -> HashMap<Channel, Arc<dyn DeliveryProvider>> {
    let email: Arc<dyn DeliveryProvider> =
        match (&config.resend_api_key, &config.email_from) {
            (Some(api_key), Some(from)) => {
                Arc::new(ResendEmailProvider::new(api_key.clone(), from.clone()))
            }
            _ => {
                tracing::warn!("RESEND_API_KEY or EMAIL_FROM not set, email runs in dry-run mode");
                Arc::new(LogProvider)
            }
        };

    let sms: Arc<dyn DeliveryProvider> = match &config.sms_gateway_url {
        Some(url) => Arc::new(HttpSmsProvider::new(
            url.clone(),
            config.sms_gateway_token.clone(),
        )),
        None => {
            tracing::warn!("SMS_GATEWAY_URL not set, SMS runs in dry-run mode");
            Arc::new(LogProvider)
        }
    };

    HashMap::from([(Channel::Email, email), (Channel::Sms, sms)])
}
