//! `walletgate serve`: the long-running broker.

use std::sync::Arc;

use anyhow::Context;
use secrecy::ExposeSecret;

use crate::bootstrap::{ensure_auth_token_at, walletgate_env_path};
use crate::broker::{
    BroadcastNotifier, BrowserWindowHost, Broker, BrokerDeps, DevAccountManager,
    HeadlessWindowHost, WindowHost,
};
use crate::config::{Config, WindowHostKind};
use crate::gateway::{GatewayState, start_server};

pub async fn run_serve(config: Config) -> anyhow::Result<()> {
    let token = match &config.gateway.auth_token {
        Some(token) => token.expose_secret().to_string(),
        None => {
            let path = walletgate_env_path();
            let (token, created) = ensure_auth_token_at(&path)
                .with_context(|| format!("failed to persist gateway token to {}", path.display()))?;
            if created {
                tracing::info!(path = %path.display(), "Generated gateway auth token");
            }
            token
        }
    };

    let store = crate::db::connect_from_config(&config.database)
        .await
        .context("failed to open the durable store")?;

    let accounts = Arc::new(DevAccountManager::new(
        config.accounts.dev_address.clone(),
        config.accounts.dev_balance,
    ));
    let window_host: Arc<dyn WindowHost> = match config.broker.window_host {
        WindowHostKind::Browser => Arc::new(BrowserWindowHost),
        WindowHostKind::Headless => Arc::new(HeadlessWindowHost::new()),
    };

    let approval_base_url = config.approval_base_url();
    let broker = Broker::new(
        &config.broker,
        &approval_base_url,
        Some(&token),
        BrokerDeps {
            store,
            window_host,
            accounts: accounts.clone(),
            balances: accounts,
            notifier: Arc::new(BroadcastNotifier::default()),
        },
    );

    // Slots orphaned by a previous run must not block new requests.
    let swept = broker.pending.sweep_stale().await?;
    if !swept.is_empty() {
        tracing::info!(count = swept.len(), "Swept orphaned pending slots");
    }

    let addr = tokio::net::lookup_host((config.gateway.host.as_str(), config.gateway.port))
        .await
        .with_context(|| format!("cannot resolve {}", config.gateway.host))?
        .next()
        .with_context(|| format!("no address for {}", config.gateway.host))?;

    let state = Arc::new(GatewayState::new(broker, config.gateway.bridge_rate_limit));
    let bound = start_server(addr, state.clone(), token).await?;

    tracing::info!(
        %bound,
        approval_base_url = %approval_base_url,
        timeout_secs = config.broker.request_timeout.as_secs(),
        "walletgate ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("Shutdown requested");
    state.shutdown().await;
    Ok(())
}
