//! `walletgate sites`: trusted origins.

use std::time::Duration;

use secrecy::ExposeSecret;

use crate::broker::{Origin, SiteTrustRegistry};
use crate::cli::SitesCommand;
use crate::config::Config;

pub async fn run_sites_command(cmd: SitesCommand, config: &Config) -> anyhow::Result<()> {
    match cmd {
        SitesCommand::List { json } => {
            let store = crate::db::connect_from_config(&config.database).await?;
            let sites = SiteTrustRegistry::new(store).list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sites)?);
                return Ok(());
            }
            if sites.is_empty() {
                println!("No connected sites.");
                return Ok(());
            }
            println!("{:<40} {:<44} {}", "ORIGIN", "ACCOUNT", "LAST USED");
            for site in sites {
                println!(
                    "{:<40} {:<44} {}",
                    site.origin,
                    site.account_address,
                    site.last_used_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(())
        }
        SitesCommand::Revoke { origin } => {
            let origin = Origin::parse(&origin)?;
            // A running gateway revokes and notifies the site's tabs.
            match revoke_via_gateway(config, &origin).await {
                Ok(Some(removed)) => {
                    report_revoke(&origin, removed);
                    return Ok(());
                }
                Ok(None) => {}
                Err(e) => tracing::debug!("Gateway revoke unavailable: {}", e),
            }

            let store = crate::db::connect_from_config(&config.database).await?;
            let removed = SiteTrustRegistry::new(store).remove(&origin).await?;
            report_revoke(&origin, removed);
            if removed {
                println!("(gateway not running; open tabs were not notified)");
            }
            Ok(())
        }
    }
}

fn report_revoke(origin: &Origin, removed: bool) {
    if removed {
        println!("Revoked {origin}");
    } else {
        println!("{origin} was not connected");
    }
}

/// `Ok(None)` when no gateway answered or no token is configured.
async fn revoke_via_gateway(config: &Config, origin: &Origin) -> anyhow::Result<Option<bool>> {
    let Some(token) = gateway_token(config) else {
        return Ok(None);
    };
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()?;
    let url = format!(
        "{}/api/sites/{}",
        config.gateway.base_url(),
        urlencoding::encode(origin.as_str())
    );
    let response = match client.delete(&url).bearer_auth(token).send().await {
        Ok(response) => response,
        Err(e) if e.is_connect() || e.is_timeout() => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let status = response.status();
    if status.is_success() {
        Ok(Some(true))
    } else if status == reqwest::StatusCode::NOT_FOUND {
        Ok(Some(false))
    } else {
        anyhow::bail!("gateway answered {status}")
    }
}

fn gateway_token(config: &Config) -> Option<String> {
    config
        .gateway
        .auth_token
        .as_ref()
        .map(|t| t.expose_secret().to_string())
}
