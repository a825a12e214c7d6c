//! `walletgate doctor` - active health diagnostics.
//!
//! Validates configuration, opens the durable store and probes the gateway
//! port so problems surface before a website is left waiting on an approval
//! that can never be shown.

use std::time::Duration;

use crate::broker::PendingRequestStore;
use crate::config::{Config, WindowHostKind};
use crate::error::ConfigError;

/// Print one line per check, then a tally.
pub async fn run_doctor_command(
    config: Result<Config, ConfigError>,
    strict: bool,
) -> anyhow::Result<()> {
    println!("walletgate doctor");
    println!("=================\n");

    let mut passed = 0u32;
    let mut failed = 0u32;

    let config = match config {
        Ok(config) => {
            check(
                "Configuration",
                CheckResult::Pass(format!(
                    "timeout {}s, poll {}ms, window host {:?}",
                    config.broker.request_timeout.as_secs(),
                    config.broker.poll_interval.as_millis(),
                    config.broker.window_host
                )),
                &mut passed,
                &mut failed,
            );
            config
        }
        Err(e) => {
            check(
                "Configuration",
                CheckResult::Fail(e.to_string()),
                &mut passed,
                &mut failed,
            );
            summarize(passed, failed, strict)?;
            return Ok(());
        }
    };

    check(
        "Gateway auth token",
        check_auth_token(&config),
        &mut passed,
        &mut failed,
    );

    check(
        "Durable store",
        check_store(&config).await,
        &mut passed,
        &mut failed,
    );

    check(
        "Gateway port",
        check_gateway_port(&config).await,
        &mut passed,
        &mut failed,
    );

    check(
        "Approval window opener",
        check_window_opener(config.broker.window_host),
        &mut passed,
        &mut failed,
    );

    summarize(passed, failed, strict)
}

fn summarize(passed: u32, failed: u32, strict: bool) -> anyhow::Result<()> {
    println!();
    println!("  {passed} passed, {failed} failed");

    if failed > 0 && strict {
        anyhow::bail!("doctor strict mode failed with {failed} check(s)");
    }
    Ok(())
}

// --- Checks ---

fn check(name: &str, result: CheckResult, passed: &mut u32, failed: &mut u32) {
    match result {
        CheckResult::Pass(detail) => {
            *passed += 1;
            println!("  [pass] {name}: {detail}");
        }
        CheckResult::Fail(detail) => {
            *failed += 1;
            println!("  [FAIL] {name}: {detail}");
        }
        CheckResult::Skip(reason) => {
            println!("  [skip] {name}: {reason}");
        }
    }
}

enum CheckResult {
    Pass(String),
    Fail(String),
    Skip(String),
}

fn check_auth_token(config: &Config) -> CheckResult {
    if config.gateway.auth_token.is_some() {
        CheckResult::Pass("GATEWAY_AUTH_TOKEN is set".to_string())
    } else {
        CheckResult::Skip(format!(
            "not set yet; `walletgate serve` will generate one in {}",
            crate::bootstrap::walletgate_env_path().display()
        ))
    }
}

async fn check_store(config: &Config) -> CheckResult {
    let store = match crate::db::connect_from_config(&config.database).await {
        Ok(store) => store,
        Err(e) => {
            return CheckResult::Fail(format!(
                "cannot open {}: {e}",
                config.database.libsql_path.display()
            ));
        }
    };

    let pending = PendingRequestStore::new(
        store,
        config.broker.request_timeout,
        config.broker.orphan_grace,
    );
    let slots = match pending.list().await {
        Ok(slots) => slots,
        Err(e) => return CheckResult::Fail(format!("cannot read pending slots: {e}")),
    };

    let stale: Vec<String> = slots
        .iter()
        .filter(|slot| pending.is_stale(slot))
        .map(|slot| slot.kind.to_string())
        .collect();
    if !stale.is_empty() {
        return CheckResult::Fail(format!(
            "stale slots for {} (cleared on next serve, or run `walletgate pending clear <kind>`)",
            stale.join(", ")
        ));
    }

    CheckResult::Pass(format!(
        "{} ({} occupied slot(s))",
        config.database.libsql_path.display(),
        slots.len()
    ))
}

async fn check_gateway_port(config: &Config) -> CheckResult {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => {
            drop(listener);
            CheckResult::Pass(format!("{addr} is available"))
        }
        Err(bind_error) => {
            // Busy may just mean walletgate is already running.
            if gateway_is_healthy(&config.gateway.base_url()).await {
                CheckResult::Pass(format!("walletgate already serving on {addr}"))
            } else {
                CheckResult::Fail(format!(
                    "{addr} is unavailable ({bind_error}); free the port or change GATEWAY_PORT"
                ))
            }
        }
    }
}

async fn gateway_is_healthy(base_url: &str) -> bool {
    let Ok(client) = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
    else {
        return false;
    };
    match client.get(format!("{base_url}/api/health")).send().await {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}

fn check_window_opener(host: WindowHostKind) -> CheckResult {
    match host {
        WindowHostKind::Headless => {
            CheckResult::Skip("headless mode; approval pages are not opened".to_string())
        }
        WindowHostKind::Browser if cfg!(target_os = "linux") => {
            check_binary("xdg-open", &["--version"])
        }
        WindowHostKind::Browser => {
            CheckResult::Pass("system browser opener".to_string())
        }
    }
}

/// Run `name args..` and report the first line it prints.
fn check_binary(name: &str, args: &[&str]) -> CheckResult {
    let Ok(output) = std::process::Command::new(name).args(args).output() else {
        return CheckResult::Skip(format!("{name} not found in PATH"));
    };
    if !output.status.success() {
        return CheckResult::Fail(format!("{name} exited with {}", output.status));
    }
    let first_line = |bytes: &[u8]| {
        String::from_utf8_lossy(bytes)
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
    };
    let banner = first_line(&output.stdout)
        .or_else(|| first_line(&output.stderr))
        .unwrap_or_else(|| format!("{name} available"));
    CheckResult::Pass(banner)
}
