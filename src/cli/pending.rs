//! `walletgate pending`: inspect and clear approval slots.

use crate::broker::{PendingRequestStore, RequestKind};
use crate::cli::PendingCommand;
use crate::config::Config;

pub async fn run_pending_command(cmd: PendingCommand, config: &Config) -> anyhow::Result<()> {
    let store = crate::db::connect_from_config(&config.database).await?;
    let pending = PendingRequestStore::new(
        store,
        config.broker.request_timeout,
        config.broker.orphan_grace,
    );

    match cmd {
        PendingCommand::List { json } => {
            let slots = pending.list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&slots)?);
                return Ok(());
            }
            if slots.is_empty() {
                println!("No pending requests.");
                return Ok(());
            }
            println!("{:<12} {:<38} {:<32} {}", "KIND", "REQUEST", "ORIGIN", "STATE");
            for slot in slots {
                let mut state = match &slot.outcome {
                    None => "awaiting decision".to_string(),
                    Some(outcome) => format!("{} (unconsumed)", outcome.label()),
                };
                if pending.is_stale(&slot) {
                    state.push_str(", stale");
                }
                println!(
                    "{:<12} {:<38} {:<32} {}",
                    slot.kind, slot.request_id, slot.origin, state
                );
            }
            Ok(())
        }
        PendingCommand::Clear { kind } => {
            let kind: RequestKind = kind.parse().map_err(anyhow::Error::msg)?;
            match pending.clear(kind).await? {
                Some(request) => println!("Cleared {kind} slot (request {})", request.request_id),
                None => println!("The {kind} slot was already empty"),
            }
            Ok(())
        }
    }
}
