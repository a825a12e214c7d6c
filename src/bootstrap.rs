//! Bootstrap helpers for walletgate.
//!
//! Bootstrap env vars are persisted to disk before any config is resolved.
//! This covers the database location (`LIBSQL_*`) and the gateway bearer
//! token, which must stay stable across restarts so approval pages opened
//! by a previous run keep working.
//!
//! File: `~/.walletgate/.env` (standard dotenvy format)

use std::path::{Path, PathBuf};

/// Base directory for walletgate state: `~/.walletgate`.
pub fn walletgate_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".walletgate")
}

/// Path to the walletgate-specific `.env` file: `~/.walletgate/.env`.
pub fn walletgate_env_path() -> PathBuf {
    walletgate_dir().join(".env")
}

/// Load env vars from `~/.walletgate/.env` (in addition to the standard `.env`).
///
/// Call this **after** `dotenvy::dotenv()` so that the standard `./.env`
/// takes priority over `~/.walletgate/.env`. dotenvy never overwrites
/// existing env vars, so the effective priority is:
///
///   explicit env vars > `./.env` > `~/.walletgate/.env`
pub fn load_walletgate_env() {
    let path = walletgate_env_path();
    if path.exists() {
        let _ = dotenvy::from_path(&path);
    }
}

/// Merge `vars` into the dotenv file at `path`, keeping unrelated entries.
///
/// Values are double-quoted so that `#` and other shell-special characters
/// are preserved by dotenvy.
pub fn save_bootstrap_env_to(path: &Path, vars: &[(&str, &str)]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut entries: Vec<(String, String)> = match dotenvy::from_path_iter(path) {
        Ok(iter) => iter.filter_map(Result::ok).collect(),
        Err(_) => Vec::new(),
    };
    for (key, value) in vars {
        match entries.iter_mut().find(|(k, _)| k == key) {
            Some(existing) => existing.1 = (*value).to_string(),
            None => entries.push(((*key).to_string(), (*value).to_string())),
        }
    }

    let mut content = String::new();
    for (key, value) in &entries {
        // Escape backslashes and double quotes to prevent env var injection
        // (e.g. a value containing `"\nINJECTED="x` would break out of quotes).
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        content.push_str(&format!("{}=\"{}\"\n", key, escaped));
    }
    std::fs::write(path, content)
}

/// Write bootstrap vars to `~/.walletgate/.env`.
pub fn save_bootstrap_env(vars: &[(&str, &str)]) -> std::io::Result<()> {
    save_bootstrap_env_to(&walletgate_env_path(), vars)
}

/// Random 32-byte bearer token, hex encoded.
pub fn generate_auth_token() -> String {
    use rand::RngCore;

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Make sure a gateway token is persisted in the dotenv file at `path`.
///
/// Returns the token and whether it was newly generated. An explicit
/// `GATEWAY_AUTH_TOKEN` in the file is never replaced.
pub fn ensure_auth_token_at(path: &Path) -> std::io::Result<(String, bool)> {
    let existing = dotenvy::from_path_iter(path).ok().and_then(|iter| {
        iter.filter_map(Result::ok)
            .find(|(k, v)| k == "GATEWAY_AUTH_TOKEN" && !v.is_empty())
            .map(|(_, v)| v)
    });
    if let Some(token) = existing {
        return Ok((token, false));
    }

    let token = generate_auth_token();
    save_bootstrap_env_to(path, &[("GATEWAY_AUTH_TOKEN", &token)])?;
    Ok((token, true))
}
