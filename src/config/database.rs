use std::path::PathBuf;

use secrecy::SecretString;

use crate::config::helpers::optional_env;
use crate::error::ConfigError;
use crate::settings::Settings;

/// Durable store location.
///
/// With both `libsql_url` and `libsql_auth_token` set the local file runs
/// as an embedded replica synced to Turso; otherwise it is purely local.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub libsql_path: PathBuf,
    pub libsql_url: Option<String>,
    pub libsql_auth_token: Option<SecretString>,
}

/// `~/.walletgate/walletgate.db`
pub fn default_libsql_path() -> PathBuf {
    crate::bootstrap::walletgate_dir().join("walletgate.db")
}

impl DatabaseConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let libsql_path = optional_env("LIBSQL_PATH")?
            .or_else(|| settings.database.libsql_path.clone())
            .map(PathBuf::from)
            .unwrap_or_else(default_libsql_path);

        let libsql_url = optional_env("LIBSQL_URL")?.or_else(|| settings.database.libsql_url.clone());
        let libsql_auth_token = optional_env("LIBSQL_AUTH_TOKEN")?.map(SecretString::from);

        if libsql_url.is_some() && libsql_auth_token.is_none() {
            return Err(ConfigError::MissingEnvVar(
                "LIBSQL_AUTH_TOKEN (required when LIBSQL_URL is set)".to_string(),
            ));
        }

        Ok(Self {
            libsql_path,
            libsql_url,
            libsql_auth_token,
        })
    }
}
