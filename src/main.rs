use clap::Parser;
use tracing_subscriber::EnvFilter;

use walletgate::cli::Cli;
use walletgate::config::{Config, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env_with_toml(cli.config.as_deref());

    let format = config
        .as_ref()
        .map(|c| c.logging.format)
        .unwrap_or(LogFormat::Pretty);
    init_tracing(format);

    walletgate::cli::run(cli, config).await
}

/// Logs go to stderr so command output on stdout stays scriptable.
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("walletgate=info,tower_http=warn"));

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init(),
    }
}
