//! `walletgate config`: TOML config file management.

use std::path::Path;

use crate::cli::ConfigCommand;
use crate::settings::Settings;

pub fn run_config_command(cmd: ConfigCommand, toml_path: Option<&Path>) -> anyhow::Result<()> {
    let path = toml_path
        .map(Path::to_path_buf)
        .unwrap_or_else(Settings::default_toml_path);

    match cmd {
        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            Settings::load()
                .save_toml(&path)
                .map_err(anyhow::Error::msg)?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        ConfigCommand::List => {
            let mut settings = Settings::load();
            settings.overlay_toml(&path).map_err(anyhow::Error::msg)?;
            for (key, value) in settings.list() {
                println!("{key} = {value}");
            }
            Ok(())
        }
    }
}
