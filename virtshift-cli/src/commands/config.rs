//! `virtshift config` command.

use crate::output::{self, OutputMode};
use clap::Subcommand;
use std::path::{Path, PathBuf};
use virtshift_core::error::{Result, ShiftError};
use virtshift_core::{paths, AppConfig};

/// Configuration subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration
    Show,

    /// Print one value by dotted key (e.g. ssh.port)
    Get { key: String },

    /// Set one value and write the config file
    Set { key: String, value: String },

    /// Reset one value to its default and write the config file
    Unset { key: String },

    /// Write a default config file
    Init,

    /// List all keys and their current values
    List,

    /// Print the config file path in effect
    Path,
}

/// The file `set`/`unset`/`init` operate on: the explicit `--config` path
/// when given, the user config otherwise.
fn target_path(explicit: Option<&Path>) -> PathBuf {
    explicit.map(Path::to_path_buf).unwrap_or_else(paths::user_config_path)
}

/// Load the file layer only (no env overrides) for editing.
fn load_for_edit(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        AppConfig::from_file(path)
    } else {
        Ok(AppConfig::default())
    }
}

/// Run a config subcommand.
pub fn run(
    command: ConfigCommand,
    explicit_path: Option<&Path>,
    output: OutputMode,
) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let config = AppConfig::load(explicit_path)?;
            match output {
                OutputMode::Json => output::print_json(&config),
                OutputMode::Text => {
                    let yaml = serde_yaml::to_string(&config).map_err(|e| {
                        ShiftError::Configuration { reason: format!("serialize failed: {}", e) }
                    })?;
                    print!("{}", yaml);
                }
            }
        }
        ConfigCommand::Get { key } => {
            let config = AppConfig::load(explicit_path)?;
            println!("{}", config.get_key(&key)?);
        }
        ConfigCommand::Set { key, value } => {
            let path = target_path(explicit_path);
            let mut config = load_for_edit(&path)?;
            config.set_key(&key, &value)?;
            config.save(&path)?;
            println!("{} = {} ({})", key, value, path.display());
        }
        ConfigCommand::Unset { key } => {
            let path = target_path(explicit_path);
            let mut config = load_for_edit(&path)?;
            config.unset_key(&key)?;
            config.save(&path)?;
            println!("{} reset ({})", key, path.display());
        }
        ConfigCommand::Init => {
            let path = target_path(explicit_path);
            if path.exists() {
                return Err(ShiftError::Configuration {
                    reason: format!("{} already exists", path.display()),
                });
            }
            AppConfig::default().save(&path)?;
            println!("Wrote {}", path.display());
        }
        ConfigCommand::List => {
            let config = AppConfig::load(explicit_path)?;
            for (key, value) in config.list_keys() {
                println!("{} = {}", key, value);
            }
        }
        ConfigCommand::Path => {
            let path = explicit_path.map(Path::to_path_buf).unwrap_or_else(|| {
                [paths::user_config_path(), paths::system_config_path(), paths::local_config_path()]
                    .into_iter()
                    .find(|p| p.exists())
                    .unwrap_or_else(paths::user_config_path)
            });
            println!("{}", path.display());
        }
    }
    Ok(())
}
