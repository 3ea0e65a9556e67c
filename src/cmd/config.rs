//! Configuration view and validation commands: `ivan config`.

use anyhow::{Context, Result};

use ivan::config::IvanConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config: &IvanConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = IvanConfig::home_dir()?.join("config.toml");

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Ivan Configuration");
            println!("==================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("Config file: {} (not found, using defaults)", config_path.display());
            }
            println!("Database: {}", config.db_path()?.display());
            println!();

            let mut shown = config.clone();
            if shown.github.token.is_some() {
                shown.github.token = Some("********".to_string());
            }
            let rendered =
                toml::to_string_pretty(&shown).context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
            }
        }
    }

    Ok(())
}
