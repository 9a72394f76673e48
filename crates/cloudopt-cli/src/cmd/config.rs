use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use cloudopt_core::config::{Config, ProviderConfig, WarnLevel};
use std::path::Path;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Validate the config for common mistakes
    Validate,

    /// Show the effective config
    Show,

    /// List configured provider accounts
    Providers,
}

pub fn run(root: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    let config = Config::read(root).context("failed to load config")?;
    match subcmd {
        ConfigSubcommand::Validate => validate(&config, json),
        ConfigSubcommand::Show => show(&config, json),
        ConfigSubcommand::Providers => providers(&config, json),
    }
}

fn validate(config: &Config, json: bool) -> anyhow::Result<()> {
    let warnings = config.validate();

    if json {
        print_json(&serde_json::json!({ "warnings": warnings }))?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}

fn show(config: &Config, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(config);
    }
    print!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

fn providers(config: &Config, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(&config.providers);
    }
    if config.providers.is_empty() {
        println!("No providers configured.");
        return Ok(());
    }
    let rows = config
        .providers
        .iter()
        .map(|(account, provider)| match provider {
            ProviderConfig::Http {
                endpoint,
                token_env,
            } => vec![
                account.clone(),
                "http".to_string(),
                endpoint.clone(),
                token_env.clone().unwrap_or_else(|| "-".to_string()),
            ],
            ProviderConfig::DryRun => vec![
                account.clone(),
                "dry_run".to_string(),
                "-".to_string(),
                "-".to_string(),
            ],
        })
        .collect();
    print_table(&["ACCOUNT", "TYPE", "ENDPOINT", "TOKEN ENV"], rows);
    Ok(())
}
