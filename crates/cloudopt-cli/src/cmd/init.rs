use anyhow::Context;
use cloudopt_core::config::{Config, ProviderConfig};
use cloudopt_core::{io, paths};
use cloudopt_core::store::RedbStore;
use std::path::Path;

pub fn run(root: &Path, dry_run_accounts: &[String]) -> anyhow::Result<()> {
    println!("Initializing cloudopt in: {}", root.display());

    let dir = paths::cloudopt_dir(root);
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let mut config = Config::default();
    for account in dry_run_accounts {
        config.providers.insert(account.clone(), ProviderConfig::DryRun);
    }
    let yaml = serde_yaml::to_string(&config)?;
    if io::write_if_missing(&paths::config_path(root), yaml.as_bytes())
        .context("failed to write config.yaml")?
    {
        println!("  created: {}", paths::CONFIG_FILE);
    } else {
        println!("  exists:  {}", paths::CONFIG_FILE);
    }

    let db_path = paths::db_path(root);
    let existed = db_path.exists();
    RedbStore::open(&db_path).context("failed to create database")?;
    if existed {
        println!("  exists:  {}", paths::DB_FILE);
    } else {
        println!("  created: {}", paths::DB_FILE);
    }

    println!("\nNext: add provider accounts to {} and run 'cloudopt config validate'.", paths::CONFIG_FILE);
    Ok(())
}
