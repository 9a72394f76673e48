pub mod action;
pub mod config;
pub mod daemon;
pub mod init;
pub mod recommend;
pub mod tick;
pub mod workflow;

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use cloudopt_core::config::Config;
use cloudopt_core::paths;
use cloudopt_core::provider::{ProviderAdapter, ProviderMap};
use cloudopt_core::scheduler::Scheduler;
use cloudopt_core::store::RedbStore;
use uuid::Uuid;

/// Config, database and engines of one initialized root.
pub struct Workspace {
    pub config: Config,
    pub engines: Scheduler<RedbStore>,
}

impl Workspace {
    pub fn open(root: &Path) -> anyhow::Result<Self> {
        let config = Config::load(root).context("failed to load config")?;
        let store = RedbStore::open(&paths::db_path(root)).context("failed to open database")?;
        let providers = ProviderMap::from_config(&config).context("failed to set up providers")?;
        Ok(Self {
            engines: Scheduler::new(Arc::new(store), providers, &config),
            config,
        })
    }

    pub fn provider(&self, account_id: &str) -> anyhow::Result<Arc<dyn ProviderAdapter>> {
        self.engines.providers().get(account_id).ok_or_else(|| {
            anyhow!("no provider configured for account '{account_id}' (see .cloudopt/config.yaml)")
        })
    }
}

pub fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("failed to start async runtime")
}

pub fn parse_id(raw: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("invalid id '{raw}'"))
}

/// RFC 3339, e.g. `2024-06-10T22:00:00Z`.
pub fn parse_time(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("invalid time '{raw}': expected RFC 3339"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339_with_offset() {
        let t = parse_time("2024-06-10T22:00:00+02:00").unwrap();
        assert_eq!(t.to_rfc3339(), "2024-06-10T20:00:00+00:00");
        assert!(parse_time("tomorrow").is_err());
    }

    #[test]
    fn rejects_bad_ids() {
        let err = parse_id("nope").unwrap_err();
        assert!(err.to_string().contains("invalid id 'nope'"));
    }
}
