use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::info;

use super::{ProviderActionResult, ProviderAdapter};
use crate::error::Result;
use crate::recommendation::ResourceRef;

/// Adapter that performs nothing and reports success. Reads return empty
/// inventories.
#[derive(Debug, Clone)]
pub struct DryRunProvider {
    name: String,
}

impl DryRunProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl ProviderAdapter for DryRunProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute_action(
        &self,
        verb: &str,
        resource: Option<&ResourceRef>,
        parameters: &Map<String, Value>,
    ) -> Result<ProviderActionResult> {
        let target = resource.map(|r| r.id.as_str()).unwrap_or("-");
        info!(provider = %self.name, verb, resource = target, "dry run");
        Ok(ProviderActionResult {
            success: true,
            message: format!("dry run: {verb} {target}"),
            details: json!({ "dry_run": true, "parameters": parameters }),
        })
    }

    async fn tag_resource(
        &self,
        resource: &ResourceRef,
        tags: &BTreeMap<String, String>,
    ) -> Result<ProviderActionResult> {
        info!(provider = %self.name, resource = %resource.id, tags = tags.len(), "dry run tag");
        Ok(ProviderActionResult {
            success: true,
            message: format!("dry run: tagged {} with {} tags", resource.id, tags.len()),
            details: json!({ "dry_run": true, "tags": tags }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_success_without_inventory() {
        let p = DryRunProvider::new("acct");
        let res = p
            .execute_action("stop_vm", None, &Map::new())
            .await
            .unwrap();
        assert!(res.success);
        assert_eq!(res.details["dry_run"], true);
        assert!(p.get_resources(None).await.unwrap().is_empty());
        assert!(p.get_recommendations().await.unwrap().is_empty());
    }
}
