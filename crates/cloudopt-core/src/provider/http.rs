//! JSON-over-HTTP bridge to an out-of-process vendor adapter.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error};

use super::{
    CostRecord, MetricSeries, MetricsQuery, ProviderActionResult, ProviderAdapter,
    ProviderRecommendation, Resource,
};
use crate::error::{CloudoptError, Result};
use crate::recommendation::ResourceRef;
use crate::types::ResourceKind;

/// Endpoints, relative to the base URL:
///
/// | call | route |
/// |---|---|
/// | authenticate | `POST /authenticate` |
/// | get_resources | `GET /resources[?type=kind]` |
/// | get_resource | `GET /resources/{kind}/{id}` |
/// | get_metrics | `POST /metrics` |
/// | get_cost_data | `GET /costs?start=..&end=..` |
/// | execute_action | `POST /actions` |
/// | tag_resource | `POST /tags` |
/// | get_recommendations | `GET /recommendations` |
#[derive(Debug, Clone)]
pub struct HttpProvider {
    name: String,
    base_url: String,
    token: Option<String>,
    client: Client,
}

#[derive(Serialize)]
struct ActionRequest<'a> {
    action: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource: Option<&'a ResourceRef>,
    parameters: &'a Map<String, Value>,
}

#[derive(Serialize)]
struct TagRequest<'a> {
    resource: &'a ResourceRef,
    tags: &'a BTreeMap<String, String>,
}

impl HttpProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, token: Option<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client: Client::new(),
        }
    }

    /// Like [`new`](Self::new), reading the bearer token from `token_env`.
    pub fn from_env(name: &str, base_url: &str, token_env: Option<&str>) -> Result<Self> {
        let token = match token_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                CloudoptError::Config(format!(
                    "provider '{name}': environment variable '{var}' is not set"
                ))
            })?),
            None => None,
        };
        Ok(Self::new(name, base_url, token))
    }

    /// The base URL with `segments` appended, each percent-encoded, so ids
    /// such as ARM paths stay a single segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let bad = |why: String| {
            CloudoptError::Config(format!("provider '{}': endpoint {:?} {why}", self.name, self.base_url))
        };
        let mut url = Url::parse(&self.base_url).map_err(|e| bad(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| bad("cannot take a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder, route: &str) -> Result<Response> {
        let response = self.authorize(req).send().await.map_err(|e| {
            error!(provider = %self.name, route, error = %e, "provider request failed");
            CloudoptError::Provider(format!("{}: {route}: {e}", self.name))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(CloudoptError::Provider(format!(
                "{}: {route} returned {status}: {body}",
                self.name
            )));
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = self.endpoint(segments)?;
        let route = url.path().to_string();
        debug!(provider = %self.name, route = %route, "GET");
        let response = self.send(self.client.get(url).query(query), &route).await?;
        self.decode(response, &route).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        segment: &str,
        body: &B,
    ) -> Result<T> {
        let url = self.endpoint(&[segment])?;
        let route = url.path().to_string();
        debug!(provider = %self.name, route = %route, "POST");
        let response = self.send(self.client.post(url).json(body), &route).await?;
        self.decode(response, &route).await
    }

    async fn decode<T: DeserializeOwned>(&self, response: Response, path: &str) -> Result<T> {
        response.json::<T>().await.map_err(|e| {
            CloudoptError::Provider(format!("{}: {path}: malformed response: {e}", self.name))
        })
    }
}

#[async_trait]
impl ProviderAdapter for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn authenticate(&self) -> Result<()> {
        let req = self.client.post(self.endpoint(&["authenticate"])?);
        self.send(req, "/authenticate").await?;
        Ok(())
    }

    async fn get_resources(&self, kind: Option<&ResourceKind>) -> Result<Vec<Resource>> {
        let query: Vec<(&str, String)> = kind.map(|k| ("type", k.to_string())).into_iter().collect();
        self.get_json(&["resources"], &query).await
    }

    async fn get_resource(&self, kind: &ResourceKind, id: &str) -> Result<Resource> {
        let path = format!("/resources/{kind}/{id}");
        let req = self.client.get(self.endpoint(&["resources", kind.as_str(), id])?);
        let response = self.authorize(req).send().await.map_err(|e| {
            CloudoptError::Provider(format!("{}: {path}: {e}", self.name))
        })?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CloudoptError::not_found("resource", format!("{kind}/{id}")));
        }
        if !response.status().is_success() {
            return Err(CloudoptError::Provider(format!(
                "{}: {path} returned {}",
                self.name,
                response.status()
            )));
        }
        self.decode(response, &path).await
    }

    async fn get_metrics(&self, query: &MetricsQuery) -> Result<HashMap<String, MetricSeries>> {
        self.post_json("metrics", query).await
    }

    async fn get_cost_data(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<CostRecord>> {
        self.get_json(
            &["costs"],
            &[("start", start.to_string()), ("end", end.to_string())],
        )
        .await
    }

    async fn execute_action(
        &self,
        verb: &str,
        resource: Option<&ResourceRef>,
        parameters: &Map<String, Value>,
    ) -> Result<ProviderActionResult> {
        let body = ActionRequest {
            action: verb,
            resource,
            parameters,
        };
        self.post_json("actions", &body).await
    }

    async fn tag_resource(
        &self,
        resource: &ResourceRef,
        tags: &BTreeMap<String, String>,
    ) -> Result<ProviderActionResult> {
        self.post_json("tags", &TagRequest { resource, tags })
            .await
    }

    async fn get_recommendations(&self) -> Result<Vec<ProviderRecommendation>> {
        self.get_json(&["recommendations"], &[]).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[tokio::test]
    async fn execute_action_posts_verb_with_bearer() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/actions")
            .match_header("authorization", "Bearer secret")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "action": "stop_instance",
                "resource": {"id": "i-1", "kind": "ec2_instance"},
                "parameters": {"force": true}
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"success": true, "message": "stopping"}"#)
            .create_async()
            .await;

        let provider = HttpProvider::new("acct", server.url(), Some("secret".into()));
        let mut params = Map::new();
        params.insert("force".into(), Value::Bool(true));
        let res = provider
            .execute_action(
                "stop_instance",
                Some(&ResourceRef::new("i-1", ResourceKind::Ec2Instance)),
                &params,
            )
            .await
            .unwrap();

        assert!(res.success);
        assert_eq!(res.message, "stopping");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn error_status_becomes_provider_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/recommendations")
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;

        let provider = HttpProvider::new("acct", server.url(), None);
        let err = provider.get_recommendations().await.unwrap_err();
        match err {
            CloudoptError::Provider(msg) => {
                assert!(msg.contains("503"));
                assert!(msg.contains("maintenance"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cost_records_accept_numeric_amounts() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/costs")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("start".into(), "2024-05-01".into()),
                Matcher::UrlEncoded("end".into(), "2024-06-10".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"date": "2024-05-01", "amount": 12.5, "currency": "USD"}]"#)
            .create_async()
            .await;

        let provider = HttpProvider::new("acct", server.url(), None);
        let start = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        let costs = provider.get_cost_data(start, end).await.unwrap();
        assert_eq!(costs.len(), 1);
        assert_eq!(costs[0].amount, rust_decimal::Decimal::new(125, 1));
    }

    #[tokio::test]
    async fn missing_resource_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/resources/ec2_instance/i-404")
            .with_status(404)
            .create_async()
            .await;

        let provider = HttpProvider::new("acct", server.url(), None);
        let err = provider
            .get_resource(&ResourceKind::Ec2Instance, "i-404")
            .await
            .unwrap_err();
        assert!(matches!(err, CloudoptError::NotFound { kind: "resource", .. }));
    }

    #[tokio::test]
    async fn resource_ids_are_a_single_encoded_segment() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock(
                "GET",
                "/api/resources/virtual_machine/%2Fsubscriptions%2Fs1%2FvirtualMachines%2Fvm%201",
            )
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"id": "/subscriptions/s1/virtualMachines/vm 1", "kind": "virtual_machine", "status": "running"}"#,
            )
            .create_async()
            .await;

        let provider = HttpProvider::new("acct", format!("{}/api/", server.url()), None);
        let res = provider
            .get_resource(&ResourceKind::VirtualMachine, "/subscriptions/s1/virtualMachines/vm 1")
            .await
            .unwrap();
        assert_eq!(res.id, "/subscriptions/s1/virtualMachines/vm 1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn resource_type_filter_is_query_encoded() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/resources")
            .match_query(Matcher::UrlEncoded("type".into(), "db&cache".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("[]")
            .create_async()
            .await;

        let provider = HttpProvider::new("acct", server.url(), None);
        let kind = ResourceKind::Other("db&cache".into());
        assert!(provider.get_resources(Some(&kind)).await.unwrap().is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unparsable_endpoint_is_a_config_error() {
        let provider = HttpProvider::new("acct", "not a url", None);
        let err = provider.get_recommendations().await.unwrap_err();
        assert!(matches!(err, CloudoptError::Config(_)), "{err:?}");
    }

    #[test]
    fn from_env_requires_the_variable() {
        let err = HttpProvider::from_env("acct", "http://x", Some("CLOUDOPT_TEST_UNSET_TOKEN"))
            .unwrap_err();
        assert!(matches!(err, CloudoptError::Config(_)));
    }
}
