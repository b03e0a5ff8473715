//! Elasticsearch `_bulk` writer.
//!
//! Each batch becomes one NDJSON request of `index` actions keyed by `_id`,
//! which upserts by identity. Per-item statuses are mapped to [`ItemStatus`]:
//! 429 and 5xx are retryable, anything else is a permanent rejection.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::{BulkResult, BulkWriter, ItemStatus};
use crate::error::{MigrateError, Result};
use crate::transform::DestinationDoc;

/// Connection settings for an Elasticsearch cluster.
#[derive(Clone, Serialize, Deserialize)]
pub struct ElasticsearchConfig {
    /// Base URL, e.g. `http://localhost:9200`.
    pub url: String,

    /// Target index.
    pub index: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    30
}

impl fmt::Debug for ElasticsearchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElasticsearchConfig")
            .field("url", &self.url)
            .field("index", &self.index)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(default)]
    _id: Option<String>,
    status: u16,
    #[serde(default)]
    error: Option<BulkItemError>,
}

#[derive(Debug, Deserialize)]
struct BulkItemError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    reason: Option<String>,
}

impl BulkItem {
    fn into_status(self) -> ItemStatus {
        if (200..300).contains(&self.status) {
            return ItemStatus::Ok;
        }
        let reason = match self.error {
            Some(e) => match e.reason {
                Some(r) => format!("{}: {}", e.kind, r),
                None => e.kind,
            },
            None => format!("status {}", self.status),
        };
        ItemStatus::Failed {
            reason: format!("{} ({})", reason, self._id.as_deref().unwrap_or("?")),
            retryable: self.status == 429 || self.status >= 500,
        }
    }
}

/// Bulk writer for an Elasticsearch index.
pub struct ElasticsearchWriter {
    client: Client,
    config: ElasticsearchConfig,
}

impl ElasticsearchWriter {
    /// Build a writer with a pooled HTTP client.
    pub fn new(config: ElasticsearchConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.url.trim_end_matches('/'), path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.username {
            Some(user) => req.basic_auth(user, self.config.password.as_deref()),
            None => req,
        }
    }

    fn bulk_body(&self, docs: &[DestinationDoc]) -> Result<String> {
        let mut body = String::new();
        for doc in docs {
            let action = json!({ "index": { "_index": self.config.index, "_id": doc.id } });
            body.push_str(&action.to_string());
            body.push('\n');
            body.push_str(&doc.to_json()?);
            body.push('\n');
        }
        Ok(body)
    }
}

#[async_trait]
impl BulkWriter for ElasticsearchWriter {
    async fn write_batch(&self, docs: &[DestinationDoc]) -> Result<BulkResult> {
        if docs.is_empty() {
            return Ok(BulkResult::default());
        }

        let body = self.bulk_body(docs)?;
        let response = self
            .authorize(self.client.post(self.endpoint("_bulk")))
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(MigrateError::DestinationWrite(format!(
                "bulk request returned {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        let parsed: BulkResponse = response.json().await?;
        if parsed.items.len() != docs.len() {
            return Err(MigrateError::DestinationWrite(format!(
                "bulk response has {} items for {} documents",
                parsed.items.len(),
                docs.len()
            )));
        }

        let items: Vec<ItemStatus> = parsed
            .items
            .into_iter()
            .map(|mut entry| match entry.remove("index") {
                Some(item) => item.into_status(),
                None => ItemStatus::Failed {
                    reason: "bulk response item has no index action".into(),
                    retryable: false,
                },
            })
            .collect();

        let result = BulkResult::from_items(items);
        if result.any_errors {
            warn!("{}: {}", self.config.index, result.failure_summary());
        } else if parsed.errors {
            debug!("bulk response flagged errors but every item succeeded");
        }
        Ok(result)
    }

    async fn health_check(&self) -> Result<()> {
        let response = self
            .authorize(self.client.get(self.endpoint("")))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(MigrateError::DestinationWrite(format!(
                "health check returned {}",
                response.status()
            )))
        }
    }

    fn destination_type(&self) -> &'static str {
        "elasticsearch"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value};
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: &str) -> ElasticsearchConfig {
        ElasticsearchConfig {
            url: url.to_string(),
            index: "things".into(),
            username: None,
            password: Some("secret".into()),
            request_timeout_secs: 5,
        }
    }

    fn doc(id: &str) -> DestinationDoc {
        let mut body = Map::new();
        body.insert("key".into(), Value::from(id));
        DestinationDoc {
            id: id.into(),
            body,
        }
    }

    #[tokio::test]
    async fn test_bulk_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .and(header("content-type", "application/x-ndjson"))
            .and(body_string_contains(r#""_id":"a""#))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": false,
                "items": [
                    { "index": { "_id": "a", "status": 201 } },
                    { "index": { "_id": "b", "status": 200 } }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let writer = ElasticsearchWriter::new(config(&server.uri())).unwrap();
        let result = writer.write_batch(&[doc("a"), doc("b")]).await.unwrap();
        assert!(!result.any_errors);
        assert_eq!(result.items.len(), 2);
    }

    #[tokio::test]
    async fn test_item_statuses_are_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": true,
                "items": [
                    { "index": { "_id": "a", "status": 429,
                        "error": { "type": "es_rejected_execution_exception", "reason": "queue full" } } },
                    { "index": { "_id": "b", "status": 400,
                        "error": { "type": "mapper_parsing_exception" } } }
                ]
            })))
            .mount(&server)
            .await;

        let writer = ElasticsearchWriter::new(config(&server.uri())).unwrap();
        let result = writer.write_batch(&[doc("a"), doc("b")]).await.unwrap();
        assert!(result.any_errors);
        assert!(matches!(
            &result.items[0],
            ItemStatus::Failed { retryable: true, .. }
        ));
        assert!(matches!(
            &result.items[1],
            ItemStatus::Failed { retryable: false, .. }
        ));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let writer = ElasticsearchWriter::new(config(&server.uri())).unwrap();
        let err = writer.write_batch(&[doc("a")]).await.unwrap_err();
        assert!(matches!(err, MigrateError::DestinationWrite(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_health_check() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "cluster_name": "es" })))
            .mount(&server)
            .await;

        let writer = ElasticsearchWriter::new(config(&server.uri())).unwrap();
        writer.health_check().await.unwrap();
    }

    #[test]
    fn test_password_is_redacted() {
        let rendered = format!("{:?}", config("http://localhost:9200"));
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
