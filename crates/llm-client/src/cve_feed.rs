//! CVE feed client polled by the synthesis pipeline's `fetch_cves` stage
//! (spec.md §4.5 stage 1), grounded on the Anthropic provider's reqwest
//! usage pattern and on the CVE record validation shape of a phantom-cve
//! handler.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use scan_core::{CoreError, CoreResult, CveRecord};
use serde::Deserialize;
use tracing::warn;

/// Polls an external CVE feed for records published since a given cursor.
#[async_trait]
pub trait CveFeedClient: Send + Sync {
    /// Returns CVEs published since `since` (exclusive), or the whole feed's
    /// backlog when `since` is `None` (first run).
    async fn fetch_since(&self, since: Option<DateTime<Utc>>) -> CoreResult<Vec<CveRecord>>;
}

#[derive(Debug, Deserialize)]
struct FeedEnvelope {
    items: Vec<FeedRecord>,
}

#[derive(Debug, Deserialize)]
struct FeedRecord {
    cve_id: String,
    published_at: DateTime<Utc>,
    description: String,
    #[serde(default)]
    references: Vec<String>,
}

/// HTTP-backed [`CveFeedClient`].
pub struct HttpCveFeedClient {
    client: Client,
    endpoint: String,
}

impl HttpCveFeedClient {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { client: Client::new(), endpoint: endpoint.into() }
    }
}

#[async_trait]
impl CveFeedClient for HttpCveFeedClient {
    async fn fetch_since(&self, since: Option<DateTime<Utc>>) -> CoreResult<Vec<CveRecord>> {
        let mut request = self.client.get(&self.endpoint);
        if let Some(since) = since {
            request = request.query(&[("since", since.to_rfc3339())]);
        }

        let response = request.send().await.map_err(|e| CoreError::LlmUnavailable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CoreError::LlmUnavailable(format!("CVE feed returned {status}")));
        }

        let envelope: FeedEnvelope = response
            .json()
            .await
            .map_err(|e| CoreError::InvalidOutput(format!("malformed CVE feed response: {e}")))?;

        let mut records = Vec::with_capacity(envelope.items.len());
        for item in envelope.items {
            let record = CveRecord {
                cve_id: item.cve_id,
                published_at: item.published_at,
                description: item.description,
                references: item.references,
            };
            match record.validate() {
                Ok(()) => records.push(record),
                Err(e) => warn!(cve_id = %record.cve_id, error = %e, "dropping invalid CVE record from feed"),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fetches_and_validates_records() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cves"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [
                    {
                        "cve_id": "CVE-2024-0001",
                        "published_at": "2024-01-01T00:00:00Z",
                        "description": "A thing broke",
                        "references": ["https://example.com/advisory"]
                    },
                    {
                        "cve_id": "bogus",
                        "published_at": "2024-01-01T00:00:00Z",
                        "description": "missing CVE- prefix",
                        "references": []
                    }
                ]
            })))
            .mount(&server)
            .await;

        let client = HttpCveFeedClient::new(format!("{}/cves", server.uri()));
        let records = client.fetch_since(None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].cve_id, "CVE-2024-0001");
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/cves")).respond_with(ResponseTemplate::new(503)).mount(&server).await;

        let client = HttpCveFeedClient::new(format!("{}/cves", server.uri()));
        let err = client.fetch_since(None).await.unwrap_err();
        assert!(matches!(err, CoreError::LlmUnavailable(_)));
    }
}
