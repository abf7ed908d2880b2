//! HTTP query gateway.
//!
//! Posts the JSON query document to the service endpoint and decodes the
//! JSON envelope. Failures are returned as-is; nothing here retries.

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::domain::error::{AuditError, Result};
use crate::metrics::METRICS;
use crate::query::{Query, QueryGateway, QueryResponse};

const USER_AGENT: &str = concat!("coverage-audit/", env!("CARGO_PKG_VERSION"));

/// Longest response body excerpt carried in an [`AuditError::Status`].
const BODY_EXCERPT: usize = 512;

/// Build the shared reqwest client.
pub(crate) fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| AuditError::Transport {
            endpoint: "<client>".to_string(),
            detail: e.to_string(),
        })
}

/// POST `body` as JSON and return the raw response bytes of a 2xx reply.
pub(crate) async fn post_json<B: Serialize + ?Sized>(
    client: &reqwest::Client,
    endpoint: &str,
    body: &B,
) -> Result<Vec<u8>> {
    let response = client
        .post(endpoint)
        .json(body)
        .send()
        .await
        .map_err(|e| AuditError::transport(endpoint, e))?;

    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| AuditError::transport(endpoint, e))?;

    if !status.is_success() {
        let text = String::from_utf8_lossy(&bytes);
        return Err(AuditError::Status {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            body: text.chars().take(BODY_EXCERPT).collect(),
        });
    }
    Ok(bytes.to_vec())
}

/// Query gateway backed by the service's HTTP endpoint.
pub struct HttpQueryGateway {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpQueryGateway {
    pub fn new(endpoint: &str) -> Result<Self> {
        Ok(HttpQueryGateway {
            endpoint: endpoint.to_string(),
            client: build_client()?,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl QueryGateway for HttpQueryGateway {
    async fn execute(&self, query: &Query) -> Result<QueryResponse> {
        debug!(endpoint = %self.endpoint, from = ?query.from, "executing query");
        METRICS.inc_queries();

        let bytes = post_json(&self.client, &self.endpoint, query).await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            AuditError::Decode(format!("query response from {}: {}", self.endpoint, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Dataset;

    #[test]
    fn test_gateway_keeps_endpoint() {
        let gateway = HttpQueryGateway::new("http://127.0.0.1:9/query").unwrap();
        assert_eq!(gateway.endpoint(), "http://127.0.0.1:9/query");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        // port 9 (discard) is not expected to accept HTTP
        let gateway = HttpQueryGateway::new("http://127.0.0.1:9/query").unwrap();
        let err = gateway
            .execute(&Query::new(Dataset::Task).limit(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::Transport { .. }));
    }
}
