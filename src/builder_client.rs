//! RPC transport back to builders and the sentry.

use crate::BoxError;
use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use jsonrpsee::{
    core::client::ClientT,
    http_client::{HttpClient, HttpClientBuilder},
    rpc_params,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Connection establishment budget.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(1);
/// TCP keepalive interval for builder connections.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);
/// Idle connections are dropped after this long.
pub const IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(90);
/// Connection cap per builder endpoint.
pub const MAX_CONNS_PER_HOST: usize = 50;
/// End-to-end budget for a single request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Issue reported back to a builder after its bid failed simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidIssue {
    pub validator: Address,
    pub builder: Address,
    pub bid_hash: B256,
    pub message: String,
}

/// Client half of the builder transport. Implemented over HTTP for real
/// builders and the sentry; tests substitute a recorder.
#[async_trait]
pub trait BuilderClient: Send + Sync {
    async fn report_issue(&self, issue: &BidIssue) -> Result<(), BoxError>;
}

/// jsonrpsee-backed client speaking the `mev` namespace of a builder or
/// sentry endpoint.
pub struct HttpBuilderClient {
    client: HttpClient,
    url: String,
}

impl HttpBuilderClient {
    /// Dial `url` with the shared transport limits. The underlying client
    /// keeps its connection pool for the lifetime of the registry entry.
    pub fn dial(url: &str) -> Result<Self, BoxError> {
        let client = HttpClientBuilder::default()
            .request_timeout(REQUEST_TIMEOUT)
            .build(url)?;
        Ok(Self { client, url: url.to_string() })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl BuilderClient for HttpBuilderClient {
    async fn report_issue(&self, issue: &BidIssue) -> Result<(), BoxError> {
        debug!(url = %self.url, builder = %issue.builder, bid_hash = %issue.bid_hash,
            "reporting bid issue");
        let _: serde_json::Value =
            self.client.request("mev_reportIssue", rpc_params![issue]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bid_issue_serializes_camel_case() {
        let issue = BidIssue {
            validator: Address::repeat_byte(1),
            builder: Address::repeat_byte(2),
            bid_hash: B256::repeat_byte(3),
            message: "invalid bid size".to_string(),
        };
        let json = serde_json::to_value(&issue).unwrap();
        assert!(json.get("bidHash").is_some());
        assert_eq!(json["message"], "invalid bid size");

        let back: BidIssue = serde_json::from_value(json).unwrap();
        assert_eq!(back, issue);
    }

    #[test]
    fn dial_rejects_invalid_url() {
        assert!(HttpBuilderClient::dial("not a url").is_err());
    }
}
