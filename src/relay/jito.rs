//! Jito block-engine JSON-RPC client
//!
//! Submission uses `sendBundle` with base64-encoded transactions. Confirmation
//! polls `getInflightBundleStatuses` until the bundle leaves `Pending`, then
//! reads the landed transaction signature from `getBundleStatuses`.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Deserialize;
use serde_json::{json, Value};
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::BundleRelay;
use crate::config::RelayConfig;
use crate::errors::RelayError;
use crate::types::{BundleDescriptor, BundleHandle, ConfirmationStatus};

const BUNDLES_PATH: &str = "/api/v1/bundles";

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ContextValue<T> {
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct InflightStatus {
    bundle_id: String,
    status: String,
    #[serde(default)]
    landed_slot: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BundleStatus {
    bundle_id: String,
    #[serde(default)]
    transactions: Vec<String>,
}

/// Inflight verdict as reported by the block engine
#[derive(Debug, Clone, PartialEq, Eq)]
enum Inflight {
    Pending,
    Landed(Option<u64>),
    Failed,
    Invalid,
}

pub struct JitoRelayClient {
    http: reqwest::Client,
    endpoint: String,
    limiter: DefaultDirectRateLimiter,
    poll_interval: Duration,
}

impl JitoRelayClient {
    pub fn new(config: &RelayConfig) -> Result<Self, RelayError> {
        let endpoint = format!("{}{}", config.url.trim_end_matches('/'), BUNDLES_PATH);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.http_timeout_ms))
            .pool_max_idle_per_host(8)
            .build()
            .map_err(|e| RelayError::Unavailable {
                endpoint: endpoint.clone(),
                message: e.to_string(),
            })?;

        let rps = NonZeroU32::new(config.rate_limit_rps).ok_or_else(|| RelayError::Unavailable {
            endpoint: endpoint.clone(),
            message: "rate limit must be > 0".to_string(),
        })?;

        info!(endpoint = %endpoint, rate_limit_rps = config.rate_limit_rps, "Jito relay client ready");

        Ok(Self {
            http,
            endpoint,
            limiter: RateLimiter::direct(Quota::per_second(rps)),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        })
    }

    fn unavailable(&self, message: impl Into<String>) -> RelayError {
        RelayError::Unavailable {
            endpoint: self.endpoint.clone(),
            message: message.into(),
        }
    }

    /// One JSON-RPC round trip; transport and HTTP failures are `Unavailable`
    async fn call(&self, method: &str, params: Value) -> Result<Value, RelayError> {
        self.limiter.until_ready().await;

        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(self.unavailable(format!("HTTP {status}")));
        }

        let parsed: RpcResponse = response
            .json()
            .await
            .map_err(|e| self.unavailable(format!("malformed response: {e}")))?;

        if let Some(err) = parsed.error {
            return Err(RelayError::Rejected(format!("{} ({})", err.message, err.code)));
        }
        parsed
            .result
            .ok_or_else(|| RelayError::Rejected(format!("{method}: empty result")))
    }

    async fn inflight_status(&self, bundle_id: &str) -> Result<Inflight, RelayError> {
        let result = self
            .call("getInflightBundleStatuses", json!([[bundle_id]]))
            .await?;
        let statuses: ContextValue<InflightStatus> = serde_json::from_value(result)
            .map_err(|e| self.unavailable(format!("malformed inflight status: {e}")))?;

        let Some(entry) = statuses.value.into_iter().find(|s| s.bundle_id == bundle_id) else {
            return Ok(Inflight::Pending);
        };
        Ok(match entry.status.as_str() {
            "Landed" => Inflight::Landed(entry.landed_slot),
            "Failed" => Inflight::Failed,
            "Invalid" => Inflight::Invalid,
            _ => Inflight::Pending,
        })
    }

    /// Signature of the first landed transaction in the bundle
    async fn landed_signature(&self, bundle_id: &str) -> Result<Option<String>, RelayError> {
        let result = self.call("getBundleStatuses", json!([[bundle_id]])).await?;
        let statuses: ContextValue<Option<BundleStatus>> = serde_json::from_value(result)
            .map_err(|e| self.unavailable(format!("malformed bundle status: {e}")))?;

        Ok(statuses
            .value
            .into_iter()
            .flatten()
            .find(|s| s.bundle_id == bundle_id)
            .and_then(|s| s.transactions.into_iter().next()))
    }
}

#[async_trait]
impl BundleRelay for JitoRelayClient {
    async fn submit_bundle(&self, bundle: &BundleDescriptor) -> Result<BundleHandle, RelayError> {
        let encoded = BASE64.encode(&bundle.payload_bytes);
        let result = self
            .call("sendBundle", json!([[encoded], { "encoding": "base64" }]))
            .await?;

        let bundle_id = result
            .as_str()
            .ok_or_else(|| RelayError::Rejected("sendBundle: result is not a bundle id".to_string()))?
            .to_string();

        debug!(
            bundle_id = %bundle_id,
            fee_bid = bundle.fee_bid,
            min_slot = bundle.validity_slot_range.min_slot,
            max_slot = bundle.validity_slot_range.max_slot,
            "Bundle accepted by block engine"
        );
        Ok(BundleHandle(bundle_id))
    }

    async fn await_confirmation(
        &self,
        handle: &BundleHandle,
        timeout: Duration,
    ) -> ConfirmationStatus {
        let deadline = Instant::now() + timeout;

        loop {
            let polled = tokio::time::timeout_at(deadline, self.inflight_status(&handle.0)).await;
            match polled {
                Err(_) => return ConfirmationStatus::TimedOut,
                Ok(Ok(Inflight::Landed(slot))) => {
                    let signature =
                        match tokio::time::timeout_at(deadline, self.landed_signature(&handle.0)).await {
                            Ok(Ok(Some(sig))) => sig,
                            Ok(Ok(None)) | Err(_) => handle.0.clone(),
                            Ok(Err(e)) => {
                                warn!(bundle_id = %handle, error = %e, "Landed but signature lookup failed");
                                handle.0.clone()
                            }
                        };
                    debug!(bundle_id = %handle, ?slot, "Bundle landed");
                    return ConfirmationStatus::Confirmed(signature);
                }
                Ok(Ok(Inflight::Failed)) => {
                    return ConfirmationStatus::Rejected("bundle failed in auction".to_string())
                }
                Ok(Ok(Inflight::Invalid)) => return ConfirmationStatus::Expired,
                Ok(Ok(Inflight::Pending)) => {}
                Ok(Err(e)) => {
                    debug!(bundle_id = %handle, error = %e, "Status poll failed, will retry");
                }
            }

            let next = Instant::now() + self.poll_interval;
            if next >= deadline {
                tokio::time::sleep_until(deadline).await;
                return ConfirmationStatus::TimedOut;
            }
            tokio::time::sleep_until(next).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SlotRange;
    use mockito::Matcher;

    fn client(url: &str) -> JitoRelayClient {
        JitoRelayClient::new(&RelayConfig {
            url: url.to_string(),
            rate_limit_rps: 1_000,
            poll_interval_ms: 10,
            http_timeout_ms: 1_000,
        })
        .unwrap()
    }

    fn bundle() -> BundleDescriptor {
        BundleDescriptor {
            payload_bytes: vec![1, 2, 3],
            fee_bid: 5_000,
            validity_slot_range: SlotRange::new(100, 150),
        }
    }

    #[tokio::test]
    async fn test_send_bundle_returns_handle() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", BUNDLES_PATH)
            .match_body(Matcher::AllOf(vec![
                Matcher::PartialJson(json!({"method": "sendBundle"})),
                Matcher::Regex(r#""AQID""#.to_string()),
            ]))
            .with_body(r#"{"jsonrpc":"2.0","result":"b-123","id":1}"#)
            .create_async()
            .await;

        let handle = client(&server.url()).submit_bundle(&bundle()).await.unwrap();
        assert_eq!(handle, BundleHandle("b-123".to_string()));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rpc_error_is_rejection() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", BUNDLES_PATH)
            .with_body(r#"{"jsonrpc":"2.0","error":{"code":-32602,"message":"bundle contains an already processed transaction"},"id":1}"#)
            .create_async()
            .await;

        let err = client(&server.url()).submit_bundle(&bundle()).await.unwrap_err();
        assert!(matches!(err, RelayError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_server_error_is_unavailable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", BUNDLES_PATH)
            .with_status(503)
            .create_async()
            .await;

        let err = client(&server.url()).submit_bundle(&bundle()).await.unwrap_err();
        assert!(matches!(err, RelayError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_is_unavailable() {
        let err = client("http://127.0.0.1:9")
            .submit_bundle(&bundle())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_landed_bundle_confirms_with_signature() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", BUNDLES_PATH)
            .match_body(Matcher::PartialJson(json!({"method": "getInflightBundleStatuses"})))
            .with_body(
                r#"{"jsonrpc":"2.0","result":{"context":{"slot":1},"value":[{"bundle_id":"b-1","status":"Landed","landed_slot":120}]},"id":1}"#,
            )
            .create_async()
            .await;
        server
            .mock("POST", BUNDLES_PATH)
            .match_body(Matcher::PartialJson(json!({"method": "getBundleStatuses"})))
            .with_body(
                r#"{"jsonrpc":"2.0","result":{"context":{"slot":1},"value":[{"bundle_id":"b-1","transactions":["5sig"],"slot":120,"confirmation_status":"confirmed","err":{"Ok":null}}]},"id":1}"#,
            )
            .create_async()
            .await;

        let status = client(&server.url())
            .await_confirmation(&BundleHandle("b-1".to_string()), Duration::from_secs(2))
            .await;
        assert_eq!(status, ConfirmationStatus::Confirmed("5sig".to_string()));
    }

    #[tokio::test]
    async fn test_failed_and_invalid_statuses() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", BUNDLES_PATH)
            .match_body(Matcher::Regex(r#""failed""#.to_string()))
            .with_body(r#"{"jsonrpc":"2.0","result":{"context":{"slot":1},"value":[{"bundle_id":"failed","status":"Failed","landed_slot":null}]},"id":1}"#)
            .create_async()
            .await;
        server
            .mock("POST", BUNDLES_PATH)
            .match_body(Matcher::Regex(r#""gone""#.to_string()))
            .with_body(r#"{"jsonrpc":"2.0","result":{"context":{"slot":1},"value":[{"bundle_id":"gone","status":"Invalid","landed_slot":null}]},"id":1}"#)
            .create_async()
            .await;

        let relay = client(&server.url());
        assert!(matches!(
            relay
                .await_confirmation(&BundleHandle("failed".into()), Duration::from_secs(2))
                .await,
            ConfirmationStatus::Rejected(_)
        ));
        assert_eq!(
            relay
                .await_confirmation(&BundleHandle("gone".into()), Duration::from_secs(2))
                .await,
            ConfirmationStatus::Expired
        );
    }

    #[tokio::test]
    async fn test_pending_until_timeout() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", BUNDLES_PATH)
            .with_body(r#"{"jsonrpc":"2.0","result":{"context":{"slot":1},"value":[{"bundle_id":"p","status":"Pending","landed_slot":null}]},"id":1}"#)
            .expect_at_least(2)
            .create_async()
            .await;

        let started = std::time::Instant::now();
        let status = client(&server.url())
            .await_confirmation(&BundleHandle("p".into()), Duration::from_millis(150))
            .await;
        assert_eq!(status, ConfirmationStatus::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(150));
    }
}
