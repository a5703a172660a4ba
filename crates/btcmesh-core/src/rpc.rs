//! Bitcoin Core RPC adapter.
//!
//! The engine sees a single operation: submit a hex string, get back a txid
//! or a typed error whose detail travels verbatim in the terminal NACK.

use crate::config::RpcConfig;
use crate::error::{Error, Result};
use crate::logging::RedactedHex;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error as ThisError;
use tracing::{debug, info};

/// HTTP timeout for one RPC call; broadcasts can take seconds on a busy node.
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Failure of a broadcast attempt.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The node accepted the call but rejected the transaction
    /// (e.g. `txn-mempool-conflict`, `bad-txns-inputs-missingorspent`).
    #[error("{0}")]
    Rejected(String),

    /// The node could not be reached or answered garbage.
    #[error("{0}")]
    Unreachable(String),
}

impl RpcError {
    /// Concise detail suitable for the NACK `<detail>` field.
    pub fn detail(&self) -> &str {
        match self {
            RpcError::Rejected(d) | RpcError::Unreachable(d) => d,
        }
    }
}

/// Narrow broadcast contract the relay engine depends on.
#[async_trait]
pub trait BroadcastRpc: Send + Sync {
    /// Submit a raw transaction; returns the txid on acceptance.
    async fn broadcast(&self, tx_hex: &str) -> std::result::Result<String, RpcError>;
}

/// JSON-RPC client for a Bitcoin Core endpoint.
pub struct CoreRpcClient {
    http: reqwest::Client,
    url: String,
    user: String,
    password: String,
}

impl CoreRpcClient {
    /// Build a client for the configured endpoint.
    pub fn new(config: &RpcConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .map_err(|e| Error::Rpc(e.to_string()))?;
        Ok(Self {
            http,
            url: config.url(),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    async fn call(&self, method: &str, params: Value) -> std::result::Result<Value, RpcError> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "btcmesh",
            "method": method,
            "params": params,
        });
        let response = self
            .http
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcError::Unreachable(e.to_string()))?;
        let envelope: Value = response
            .json()
            .await
            .map_err(|e| RpcError::Unreachable(e.to_string()))?;

        if let Some(err) = envelope.get("error").filter(|e| !e.is_null()) {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown rpc error");
            return Err(RpcError::Rejected(message.to_string()));
        }
        envelope
            .get("result")
            .cloned()
            .ok_or_else(|| RpcError::Unreachable("rpc response without result".into()))
    }

    /// Probe the endpoint and return the chain name (`main`, `test`, ...).
    pub async fn check_connection(&self) -> Result<String> {
        let info = self
            .call("getblockchaininfo", json!([]))
            .await
            .map_err(|e| Error::Rpc(e.detail().to_string()))?;
        let chain = info
            .get("chain")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        info!(chain = %chain, "connected to Bitcoin Core");
        Ok(chain)
    }
}

#[async_trait]
impl BroadcastRpc for CoreRpcClient {
    async fn broadcast(&self, tx_hex: &str) -> std::result::Result<String, RpcError> {
        debug!(tx = %RedactedHex(tx_hex), "submitting sendrawtransaction");
        // maxfeerate 0 lifts Core's fee-rate ceiling; the spender chose the
        // fee before handing the transaction to the mesh.
        let result = self.call("sendrawtransaction", json!([tx_hex, 0.0])).await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RpcError::Unreachable("sendrawtransaction returned no txid".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_detail_passthrough() {
        let err = RpcError::Rejected("txn-mempool-conflict".into());
        assert_eq!(err.detail(), "txn-mempool-conflict");
        assert_eq!(err.to_string(), "txn-mempool-conflict");

        let err = RpcError::Unreachable("connection refused".into());
        assert_eq!(err.detail(), "connection refused");
    }
}
