// Copyright (C) 2024, 2025 NimPool Developers (see AUTHORS)
//
// This file is part of NimPool
//
// NimPool is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// NimPool is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// NimPool. If not, see <https://www.gnu.org/licenses/>.


//! JSON-RPC client for the blockchain node.
//!
//! [`NodeRpcClient`] speaks JSON-RPC 2.0 over HTTP with basic auth. The
//! [`port::NodeChain`] wrapper implements the pool's `BlockchainPort` on top
//! of it and [`poller`] turns head polling into ordered chain events.

use base64::{Engine, engine::general_purpose::STANDARD};
use nimpool_lib::chain::ChainError;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error};

pub mod poller;
pub mod port;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use poller::start_head_poller;
pub use port::NodeChain;

const JSONRPC_VERSION: &str = "2.0";

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Vec<serde_json::Value>,
}

/// JSON-RPC 2.0 response. Exactly one of `result` and `error` is set, a
/// missing `result` reads as null.
#[derive(Deserialize, Debug)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize, Debug)]
struct JsonRpcError {
    code: i32,
    message: String,
}

/// Error type for the NodeRpcClient
#[derive(Debug)]
pub enum RpcError {
    HttpError { status_code: u16, message: String },
    ParseError { message: String },
    RpcError { code: i32, message: String },
    Other(String),
}

impl Error for RpcError {}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::HttpError {
                status_code,
                message,
            } => {
                write!(f, "HTTP error {status_code}: {message}")
            }
            RpcError::ParseError { message } => {
                write!(f, "Parse error: {message}")
            }
            RpcError::RpcError { code, message } => {
                write!(f, "RPC error {code}: {message}")
            }
            RpcError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl From<RpcError> for ChainError {
    fn from(e: RpcError) -> Self {
        ChainError::Rpc(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct NodeRpcClient {
    client: reqwest::Client,
    url: String,
    request_id: Arc<AtomicU64>,
}

impl NodeRpcClient {
    pub fn new(url: &str, username: &str, password: &str) -> Result<Self, RpcError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::AUTHORIZATION,
            format!(
                "Basic {}",
                STANDARD.encode(format!("{username}:{password}"))
            )
            .parse()
            .map_err(|e| RpcError::Other(format!("Invalid header: {e}")))?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| RpcError::Other(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: url.to_string(),
            request_id: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Call `method` and return its result, `None` when the node answers
    /// with a null result.
    pub async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<Option<T>, RpcError> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        };

        let response = match self.client.post(&self.url).json(&request).send().await {
            Ok(resp) => resp,
            Err(e) => {
                error!("HTTP request to node failed: {e}");
                return Err(RpcError::Other(format!("HTTP request failed: {e}")));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            error!("Error reaching node with status={status_code}. Message={error_body:?}");
            return Err(RpcError::HttpError {
                status_code,
                message: error_body,
            });
        }

        let rpc_response: JsonRpcResponse<T> =
            response.json().await.map_err(|e| RpcError::ParseError {
                message: format!("Failed to parse response: {e}"),
            })?;

        if let Some(error) = rpc_response.error {
            debug!("Node rejected {method}: {}", error.message);
            return Err(RpcError::RpcError {
                code: error.code,
                message: error.message,
            });
        }
        Ok(rpc_response.result)
    }

    /// Like [`NodeRpcClient::request`] but a null result is an error.
    pub async fn request_value<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<T, RpcError> {
        self.request(method, params)
            .await?
            .ok_or_else(|| RpcError::ParseError {
                message: format!("Null result for {method}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, header, method, path},
    };

    #[tokio::test]
    async fn test_request_sends_basic_auth_and_jsonrpc_envelope() {
        let mock_server = MockServer::start().await;

        let auth_header = format!(
            "Basic {}",
            STANDARD.encode(format!("{}:{}", "testuser", "testpass"))
        );

        Mock::given(method("POST"))
            .and(path("/"))
            .and(header("Authorization", auth_header))
            .and(body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": 0,
                "method": "getNetworkTime",
                "params": [],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "result": 1_700_000_000_000u64,
                "id": 0
            })))
            .mount(&mock_server)
            .await;

        let client = NodeRpcClient::new(&mock_server.uri(), "testuser", "testpass").unwrap();
        let time: u64 = client.request_value("getNetworkTime", vec![]).await.unwrap();
        assert_eq!(time, 1_700_000_000_000);
    }

    #[tokio::test]
    async fn test_null_result_is_none() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "result": null,
                "id": 0
            })))
            .mount(&mock_server)
            .await;

        let client = NodeRpcClient::new(&mock_server.uri(), "testuser", "testpass").unwrap();
        let result: Option<String> = client.request("getBlockByHash", vec![]).await.unwrap();
        assert!(result.is_none());
        let required: Result<String, RpcError> = client.request_value("getBlockByHash", vec![]).await;
        assert!(matches!(required, Err(RpcError::ParseError { .. })));
    }

    #[tokio::test]
    async fn test_rpc_error_is_reported() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "error": { "code": -32601, "message": "Method not found" },
                "id": 0
            })))
            .mount(&mock_server)
            .await;

        let client = NodeRpcClient::new(&mock_server.uri(), "testuser", "testpass").unwrap();
        let result: Result<Option<u64>, RpcError> = client.request("nope", vec![]).await;
        match result {
            Err(RpcError::RpcError { code, message }) => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("Expected RpcError::RpcError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_with_4xx_http_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Unauthorized"))
            .mount(&mock_server)
            .await;

        let client = NodeRpcClient::new(&mock_server.uri(), "nimiq", "wrong").unwrap();
        let result: Result<Option<u64>, RpcError> = client.request("getBalance", vec![]).await;

        if let Err(RpcError::HttpError {
            status_code,
            message,
        }) = result
        {
            assert_eq!(status_code, 401);
            assert_eq!(message, "Unauthorized");
        } else {
            panic!("Expected RpcError::HttpError, got {result:?}");
        }
    }
}
