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


use base64::Engine;
use nimpool_lib::config::NodeConfig;
use wiremock::MockServer;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, ResponseTemplate};

/// Mock node and a config pointing at it.
pub async fn setup_mock_node_rpc() -> (MockServer, NodeConfig) {
    let mock_server = MockServer::start().await;

    let config = NodeConfig {
        url: mock_server.uri(),
        username: "testuser".to_string(),
        password: "testpass".to_string(),
        poll_interval_ms: 10,
    };

    (mock_server, config)
}

fn auth_header() -> String {
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", "testuser", "testpass"))
    )
}

/// Answer `api_method` called with exactly `params` with `result`. Request
/// ids are not matched.
pub async fn mock_method(
    mock_server: &MockServer,
    api_method: &str,
    params: serde_json::Value,
    result: serde_json::Value,
) {
    Mock::given(method("POST"))
        .and(path("/"))
        .and(header("Authorization", auth_header()))
        .and(MethodMatcher {
            method: api_method.to_string(),
            params,
        })
        .respond_with(ResponseTemplate::new(200).set_body_json(
            serde_json::json!({ "jsonrpc": "2.0", "result": result, "id": 0 }),
        ))
        .mount(mock_server)
        .await;
}

/// Answer `api_method` with a null result.
pub async fn mock_method_null(mock_server: &MockServer, api_method: &str, params: serde_json::Value) {
    mock_method(mock_server, api_method, params, serde_json::Value::Null).await;
}

/// Matches the method and params of a JSON-RPC body, ignoring the id.
pub struct MethodMatcher {
    method: String,
    params: serde_json::Value,
}

impl wiremock::Match for MethodMatcher {
    fn matches(&self, request: &wiremock::Request) -> bool {
        let Ok(body) = serde_json::from_slice::<serde_json::Value>(&request.body) else {
            return false;
        };
        body.get("method").and_then(|m| m.as_str()) == Some(self.method.as_str())
            && body.get("params") == Some(&self.params)
    }
}
