//! Exercises the multiplexer against a small in-process fake middleware
//! server, since there is no live TrueNAS appliance to test against here.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use truenas_appliance_client::{ApplianceConfig, ConnectionState, Multiplexer};

/// Accepts one connection, authenticates it, then answers every request
/// whose method is `core.ping` with `"pong"` and drops anything else.
async fn spawn_fake_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                while let Some(Ok(Message::Text(text))) = ws.next().await {
                    let req: Value = match serde_json::from_str(&text) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };
                    let id = req.get("id").and_then(Value::as_u64).unwrap_or(0);
                    let method = req.get("method").and_then(Value::as_str).unwrap_or("");
                    let response = match method {
                        "auth.login_with_api_key" => json!({"jsonrpc": "2.0", "id": id, "result": true}),
                        "core.ping" => json!({"jsonrpc": "2.0", "id": id, "result": "pong"}),
                        "core.boom" => json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": {"code": 22, "message": "dataset 'tank/x' does not exist"}
                        }),
                        _ => continue,
                    };
                    if ws
                        .send(Message::Text(response.to_string()))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            });
        }
    });

    format!("ws://{addr}")
}

#[tokio::test]
async fn call_round_trips_through_fake_appliance() {
    let url = spawn_fake_server().await;
    let config = ApplianceConfig::new(url, "test-api-key");
    let mux = Multiplexer::connect(config);

    let result = mux
        .call("core.ping", Value::Null, Some(Duration::from_secs(5)))
        .await
        .expect("call should succeed");
    assert_eq!(result, Value::String("pong".into()));
}

#[tokio::test]
async fn rpc_error_decodes_into_not_found() {
    let url = spawn_fake_server().await;
    let config = ApplianceConfig::new(url, "test-api-key");
    let mux = Multiplexer::connect(config);

    let err = mux
        .call("core.boom", Value::Null, Some(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "expected not-found, got {err:?}");
}

#[tokio::test]
async fn call_without_a_matching_response_times_out() {
    let url = spawn_fake_server().await;
    let config = ApplianceConfig::new(url, "test-api-key");
    let mux = Multiplexer::connect(config);

    // "core.silent" has no handler on the fake server, so no response ever
    // arrives and the deadline must fire.
    let err = mux
        .call("core.silent", Value::Null, Some(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(matches!(err, truenas_appliance_client::ApplianceError::Timeout));
}

#[tokio::test]
async fn multiplexer_reports_connected_after_handshake() {
    let url = spawn_fake_server().await;
    let config = ApplianceConfig::new(url, "test-api-key");
    let mux = Multiplexer::connect(config);

    mux.call("core.ping", Value::Null, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(mux.state(), ConnectionState::Connected);
}
