//! JSON-RPC 2.0 multiplexer over a single long-lived WebSocket connection to
//! the TrueNAS appliance middleware.
//!
//! One background task owns the socket end to end: it authenticates, then
//! alternates between reading frames off the wire and writing frames handed
//! to it by [`Multiplexer::call`]. Callers never see the socket directly;
//! they correlate request/response by id through a pending-call table shared
//! with the reader half.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, instrument, warn};

use crate::config::ApplianceConfig;
use crate::error::ApplianceError;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Backoff schedule between reconnect attempts, per connection lifecycle.
/// Each step gets 0-500ms of jitter added so a fleet of controllers that lost
/// the appliance at the same moment doesn't hammer it in lockstep.
const RECONNECT_BACKOFF_SECS: [u64; 5] = [5, 10, 20, 40, 60];

const METRIC_CONNECTED: &str = "appliance_connected";
const METRIC_RECONNECT_ATTEMPTS_TOTAL: &str = "appliance_reconnect_attempts_total";
const METRIC_PENDING_CALLS: &str = "appliance_pending_calls";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize, Default)]
struct JsonRpcResponse {
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcErrorObj>,
}

#[derive(Deserialize)]
struct JsonRpcErrorObj {
    code: i64,
    message: String,
}

type PendingTable = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, ApplianceError>>>>>;

struct OutboundFrame {
    text: String,
}

/// A single entry point for issuing calls against the appliance, safe to
/// clone and invoke concurrently from many callers.
pub struct Multiplexer {
    next_id: AtomicU64,
    pending: PendingTable,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    state: watch::Receiver<ConnectionState>,
}

impl Multiplexer {
    /// Spawns the background connection task and returns immediately; the
    /// task manages its own connect/authenticate/reconnect lifecycle.
    pub fn connect(config: ApplianceConfig) -> Arc<Multiplexer> {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let mux = Arc::new(Multiplexer {
            next_id: AtomicU64::new(1),
            pending: pending.clone(),
            outbound: outbound_tx,
            state: state_rx,
        });

        tokio::spawn(run(config, pending, outbound_rx, state_tx));
        mux
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Hands out a cloned receiver so callers (e.g. the binary's metrics
    /// task) can react to connection-state transitions without polling.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    fn insert_pending(&self, id: u64, tx: oneshot::Sender<Result<Value, ApplianceError>>) {
        let mut table = self.pending.lock().unwrap();
        table.insert(id, tx);
        gauge!(METRIC_PENDING_CALLS).set(table.len() as f64);
    }

    fn remove_pending(&self, id: u64) {
        let mut table = self.pending.lock().unwrap();
        table.remove(&id);
        gauge!(METRIC_PENDING_CALLS).set(table.len() as f64);
    }

    /// Issues one RPC call and waits for its matching response, or for
    /// `deadline` to elapse, whichever comes first.
    #[instrument(skip(self, params), fields(method = %method))]
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        deadline: Option<Duration>,
    ) -> Result<Value, ApplianceError> {
        if self.is_closed() {
            return Err(ApplianceError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.insert_pending(id, tx);

        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let text = serde_json::to_string(&request).map_err(|e| {
            self.remove_pending(id);
            ApplianceError::Decode(e.to_string())
        })?;

        if self.outbound.send(OutboundFrame { text }).is_err() {
            self.remove_pending(id);
            return Err(ApplianceError::TransportLost);
        }

        let outcome = match deadline {
            Some(d) => match tokio::time::timeout(d, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(ApplianceError::TransportLost),
                Err(_) => {
                    self.remove_pending(id);
                    Err(ApplianceError::Timeout)
                }
            },
            None => rx.await.unwrap_or(Err(ApplianceError::TransportLost)),
        };
        outcome
    }
}

async fn run(
    config: ApplianceConfig,
    pending: PendingTable,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundFrame>,
    state_tx: watch::Sender<ConnectionState>,
) {
    let mut attempt = 0usize;
    loop {
        match connect_and_auth(&config).await {
            Ok(ws) => {
                attempt = 0;
                gauge!(METRIC_CONNECTED).set(1.0);
                let _ = state_tx.send(ConnectionState::Connected);
                info!(url = %config.url, "connected to appliance");
                let reason = drive_session(ws, &config, &pending, &mut outbound_rx).await;
                warn!(?reason, "appliance connection lost, will reconnect");
                gauge!(METRIC_CONNECTED).set(0.0);
                drain_pending(&pending, ApplianceError::TransportLost);
            }
            Err(ApplianceError::AuthenticationFailed(reason)) => {
                warn!(%reason, "appliance rejected credentials, not retrying");
                let _ = state_tx.send(ConnectionState::Closed);
                drain_pending(&pending, ApplianceError::AuthenticationFailed(reason));
                return;
            }
            Err(err) => {
                warn!(error = %err, attempt, "failed to connect to appliance");
            }
        }

        let _ = state_tx.send(ConnectionState::Reconnecting);
        counter!(METRIC_RECONNECT_ATTEMPTS_TOTAL).increment(1);

        if attempt >= RECONNECT_BACKOFF_SECS.len() {
            let _ = state_tx.send(ConnectionState::Closed);
            gauge!(METRIC_CONNECTED).set(0.0);
            drain_pending(&pending, ApplianceError::Closed);
            return;
        }

        // outbound_rx.recv() returning None means every Multiplexer handle
        // was dropped; no point reconnecting with nobody left to call us.
        if outbound_rx.is_closed() {
            let _ = state_tx.send(ConnectionState::Closed);
            drain_pending(&pending, ApplianceError::Closed);
            return;
        }

        let jitter_ms = rand::thread_rng().gen_range(0..500);
        tokio::time::sleep(Duration::from_secs(RECONNECT_BACKOFF_SECS[attempt]) + Duration::from_millis(jitter_ms))
            .await;
        attempt += 1;
    }
}

fn drain_pending(pending: &PendingTable, err: ApplianceError) {
    let mut table = pending.lock().unwrap();
    for (_, tx) in table.drain() {
        let _ = tx.send(Err(err.clone()));
    }
    gauge!(METRIC_PENDING_CALLS).set(table.len() as f64);
}

async fn connect_and_auth(config: &ApplianceConfig) -> Result<WsStream, ApplianceError> {
    let connector = if config.insecure_skip_verify {
        Some(Connector::Rustls(Arc::new(insecure_tls_config())))
    } else {
        None
    };

    let (mut ws, _resp) = tokio_tungstenite::connect_async_tls_with_config(
        &config.url,
        None,
        false,
        connector,
    )
    .await
    .map_err(|e| ApplianceError::Decode(format!("websocket connect failed: {e}")))?;

    let auth_request = JsonRpcRequest {
        jsonrpc: "2.0",
        id: 0,
        method: &config.method_names.auth_login_with_api_key,
        params: Value::Array(vec![Value::String(config.api_key.expose().to_string())]),
    };
    let text = serde_json::to_string(&auth_request)
        .map_err(|e| ApplianceError::Decode(e.to_string()))?;
    ws.send(Message::Text(text))
        .await
        .map_err(|e| ApplianceError::AuthenticationFailed(e.to_string()))?;

    let auth_timeout = Duration::from_secs(30);
    let response = tokio::time::timeout(auth_timeout, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(&text) {
                        if resp.id == Some(0) {
                            return Ok(resp);
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(ApplianceError::AuthenticationFailed(
                        "connection closed during login".into(),
                    ));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ApplianceError::AuthenticationFailed(e.to_string())),
            }
        }
    })
    .await
    .map_err(|_| ApplianceError::AuthenticationFailed("timed out waiting for login response".into()))??;

    match response.error {
        Some(e) => Err(ApplianceError::AuthenticationFailed(e.message)),
        None => match response.result {
            Some(Value::Bool(true)) | Some(_) => Ok(ws),
            None => Err(ApplianceError::AuthenticationFailed(
                "login returned no result".into(),
            )),
        },
    }
}

/// Runs the read/write loop for one established, authenticated connection
/// until it drops, returning the reason so the caller can log it before
/// deciding whether to reconnect.
async fn drive_session(
    ws: WsStream,
    config: &ApplianceConfig,
    pending: &PendingTable,
    outbound_rx: &mut mpsc::UnboundedReceiver<OutboundFrame>,
) -> ApplianceError {
    let (mut sink, mut stream) = ws.split();
    let read_deadline = config.read_timeout.max(config.ping_interval * 4);
    let mut ping_interval = tokio::time::interval(config.ping_interval);
    ping_interval.tick().await; // first tick fires immediately, discard it

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => {
                        let write = tokio::time::timeout(
                            config.write_timeout,
                            sink.send(Message::Text(frame.text)),
                        )
                        .await;
                        match write {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => return ApplianceError::Decode(e.to_string()),
                            Err(_) => return ApplianceError::Timeout,
                        }
                    }
                    None => return ApplianceError::Closed,
                }
            }
            msg = tokio::time::timeout(read_deadline, stream.next()) => {
                match msg {
                    Ok(Some(Ok(Message::Text(text)))) => handle_incoming(&text, pending),
                    Ok(Some(Ok(Message::Ping(payload)))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            return ApplianceError::TransportLost;
                        }
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return ApplianceError::TransportLost,
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => return ApplianceError::Decode(e.to_string()),
                    Err(_) => return ApplianceError::Timeout,
                }
            }
            _ = ping_interval.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    return ApplianceError::TransportLost;
                }
            }
        }
    }
}

fn handle_incoming(text: &str, pending: &PendingTable) {
    let response: JsonRpcResponse = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            debug!(error = %e, "ignoring unparseable appliance frame");
            return;
        }
    };
    let Some(id) = response.id else {
        // Notification, not a call response; nothing currently subscribes.
        return;
    };
    let tx = {
        let mut table = pending.lock().unwrap();
        let tx = table.remove(&id);
        gauge!(METRIC_PENDING_CALLS).set(table.len() as f64);
        tx
    };
    let Some(tx) = tx else {
        return;
    };
    let outcome = match response.error {
        Some(e) => Err(ApplianceError::from_rpc(e.code, e.message)),
        None => Ok(response.result.unwrap_or(Value::Null)),
    };
    let _ = tx.send(outcome);
}

fn insecure_tls_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerify))
        .with_no_client_auth()
}

/// Accepts any server certificate. Only reachable via the explicit
/// `insecure_skip_verify` configuration flag.
#[derive(Debug)]
struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_matches_spec() {
        assert_eq!(RECONNECT_BACKOFF_SECS, [5, 10, 20, 40, 60]);
    }

    #[tokio::test]
    async fn call_against_closed_multiplexer_fails_fast() {
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Closed);
        let mux = Multiplexer {
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            outbound: outbound_tx,
            state: state_rx,
        };

        let err = mux.call("core.ping", Value::Null, None).await.unwrap_err();
        assert!(matches!(err, ApplianceError::Closed));
    }

    #[tokio::test]
    async fn call_times_out_when_nothing_answers() {
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let mux = Multiplexer {
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            outbound: outbound_tx,
            state: state_rx,
        };

        let err = mux
            .call("core.ping", Value::Null, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplianceError::Timeout));
        assert!(mux.pending.lock().unwrap().is_empty());
    }
}
