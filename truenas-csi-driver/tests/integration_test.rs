//! Exercises the CSI services against a small in-process fake TrueNAS
//! middleware, since there is no live appliance to test against here. Mirrors
//! the harness in `truenas-appliance-client`'s own integration test.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tonic::Request;

use truenas_appliance_client::{ApplianceClient, ApplianceConfig, Multiplexer};
use truenas_csi_driver::csi;
use truenas_csi_driver::csi::controller_server::Controller;
use truenas_csi_driver::csi::identity_server::Identity;
use truenas_csi_driver::{ControllerService, Engine, IdentityService};

#[derive(Default)]
struct FakeApplianceState {
    datasets: HashMap<String, Value>,
    shares: Vec<Value>,
    next_share_id: i64,
}

/// A minimal stand-in for the TrueNAS SCALE middleware: just enough of
/// `pool.dataset.*` and `sharing.nfs.*` to round-trip a file-share volume
/// through [`Engine`] the way a real appliance would.
async fn spawn_fake_appliance() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(Mutex::new(FakeApplianceState { next_share_id: 1, ..Default::default() }));

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let state = state.clone();
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
                    let params = req.get("params").cloned().unwrap_or(Value::Null);
                    let result = handle(&state, method, params);
                    let response = json!({"jsonrpc": "2.0", "id": id, "result": result});
                    if ws.send(Message::Text(response.to_string())).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    format!("ws://{addr}")
}

fn handle(state: &Mutex<FakeApplianceState>, method: &str, params: Value) -> Value {
    let mut state = state.lock().unwrap();
    match method {
        "auth.login_with_api_key" => Value::Bool(true),
        "core.ping" => Value::String("pong".into()),

        "pool.dataset.create" => {
            let payload = params.as_array().and_then(|a| a.first()).cloned().unwrap_or_default();
            let name = payload.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
            let entry = json!({
                "id": name,
                "name": name,
                "type": payload.get("type").cloned().unwrap_or(json!("FILESYSTEM")),
                "used": {"parsed": 0},
                "available": {"parsed": 107_374_182_400u64},
                "user_properties": Value::Object(Default::default()),
            });
            state.datasets.insert(name, entry.clone());
            entry
        }

        "pool.dataset.query" => {
            let filters = params.as_array().and_then(|a| a.first()).cloned().unwrap_or(json!([]));
            let all: Vec<Value> = state.datasets.values().cloned().collect();
            let filtered: Vec<Value> = match filters.as_array() {
                Some(fs) if !fs.is_empty() => all
                    .into_iter()
                    .filter(|d| {
                        fs.iter().all(|f| {
                            let triple = f.as_array().cloned().unwrap_or_default();
                            let field = triple.first().and_then(Value::as_str).unwrap_or("");
                            let expect = triple.get(2).cloned().unwrap_or(Value::Null);
                            d.get(field) == Some(&expect)
                        })
                    })
                    .collect(),
                _ => all,
            };
            Value::Array(filtered)
        }

        "pool.dataset.update" => {
            let arr = params.as_array().cloned().unwrap_or_default();
            let path = arr.first().and_then(Value::as_str).unwrap_or_default().to_string();
            let payload = arr.get(1).cloned().unwrap_or_default();
            if let Some(dataset) = state.datasets.get_mut(&path) {
                if let Some(updates) = payload.get("user_properties_update").and_then(Value::as_array) {
                    let props = dataset
                        .get_mut("user_properties")
                        .and_then(Value::as_object_mut)
                        .expect("dataset always carries a user_properties object");
                    for update in updates {
                        let key = update.get("key").and_then(Value::as_str).unwrap_or_default();
                        if update.get("remove").and_then(Value::as_bool).unwrap_or(false) {
                            props.remove(key);
                        } else if let Some(value) = update.get("value").and_then(Value::as_str) {
                            props.insert(key.to_string(), json!({"value": value}));
                        }
                    }
                }
                dataset.clone()
            } else {
                Value::Null
            }
        }

        "pool.dataset.delete" => {
            let arr = params.as_array().cloned().unwrap_or_default();
            let path = arr.first().and_then(Value::as_str).unwrap_or_default();
            state.datasets.remove(path);
            Value::Bool(true)
        }

        "sharing.nfs.query" => {
            let filters = params.as_array().and_then(|a| a.first()).cloned().unwrap_or(json!([]));
            let matches: Vec<Value> = match filters.as_array() {
                Some(fs) if !fs.is_empty() => state
                    .shares
                    .iter()
                    .filter(|s| {
                        fs.iter().all(|f| {
                            let triple = f.as_array().cloned().unwrap_or_default();
                            let field = triple.first().and_then(Value::as_str).unwrap_or("");
                            let expect = triple.get(2).cloned().unwrap_or(Value::Null);
                            s.get(field) == Some(&expect)
                        })
                    })
                    .cloned()
                    .collect(),
                _ => state.shares.clone(),
            };
            Value::Array(matches)
        }

        "sharing.nfs.create" => {
            let payload = params.as_array().and_then(|a| a.first()).cloned().unwrap_or_default();
            let id = state.next_share_id;
            state.next_share_id += 1;
            let mut entry = payload.clone();
            entry["id"] = json!(id);
            state.shares.push(entry.clone());
            entry
        }

        "sharing.nfs.delete" => {
            let id = params.as_array().and_then(|a| a.first()).and_then(Value::as_i64);
            state.shares.retain(|s| s.get("id").and_then(Value::as_i64) != id);
            Value::Bool(true)
        }

        _ => Value::Null,
    }
}

async fn fake_engine() -> Arc<Engine> {
    let url = spawn_fake_appliance().await;
    let config = ApplianceConfig::new(url, "test-api-key");
    let mux = Multiplexer::connect(config.clone());
    let client = Arc::new(ApplianceClient::new(mux, config.method_names));
    Arc::new(Engine::new(client))
}

fn file_share_params() -> HashMap<String, String> {
    HashMap::from([
        ("protocol".to_string(), "file-share".to_string()),
        ("pool".to_string(), "tank".to_string()),
        ("parentDataset".to_string(), "csi".to_string()),
    ])
}

#[tokio::test]
async fn create_and_delete_file_share_volume_round_trips() {
    let engine = fake_engine().await;
    let controller = ControllerService::new(engine);

    let create = controller
        .create_volume(Request::new(csi::CreateVolumeRequest {
            name: "pvc-round-trip".to_string(),
            capacity_range: Some(csi::CapacityRange { required_bytes: 5 * 1024 * 1024 * 1024, limit_bytes: 0 }),
            volume_capabilities: vec![],
            parameters: file_share_params(),
            secrets: HashMap::new(),
            volume_content_source: None,
            accessibility_requirements: None,
        }))
        .await
        .expect("CreateVolume should succeed")
        .into_inner();

    let volume = create.volume.expect("CreateVolume should return a volume");
    assert_eq!(volume.volume_id, "pvc-round-trip");
    assert_eq!(volume.capacity_bytes, 5 * 1024 * 1024 * 1024);
    assert_eq!(volume.volume_context.get("protocol").map(String::as_str), Some("file-share"));
    assert_eq!(volume.volume_context.get("datasetPath").map(String::as_str), Some("tank/csi/pvc-round-trip"));

    // Idempotent: a second CreateVolume with the same name and a compatible
    // size returns the same volume rather than erroring.
    let again = controller
        .create_volume(Request::new(csi::CreateVolumeRequest {
            name: "pvc-round-trip".to_string(),
            capacity_range: Some(csi::CapacityRange { required_bytes: 5 * 1024 * 1024 * 1024, limit_bytes: 0 }),
            volume_capabilities: vec![],
            parameters: file_share_params(),
            secrets: HashMap::new(),
            volume_content_source: None,
            accessibility_requirements: None,
        }))
        .await
        .expect("repeat CreateVolume should also succeed")
        .into_inner();
    assert_eq!(again.volume.unwrap().volume_id, "pvc-round-trip");

    controller
        .delete_volume(Request::new(csi::DeleteVolumeRequest {
            volume_id: "pvc-round-trip".to_string(),
            secrets: HashMap::new(),
        }))
        .await
        .expect("DeleteVolume should succeed");

    // DeleteVolume is idempotent: deleting again is a no-op, not an error.
    controller
        .delete_volume(Request::new(csi::DeleteVolumeRequest {
            volume_id: "pvc-round-trip".to_string(),
            secrets: HashMap::new(),
        }))
        .await
        .expect("repeat DeleteVolume should also succeed");
}

#[tokio::test]
async fn create_volume_rejects_unknown_protocol() {
    let engine = fake_engine().await;
    let controller = ControllerService::new(engine);

    let mut parameters = file_share_params();
    parameters.insert("protocol".to_string(), "carrier-pigeon".to_string());

    let status = controller
        .create_volume(Request::new(csi::CreateVolumeRequest {
            name: "pvc-bad-protocol".to_string(),
            capacity_range: None,
            volume_capabilities: vec![],
            parameters,
            secrets: HashMap::new(),
            volume_content_source: None,
            accessibility_requirements: None,
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
}

#[tokio::test]
async fn list_volumes_paginates_by_offset() {
    let engine = fake_engine().await;
    let controller = ControllerService::new(engine);

    for i in 0..3 {
        controller
            .create_volume(Request::new(csi::CreateVolumeRequest {
                name: format!("pvc-{i}"),
                capacity_range: None,
                volume_capabilities: vec![],
                parameters: file_share_params(),
                secrets: HashMap::new(),
                volume_content_source: None,
                accessibility_requirements: None,
            }))
            .await
            .expect("CreateVolume should succeed");
    }

    let first_page = controller
        .list_volumes(Request::new(csi::ListVolumesRequest { max_entries: 2, starting_token: String::new() }))
        .await
        .expect("ListVolumes should succeed")
        .into_inner();
    assert_eq!(first_page.entries.len(), 2);
    assert_eq!(first_page.next_token, "2");

    let second_page = controller
        .list_volumes(Request::new(csi::ListVolumesRequest {
            max_entries: 2,
            starting_token: first_page.next_token,
        }))
        .await
        .expect("ListVolumes should succeed")
        .into_inner();
    assert_eq!(second_page.entries.len(), 1);
}

#[tokio::test]
async fn identity_service_reports_readiness_and_capabilities() {
    let identity = IdentityService::new();

    let info = identity
        .get_plugin_info(Request::new(csi::GetPluginInfoRequest {}))
        .await
        .expect("GetPluginInfo should succeed")
        .into_inner();
    assert!(!info.name.is_empty());

    let caps = identity
        .get_plugin_capabilities(Request::new(csi::GetPluginCapabilitiesRequest {}))
        .await
        .expect("GetPluginCapabilities should succeed")
        .into_inner();
    assert!(!caps.capabilities.is_empty());

    let probe = identity
        .probe(Request::new(csi::ProbeRequest {}))
        .await
        .expect("Probe should succeed")
        .into_inner();
    // Without a shared ReadinessState, IdentityService always reports ready.
    assert_eq!(probe.ready, Some(true));
}
