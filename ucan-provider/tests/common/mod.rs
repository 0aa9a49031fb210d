//! Shared test utilities for ucan-provider integration tests.
//!
//! `MockCloud` serves the volume, network and compute APIs from one axum
//! router so the real HTTP clients can run against it.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Map, Value, json};
use tokio::net::TcpListener;

pub const CREDENTIALS: &[u8] =
    br#"{"accessKeyId":"AK-TEST","secretAccessKey":"SK-TEST","service":"ucan","region":"cn-test"}"#;

pub const OBJECT_TAG: &str = "ucan.io/object";

/// Failure returned instead of the next response.
#[derive(Debug, Clone)]
pub enum Injected {
    Status(u16),
    Garbage,
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub namespace: Option<String>,
}

#[derive(Default)]
struct Cloud {
    volumes: BTreeMap<String, Value>,
    floating_ips: BTreeMap<String, Value>,
    servers: BTreeMap<String, Value>,
    next_id: u64,
    requests: Vec<Recorded>,
    failures: VecDeque<Injected>,
}

impl Cloud {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }
}

type Shared = Arc<Mutex<Cloud>>;

fn lock(state: &Shared) -> MutexGuard<'_, Cloud> {
    state.lock().unwrap()
}

/// In-process stand-in for the ucan APIs.
pub struct MockCloud {
    pub addr: SocketAddr,
    state: Shared,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockCloud {
    pub async fn spawn() -> Self {
        let state: Shared = Arc::new(Mutex::new(Cloud::default()));

        let router = Router::new()
            .route("/volume/v3/{project}/volumes", post(create_volume))
            .route("/volume/v3/{project}/volumes/detail", get(list_volumes))
            .route(
                "/volume/v3/{project}/volumes/{id}",
                get(get_volume).put(update_volume).delete(delete_volume),
            )
            .route("/v3/floatingips", post(create_floating_ip))
            .route(
                "/v3/floatingips/{id}",
                get(get_floating_ip)
                    .put(update_floating_ip)
                    .delete(delete_floating_ip),
            )
            .route("/virtualmachine/v3/servers", post(create_server))
            .route(
                "/virtualmachine/v3/servers/{id}",
                get(get_server).put(update_server).delete(delete_server),
            )
            .layer(middleware::from_fn_with_state(state.clone(), record))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("Server error");
        });

        Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Answer the next request with `failure`.
    pub fn fail_next(&self, failure: Injected) {
        lock(&self.state).failures.push_back(failure);
    }

    pub fn requests(&self) -> Vec<Recorded> {
        lock(&self.state).requests.clone()
    }

    pub fn count_requests(&self, method: &str, path: &str) -> usize {
        lock(&self.state)
            .requests
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }

    pub fn volume(&self, id: &str) -> Option<Value> {
        lock(&self.state).volumes.get(id).cloned()
    }

    pub fn volume_ids(&self) -> Vec<String> {
        lock(&self.state).volumes.keys().cloned().collect()
    }

    /// Add a volume out of band, carrying ownership tag `tag`.
    pub fn insert_volume(&self, project: &str, name: &str, tag: &str) -> String {
        let mut cloud = lock(&self.state);
        let id = cloud.id("vol");
        let mut metadata = Map::new();
        metadata.insert(OBJECT_TAG.to_string(), json!(tag));
        let volume = json!({
            "id": id,
            "project_id": project,
            "status": "available",
            "name": name,
            "description": "",
            "size": 10,
            "volume_type": "ssd",
            "multiattach": false,
            "metadata": metadata,
        });
        cloud.volumes.insert(id.clone(), volume);
        id
    }

    pub fn set_volume(&self, id: &str, field: &str, value: Value) {
        if let Some(volume) = lock(&self.state).volumes.get_mut(id) {
            volume[field] = value;
        }
    }

    pub fn remove_volume(&self, id: &str) {
        lock(&self.state).volumes.remove(id);
    }

    pub fn floating_ip(&self, id: &str) -> Option<Value> {
        lock(&self.state).floating_ips.get(id).cloned()
    }

    pub fn floating_ip_ids(&self) -> Vec<String> {
        lock(&self.state).floating_ips.keys().cloned().collect()
    }

    pub fn set_floating_ip(&self, id: &str, field: &str, value: Value) {
        if let Some(fip) = lock(&self.state).floating_ips.get_mut(id) {
            fip[field] = value;
        }
    }

    pub fn server(&self, id: &str) -> Option<Value> {
        lock(&self.state).servers.get(id).cloned()
    }

    pub fn server_ids(&self) -> Vec<String> {
        lock(&self.state).servers.keys().cloned().collect()
    }

    pub fn set_server(&self, id: &str, field: &str, value: Value) {
        if let Some(server) = lock(&self.state).servers.get_mut(id) {
            server[field] = value;
        }
    }
}

impl Drop for MockCloud {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Poll `condition` every 20ms until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

async fn record(State(state): State<Shared>, request: Request, next: Next) -> Response {
    let injected = {
        let mut cloud = lock(&state);
        cloud.requests.push(Recorded {
            method: request.method().to_string(),
            path: request.uri().path().to_string(),
            namespace: request
                .headers()
                .get("X-UCAN-NS")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        });
        cloud.failures.pop_front()
    };

    match injected {
        Some(Injected::Status(status)) => (
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            "injected failure",
        )
            .into_response(),
        Some(Injected::Garbage) => (StatusCode::OK, "<html>not json</html>").into_response(),
        None => next.run(request).await,
    }
}

fn merge(target: &mut Value, changes: &Value, fields: &[&str]) {
    for field in fields {
        if let Some(value) = changes.get(*field) {
            target[*field] = value.clone();
        }
    }
}

// Volumes

async fn create_volume(
    State(state): State<Shared>,
    Path(project): Path<String>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let mut cloud = lock(&state);
    let id = cloud.id("vol");
    let mut volume = body["volume"].clone();
    volume["id"] = json!(id);
    volume["project_id"] = json!(project);
    volume["status"] = json!("available");
    volume["scheduler_hints"] = body["OS-SCH-HNT:scheduler_hints"].clone();
    cloud.volumes.insert(id, volume.clone());
    (StatusCode::ACCEPTED, Json(json!({ "volume": volume })))
}

async fn list_volumes(
    State(state): State<Shared>,
    Path(project): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    let filter: BTreeMap<String, String> = query
        .get("metadata")
        .and_then(|m| serde_json::from_str(m).ok())
        .unwrap_or_default();

    let cloud = lock(&state);
    let volumes: Vec<Value> = cloud
        .volumes
        .values()
        .filter(|v| v["project_id"] == project.as_str())
        .filter(|v| {
            filter
                .iter()
                .all(|(k, want)| v["metadata"][k.as_str()] == want.as_str())
        })
        .cloned()
        .collect();
    Json(json!({ "volumes": volumes }))
}

async fn get_volume(
    State(state): State<Shared>,
    Path((_project, id)): Path<(String, String)>,
) -> Result<Json<Value>, StatusCode> {
    let cloud = lock(&state);
    let volume = cloud.volumes.get(&id).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(json!({ "volume": volume })))
}

async fn update_volume(
    State(state): State<Shared>,
    Path((_project, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let mut cloud = lock(&state);
    let volume = cloud.volumes.get_mut(&id).ok_or(StatusCode::NOT_FOUND)?;
    merge(volume, &body["volume"], &["name", "description"]);
    Ok(Json(json!({ "volume": volume })))
}

async fn delete_volume(
    State(state): State<Shared>,
    Path((_project, id)): Path<(String, String)>,
) -> StatusCode {
    match lock(&state).volumes.remove(&id) {
        Some(_) => StatusCode::ACCEPTED,
        None => StatusCode::NOT_FOUND,
    }
}

// Floating IPs

async fn create_floating_ip(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let mut cloud = lock(&state);
    let id = cloud.id("fip");
    let mut fip = body["floatingip"].clone();
    fip["id"] = json!(id);
    fip["status"] = json!("running");
    fip["floating_ip_address"] = json!(format!("203.0.113.{}", cloud.next_id));
    cloud.floating_ips.insert(id, fip.clone());
    Json(json!({ "floatingips": fip }))
}

async fn get_floating_ip(
    State(state): State<Shared>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let cloud = lock(&state);
    let fip = cloud.floating_ips.get(&id).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(json!({ "floatingips": fip })))
}

async fn update_floating_ip(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let mut cloud = lock(&state);
    let fip = cloud.floating_ips.get_mut(&id).ok_or(StatusCode::NOT_FOUND)?;
    merge(fip, &body["floatingip"], &["name", "description", "bandwidth"]);
    Ok(Json(json!({ "floatingips": fip })))
}

async fn delete_floating_ip(State(state): State<Shared>, Path(id): Path<String>) -> StatusCode {
    match lock(&state).floating_ips.remove(&id) {
        Some(_) => StatusCode::NO_CONTENT,
        None => StatusCode::NOT_FOUND,
    }
}

// Servers

async fn create_server(State(state): State<Shared>, Json(body): Json<Value>) -> impl IntoResponse {
    let mut cloud = lock(&state);
    let id = cloud.id("srv");
    let server = json!({
        "id": id,
        "status": "ACTIVE",
        "name": body["name"],
        "metadata": body.get("metadata").cloned().unwrap_or_else(|| json!({})),
        "image": { "id": body["imageRef"] },
        "flavor": { "id": body["flavorRef"] },
        "block_device_mapping": body["block_device_mapping"],
    });
    cloud.servers.insert(id, server.clone());
    (StatusCode::ACCEPTED, Json(json!({ "server": server })))
}

async fn get_server(
    State(state): State<Shared>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let cloud = lock(&state);
    let server = cloud.servers.get(&id).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(json!({ "server": server })))
}

async fn update_server(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let mut cloud = lock(&state);
    let server = cloud.servers.get_mut(&id).ok_or(StatusCode::NOT_FOUND)?;
    merge(server, &body["server"], &["name", "metadata"]);
    Ok(Json(json!({ "server": server })))
}

async fn delete_server(State(state): State<Shared>, Path(id): Path<String>) -> StatusCode {
    match lock(&state).servers.remove(&id) {
        Some(_) => StatusCode::NO_CONTENT,
        None => StatusCode::NOT_FOUND,
    }
}
