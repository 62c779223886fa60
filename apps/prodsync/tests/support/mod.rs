#![allow(dead_code)]

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use parking_lot::Mutex;
use prodsync_client_core::auth::{
    CredentialStore, FileCredentialStore, StoredSession, UserProfile,
};
use prodsync_client_core::push::{Command, Frame};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

pub const CODE: &str = "PR-1";
pub const OPERATOR: &str = "op@plant.test";

/// In-memory stand-in for the production API and its STOMP broker.
pub struct MockServer {
    pub valid_token: Mutex<String>,
    pub refresh_token: Mutex<String>,
    pub unauthorized: AtomicUsize,
    pub authorized: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub fetches: AtomicUsize,
    pub fields: Mutex<BTreeMap<u64, Option<String>>>,
    pub writes: Mutex<Vec<(String, Value)>>,
    pub status: Mutex<String>,
    pub connections: AtomicUsize,
    pub connect_auth: Mutex<Vec<Option<String>>>,
    pub subscribes: Mutex<Vec<(String, String)>>,
    pub unsubscribes: Mutex<Vec<String>>,
    outbound: broadcast::Sender<(String, String)>,
    kill: broadcast::Sender<()>,
}

impl MockServer {
    pub fn new() -> Arc<Self> {
        let mut fields = BTreeMap::new();
        fields.insert(101, Some("4.0".to_string()));
        Arc::new(Self {
            valid_token: Mutex::new("fresh".into()),
            refresh_token: Mutex::new("refresh-1".into()),
            unauthorized: AtomicUsize::new(0),
            authorized: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            fields: Mutex::new(fields),
            writes: Mutex::new(Vec::new()),
            status: Mutex::new("IN_PROGRESS".into()),
            connections: AtomicUsize::new(0),
            connect_auth: Mutex::new(Vec::new()),
            subscribes: Mutex::new(Vec::new()),
            unsubscribes: Mutex::new(Vec::new()),
            outbound: broadcast::channel(64).0,
            kill: broadcast::channel(4).0,
        })
    }

    /// Serves HTTP and `/ws` on an ephemeral loopback port.
    pub async fn spawn(self: &Arc<Self>) -> SocketAddr {
        let router = Router::new()
            .route("/auth/refresh-token", post(refresh))
            .route("/auth/login", post(login))
            .route("/auth/me", get(me))
            .route("/landing", get(landing))
            .route("/productions/:code", get(detail))
            .route("/productions/:code/latest-answers", get(latest_answers))
            .route("/productions/:code/fields/:field", put(put_field))
            .route(
                "/productions/:code/tables/:table/:row/:col",
                put(put_cell),
            )
            .route("/productions/:code/change-state", put(change_state))
            .route("/ws", get(ws_upgrade))
            .with_state(Arc::clone(self));
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("mock server addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        addr
    }

    /// Broadcasts a body to every client subscribed to `topic`.
    pub fn publish(&self, topic: &str, body: Value) {
        let _ = self.outbound.send((topic.to_string(), body.to_string()));
    }

    pub fn publish_raw(&self, topic: &str, body: &str) {
        let _ = self.outbound.send((topic.to_string(), body.to_string()));
    }

    /// Drops every open WebSocket without a STOMP goodbye.
    pub fn drop_connections(&self) {
        let _ = self.kill.send(());
    }

    pub fn subscription_count(&self, topic: &str) -> usize {
        self.subscribes
            .lock()
            .iter()
            .filter(|(destination, _)| destination == topic)
            .count()
    }

    fn check_auth(&self, headers: &HeaderMap) -> bool {
        let expected = format!("Bearer {}", self.valid_token.lock());
        let presented = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
        if presented == Some(expected.as_str()) {
            self.authorized.fetch_add(1, Ordering::SeqCst);
            true
        } else {
            self.unauthorized.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    fn snapshot(&self, code: &str) -> Value {
        let answers: Vec<Value> = self
            .fields
            .lock()
            .iter()
            .map(|(id, value)| json!({ "answerId": id * 10, "fieldId": id, "value": value }))
            .collect();
        json!({
            "production": {
                "code": code,
                "templateName": "Filling line",
                "status": self.status.lock().clone(),
                "batchLabel": "B-1"
            },
            "fields": [
                { "id": 101, "label": "Weight", "type": "decimal" },
                { "id": 211, "label": "Count", "type": "integer" }
            ],
            "tables": [{
                "id": 7,
                "name": "Checks",
                "rows": [{ "id": 1, "label": "Shift A" }],
                "columns": [{ "id": 1, "label": "Seal", "type": "text" }]
            }],
            "fieldAnswers": answers,
            "cellAnswers": []
        })
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "message": "token expired" })),
    )
        .into_response()
}

async fn refresh(State(server): State<Arc<MockServer>>, headers: HeaderMap) -> Response {
    server.refresh_calls.fetch_add(1, Ordering::SeqCst);
    let expected = format!("Bearer {}", server.refresh_token.lock());
    if headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) != Some(expected.as_str()) {
        return unauthorized();
    }
    let access = format!("fresh-{}", server.refresh_calls.load(Ordering::SeqCst));
    *server.valid_token.lock() = access.clone();
    *server.refresh_token.lock() = "refresh-2".into();
    Json(json!({ "accessToken": access, "refreshToken": "refresh-2" })).into_response()
}

async fn login(State(server): State<Arc<MockServer>>, Json(body): Json<Value>) -> Response {
    if body["password"] != "secret" {
        return unauthorized();
    }
    let access = server.valid_token.lock().clone();
    Json(json!({
        "accessToken": access,
        "refreshToken": "refresh-1",
        "user": { "email": body["email"], "name": "Dana" }
    }))
    .into_response()
}

async fn me(State(server): State<Arc<MockServer>>, headers: HeaderMap) -> Response {
    if !server.check_auth(&headers) {
        return unauthorized();
    }
    Json(json!({ "email": OPERATOR, "role": "OPERATOR" })).into_response()
}

async fn landing() -> Response {
    (
        [("content-type", "text/html")],
        "<!DOCTYPE html><html><body>Sign in</body></html>",
    )
        .into_response()
}

/// `?delay_ms=N` holds the response, so a rejection can arrive after the
/// session has already been renewed by another caller.
async fn detail(
    State(server): State<Arc<MockServer>>,
    Path(code): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Some(delay) = params.get("delay_ms").and_then(|ms| ms.parse().ok()) {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if !server.check_auth(&headers) {
        return unauthorized();
    }
    Json(server.snapshot(&code)["production"].clone()).into_response()
}

async fn latest_answers(
    State(server): State<Arc<MockServer>>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !server.check_auth(&headers) {
        return unauthorized();
    }
    server.fetches.fetch_add(1, Ordering::SeqCst);
    Json(server.snapshot(&code)).into_response()
}

async fn put_field(
    State(server): State<Arc<MockServer>>,
    Path((code, field)): Path<(String, u64)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !server.check_auth(&headers) {
        return unauthorized();
    }
    let value = body["value"].as_str().map(str::to_string);
    server.fields.lock().insert(field, value.clone());
    server
        .writes
        .lock()
        .push((format!("/productions/{code}/fields/{field}"), body));
    Json(json!({
        "answerId": field * 10,
        "fieldId": field,
        "value": value,
        "updatedAt": "2024-05-01T10:00:00Z"
    }))
    .into_response()
}

async fn put_cell(
    State(server): State<Arc<MockServer>>,
    Path((code, table, row, col)): Path<(String, u64, u64, u64)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !server.check_auth(&headers) {
        return unauthorized();
    }
    let value = body["value"].clone();
    server.writes.lock().push((
        format!("/productions/{code}/tables/{table}/{row}/{col}"),
        body,
    ));
    Json(json!({ "tableId": table, "rowId": row, "colId": col, "value": value })).into_response()
}

async fn change_state(
    State(server): State<Arc<MockServer>>,
    Path(code): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !server.check_auth(&headers) {
        return unauthorized();
    }
    if let Some(status) = body["value"].as_str() {
        *server.status.lock() = status.to_string();
    }
    server
        .writes
        .lock()
        .push((format!("/productions/{code}/change-state"), body));
    Json(json!({ "code": code, "status": server.status.lock().clone() })).into_response()
}

async fn ws_upgrade(State(server): State<Arc<MockServer>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| stomp_session(socket, server))
}

async fn stomp_session(mut socket: WebSocket, server: Arc<MockServer>) {
    server.connections.fetch_add(1, Ordering::SeqCst);
    let mut outbound = server.outbound.subscribe();
    let mut kill = server.kill.subscribe();
    // destination → subscription id
    let mut subscriptions: HashMap<String, String> = HashMap::new();
    let mut sequence = 0u64;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let text = match incoming {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(_)) => continue,
                };
                let Ok(frames) = Frame::parse_all(&text) else {
                    continue;
                };
                for frame in frames {
                    match frame.command {
                        Command::Connect => {
                            server
                                .connect_auth
                                .lock()
                                .push(frame.get("Authorization").map(str::to_string));
                            let connected = Frame::new(Command::Connected)
                                .header("version", "1.2")
                                .header("heart-beat", "0,0");
                            if socket.send(WsMessage::Text(connected.encode())).await.is_err() {
                                return;
                            }
                        }
                        Command::Subscribe => {
                            let destination = frame.get("destination").unwrap_or_default().to_string();
                            let id = frame.get("id").unwrap_or_default().to_string();
                            subscriptions.insert(destination.clone(), id.clone());
                            server.subscribes.lock().push((destination, id));
                        }
                        Command::Unsubscribe => {
                            let id = frame.get("id").unwrap_or_default().to_string();
                            subscriptions.retain(|_, existing| *existing != id);
                            server.unsubscribes.lock().push(id);
                        }
                        Command::Disconnect => return,
                        _ => {}
                    }
                }
            }
            published = outbound.recv() => {
                let Ok((topic, body)) = published else {
                    continue;
                };
                let Some(id) = subscriptions.get(&topic) else {
                    continue;
                };
                sequence += 1;
                let message = Frame::new(Command::Message)
                    .header("destination", topic.as_str())
                    .header("content-type", "application/json")
                    .header("subscription", id.as_str())
                    .header("message-id", format!("m-{sequence}"))
                    .with_body(body);
                if socket.send(WsMessage::Text(message.encode())).await.is_err() {
                    return;
                }
            }
            _ = kill.recv() => return,
        }
    }
}

/// Writes a session file holding `access`/`refresh` for the test operator.
pub fn seed_credentials(path: &FsPath, access: &str, refresh: Option<&str>) -> FileCredentialStore {
    let store = FileCredentialStore::new(path);
    store
        .save(&StoredSession {
            access_token: Some(access.to_string()),
            refresh_token: refresh.map(str::to_string),
            user: Some(UserProfile {
                email: OPERATOR.into(),
                name: None,
                role: None,
            }),
            updated_at: None,
        })
        .expect("seed credentials");
    store
}

/// Polls `check` until it holds or five seconds pass.
pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn within<T>(what: &str, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}
