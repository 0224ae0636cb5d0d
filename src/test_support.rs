//! In-process fake RPC server for end-to-end tests.
//!
//! Serves the same procedures over both transports:
//! - `GET|POST /rpc/{name}` (request/response)
//! - `GET /rpc/ws` (persistent, protobuf frames)
//! - `GET /rpc/plain` (418 with a text body), `GET /rpc/html` (200 with HTML)
//!
//! Procedures:
//! - `getUser {id}`: id 1 → Ada, id 2 → a malformed user, else 404
//! - `createUser {name}` → user 7
//! - `slow` → answers after 300ms
//! - `disconnect` (ws only) → the server drops the connection
//! - `counter {count}` → items 1..=count, then done (`counterAsText` too)
//! - `ticks` → an item every 10ms until cancelled
//! - `failing` → one item, then error 500

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use frames::{Frame, Kind, RemoteError, Status};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// =============================================================================
// CATALOGUE
// =============================================================================

#[derive(Clone, Debug, Serialize)]
pub(crate) struct UserId {
    pub id: u32,
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct NewUser {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub(crate) struct User {
    pub id: u32,
    pub name: String,
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct CounterInput {
    pub count: u32,
}

/// Input whose encoding always fails.
#[derive(Debug)]
pub(crate) struct Unencodable;

impl Serialize for Unencodable {
    fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(serde::ser::Error::custom("refusing to encode"))
    }
}

crate::procedures! {
    pub(crate) catalogue TestApi {
        query GetUser("getUser"): UserId => User;
        query Slow("slow"): () => String;
        query Html("html"): () => String;
        query Disconnect("disconnect"): () => Value;
        query Broken("brokenUser"): Unencodable => User;
        mutation CreateUser("createUser"): NewUser => User;
        subscription Counter("counter"): CounterInput => u64;
        subscription CounterAsText("counterAsText"): CounterInput => String;
        subscription Ticks("ticks"): () => u64;
        subscription Failing("failing"): () => u64;
        subscription BrokenEvents("brokenEvents"): Unencodable => u64;
    }
}

// =============================================================================
// SERVER
// =============================================================================

#[derive(Clone, Default)]
struct ServerState {
    calls: Arc<Mutex<HashMap<String, usize>>>,
}

impl ServerState {
    fn record(&self, procedure: &str) {
        let mut calls = self.calls.lock().expect("calls mutex");
        *calls.entry(procedure.to_owned()).or_default() += 1;
    }

    async fn call(&self, procedure: &str, input: &Value) -> Result<Value, RemoteError> {
        self.record(procedure);
        match procedure {
            "getUser" => match input.get("id").and_then(Value::as_u64) {
                Some(1) => Ok(json!({ "id": 1, "name": "Ada" })),
                Some(2) => Ok(json!({ "id": "not-a-number" })),
                _ => Err(RemoteError::new(404, "user not found")),
            },
            "createUser" => Ok(json!({ "id": 7, "name": input.get("name").cloned().unwrap_or(Value::Null) })),
            "slow" => {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(json!("slow"))
            }
            other => Err(unknown_procedure(other)),
        }
    }
}

fn unknown_procedure(name: &str) -> RemoteError {
    RemoteError::new(404, format!("unknown procedure `{name}`"))
}

pub(crate) struct TestServer {
    addr: SocketAddr,
    state: ServerState,
    task: JoinHandle<()>,
}

impl TestServer {
    pub(crate) async fn start() -> Self {
        let state = ServerState::default();
        let app = Router::new()
            .route("/rpc/ws", get(ws_upgrade))
            .route("/rpc/plain", get(plain_error))
            .route("/rpc/html", get(html_page))
            .route("/rpc/{name}", get(http_query).post(http_mutation))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind test server");
        let addr = listener.local_addr().expect("local addr");
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { addr, state, task }
    }

    /// `http://127.0.0.1:<port>/rpc`
    pub(crate) fn http_endpoint(&self) -> String {
        format!("http://{}/rpc", self.addr)
    }

    /// `ws://127.0.0.1:<port>/rpc/ws`
    pub(crate) fn ws_endpoint(&self) -> String {
        format!("ws://{}/rpc/ws", self.addr)
    }

    /// How many times `procedure` has been invoked.
    pub(crate) fn calls(&self, procedure: &str) -> usize {
        self.state.calls.lock().expect("calls mutex").get(procedure).copied().unwrap_or(0)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// =============================================================================
// HTTP
// =============================================================================

async fn http_query(
    State(state): State<ServerState>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let input = match params.get("input").map(|raw| serde_json::from_str(raw)) {
        None => Value::Null,
        Some(Ok(input)) => input,
        Some(Err(_)) => return respond(Err(RemoteError::new(400, "input is not JSON"))),
    };
    respond(state.call(&name, &input).await)
}

async fn http_mutation(State(state): State<ServerState>, Path(name): Path<String>, body: Bytes) -> Response {
    let input = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(input) => input,
            Err(_) => return respond(Err(RemoteError::new(400, "body is not JSON"))),
        }
    };
    respond(state.call(&name, &input).await)
}

async fn plain_error() -> Response {
    (StatusCode::IM_A_TEAPOT, "short and stout").into_response()
}

async fn html_page() -> Response {
    (StatusCode::OK, "<html>oops</html>").into_response()
}

fn respond(result: Result<Value, RemoteError>) -> Response {
    match result {
        Ok(output) => Json(output).into_response(),
        Err(err) => {
            let status = u16::try_from(err.code)
                .ok()
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(err.to_data())).into_response()
        }
    }
}

// =============================================================================
// WEBSOCKET
// =============================================================================

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(move |socket| ws_loop(socket, state))
}

async fn ws_loop(mut socket: WebSocket, state: ServerState) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let mut streams: HashMap<u64, JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let decoded = match msg {
                    Message::Binary(bytes) => frames::decode_frame(&bytes),
                    Message::Text(text) => frames::decode_text(text.as_str()),
                    Message::Close(_) => break,
                    _ => continue,
                };
                let Ok(frame) = decoded else { continue };
                if frame.status == Status::Request && frame.procedure == "disconnect" {
                    break;
                }
                dispatch(frame, &state, &out_tx, &mut streams);
            }
            Some(frame) = out_rx.recv() => {
                if socket.send(Message::Binary(frames::encode_frame(&frame).into())).await.is_err() {
                    break;
                }
            }
        }
    }

    for (_, task) in streams {
        task.abort();
    }
}

fn dispatch(
    frame: Frame,
    state: &ServerState,
    out: &mpsc::UnboundedSender<Frame>,
    streams: &mut HashMap<u64, JoinHandle<()>>,
) {
    match (frame.status, frame.kind) {
        (Status::Cancel, _) => {
            if let Some(task) = streams.remove(&frame.id) {
                task.abort();
            }
            let _ = out.send(frame.cancel_ack());
        }
        (Status::Request, Some(Kind::Subscription)) => {
            state.record(&frame.procedure);
            let id = frame.id;
            streams.insert(id, tokio::spawn(run_subscription(frame, out.clone())));
        }
        (Status::Request, Some(_)) => {
            let state = state.clone();
            let out = out.clone();
            tokio::spawn(async move {
                let reply = match state.call(&frame.procedure, &frame.data).await {
                    Ok(output) => frame.done_with(output),
                    Err(err) => frame.error(&err),
                };
                let _ = out.send(reply);
            });
        }
        _ => {}
    }
}

async fn run_subscription(req: Frame, out: mpsc::UnboundedSender<Frame>) {
    match req.procedure.as_str() {
        "counter" | "counterAsText" => {
            let count = req.data.get("count").and_then(Value::as_u64).unwrap_or(3);
            for n in 1..=count {
                let _ = out.send(req.item(json!(n)));
            }
            let _ = out.send(req.done());
        }
        "ticks" => {
            for n in 1u64.. {
                if out.send(req.item(json!(n))).is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
        "failing" => {
            let _ = out.send(req.item(json!(1)));
            let _ = out.send(req.error(&RemoteError::new(500, "boom")));
        }
        other => {
            let _ = out.send(req.error(&unknown_procedure(other)));
        }
    }
}
