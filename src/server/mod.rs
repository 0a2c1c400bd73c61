//! Host-side protocol server: the loopback listening endpoint, connection
//! registry, broadcaster, and the single ingestion path for domain events.
//!
//! The listener binds 127.0.0.1 only — the loopback address is the trust
//! boundary, so connections carry no client identity beyond the connection
//! itself.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use serde_json::Value;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::BridgeConfig;
use crate::dedup::NotificationDeduper;
use crate::dispatch::{ActionTable, DomainCommand, HandlerCtx};
use crate::error::{Error, Result};
use crate::protocol::{Envelope, KeepAlive, CLEAN_SHUTDOWN_CODE, HOST_SOURCE};
use crate::state::{ControlSurfaceState, DomainEvent};

/// Per-connection outbound queue depth. A connection that falls this far
/// behind is dropped rather than allowed to stall the fan-out.
const OUTBOUND_QUEUE: usize = 64;

const INGEST_QUEUE: usize = 256;

struct ConnectionEntry {
    outbound: mpsc::Sender<Message>,
    last_activity: Instant,
}

struct Shared {
    state: Arc<Mutex<ControlSurfaceState>>,
    registry: Mutex<HashMap<Uuid, ConnectionEntry>>,
}

#[derive(Clone)]
struct AppState {
    shared: Arc<Shared>,
    actions: Arc<ActionTable>,
    ctx: HandlerCtx,
    shutdown_rx: watch::Receiver<bool>,
}

pub struct SurfaceServer;

impl SurfaceServer {
    /// Bind the loopback endpoint and start serving control surfaces.
    ///
    /// Binding is a deliberate user action: a taken port fails the start with
    /// [`Error::Bind`] and is never retried in the background. Domain
    /// commands issued by handlers are delivered on `domain_tx`.
    pub async fn start(
        config: &BridgeConfig,
        actions: ActionTable,
        domain_tx: mpsc::Sender<DomainCommand>,
    ) -> Result<ServerHandle> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, config.server.port));
        let listener = TcpListener::bind(addr).await.map_err(Error::Bind)?;
        let local_addr = listener.local_addr().map_err(Error::Bind)?;

        let shared = Arc::new(Shared {
            state: Arc::new(Mutex::new(ControlSurfaceState::default())),
            registry: Mutex::new(HashMap::new()),
        });
        let ctx = HandlerCtx {
            domain: domain_tx,
            state: shared.state.clone(),
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ingest_tx, ingest_rx) = mpsc::channel(INGEST_QUEUE);
        let app_state = AppState {
            shared: shared.clone(),
            actions: Arc::new(actions),
            ctx,
            shutdown_rx: shutdown_rx.clone(),
        };

        let app = Router::new()
            .route("/ws", get(ws_handler))
            .with_state(app_state);
        let mut serve_shutdown = shutdown_rx.clone();
        let server_task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = serve_shutdown.changed().await;
                })
                .await;
            if let Err(err) = result {
                tracing::warn!(error = %err, "surface server stopped");
            }
        });
        let ingest_task = tokio::spawn(run_ingest_loop(shared.clone(), ingest_rx, shutdown_rx));

        tracing::info!(%local_addr, "control-surface endpoint listening");

        Ok(ServerHandle {
            shared,
            ingest_tx,
            shutdown_tx,
            local_addr,
            server_task,
            ingest_task,
        })
    }
}

/// Handle to a running server. The host application feeds domain events
/// through [`ServerHandle::ingest`]; nothing else may mutate the store.
pub struct ServerHandle {
    shared: Arc<Shared>,
    ingest_tx: mpsc::Sender<DomainEvent>,
    shutdown_tx: watch::Sender<bool>,
    local_addr: SocketAddr,
    server_task: JoinHandle<()>,
    ingest_task: JoinHandle<()>,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl ServerHandle {
    /// Ingest one authoritative domain event. Events are applied and
    /// broadcast strictly in ingestion order, one at a time.
    pub async fn ingest(&self, event: DomainEvent) -> Result<()> {
        self.ingest_tx.send(event).await.map_err(|_| Error::Closed)
    }

    /// Ingest a JSON-shaped domain event: either the full envelope shape or
    /// the legacy `{type, ...fields}` shape.
    pub async fn ingest_json(&self, value: &Value) -> Result<()> {
        self.ingest(DomainEvent::from_value(value)?).await
    }

    /// Consistent snapshot of the canonical state.
    pub fn state(&self) -> ControlSurfaceState {
        self.shared.state.lock().unwrap().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.registry.lock().unwrap().len()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn surface_url(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }

    /// Stop serving: close every connection with the clean-shutdown code,
    /// cancel pending work, and reset the state to defaults. Nothing
    /// survives a restart.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.server_task.await;
        let _ = self.ingest_task.await;
        self.shared.registry.lock().unwrap().clear();
        *self.shared.state.lock().unwrap() = ControlSurfaceState::default();
        tracing::info!("control-surface endpoint stopped, state reset");
    }
}

async fn ws_handler(State(app): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app))
}

async fn handle_socket(mut socket: WebSocket, app: AppState) {
    let id = Uuid::new_v4();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);

    let count = {
        let mut registry = app.shared.registry.lock().unwrap();
        registry.insert(
            id,
            ConnectionEntry {
                outbound: outbound_tx.clone(),
                last_activity: Instant::now(),
            },
        );
        registry.len()
    };
    let snapshot = {
        let mut state = app.shared.state.lock().unwrap();
        state.connected = true;
        state.connection_count = count;
        state.clone()
    };
    tracing::info!(connection = %id, count, "control surface connected");

    // A late-joining client is not left blank: it gets the full snapshot
    // before anything else.
    send_snapshot(&outbound_tx, &snapshot);

    let mut shutdown = app.shutdown_rx.clone();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: CLEAN_SHUTDOWN_CODE,
                        reason: "server shutdown".into(),
                    })))
                    .await;
                break;
            }
            outgoing = outbound_rx.recv() => {
                let Some(msg) = outgoing else { break };
                let closing = matches!(msg, Message::Close(_));
                if socket.send(msg).await.is_err() {
                    break;
                }
                if closing {
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(&app, id, &outbound_tx, &text);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(connection = %id, error = %err, "socket error");
                        break;
                    }
                }
            }
        }
    }

    let remaining = {
        let mut registry = app.shared.registry.lock().unwrap();
        registry.remove(&id);
        registry.len()
    };
    {
        let mut state = app.shared.state.lock().unwrap();
        state.connection_count = remaining;
        if remaining == 0 {
            state.connected = false;
        }
    }
    tracing::info!(connection = %id, remaining, "control surface disconnected");
}

fn send_snapshot(outbound: &mpsc::Sender<Message>, snapshot: &ControlSurfaceState) {
    match serde_json::to_value(snapshot) {
        Ok(value) => {
            let envelope = Envelope::new(HOST_SOURCE, "connectionStateUpdate", value);
            send_envelope(outbound, &envelope);
        }
        Err(err) => tracing::warn!(error = %err, "snapshot encode failed"),
    }
}

fn send_envelope(outbound: &mpsc::Sender<Message>, envelope: &Envelope) {
    match envelope.encode() {
        Ok(raw) => {
            let _ = outbound.try_send(Message::Text(raw));
        }
        Err(err) => tracing::warn!(error = %err, "envelope encode failed"),
    }
}

fn handle_text(app: &AppState, id: Uuid, outbound: &mpsc::Sender<Message>, text: &str) {
    if let Some(entry) = app.shared.registry.lock().unwrap().get_mut(&id) {
        entry.last_activity = Instant::now();
    }

    // Keep-alive short-circuits before generic envelope decoding.
    if KeepAlive::parse_ping(text).is_some() {
        if let Ok(raw) = KeepAlive::pong().encode() {
            let _ = outbound.try_send(Message::Text(raw));
        }
        return;
    }

    let reply = match Envelope::decode(text) {
        Ok(envelope) => app.actions.dispatch(&app.ctx, &envelope.action, &envelope.payload),
        Err(err) => {
            tracing::debug!(connection = %id, error = %err, "inbound decode failed");
            Envelope::error_response(HOST_SOURCE, err.wire_code(), &err.to_string(), None)
        }
    };
    send_envelope(outbound, &reply);
}

/// Single-writer ingestion loop. One event at a time: apply to the store,
/// snapshot, broadcast — the next event is not accepted until this one's
/// broadcast has been handed to every connection queue.
async fn run_ingest_loop(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<DomainEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut dedup = NotificationDeduper::default();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                if let Some(key) = event.dedup_key() {
                    if !dedup.should_emit(&key) {
                        tracing::debug!(key = %key, "duplicate notification suppressed");
                        continue;
                    }
                }
                let snapshot = {
                    let mut state = shared.state.lock().unwrap();
                    state.apply(&event);
                    state.clone()
                };
                let envelope = Envelope::new(
                    HOST_SOURCE,
                    event.broadcast_action(),
                    event.broadcast_payload(&snapshot),
                );
                let delivered = broadcast(&shared, &envelope);
                tracing::debug!(action = %envelope.action, delivered, "state broadcast");
            }
        }
    }
}

/// Fan an envelope out to every registered connection. Per-connection
/// failures are isolated: a dead or saturated connection is dropped from the
/// registry and delivery to the others continues. Never blocks on a slow
/// client. Returns the number of successful deliveries.
fn broadcast(shared: &Shared, envelope: &Envelope) -> usize {
    let raw = match envelope.encode() {
        Ok(raw) => raw,
        Err(err) => {
            tracing::warn!(error = %err, "broadcast encode failed");
            return 0;
        }
    };

    let mut stale = Vec::new();
    let mut delivered = 0;
    {
        let registry = shared.registry.lock().unwrap();
        for (id, entry) in registry.iter() {
            match entry.outbound.try_send(Message::Text(raw.clone())) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::debug!(connection = %id, error = %err, "broadcast send failed, dropping connection");
                    stale.push(*id);
                }
            }
        }
    }

    if !stale.is_empty() {
        let remaining = {
            let mut registry = shared.registry.lock().unwrap();
            for id in &stale {
                registry.remove(id);
            }
            registry.len()
        };
        let mut state = shared.state.lock().unwrap();
        state.connection_count = remaining;
        if remaining == 0 {
            state.connected = false;
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type TestWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn test_config() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.server.port = 0;
        config
    }

    async fn start_test_server() -> (ServerHandle, mpsc::Receiver<DomainCommand>) {
        let (domain_tx, domain_rx) = mpsc::channel(16);
        let handle = SurfaceServer::start(&test_config(), ActionTable::with_builtin(), domain_tx)
            .await
            .expect("server start");
        (handle, domain_rx)
    }

    async fn connect(handle: &ServerHandle) -> TestWs {
        let (ws, _) = connect_async(handle.surface_url()).await.expect("connect");
        ws
    }

    async fn next_text(ws: &mut TestWs) -> String {
        let deadline = Duration::from_secs(2);
        loop {
            let msg = timeout(deadline, ws.next())
                .await
                .expect("timed out waiting for message")
                .expect("stream ended")
                .expect("socket error");
            if let WsMessage::Text(text) = msg {
                return text;
            }
        }
    }

    async fn next_envelope(ws: &mut TestWs) -> Envelope {
        Envelope::decode(&next_text(ws).await).expect("envelope")
    }

    async fn send_action(ws: &mut TestWs, action: &str, payload: Value) {
        let env = Envelope::new(crate::protocol::SURFACE_SOURCE, action, payload);
        ws.send(WsMessage::Text(env.encode().unwrap())).await.unwrap();
    }

    #[tokio::test]
    async fn late_joining_client_receives_full_snapshot_first() {
        let (handle, _domain_rx) = start_test_server().await;
        handle
            .ingest(DomainEvent::VolumeChanged { volume: 0.3 })
            .await
            .unwrap();

        let mut ws = connect(&handle).await;
        let env = next_envelope(&mut ws).await;
        assert_eq!(env.action, "connectionStateUpdate");
        assert_eq!(env.payload["connected"], true);
        assert_eq!(env.payload["connectionCount"], 1);
        assert_eq!(env.payload["volume"], 0.3);
        assert_eq!(env.source, HOST_SOURCE);

        handle.stop().await;
    }

    #[tokio::test]
    async fn bind_failure_is_fatal_and_synchronous() {
        let (handle, _domain_rx) = start_test_server().await;
        let mut taken = BridgeConfig::default();
        taken.server.port = handle.local_addr().port();

        let (domain_tx, _rx) = mpsc::channel(4);
        let err = SurfaceServer::start(&taken, ActionTable::with_builtin(), domain_tx)
            .await
            .expect_err("second bind must fail");
        assert!(matches!(err, Error::Bind(_)));

        handle.stop().await;
    }

    #[tokio::test]
    async fn dispatches_commands_and_confirms_acceptance() {
        let (handle, mut domain_rx) = start_test_server().await;
        let mut ws = connect(&handle).await;
        let _snapshot = next_envelope(&mut ws).await;

        send_action(&mut ws, "pauseTrack", Value::Null).await;
        let response = next_envelope(&mut ws).await;
        assert_eq!(response.action, "pauseTrackResponse");
        assert_eq!(response.payload["success"], true);
        assert_eq!(domain_rx.recv().await.unwrap(), DomainCommand::Pause);

        handle.stop().await;
    }

    #[tokio::test]
    async fn unknown_action_and_garbage_get_error_responses() {
        let (handle, _domain_rx) = start_test_server().await;
        let mut ws = connect(&handle).await;
        let _snapshot = next_envelope(&mut ws).await;

        send_action(&mut ws, "warpTen", Value::Null).await;
        let response = next_envelope(&mut ws).await;
        assert_eq!(response.action, "errorResponse");
        assert_eq!(response.payload["error"]["code"], "UNKNOWN_ACTION");

        ws.send(WsMessage::Text("{broken".to_string())).await.unwrap();
        let response = next_envelope(&mut ws).await;
        assert_eq!(response.action, "errorResponse");
        assert_eq!(response.payload["error"]["code"], "PARSE_ERROR");

        ws.send(WsMessage::Text(r#"{"payload":{}}"#.to_string()))
            .await
            .unwrap();
        let response = next_envelope(&mut ws).await;
        assert_eq!(response.payload["error"]["code"], "MISSING_ACTION");

        // The connection survived all of it.
        send_action(&mut ws, "getState", Value::Null).await;
        let response = next_envelope(&mut ws).await;
        assert_eq!(response.action, "getStateResponse");
        assert_eq!(response.payload["success"], true);

        handle.stop().await;
    }

    #[tokio::test]
    async fn keepalive_ping_answers_pong_before_envelope_decode() {
        let (handle, _domain_rx) = start_test_server().await;
        let mut ws = connect(&handle).await;
        let _snapshot = next_envelope(&mut ws).await;

        ws.send(WsMessage::Text(
            r#"{"type":"ping","timestamp":1712345678901}"#.to_string(),
        ))
        .await
        .unwrap();
        let raw = next_text(&mut ws).await;
        let pong: KeepAlive = serde_json::from_str(&raw).unwrap();
        assert_eq!(pong.kind, "pong");

        handle.stop().await;
    }

    #[tokio::test]
    async fn authoritative_events_broadcast_to_all_connections() {
        let (handle, _domain_rx) = start_test_server().await;
        let mut a = connect(&handle).await;
        let mut b = connect(&handle).await;
        let _ = next_envelope(&mut a).await;
        let _ = next_envelope(&mut b).await;

        handle
            .ingest(DomainEvent::PlaybackChanged { is_playing: true })
            .await
            .unwrap();

        for ws in [&mut a, &mut b] {
            let env = next_envelope(ws).await;
            assert_eq!(env.action, "audioStateUpdate");
            assert_eq!(env.payload["isPlaying"], true);
        }
        assert!(handle.state().is_playing);

        handle.stop().await;
    }

    #[tokio::test]
    async fn ingest_json_accepts_envelope_and_legacy_shapes() {
        let (handle, _domain_rx) = start_test_server().await;
        let mut ws = connect(&handle).await;
        let _ = next_envelope(&mut ws).await;

        handle
            .ingest_json(&serde_json::json!({
                "action": "loopChanged",
                "payload": { "enabled": true },
            }))
            .await
            .unwrap();
        let env = next_envelope(&mut ws).await;
        assert_eq!(env.action, "loopStateUpdate");
        assert_eq!(env.payload["loopEnabled"], true);

        handle
            .ingest_json(&serde_json::json!({ "type": "muteChanged", "enabled": true }))
            .await
            .unwrap();
        let env = next_envelope(&mut ws).await;
        assert_eq!(env.action, "muteStateUpdate");
        assert_eq!(env.payload["muteEnabled"], true);

        assert!(handle
            .ingest_json(&serde_json::json!({ "type": "discoBall" }))
            .await
            .is_err());

        handle.stop().await;
    }

    #[tokio::test]
    async fn duplicate_tab_notifications_inside_window_broadcast_once() {
        let (handle, _domain_rx) = start_test_server().await;
        let mut ws = connect(&handle).await;
        let _ = next_envelope(&mut ws).await;

        let event = DomainEvent::HotkeyTabChanged {
            from_tab: 2,
            to_tab: 3,
        };
        handle.ingest(event.clone()).await.unwrap();
        handle.ingest(event).await.unwrap();

        let env = next_envelope(&mut ws).await;
        assert_eq!(env.action, "hotkeyStateUpdate");
        assert_eq!(env.payload["fromTab"], 2);
        assert_eq!(env.payload["toTab"], 3);

        // The duplicate was suppressed: nothing else arrives.
        let silence = timeout(Duration::from_millis(300), ws.next()).await;
        assert!(silence.is_err(), "expected no second hotkeyStateUpdate");

        handle.stop().await;
    }

    #[tokio::test]
    async fn broadcast_isolates_dead_connections() {
        let shared = Shared {
            state: Arc::new(Mutex::new(ControlSurfaceState::default())),
            registry: Mutex::new(HashMap::new()),
        };
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
            receivers.push(rx);
            shared.registry.lock().unwrap().insert(
                Uuid::new_v4(),
                ConnectionEntry {
                    outbound: tx,
                    last_activity: Instant::now(),
                },
            );
        }
        // One already-closed connection: its receiver is gone.
        let (dead_tx, dead_rx) = mpsc::channel(OUTBOUND_QUEUE);
        drop(dead_rx);
        shared.registry.lock().unwrap().insert(
            Uuid::new_v4(),
            ConnectionEntry {
                outbound: dead_tx,
                last_activity: Instant::now(),
            },
        );

        let envelope = Envelope::new(
            HOST_SOURCE,
            "audioStateUpdate",
            serde_json::json!({ "isPlaying": true }),
        );
        let delivered = broadcast(&shared, &envelope);
        assert_eq!(delivered, 3);
        assert_eq!(shared.registry.lock().unwrap().len(), 3);
        for rx in &mut receivers {
            assert!(rx.try_recv().is_ok());
        }
    }

    #[tokio::test]
    async fn closed_connection_does_not_block_delivery_to_others() {
        let (handle, _domain_rx) = start_test_server().await;
        let mut a = connect(&handle).await;
        let mut b = connect(&handle).await;
        let c = connect(&handle).await;
        let _ = next_envelope(&mut a).await;
        let _ = next_envelope(&mut b).await;
        drop(c);
        // Give the server a beat to notice the dropped socket.
        tokio::time::sleep(Duration::from_millis(100)).await;

        handle
            .ingest(DomainEvent::PlaybackChanged { is_playing: true })
            .await
            .unwrap();
        for ws in [&mut a, &mut b] {
            let env = next_envelope(ws).await;
            assert_eq!(env.action, "audioStateUpdate");
        }
        assert_eq!(handle.connection_count(), 2);

        handle.stop().await;
    }

    #[tokio::test]
    async fn stop_closes_cleanly_and_resets_state() {
        let (handle, _domain_rx) = start_test_server().await;
        let mut ws = connect(&handle).await;
        let _ = next_envelope(&mut ws).await;

        handle
            .ingest(DomainEvent::VolumeChanged { volume: 0.2 })
            .await
            .unwrap();
        let _ = next_envelope(&mut ws).await;

        let probe = handle.shared.clone();
        assert!(probe.state.lock().unwrap().connected);

        handle.stop().await;

        let state = probe.state.lock().unwrap().clone();
        assert_eq!(state, ControlSurfaceState::default());
        assert!(probe.registry.lock().unwrap().is_empty());

        // The client observed a clean shutdown, not an abrupt drop.
        let mut saw_clean_close = false;
        while let Ok(Some(Ok(msg))) = timeout(Duration::from_secs(2), ws.next()).await {
            if let WsMessage::Close(Some(frame)) = msg {
                assert_eq!(frame.code, CloseCode::Normal);
                saw_clean_close = true;
                break;
            }
        }
        assert!(saw_clean_close, "expected close frame with clean code");
    }
}
