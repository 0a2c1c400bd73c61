//! Control-surface client: connection lifecycle, retry/backoff state machine,
//! health-check ping, and the optimistic local state mirror.
//!
//! The engine owns the link. Embedding UIs talk to it through a
//! [`ClientHandle`] and observe it through `watch` channels, so a dead host
//! surfaces as a degraded status ("Retrying (n/10)", slow polling) rather
//! than an error path in the UI.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::{BridgeConfig, ReconnectConfig};
use crate::error::{Error, Result};
use crate::protocol::{Envelope, KeepAlive, SURFACE_SOURCE};
use crate::state::ControlSurfaceState;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reconnection schedule: bounded exponential backoff, then fixed-interval
/// slow polling.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_fast_attempts: u32,
    pub slow_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for RetryPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_fast_attempts: config.max_fast_attempts,
            slow_interval: Duration::from_millis(config.slow_interval_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (1-based). Fast attempts grow
    /// `base * multiplier^(n-1)` clamped to `max_delay`; beyond the fast
    /// ceiling the schedule is a fixed slow interval with no further growth.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt > self.max_fast_attempts {
            return self.slow_interval;
        }
        let exponent = attempt.saturating_sub(1) as i32;
        let ms = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = ms.min(self.max_delay.as_millis() as f64);
        Duration::from_secs_f64(capped / 1000.0)
    }
}

/// Link state visible to the embedding UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Connecting,
    Connected,
    Retrying { attempt: u32, limit: u32 },
    SlowPolling,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub retry: RetryPolicy,
    pub ping_interval: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            retry: RetryPolicy::default(),
            ping_interval: Duration::from_millis(ReconnectConfig::default().ping_interval_ms),
        }
    }

    /// Client settings for a surface on the same machine as the host.
    pub fn from_bridge(config: &BridgeConfig) -> Self {
        Self {
            url: config.surface_url(),
            retry: RetryPolicy::from(&config.reconnect),
            ping_interval: Duration::from_millis(config.reconnect.ping_interval_ms),
        }
    }
}

enum Command {
    SendAction { action: String, payload: Value },
    ForceReconnect,
    Shutdown,
}

enum SessionEnd {
    CleanClosed,
    Dropped,
    ForceReconnect,
    Shutdown,
}

pub struct SurfaceClient;

impl SurfaceClient {
    /// Spawn the reconnection engine. The first attempt happens immediately.
    pub fn connect(config: ClientConfig) -> ClientHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (status_tx, status_rx) = watch::channel(LinkStatus::Connecting);
        let (state_tx, state_rx) = watch::channel(ControlSurfaceState::default());
        let (update_tx, _) = broadcast::channel(64);
        let engine = Engine {
            config,
            cmd_rx,
            status_tx,
            state_tx,
            update_tx: update_tx.clone(),
            pending: VecDeque::new(),
        };
        let task = tokio::spawn(engine.run());
        ClientHandle {
            cmd_tx,
            status_rx,
            state_rx,
            update_tx,
            task,
        }
    }
}

/// Handle to a running client engine.
pub struct ClientHandle {
    cmd_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<LinkStatus>,
    state_rx: watch::Receiver<ControlSurfaceState>,
    update_tx: broadcast::Sender<Envelope>,
    task: JoinHandle<()>,
}

impl ClientHandle {
    /// Issue a command toward the host. While disconnected this triggers an
    /// immediate connection attempt — interactive latency never inherits the
    /// background retry cadence — and the action is delivered once the link
    /// is up.
    pub async fn send_action(&self, action: &str, payload: Value) -> Result<()> {
        self.cmd_tx
            .send(Command::SendAction {
                action: action.to_string(),
                payload,
            })
            .await
            .map_err(|_| Error::Closed)
    }

    /// Close any existing link with the clean-shutdown code, reset backoff,
    /// and connect again immediately, bypassing any scheduled delay.
    pub async fn force_reconnect(&self) -> Result<()> {
        self.cmd_tx
            .send(Command::ForceReconnect)
            .await
            .map_err(|_| Error::Closed)
    }

    /// Close the link cleanly and end the engine.
    pub async fn shutdown(self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
        let _ = self.task.await;
    }

    pub fn status(&self) -> watch::Receiver<LinkStatus> {
        self.status_rx.clone()
    }

    /// The local state mirror: optimistic guesses applied on send, overwritten
    /// by every authoritative broadcast from the host.
    pub fn state(&self) -> watch::Receiver<ControlSurfaceState> {
        self.state_rx.clone()
    }

    /// Every envelope received from the host, for display/logging purposes.
    pub fn updates(&self) -> broadcast::Receiver<Envelope> {
        self.update_tx.subscribe()
    }
}

struct Engine {
    config: ClientConfig,
    cmd_rx: mpsc::Receiver<Command>,
    status_tx: watch::Sender<LinkStatus>,
    state_tx: watch::Sender<ControlSurfaceState>,
    update_tx: broadcast::Sender<Envelope>,
    pending: VecDeque<Envelope>,
}

impl Engine {
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        loop {
            let _ = self.status_tx.send(LinkStatus::Connecting);
            match connect_async(&self.config.url).await {
                Ok((ws, _response)) => {
                    tracing::info!(url = %self.config.url, "surface link established");
                    attempt = 0;
                    let _ = self.status_tx.send(LinkStatus::Connected);
                    match self.run_session(ws).await {
                        SessionEnd::CleanClosed => {
                            tracing::info!("host closed the link cleanly, not reconnecting");
                            let _ = self.status_tx.send(LinkStatus::Closed);
                            return;
                        }
                        SessionEnd::Shutdown => {
                            let _ = self.status_tx.send(LinkStatus::Closed);
                            return;
                        }
                        SessionEnd::ForceReconnect => continue,
                        SessionEnd::Dropped => {
                            tracing::warn!("surface link dropped");
                        }
                    }
                }
                Err(err) => {
                    tracing::debug!(url = %self.config.url, error = %err, "connect attempt failed");
                }
            }

            attempt += 1;
            let limit = self.config.retry.max_fast_attempts;
            let _ = self.status_tx.send(if attempt > limit {
                LinkStatus::SlowPolling
            } else {
                LinkStatus::Retrying { attempt, limit }
            });
            let delay = self.config.retry.delay_for(attempt);
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");

            tokio::select! {
                _ = sleep(delay) => {}
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(Command::Shutdown) => {
                        let _ = self.status_tx.send(LinkStatus::Closed);
                        return;
                    }
                    Some(Command::ForceReconnect) => {
                        attempt = 0;
                    }
                    Some(Command::SendAction { action, payload }) => {
                        // User input while disconnected: queue the action and
                        // attempt right now instead of waiting out the timer.
                        self.queue_action(action, payload);
                    }
                },
            }
        }
    }

    async fn run_session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();

        // Deliver anything queued while disconnected, in order.
        while let Some(envelope) = self.pending.pop_front() {
            match envelope.encode() {
                Ok(raw) => {
                    if sink.send(WsMessage::Text(raw)).await.is_err() {
                        self.pending.push_front(envelope);
                        return SessionEnd::Dropped;
                    }
                }
                Err(err) => tracing::warn!(error = %err, "queued action encode failed"),
            }
        }

        let mut ping = tokio::time::interval(self.config.ping_interval);
        loop {
            tokio::select! {
                _ = ping.tick() => {
                    // Advisory health check; only a real close/error event
                    // triggers reconnection.
                    if let Ok(raw) = KeepAlive::ping().encode() {
                        if sink.send(WsMessage::Text(raw)).await.is_err() {
                            return SessionEnd::Dropped;
                        }
                    }
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(Command::Shutdown) => {
                        let _ = sink.send(clean_close()).await;
                        return SessionEnd::Shutdown;
                    }
                    Some(Command::ForceReconnect) => {
                        let _ = sink.send(clean_close()).await;
                        return SessionEnd::ForceReconnect;
                    }
                    Some(Command::SendAction { action, payload }) => {
                        self.apply_optimistic(&action, &payload);
                        let envelope = Envelope::new(SURFACE_SOURCE, &action, payload);
                        match envelope.encode() {
                            Ok(raw) => {
                                if sink.send(WsMessage::Text(raw)).await.is_err() {
                                    self.pending.push_back(envelope);
                                    return SessionEnd::Dropped;
                                }
                            }
                            Err(err) => tracing::warn!(error = %err, "action encode failed"),
                        }
                    }
                },
                msg = stream.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => self.handle_inbound(&text),
                    Some(Ok(WsMessage::Close(frame))) => {
                        let clean = frame
                            .as_ref()
                            .map(|f| f.code == CloseCode::Normal)
                            .unwrap_or(false);
                        return if clean {
                            SessionEnd::CleanClosed
                        } else {
                            SessionEnd::Dropped
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(error = %err, "surface link error");
                        return SessionEnd::Dropped;
                    }
                    None => return SessionEnd::Dropped,
                },
            }
        }
    }

    fn queue_action(&mut self, action: String, payload: Value) {
        self.apply_optimistic(&action, &payload);
        self.pending
            .push_back(Envelope::new(SURFACE_SOURCE, &action, payload));
    }

    fn handle_inbound(&mut self, text: &str) {
        if let Some(reply) = KeepAlive::parse_pong(text) {
            tracing::trace!(timestamp = reply.timestamp, "pong");
            return;
        }
        match Envelope::decode(text) {
            Ok(envelope) => {
                self.apply_authoritative(&envelope);
                let _ = self.update_tx.send(envelope);
            }
            Err(err) => tracing::debug!(error = %err, "unparseable message from host"),
        }
    }

    /// Flip the local mirror the instant a command goes out, masking
    /// round-trip latency. The next authoritative broadcast overwrites the
    /// guess; the mirror never blocks waiting for confirmation.
    fn apply_optimistic(&mut self, action: &str, payload: &Value) {
        self.state_tx.send_modify(|state| match action {
            "playTrack" => state.is_playing = true,
            "pauseTrack" => state.is_playing = false,
            "stopTrack" => {
                state.is_playing = false;
                state.position = 0.0;
            }
            "setVolume" => {
                if let Some(v) = payload.get("volume").and_then(Value::as_f64) {
                    state.volume = v;
                }
            }
            "seekToPosition" => {
                if let Some(v) = payload.get("position").and_then(Value::as_f64) {
                    state.position = v;
                }
            }
            "toggleLoop" => {
                state.loop_enabled = payload
                    .get("enabled")
                    .and_then(Value::as_bool)
                    .unwrap_or(!state.loop_enabled);
            }
            "toggleMute" => {
                state.mute_enabled = payload
                    .get("enabled")
                    .and_then(Value::as_bool)
                    .unwrap_or(!state.mute_enabled);
            }
            _ => {}
        });
    }

    /// Authoritative updates always win over optimistic guesses.
    fn apply_authoritative(&mut self, envelope: &Envelope) {
        let payload = &envelope.payload;
        self.state_tx.send_modify(|state| match envelope.action.as_str() {
            "connectionStateUpdate" => {
                match serde_json::from_value::<ControlSurfaceState>(payload.clone()) {
                    Ok(full) => *state = full,
                    Err(err) => tracing::debug!(error = %err, "bad connectionStateUpdate"),
                }
            }
            "audioStateUpdate" => {
                if let Some(v) = payload.get("isPlaying").and_then(Value::as_bool) {
                    state.is_playing = v;
                }
                if let Some(v) = payload.get("volume").and_then(Value::as_f64) {
                    state.volume = v;
                }
                if let Some(v) = payload.get("position").and_then(Value::as_f64) {
                    state.position = v;
                }
                if let Some(v) = payload.get("duration").and_then(Value::as_f64) {
                    state.duration = v;
                }
                if let Some(song) = payload.get("currentSong") {
                    state.current_song = serde_json::from_value(song.clone()).ok();
                }
            }
            "positionUpdate" => {
                if let Some(v) = payload.get("position").and_then(Value::as_f64) {
                    state.position = v;
                }
                if let Some(v) = payload.get("duration").and_then(Value::as_f64) {
                    state.duration = v;
                }
            }
            "loopStateUpdate" => {
                if let Some(v) = payload.get("loopEnabled").and_then(Value::as_bool) {
                    state.loop_enabled = v;
                }
            }
            "muteStateUpdate" => {
                if let Some(v) = payload.get("muteEnabled").and_then(Value::as_bool) {
                    state.mute_enabled = v;
                }
            }
            _ => {}
        });
    }
}

fn clean_close() -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "surface shutdown".into(),
    }))
}
