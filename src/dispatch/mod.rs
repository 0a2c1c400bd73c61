//! Action dispatch: the registration table mapping inbound action names to
//! handlers, and the built-in transport/volume/hotkey handlers.
//!
//! Handlers perform exactly one domain effect (a [`DomainCommand`] pushed to
//! the host's command channel) and answer with a single `${action}Response`
//! confirming acceptance — the authoritative state broadcast follows later
//! through the ingestion path. The command channel is bounded and pushed with
//! `try_send`, so a stalled domain layer degrades to an error response
//! instead of wedging a connection's read loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::{Envelope, ErrorCode, HOST_SOURCE};
use crate::state::ControlSurfaceState;

/// Hotkey tab banks supported by the host UI.
pub const MIN_HOTKEY_TAB: u8 = 1;
pub const MAX_HOTKEY_TAB: u8 = 5;

/// A command issued by the core toward the host's domain layer. The core
/// never reads domain state directly; these are the only calls back.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainCommand {
    Play {
        song_id: Option<i64>,
        file_path: Option<String>,
    },
    Pause,
    Stop,
    SetVolume(f64),
    Seek(f64),
    SetLoop(Option<bool>),
    SetMute(Option<bool>),
    SetHotkeyTab(u8),
}

/// Context handed to every handler invocation.
#[derive(Clone)]
pub struct HandlerCtx {
    pub domain: mpsc::Sender<DomainCommand>,
    pub state: Arc<Mutex<ControlSurfaceState>>,
}

type Handler = Box<dyn Fn(&HandlerCtx, &Value) -> Result<Value> + Send + Sync>;

/// Registration table. Built once at startup, immutable afterwards.
#[derive(Default)]
pub struct ActionTable {
    handlers: HashMap<String, Handler>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table pre-loaded with the built-in control-surface actions.
    pub fn with_builtin() -> Self {
        let mut table = Self::new();

        table.register("playTrack", |ctx, payload| {
            let song_id = payload.get("songId").and_then(Value::as_i64);
            let file_path = payload
                .get("filePath")
                .and_then(Value::as_str)
                .map(str::to_string);
            submit(
                ctx,
                DomainCommand::Play {
                    song_id,
                    file_path: file_path.clone(),
                },
            )?;
            Ok(serde_json::json!({ "songId": song_id, "filePath": file_path }))
        });

        table.register("pauseTrack", |ctx, _payload| {
            submit(ctx, DomainCommand::Pause)?;
            Ok(Value::Null)
        });

        table.register("stopTrack", |ctx, _payload| {
            submit(ctx, DomainCommand::Stop)?;
            Ok(Value::Null)
        });

        table.register("setVolume", |ctx, payload| {
            let volume = payload.get("volume").and_then(Value::as_f64).ok_or_else(|| {
                Error::Validation {
                    code: ErrorCode::InvalidVolume,
                    message: "volume must be a number".to_string(),
                }
            })?;
            if !(0.0..=1.0).contains(&volume) {
                return Err(Error::Validation {
                    code: ErrorCode::InvalidVolume,
                    message: format!("volume must be between 0 and 1, got {volume}"),
                });
            }
            submit(ctx, DomainCommand::SetVolume(volume))?;
            Ok(serde_json::json!({ "volume": volume }))
        });

        table.register("seekToPosition", |ctx, payload| {
            let position = payload
                .get("position")
                .and_then(Value::as_f64)
                .ok_or_else(|| Error::Validation {
                    code: ErrorCode::InvalidPosition,
                    message: "position must be a number".to_string(),
                })?;
            if !position.is_finite() || position < 0.0 {
                return Err(Error::Validation {
                    code: ErrorCode::InvalidPosition,
                    message: format!("position must be >= 0, got {position}"),
                });
            }
            submit(ctx, DomainCommand::Seek(position))?;
            Ok(serde_json::json!({ "position": position }))
        });

        table.register("toggleLoop", |ctx, payload| {
            let enabled = payload.get("enabled").and_then(Value::as_bool);
            submit(ctx, DomainCommand::SetLoop(enabled))?;
            Ok(serde_json::json!({ "enabled": enabled }))
        });

        table.register("toggleMute", |ctx, payload| {
            let enabled = payload.get("enabled").and_then(Value::as_bool);
            submit(ctx, DomainCommand::SetMute(enabled))?;
            Ok(serde_json::json!({ "enabled": enabled }))
        });

        table.register("setHotkeyTab", |ctx, payload| {
            let tab = payload.get("tab").and_then(Value::as_u64);
            match tab {
                Some(tab) if (MIN_HOTKEY_TAB as u64..=MAX_HOTKEY_TAB as u64).contains(&tab) => {
                    submit(ctx, DomainCommand::SetHotkeyTab(tab as u8))?;
                    Ok(serde_json::json!({ "tab": tab }))
                }
                _ => Err(Error::Validation {
                    code: ErrorCode::InvalidTabNumber,
                    message: format!(
                        "tab must be between {MIN_HOTKEY_TAB} and {MAX_HOTKEY_TAB}"
                    ),
                }),
            }
        });

        table.register("getState", |ctx, _payload| {
            let snapshot = ctx.state.lock().unwrap().clone();
            Ok(serde_json::json!({ "state": snapshot }))
        });

        table
    }

    /// Register a handler. Call before the server starts; the table is never
    /// mutated per-connection.
    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&HandlerCtx, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_string(), Box::new(handler));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Look up and run the handler for an inbound action. Always produces a
    /// response envelope: unknown actions get `errorResponse UNKNOWN_ACTION`,
    /// handler failures are caught here and answered with the failing code —
    /// a misbehaving handler never takes down the read loop.
    pub fn dispatch(&self, ctx: &HandlerCtx, action: &str, payload: &Value) -> Envelope {
        let Some(handler) = self.handlers.get(action) else {
            tracing::warn!(action, "dispatch: unknown action");
            return Envelope::error_response(
                HOST_SOURCE,
                ErrorCode::UnknownAction,
                &format!("unknown action: {action}"),
                Some(action),
            );
        };

        match handler(ctx, payload) {
            Ok(result) => {
                let mut fields = match result {
                    Value::Object(map) => map,
                    Value::Null => Map::new(),
                    other => {
                        let mut map = Map::new();
                        map.insert("result".to_string(), other);
                        map
                    }
                };
                fields.insert("success".to_string(), Value::Bool(true));
                Envelope::response(HOST_SOURCE, action, Value::Object(fields))
            }
            Err(err) => {
                tracing::warn!(action, error = %err, "dispatch: handler rejected action");
                Envelope::action_failure(HOST_SOURCE, action, err.wire_code(), &err.to_string())
            }
        }
    }
}

fn submit(ctx: &HandlerCtx, cmd: DomainCommand) -> Result<()> {
    ctx.domain
        .try_send(cmd)
        .map_err(|err| Error::Execution(format!("domain command channel unavailable: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx() -> (HandlerCtx, mpsc::Receiver<DomainCommand>) {
        let (tx, rx) = mpsc::channel(8);
        (
            HandlerCtx {
                domain: tx,
                state: Arc::new(Mutex::new(ControlSurfaceState::default())),
            },
            rx,
        )
    }

    #[test]
    fn unknown_action_yields_error_response() {
        let table = ActionTable::with_builtin();
        let (ctx, _rx) = test_ctx();
        let response = table.dispatch(&ctx, "warpTen", &Value::Null);
        assert_eq!(response.action, "errorResponse");
        assert_eq!(response.payload["success"], false);
        assert_eq!(response.payload["error"]["code"], "UNKNOWN_ACTION");
        assert_eq!(response.payload["action"], "warpTen");
    }

    #[test]
    fn out_of_range_volume_is_rejected_without_a_domain_effect() {
        let table = ActionTable::with_builtin();
        let (ctx, mut rx) = test_ctx();
        for bad in [serde_json::json!({"volume": 1.5}), serde_json::json!({"volume": -0.2}), serde_json::json!({})] {
            let response = table.dispatch(&ctx, "setVolume", &bad);
            assert_eq!(response.action, "setVolumeResponse");
            assert_eq!(response.payload["success"], false);
            assert_eq!(response.payload["error"]["code"], "INVALID_VOLUME");
        }
        assert!(rx.try_recv().is_err(), "no command may reach the domain");
        assert_eq!(
            *ctx.state.lock().unwrap(),
            ControlSurfaceState::default(),
            "store must be unchanged"
        );
    }

    #[test]
    fn valid_volume_is_accepted_and_forwarded() {
        let table = ActionTable::with_builtin();
        let (ctx, mut rx) = test_ctx();
        let response = table.dispatch(&ctx, "setVolume", &serde_json::json!({"volume": 0.75}));
        assert_eq!(response.action, "setVolumeResponse");
        assert_eq!(response.payload["success"], true);
        assert_eq!(response.payload["volume"], 0.75);
        assert_eq!(rx.try_recv().unwrap(), DomainCommand::SetVolume(0.75));
    }

    #[test]
    fn negative_position_is_rejected() {
        let table = ActionTable::with_builtin();
        let (ctx, mut rx) = test_ctx();
        let response =
            table.dispatch(&ctx, "seekToPosition", &serde_json::json!({"position": -3.0}));
        assert_eq!(response.payload["error"]["code"], "INVALID_POSITION");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn tab_number_must_be_in_supported_range() {
        let table = ActionTable::with_builtin();
        let (ctx, mut rx) = test_ctx();
        for bad in [0u64, 6, 250] {
            let response = table.dispatch(&ctx, "setHotkeyTab", &serde_json::json!({"tab": bad}));
            assert_eq!(response.payload["error"]["code"], "INVALID_TAB_NUMBER");
        }
        assert!(rx.try_recv().is_err());

        let response = table.dispatch(&ctx, "setHotkeyTab", &serde_json::json!({"tab": 3}));
        assert_eq!(response.payload["success"], true);
        assert_eq!(rx.try_recv().unwrap(), DomainCommand::SetHotkeyTab(3));
    }

    #[test]
    fn get_state_answers_from_the_snapshot_without_a_domain_round_trip() {
        let table = ActionTable::with_builtin();
        let (ctx, mut rx) = test_ctx();
        ctx.state.lock().unwrap().volume = 0.4;
        let response = table.dispatch(&ctx, "getState", &Value::Null);
        assert_eq!(response.action, "getStateResponse");
        assert_eq!(response.payload["success"], true);
        assert_eq!(response.payload["state"]["volume"], 0.4);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_domain_channel_degrades_to_execution_error() {
        let table = ActionTable::with_builtin();
        let (ctx, rx) = test_ctx();
        drop(rx);
        let response = table.dispatch(&ctx, "pauseTrack", &Value::Null);
        assert_eq!(response.payload["success"], false);
        assert_eq!(response.payload["error"]["code"], "EXECUTION_ERROR");
    }

    #[test]
    fn custom_registrations_extend_the_table() {
        let mut table = ActionTable::with_builtin();
        table.register("flashPanel", |_ctx, payload| {
            Ok(serde_json::json!({ "times": payload.get("times").and_then(Value::as_u64) }))
        });
        let (ctx, _rx) = test_ctx();
        let response = table.dispatch(&ctx, "flashPanel", &serde_json::json!({"times": 2}));
        assert_eq!(response.action, "flashPanelResponse");
        assert_eq!(response.payload["success"], true);
        assert_eq!(response.payload["times"], 2);
    }

    #[test]
    fn toggle_actions_accept_optional_enabled() {
        let table = ActionTable::with_builtin();
        let (ctx, mut rx) = test_ctx();

        let response = table.dispatch(&ctx, "toggleLoop", &Value::Null);
        assert_eq!(response.payload["success"], true);
        assert_eq!(rx.try_recv().unwrap(), DomainCommand::SetLoop(None));

        let response =
            table.dispatch(&ctx, "toggleMute", &serde_json::json!({"enabled": true}));
        assert_eq!(response.payload["success"], true);
        assert_eq!(rx.try_recv().unwrap(), DomainCommand::SetMute(Some(true)));
    }
}
