//! Canonical control-surface state and the domain-event ingestion shapes.
//!
//! The host's domain layer is the sole source of truth. The state here only
//! mirrors it for broadcast: every mutation arrives as a [`DomainEvent`]
//! through the server's single ingestion path, and the store never originates
//! a change on its own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// The slice of a song a control surface can display. The song database
/// itself lives in the host application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Song {
    #[serde(default)]
    pub id: Option<i64>,
    pub title: String,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub file_path: Option<String>,
}

/// Canonical snapshot the host believes is true. One instance per host
/// process; reset to defaults when the listening socket is stopped, persists
/// across client connect/disconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControlSurfaceState {
    pub connected: bool,
    pub connection_count: usize,
    pub current_song: Option<Song>,
    pub is_playing: bool,
    pub volume: f64,
    pub position: f64,
    pub duration: f64,
    pub loop_enabled: bool,
    pub mute_enabled: bool,
    pub last_activity: Option<DateTime<Utc>>,
}

impl Default for ControlSurfaceState {
    fn default() -> Self {
        Self {
            connected: false,
            connection_count: 0,
            current_song: None,
            is_playing: false,
            volume: 1.0,
            position: 0.0,
            duration: 0.0,
            loop_enabled: false,
            mute_enabled: false,
            last_activity: None,
        }
    }
}

impl ControlSurfaceState {
    /// Apply an authoritative update. The relevant fields are fully
    /// overwritten; nothing is merged or guessed.
    pub fn apply(&mut self, event: &DomainEvent) {
        match event {
            DomainEvent::SongChanged { song } => {
                self.duration = song.as_ref().and_then(|s| s.duration).unwrap_or(0.0);
                self.position = 0.0;
                self.current_song = song.clone();
            }
            DomainEvent::PlaybackChanged { is_playing } => {
                self.is_playing = *is_playing;
            }
            DomainEvent::PositionChanged { position, duration } => {
                self.position = round2(*position);
                self.duration = round2(*duration);
            }
            DomainEvent::VolumeChanged { volume } => {
                self.volume = *volume;
            }
            DomainEvent::LoopChanged { enabled } => {
                self.loop_enabled = *enabled;
            }
            DomainEvent::MuteChanged { enabled } => {
                self.mute_enabled = *enabled;
            }
            DomainEvent::HotkeyTabChanged { .. } => {}
        }
        self.last_activity = Some(Utc::now());
    }

    /// The `audioStateUpdate` payload for the current snapshot.
    pub fn audio_payload(&self) -> Value {
        serde_json::json!({
            "currentSong": self.current_song,
            "isPlaying": self.is_playing,
            "volume": self.volume,
            "position": self.position,
            "duration": self.duration,
        })
    }
}

/// Percentage of the track elapsed, defined as 0 when duration is 0.
pub fn position_percentage(position: f64, duration: f64) -> f64 {
    if duration == 0.0 {
        0.0
    } else {
        round2(position / duration * 100.0)
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SongFields {
    song: Option<Song>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaybackFields {
    is_playing: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionFields {
    position: f64,
    #[serde(default)]
    duration: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct VolumeFields {
    volume: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct ToggleFields {
    enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TabFields {
    from_tab: u8,
    to_tab: u8,
}

/// An authoritative event from the host's domain layer.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    SongChanged { song: Option<Song> },
    PlaybackChanged { is_playing: bool },
    PositionChanged { position: f64, duration: f64 },
    VolumeChanged { volume: f64 },
    LoopChanged { enabled: bool },
    MuteChanged { enabled: bool },
    HotkeyTabChanged { from_tab: u8, to_tab: u8 },
}

impl DomainEvent {
    /// Normalize an ingested JSON value. Accepts both the full envelope shape
    /// (`{action, payload, ...}`) and the legacy flat shape
    /// (`{type, ...fields}`) without special-casing call sites.
    pub fn from_value(value: &Value) -> Result<DomainEvent> {
        let Some(obj) = value.as_object() else {
            return Err(Error::Parse("domain event must be a JSON object".to_string()));
        };
        if let Some(action) = obj.get("action").and_then(Value::as_str) {
            let payload = obj.get("payload").cloned().unwrap_or(Value::Null);
            Self::from_parts(action, payload)
        } else if let Some(kind) = obj.get("type").and_then(Value::as_str) {
            Self::from_parts(kind, value.clone())
        } else {
            Err(Error::MissingAction)
        }
    }

    fn from_parts(name: &str, fields: Value) -> Result<DomainEvent> {
        fn parse<T: serde::de::DeserializeOwned>(name: &str, fields: Value) -> Result<T> {
            serde_json::from_value(fields)
                .map_err(|err| Error::Parse(format!("bad {name} event: {err}")))
        }

        match name {
            "songChanged" => {
                let f: SongFields = parse(name, fields)?;
                Ok(DomainEvent::SongChanged { song: f.song })
            }
            "playbackChanged" | "playbackStateChanged" => {
                let f: PlaybackFields = parse(name, fields)?;
                Ok(DomainEvent::PlaybackChanged {
                    is_playing: f.is_playing,
                })
            }
            "positionChanged" => {
                let f: PositionFields = parse(name, fields)?;
                Ok(DomainEvent::PositionChanged {
                    position: f.position,
                    duration: f.duration,
                })
            }
            "volumeChanged" => {
                let f: VolumeFields = parse(name, fields)?;
                Ok(DomainEvent::VolumeChanged { volume: f.volume })
            }
            "loopChanged" => {
                let f: ToggleFields = parse(name, fields)?;
                Ok(DomainEvent::LoopChanged { enabled: f.enabled })
            }
            "muteChanged" => {
                let f: ToggleFields = parse(name, fields)?;
                Ok(DomainEvent::MuteChanged { enabled: f.enabled })
            }
            "hotkeyTabChanged" => {
                let f: TabFields = parse(name, fields)?;
                Ok(DomainEvent::HotkeyTabChanged {
                    from_tab: f.from_tab,
                    to_tab: f.to_tab,
                })
            }
            other => Err(Error::UnknownAction(other.to_string())),
        }
    }

    /// Outbound action this event broadcasts as.
    pub fn broadcast_action(&self) -> &'static str {
        match self {
            DomainEvent::SongChanged { .. }
            | DomainEvent::PlaybackChanged { .. }
            | DomainEvent::VolumeChanged { .. } => "audioStateUpdate",
            DomainEvent::PositionChanged { .. } => "positionUpdate",
            DomainEvent::LoopChanged { .. } => "loopStateUpdate",
            DomainEvent::MuteChanged { .. } => "muteStateUpdate",
            DomainEvent::HotkeyTabChanged { .. } => "hotkeyStateUpdate",
        }
    }

    /// Broadcast payload, built from the snapshot taken after the event was
    /// applied.
    pub fn broadcast_payload(&self, state: &ControlSurfaceState) -> Value {
        match self {
            DomainEvent::SongChanged { .. }
            | DomainEvent::PlaybackChanged { .. }
            | DomainEvent::VolumeChanged { .. } => state.audio_payload(),
            DomainEvent::PositionChanged { .. } => serde_json::json!({
                "position": state.position,
                "duration": state.duration,
                "percentage": position_percentage(state.position, state.duration),
            }),
            DomainEvent::LoopChanged { .. } => serde_json::json!({
                "loopEnabled": state.loop_enabled,
            }),
            DomainEvent::MuteChanged { .. } => serde_json::json!({
                "muteEnabled": state.mute_enabled,
            }),
            DomainEvent::HotkeyTabChanged { from_tab, to_tab } => serde_json::json!({
                "fromTab": from_tab,
                "toTab": to_tab,
                "activeTab": to_tab,
            }),
        }
    }

    /// Deduplication key for events that can fire redundantly from more than
    /// one trigger path. Only hotkey tab switches need one.
    pub fn dedup_key(&self) -> Option<String> {
        match self {
            DomainEvent::HotkeyTabChanged { from_tab, to_tab } => {
                Some(format!("{from_tab}->{to_tab}"))
            }
            _ => None,
        }
    }
}
