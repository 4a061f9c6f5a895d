//! Wire envelopes and the message-type schema.
//!
//! Three envelope shapes cross the host/sandbox boundary:
//!
//! - `Request { type, channel, data, originName? }`
//! - `Reply { channel, data?, error? }`
//! - `Event { type, data, targetName? }`
//!
//! Whether a request expects a reply is an attribute of its [`MessageType`],
//! looked up once by the [`Endpoint`](crate::Endpoint), never by callers.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Channel ────────────────────────────────────────────────────────────

/// Correlation token pairing one request with its single reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel(String);

impl Channel {
    /// Mint a fresh, globally unique channel.
    pub fn mint() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Channel {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─── Message types ──────────────────────────────────────────────────────

/// Whether the initiator waits for a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    MustReply,
    FireAndForget,
}

/// Where the host sends a sandbox-originated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Host to sandbox; not routed by the host.
    Sandbox,
    /// The user-facing surface (may not exist yet).
    Ui,
    /// The song/playlist database collaborator.
    Library,
    /// Preference storage, plain or secret-store.
    Preferences,
}

/// Every request type that crosses the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    // ── Host → sandbox ───────────────────────────────────────────────
    FindNewExtensions,
    GetInstalledExtensions,
    GetExtensionIcon,
    ToggleExtensionStatus,
    RemoveExtension,
    ExtraExtensionEvents,
    GetExtensionContextMenu,
    OnClickedContextMenu,
    SetLogLevel,
    GetAccounts,
    PerformAccountLogin,
    GetDisplayName,
    GetExtensionPreferences,
    StopProcess,

    // ── Sandbox → host: library ──────────────────────────────────────
    GetSongs,
    GetEntity,
    AddSongs,
    UpdateSong,
    RemoveSong,
    AddPlaylist,
    AddToPlaylist,

    // ── Sandbox → host: preferences ──────────────────────────────────
    GetPreferences,
    SetPreferences,
    GetSecurePreferences,
    SetSecurePreferences,

    // ── Sandbox → host: user interface ───────────────────────────────
    RegisterOauth,
    OpenExternalUrl,
    ShowToast,
    RegisterAccount,
    UnregisterAccount,
    GetCurrentSong,
    GetPlayerState,
    GetVolume,
    GetTime,
    GetQueue,
    Play,
    Pause,
    Next,
    Prev,

    // ── Sandbox → host: notifications ────────────────────────────────
    UpdatePreferences,
    ExtensionUpdated,
}

impl MessageType {
    /// Reply expectation for this type.
    pub fn delivery(self) -> Delivery {
        match self {
            MessageType::UpdatePreferences | MessageType::ExtensionUpdated => {
                Delivery::FireAndForget
            }
            _ => Delivery::MustReply,
        }
    }

    pub fn is_fire_and_forget(self) -> bool {
        self.delivery() == Delivery::FireAndForget
    }

    /// Destination of this type when the sandbox originates it.
    pub fn route(self) -> Route {
        use MessageType::*;
        match self {
            FindNewExtensions
            | GetInstalledExtensions
            | GetExtensionIcon
            | ToggleExtensionStatus
            | RemoveExtension
            | ExtraExtensionEvents
            | GetExtensionContextMenu
            | OnClickedContextMenu
            | SetLogLevel
            | GetAccounts
            | PerformAccountLogin
            | GetDisplayName
            | GetExtensionPreferences
            | StopProcess => Route::Sandbox,

            GetSongs | GetEntity | AddSongs | UpdateSong | RemoveSong | AddPlaylist
            | AddToPlaylist => Route::Library,

            GetPreferences | SetPreferences | GetSecurePreferences | SetSecurePreferences => {
                Route::Preferences
            }

            RegisterOauth | OpenExternalUrl | ShowToast | RegisterAccount | UnregisterAccount
            | GetCurrentSong | GetPlayerState | GetVolume | GetTime | GetQueue | Play | Pause
            | Next | Prev | UpdatePreferences | ExtensionUpdated => Route::Ui,
        }
    }

    /// Map an extension-side host function name (`get_songs`) to its
    /// sandbox→host message type.
    pub fn from_host_function(name: &str) -> Option<Self> {
        let kebab = name.replace('_', "-");
        let message_type: MessageType =
            serde_json::from_value(Value::String(kebab)).ok()?;
        (message_type.route() != Route::Sandbox).then_some(message_type)
    }
}

// ─── Envelopes ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub channel: Channel,
    #[serde(default)]
    pub data: Value,
    #[serde(rename = "originName", default, skip_serializing_if = "Option::is_none")]
    pub origin_name: Option<String>,
}

impl Request {
    pub fn new(message_type: MessageType, data: Value) -> Self {
        Self {
            message_type,
            channel: Channel::mint(),
            data,
            origin_name: None,
        }
    }

    pub fn with_origin(mut self, origin_name: impl Into<String>) -> Self {
        self.origin_name = Some(origin_name.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub channel: Channel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    pub fn ok(channel: Channel, data: Value) -> Self {
        Self {
            channel,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(channel: Channel, error: impl Into<String>) -> Self {
        Self {
            channel,
            data: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(rename = "targetName", default, skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
}

/// One framed message. The shapes are distinguished structurally: a request
/// has `type` and `channel`, a reply has `channel` only, an event has `type`
/// only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    Request(Request),
    Reply(Reply),
    Event(Event),
}

impl Envelope {
    /// Decode a raw frame, discriminating on which keys are present.
    ///
    /// Unlike the untagged derive, a request with an unknown `type` is
    /// reported as malformed instead of being mistaken for a reply.
    pub fn from_value(value: Value) -> Result<Self, crate::ProtocolError> {
        let has_type = value.get("type").is_some();
        let has_channel = value.get("channel").is_some();
        let envelope = match (has_type, has_channel) {
            (true, true) => serde_json::from_value(value).map(Envelope::Request),
            (false, true) => serde_json::from_value(value).map(Envelope::Reply),
            (true, false) => serde_json::from_value(value).map(Envelope::Event),
            (false, false) => {
                return Err(crate::ProtocolError::MalformedEnvelope(
                    "envelope has neither `type` nor `channel`".into(),
                ))
            }
        };
        envelope.map_err(|e| crate::ProtocolError::MalformedEnvelope(e.to_string()))
    }

    pub fn channel(&self) -> Option<&Channel> {
        match self {
            Envelope::Request(r) => Some(&r.channel),
            Envelope::Reply(r) => Some(&r.channel),
            Envelope::Event(_) => None,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
