//! Data shapes exchanged through the typed API.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─── Extensions ─────────────────────────────────────────────────────────

/// What `get-installed-extensions` reports for one loaded extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionDetails {
    pub package_name: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub version: String,
    pub has_started: bool,
    pub entry: String,
    #[serde(default)]
    pub preferences: Vec<PreferenceDescriptor>,
    pub extension_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_icon: Option<String>,
}

/// One entry of an extension's declared preference schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceDescriptor {
    pub key: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type", default = "default_preference_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub default: Value,
    /// Widget-specific fields (choices, placeholder, ...) passed through as-is.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_preference_kind() -> String {
    "text".to_string()
}

// ─── Accounts ───────────────────────────────────────────────────────────

/// An account an extension offers the user to log into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountDetails {
    pub id: String,
    /// Stamped by the sandbox; extensions cannot claim another's account.
    #[serde(default)]
    pub package_name: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bg_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub logged_in: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

// ─── Context menus ──────────────────────────────────────────────────────

/// Where a context-menu entry shows up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextMenuType {
    Songs,
    Playlist,
    Queue,
    GeneralSongs,
    GeneralPlaylist,
    PlaylistContent,
    CurrentSong,
}

/// A context-menu entry. `id` and `package_name` are assigned by the sandbox
/// at registration time and ignored when supplied by an extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextMenuItem {
    #[serde(default)]
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub package_name: String,
    #[serde(rename = "type")]
    pub menu_type: ContextMenuType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ContextMenuItem>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
}

// ─── Extra events ───────────────────────────────────────────────────────

/// Events the application broadcasts to extensions with
/// `extra-extension-events`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExtraEventType {
    RequestedPlaylists,
    RequestedPlaylistSongs,
    OauthCallback,
    SongQueueChanged,
    Seeked,
    VolumeChanged,
    PlayerStateChanged,
    SongChanged,
    PreferenceChanged,
    PlaybackDetailsRequested,
    CustomRequest,
    RequestedSearchResult,
    RequestedRecommendations,
    RequestedLyrics,
    RequestedArtistSongs,
    RequestedAlbumSongs,
    SongAdded,
    SongRemoved,
    PlaylistAdded,
    PlaylistRemoved,
    #[serde(rename = "requestedSongFromURL")]
    RequestedSongFromUrl,
    #[serde(rename = "requestedPlaylistFromURL")]
    RequestedPlaylistFromUrl,
}

impl ExtraEventType {
    /// Name of the extension export that handles this event.
    pub fn hook_name(self) -> &'static str {
        use ExtraEventType::*;
        match self {
            RequestedPlaylists => "handle_requested_playlists",
            RequestedPlaylistSongs => "handle_requested_playlist_songs",
            OauthCallback => "handle_oauth_callback",
            SongQueueChanged => "handle_song_queue_changed",
            Seeked => "handle_seeked",
            VolumeChanged => "handle_volume_changed",
            PlayerStateChanged => "handle_player_state_changed",
            SongChanged => "handle_song_changed",
            PreferenceChanged => "handle_preference_changed",
            PlaybackDetailsRequested => "handle_playback_details_requested",
            CustomRequest => "handle_custom_request",
            RequestedSearchResult => "handle_requested_search_result",
            RequestedRecommendations => "handle_requested_recommendations",
            RequestedLyrics => "handle_requested_lyrics",
            RequestedArtistSongs => "handle_requested_artist_songs",
            RequestedAlbumSongs => "handle_requested_album_songs",
            SongAdded => "handle_song_added",
            SongRemoved => "handle_song_removed",
            PlaylistAdded => "handle_playlist_added",
            PlaylistRemoved => "handle_playlist_removed",
            RequestedSongFromUrl => "handle_requested_song_from_url",
            RequestedPlaylistFromUrl => "handle_requested_playlist_from_url",
        }
    }
}

/// Payload of `extra-extension-events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraEventRequest {
    #[serde(rename = "type")]
    pub event_type: ExtraEventType,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_name: Option<String>,
}
