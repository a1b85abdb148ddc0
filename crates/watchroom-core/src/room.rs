use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::time::elapsed_secs;

/// Transient per-socket identity. A new one is issued on every reconnect.
pub type ConnectionId = u64;

/// Client-supplied identity that survives reconnects.
pub type UserId = String;

/// Reserved author name for server-synthesized chat lines.
pub const SYSTEM_USERNAME: &str = "System";

/// Length of server-generated room codes.
pub const ROOM_CODE_LEN: usize = 6;
pub const ROOM_CODE_MIN_LEN: usize = 3;
pub const ROOM_CODE_MAX_LEN: usize = 16;

/// Alphabet for generated room codes (no 0/O/1/I to avoid misreads).
const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Generate a random room code like `K7QX2M`.
pub fn generate_room_code() -> String {
    let mut rng = rand::rng();
    (0..ROOM_CODE_LEN)
        .map(|_| ROOM_CODE_ALPHABET[rng.random_range(0..ROOM_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Canonical (trimmed, uppercase) form of a room code. Room codes are
/// case-insensitive, so every lookup goes through this.
pub fn normalize_room_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Check a canonical room code: 3-16 chars of `A-Z`, `0-9`, `-`.
pub fn is_valid_room_code(code: &str) -> bool {
    (ROOM_CODE_MIN_LEN..=ROOM_CODE_MAX_LEN).contains(&code.len())
        && code
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'-')
}

/// One entry in a room's video queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    pub video_id: String,
    pub title: String,
    /// Seconds; 0 when unknown.
    pub duration: f64,
    pub thumbnail: String,
    pub added_by: String,
    pub added_at: u64,
}

impl QueueItem {
    pub fn new(
        video_id: String,
        title: String,
        duration: f64,
        thumbnail: String,
        added_by: String,
        now_ms: u64,
    ) -> Self {
        Self {
            id: generate_item_id(now_ms),
            video_id,
            title,
            duration,
            thumbnail,
            added_by,
            added_at: now_ms,
        }
    }
}

/// Time-ordered id with a random suffix to separate same-millisecond adds.
fn generate_item_id(now_ms: u64) -> String {
    format!("{now_ms:012x}-{:04x}", rand::random::<u16>())
}

/// Semantic hint attached to a playback update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackAction {
    Play,
    Pause,
    Sync,
    Seek,
}

/// The authoritative playback clock of a room: the host's last report plus
/// the server time at which it arrived.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub is_playing: bool,
    pub current_time: f64,
    pub last_update: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<PlaybackAction>,
}

impl PlaybackState {
    pub fn stopped(now_ms: u64) -> Self {
        Self {
            is_playing: false,
            current_time: 0.0,
            last_update: now_ms,
            action: None,
        }
    }

    /// Where a player following this clock should be at `now_ms`.
    pub fn estimated_time(&self, now_ms: u64) -> f64 {
        if self.is_playing {
            self.current_time + elapsed_secs(self.last_update, now_ms)
        } else {
            self.current_time
        }
    }
}

/// A chat line, user-authored or synthesized by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub username: String,
    pub message: String,
    pub timestamp: u64,
    pub is_host: bool,
    #[serde(default)]
    pub is_system: bool,
}

impl ChatMessage {
    pub fn from_user(username: &str, message: String, is_host: bool, now_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            message,
            timestamp: now_ms,
            is_host,
            is_system: false,
        }
    }

    pub fn system(message: String, now_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            username: SYSTEM_USERNAME.to_string(),
            message,
            timestamp: now_ms,
            is_host: false,
            is_system: true,
        }
    }
}

/// Public view of a room member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub user_id: UserId,
    pub username: String,
    pub socket_id: ConnectionId,
    pub is_host: bool,
    pub is_muted: bool,
    pub voice_connected: bool,
    pub joined_at: u64,
}

/// Coarse peer-connection health shown next to a voice participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    #[default]
    Good,
    Medium,
    Poor,
}

impl ConnectionQuality {
    /// Map a browser `RTCPeerConnection` / ICE connection state to a quality.
    pub fn from_peer_state(state: &str) -> Self {
        match state {
            "connected" | "completed" => Self::Good,
            "new" | "checking" => Self::Medium,
            _ => Self::Poor,
        }
    }
}

/// Public view of a member of a room's voice channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceParticipantInfo {
    pub user_id: UserId,
    pub username: String,
    pub is_muted: bool,
    pub is_speaking: bool,
    pub connection_quality: ConnectionQuality,
    pub volume: f32,
}
