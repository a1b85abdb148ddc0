use serde::{Deserialize, Serialize};

use crate::room::{
    ChatMessage, ConnectionId, ConnectionQuality, ParticipantInfo, PlaybackAction, PlaybackState,
    QueueItem, UserId, VoiceParticipantInfo,
};

// ============================================================================
// Client -> Server
// ============================================================================

/// Every frame a browser may send. Wire shape:
/// `{"event": "<snake_case>", "data": { ...camelCase fields... }}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    JoinRoom(JoinRoomMsg),
    LeaveRoom,
    ChatMessage(SendChatMsg),
    ChangeUsername(ChangeUsernameMsg),
    AddToQueue(AddToQueueMsg),
    RemoveFromQueue(RemoveFromQueueMsg),
    VideoStateChange(VideoStateChangeMsg),
    SkipVideo,
    VideoEnded,
    RequestSync,
    VoiceJoin,
    VoiceOffer(VoiceOfferMsg),
    VoiceAnswer(VoiceAnswerMsg),
    VoiceIceCandidate(VoiceIceCandidateMsg),
    VoiceMuteStatus(VoiceMuteStatusMsg),
    VoiceActivity(VoiceActivityMsg),
    VoiceLeave,
}

impl ClientMessage {
    /// Event name as it appears on the wire, for logs.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::JoinRoom(_) => "join_room",
            Self::LeaveRoom => "leave_room",
            Self::ChatMessage(_) => "chat_message",
            Self::ChangeUsername(_) => "change_username",
            Self::AddToQueue(_) => "add_to_queue",
            Self::RemoveFromQueue(_) => "remove_from_queue",
            Self::VideoStateChange(_) => "video_state_change",
            Self::SkipVideo => "skip_video",
            Self::VideoEnded => "video_ended",
            Self::RequestSync => "request_sync",
            Self::VoiceJoin => "voice_join",
            Self::VoiceOffer(_) => "voice_offer",
            Self::VoiceAnswer(_) => "voice_answer",
            Self::VoiceIceCandidate(_) => "voice_ice_candidate",
            Self::VoiceMuteStatus(_) => "voice_mute_status",
            Self::VoiceActivity(_) => "voice_activity",
            Self::VoiceLeave => "voice_leave",
        }
    }

    /// Whether handling this event counts as room activity for the reaper.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Self::RequestSync)
    }

    /// High-frequency events that bypass the per-connection rate limiter.
    /// Dropping ICE candidates or speaking indicators breaks calls.
    pub fn is_rate_exempt(&self) -> bool {
        matches!(self, Self::VoiceIceCandidate(_) | Self::VoiceActivity(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomMsg {
    /// Empty to have the server create a room under a fresh code.
    #[serde(default)]
    pub room_id: String,
    pub username: String,
    #[serde(default)]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendChatMsg {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeUsernameMsg {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddToQueueMsg {
    pub video_url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub thumbnail: String,
}

/// Identifies a queue entry either by its item id or by its video id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveFromQueueMsg {
    #[serde(alias = "itemId")]
    pub video_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoStateChangeMsg {
    pub is_playing: bool,
    pub current_time: f64,
    #[serde(default)]
    pub action: Option<PlaybackAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceOfferMsg {
    pub target_user_id: UserId,
    pub offer: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceAnswerMsg {
    pub target_user_id: UserId,
    pub answer: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceIceCandidateMsg {
    pub target_user_id: UserId,
    pub candidate: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceMuteStatusMsg {
    pub is_muted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceActivityMsg {
    pub is_speaking: bool,
    #[serde(default)]
    pub volume: f32,
    /// Browser peer-connection state, e.g. "connected" or "checking".
    #[serde(default)]
    pub connection_state: Option<String>,
}

// ============================================================================
// Server -> Client
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    RoomJoined(RoomJoinedMsg),
    UserJoined(UserPresenceMsg),
    UserLeft(UserPresenceMsg),
    UserUpdated(UserUpdatedMsg),
    ChatMessage(ChatMessage),
    QueueUpdated(QueueUpdatedMsg),
    VideoChanged(VideoChangedMsg),
    VideoEnded(VideoEndedMsg),
    VideoStateSync(PlaybackState),
    HostChanged(HostChangedMsg),
    VoiceParticipants(VoiceRosterMsg),
    VoiceUserJoined(VoicePresenceMsg),
    VoiceUserLeft(VoicePresenceMsg),
    VoiceOffer(RelayedOfferMsg),
    VoiceAnswer(RelayedAnswerMsg),
    VoiceIceCandidate(RelayedIceCandidateMsg),
    VoiceMuteStatus(VoiceMuteBroadcastMsg),
    VoiceActivity(VoiceActivityBroadcastMsg),
    RoomClosed(RoomClosedMsg),
    Error(ErrorMsg),
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorMsg {
            message: message.into(),
        })
    }
}

/// Full snapshot delivered to a successful joiner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoinedMsg {
    pub room_id: String,
    pub username: String,
    pub user_id: UserId,
    pub socket_id: ConnectionId,
    pub is_host: bool,
    pub users: Vec<ParticipantInfo>,
    pub queue: Vec<QueueItem>,
    pub current_video: Option<QueueItem>,
    pub video_state: PlaybackState,
    pub chat_history: Vec<ChatMessage>,
    pub voice_participants: Vec<VoiceParticipantInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresenceMsg {
    pub username: String,
    pub user_id: UserId,
    pub is_host: bool,
    pub socket_id: ConnectionId,
    pub users: Vec<ParticipantInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUpdatedMsg {
    pub user_id: UserId,
    pub username: String,
    pub previous_username: String,
    pub is_host: bool,
    pub is_muted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueUpdatedMsg {
    pub queue: Vec<QueueItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoChangedMsg {
    pub video: QueueItem,
    pub queue: Vec<QueueItem>,
    pub video_state: PlaybackState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoEndedMsg {
    pub queue: Vec<QueueItem>,
}

/// Sent to the whole room on host migration. Carries the playback state as it
/// was last reported so the new host resumes instead of restarting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostChangedMsg {
    pub new_host: String,
    pub user_id: UserId,
    pub socket_id: ConnectionId,
    pub video_state: PlaybackState,
    pub current_video: Option<QueueItem>,
    pub queue: Vec<QueueItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceRosterMsg {
    pub participants: Vec<VoiceParticipantInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoicePresenceMsg {
    pub user_id: UserId,
    pub username: String,
    pub participants: Vec<VoiceParticipantInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedOfferMsg {
    pub from_user_id: UserId,
    pub offer: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedAnswerMsg {
    pub from_user_id: UserId,
    pub answer: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedIceCandidateMsg {
    pub from_user_id: UserId,
    pub candidate: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceMuteBroadcastMsg {
    pub user_id: UserId,
    pub is_muted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceActivityBroadcastMsg {
    pub user_id: UserId,
    pub is_speaking: bool,
    pub volume: f32,
    pub connection_quality: ConnectionQuality,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomClosedMsg {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMsg {
    pub message: String,
}
