use watchroom_core::room::{ConnectionQuality, VoiceParticipantInfo};

/// Relay-side view of one voice participant. Only used for UI indicators;
/// media never passes through the server.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceParticipant {
    pub user_id: String,
    pub username: String,
    pub is_muted: bool,
    pub is_speaking: bool,
    pub connection_quality: ConnectionQuality,
    pub volume: f32,
}

impl VoiceParticipant {
    fn info(&self) -> VoiceParticipantInfo {
        VoiceParticipantInfo {
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            is_muted: self.is_muted,
            is_speaking: self.is_speaking,
            connection_quality: self.connection_quality,
            volume: self.volume,
        }
    }
}

/// Accepted speaking-indicator update, ready to rebroadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityUpdate {
    pub is_speaking: bool,
    pub volume: f32,
    pub connection_quality: ConnectionQuality,
}

/// The voice roster of one room, in join order. Keyed by stable user id so
/// a reconnecting member keeps their place.
#[derive(Debug, Default)]
pub struct VoiceChannel {
    participants: Vec<VoiceParticipant>,
}

impl VoiceChannel {
    /// Add a participant. Returns false if they were already present, in
    /// which case their entry is refreshed rather than duplicated.
    pub fn join(&mut self, user_id: &str, username: &str, is_muted: bool) -> bool {
        if let Some(existing) = self.get_mut(user_id) {
            existing.username = username.to_string();
            existing.is_muted = is_muted;
            existing.is_speaking = false;
            return false;
        }
        self.participants.push(VoiceParticipant {
            user_id: user_id.to_string(),
            username: username.to_string(),
            is_muted,
            is_speaking: false,
            connection_quality: ConnectionQuality::default(),
            volume: 0.0,
        });
        true
    }

    pub fn leave(&mut self, user_id: &str) -> Option<VoiceParticipant> {
        let index = self.participants.iter().position(|p| p.user_id == user_id)?;
        Some(self.participants.remove(index))
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p.user_id == user_id)
    }

    fn get_mut(&mut self, user_id: &str) -> Option<&mut VoiceParticipant> {
        self.participants.iter_mut().find(|p| p.user_id == user_id)
    }

    /// Returns false if the user is not in voice.
    pub fn set_muted(&mut self, user_id: &str, is_muted: bool) -> bool {
        let Some(participant) = self.get_mut(user_id) else {
            return false;
        };
        participant.is_muted = is_muted;
        if is_muted {
            participant.is_speaking = false;
            participant.volume = 0.0;
        }
        true
    }

    /// Record a speaking-indicator report. Reports from muted or unknown
    /// participants are suppressed (`None`).
    pub fn record_activity(
        &mut self,
        user_id: &str,
        is_speaking: bool,
        volume: f32,
        peer_state: Option<&str>,
    ) -> Option<ActivityUpdate> {
        let participant = self.get_mut(user_id)?;
        if let Some(state) = peer_state {
            participant.connection_quality = ConnectionQuality::from_peer_state(state);
        }
        if participant.is_muted {
            return None;
        }
        participant.is_speaking = is_speaking;
        participant.volume = if volume.is_finite() {
            volume.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Some(ActivityUpdate {
            is_speaking: participant.is_speaking,
            volume: participant.volume,
            connection_quality: participant.connection_quality,
        })
    }

    pub fn rename(&mut self, user_id: &str, username: &str) {
        if let Some(participant) = self.get_mut(user_id) {
            participant.username = username.to_string();
        }
    }

    pub fn roster(&self) -> Vec<VoiceParticipantInfo> {
        self.participants.iter().map(VoiceParticipant::info).collect()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}
