use watchroom_core::room::{PlaybackAction, PlaybackState};

/// A room's single authoritative playback clock.
///
/// The server never advances time on its own; it stores the host's last
/// report together with the server time it arrived at.
pub struct PlaybackClock {
    state: PlaybackState,
}

impl PlaybackClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            state: PlaybackState::stopped(now_ms),
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// Apply a playback report. Reports from anyone but the host are ignored
    /// and yield `None`.
    pub fn host_update(
        &mut self,
        requester_is_host: bool,
        is_playing: bool,
        current_time: f64,
        action: Option<PlaybackAction>,
        now_ms: u64,
    ) -> Option<PlaybackState> {
        if !requester_is_host {
            return None;
        }
        self.state = PlaybackState {
            is_playing,
            current_time: sanitize_time(current_time),
            last_update: now_ms,
            action,
        };
        Some(self.state)
    }

    /// Reset for a freshly promoted video: playing from zero.
    pub fn start_video(&mut self, now_ms: u64) -> PlaybackState {
        self.state = PlaybackState {
            is_playing: true,
            current_time: 0.0,
            last_update: now_ms,
            action: Some(PlaybackAction::Play),
        };
        self.state
    }

    /// Reset after the queue ran dry.
    pub fn stop(&mut self, now_ms: u64) -> PlaybackState {
        self.state = PlaybackState::stopped(now_ms);
        self.state
    }

    /// The stored state projected forward to `now_ms`, for periodic resync of
    /// guests. `None` while paused; the stored state is not modified.
    pub fn extrapolated(&self, now_ms: u64) -> Option<PlaybackState> {
        if !self.state.is_playing {
            return None;
        }
        Some(PlaybackState {
            is_playing: true,
            current_time: self.state.estimated_time(now_ms),
            last_update: now_ms,
            action: Some(PlaybackAction::Sync),
        })
    }

    /// The stored state re-tagged as a sync, for on-demand and post-migration
    /// rebroadcasts.
    pub fn sync_state(&self) -> PlaybackState {
        PlaybackState {
            action: Some(PlaybackAction::Sync),
            ..self.state
        }
    }
}

fn sanitize_time(seconds: f64) -> f64 {
    if seconds.is_finite() && seconds > 0.0 {
        seconds
    } else {
        0.0
    }
}
