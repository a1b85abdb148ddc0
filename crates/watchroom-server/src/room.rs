use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;

use watchroom_core::net::messages::{
    AddToQueueMsg, ClientMessage, HostChangedMsg, QueueUpdatedMsg, RelayedAnswerMsg,
    RelayedIceCandidateMsg, RelayedOfferMsg, RoomClosedMsg, RoomJoinedMsg, ServerMessage,
    UserPresenceMsg, UserUpdatedMsg, VideoChangedMsg, VideoEndedMsg, VideoStateChangeMsg,
    VoiceActivityBroadcastMsg, VoiceActivityMsg, VoiceMuteBroadcastMsg, VoicePresenceMsg,
    VoiceRosterMsg,
};
use watchroom_core::net::protocol::encode_server_message;
use watchroom_core::room::{
    ChatMessage, ConnectionId, ParticipantInfo, QueueItem, UserId, VoiceParticipantInfo,
};
use watchroom_core::validate::{
    extract_video_id, normalize_chat, normalize_username, same_username, sanitize_duration,
    sanitize_title, thumbnail_or_default,
};

use crate::chat::ChatHistory;
use crate::config::RoomsConfig;
use crate::error::RoomError;
use crate::playback::PlaybackClock;
use crate::queue::{Advance, Enqueued, VideoQueue};
use crate::voice::VoiceChannel;

/// Per-connection sender for outbound WebSocket text frames.
/// Bounded so a slow client cannot exhaust memory; sends never block.
pub type ConnectionSender = mpsc::Sender<Bytes>;

/// One member of a room, bound to exactly one live connection.
pub struct Participant {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    pub username: String,
    pub is_host: bool,
    pub is_muted: bool,
    pub voice_connected: bool,
    pub joined_at: u64,
    /// Breaks `joined_at` ties during host election.
    join_seq: u64,
    sender: ConnectionSender,
}

impl Participant {
    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            socket_id: self.connection_id,
            is_host: self.is_host,
            is_muted: self.is_muted,
            voice_connected: self.voice_connected,
            joined_at: self.joined_at,
        }
    }
}

/// How a join was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Joined,
    /// The user id was already present; its participant now belongs to the
    /// new connection and the old one must be forgotten.
    Reconnected { superseded: ConnectionId },
}

/// What happened when a connection left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub user_id: UserId,
    pub username: String,
    pub was_host: bool,
    pub new_host: Option<UserId>,
    pub room_empty: bool,
}

/// State of one watch room. All mutation happens through `&mut self`, so the
/// caller's lock makes every operation atomic with respect to the room.
pub struct Room {
    code: String,
    /// Join order.
    participants: Vec<Participant>,
    host: Option<UserId>,
    queue: VideoQueue,
    clock: PlaybackClock,
    chat: ChatHistory,
    /// Present only while at least one member is in voice.
    voice: Option<VoiceChannel>,
    last_activity: Instant,
    next_join_seq: u64,
    max_users: usize,
}

impl Room {
    pub fn new(code: String, config: &RoomsConfig, now_ms: u64) -> Self {
        Self {
            code,
            participants: Vec::new(),
            host: None,
            queue: VideoQueue::new(config.max_queue_size),
            clock: PlaybackClock::new(now_ms),
            chat: ChatHistory::new(config.max_chat_history),
            voice: None,
            last_activity: Instant::now(),
            next_join_seq: 0,
            max_users: config.max_users_per_room,
        }
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn member_count(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn queue(&self) -> &VideoQueue {
        &self.queue
    }

    pub fn clock(&self) -> &PlaybackClock {
        &self.clock
    }

    /// Members currently in the voice channel.
    pub fn voice_count(&self) -> usize {
        self.voice.as_ref().map_or(0, VoiceChannel::len)
    }

    pub fn voice_roster(&self) -> Vec<VoiceParticipantInfo> {
        self.voice
            .as_ref()
            .map(VoiceChannel::roster)
            .unwrap_or_default()
    }

    pub fn participant_infos(&self) -> Vec<ParticipantInfo> {
        self.participants.iter().map(Participant::info).collect()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.participants.iter().map(|p| p.connection_id).collect()
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn index_of_connection(&self, connection_id: ConnectionId) -> Option<usize> {
        self.participants
            .iter()
            .position(|p| p.connection_id == connection_id)
    }

    fn participant_by_user(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    fn encode(&self, msg: &ServerMessage) -> Option<Bytes> {
        match encode_server_message(msg) {
            Ok(text) => Some(Bytes::from(text)),
            Err(e) => {
                tracing::warn!(room = %self.code, error = %e, "Failed to encode server message");
                None
            },
        }
    }

    pub fn send_to(&self, connection_id: ConnectionId, msg: &ServerMessage) {
        let Some(bytes) = self.encode(msg) else {
            return;
        };
        if let Some(p) = self
            .participants
            .iter()
            .find(|p| p.connection_id == connection_id)
            && let Err(e) = p.sender.try_send(bytes)
        {
            tracing::debug!(
                connection_id, room = %self.code, error = %e,
                "Failed to send to participant (slow or disconnected)"
            );
        }
    }

    fn send_where(&self, msg: &ServerMessage, include: impl Fn(&Participant) -> bool) {
        let Some(bytes) = self.encode(msg) else {
            return;
        };
        for p in self.participants.iter().filter(|p| include(p)) {
            if let Err(e) = p.sender.try_send(bytes.clone()) {
                tracing::debug!(
                    connection_id = p.connection_id, room = %self.code, error = %e,
                    "Skipping broadcast to slow client"
                );
            }
        }
    }

    pub fn broadcast(&self, msg: &ServerMessage) {
        self.send_where(msg, |_| true);
    }

    pub fn broadcast_except(&self, exclude: ConnectionId, msg: &ServerMessage) {
        self.send_where(msg, |p| p.connection_id != exclude);
    }

    /// Record a server-authored chat line and send it to the whole room.
    fn post_system(&mut self, text: String, now_ms: u64) {
        let message = ChatMessage::system(text, now_ms);
        self.chat.push(message.clone());
        self.broadcast(&ServerMessage::ChatMessage(message));
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    fn ensure_username_free(&self, username: &str, user_id: &str) -> Result<(), RoomError> {
        if self
            .participants
            .iter()
            .any(|p| p.user_id != user_id && same_username(&p.username, username))
        {
            return Err(RoomError::Validation(
                "Username is already taken in this room".to_string(),
            ));
        }
        Ok(())
    }

    /// Admit `user_id` on `connection_id`. The joiner receives a full snapshot;
    /// everyone else is told about the new member. A user id that is already
    /// present is rebound to the new connection and keeps its host status,
    /// mute flag, and seniority.
    pub fn admit(
        &mut self,
        user_id: UserId,
        username: String,
        connection_id: ConnectionId,
        sender: ConnectionSender,
        now_ms: u64,
    ) -> Result<Admission, RoomError> {
        let existing = self.participants.iter().position(|p| p.user_id == user_id);
        if existing.is_none() && self.participants.len() >= self.max_users {
            return Err(RoomError::Capacity(format!(
                "Room is full (max {} users)",
                self.max_users
            )));
        }
        self.ensure_username_free(&username, &user_id)?;

        let (index, admission) = match existing {
            Some(index) => {
                let p = &mut self.participants[index];
                let superseded = p.connection_id;
                p.connection_id = connection_id;
                p.sender = sender;
                p.username = username.clone();
                if let Some(voice) = self.voice.as_mut() {
                    voice.rename(&user_id, &username);
                }
                (index, Admission::Reconnected { superseded })
            },
            None => {
                let is_host = self.host.is_none();
                let join_seq = self.next_join_seq;
                self.next_join_seq += 1;
                self.participants.push(Participant {
                    user_id: user_id.clone(),
                    connection_id,
                    username: username.clone(),
                    is_host,
                    is_muted: false,
                    voice_connected: false,
                    joined_at: now_ms,
                    join_seq,
                    sender,
                });
                if is_host {
                    self.host = Some(user_id.clone());
                }
                (self.participants.len() - 1, Admission::Joined)
            },
        };
        self.touch();

        let joiner = &self.participants[index];
        let is_host = joiner.is_host;
        let snapshot = ServerMessage::RoomJoined(RoomJoinedMsg {
            room_id: self.code.clone(),
            username: username.clone(),
            user_id: user_id.clone(),
            socket_id: connection_id,
            is_host,
            users: self.participant_infos(),
            queue: self.queue.items(),
            current_video: self.queue.current().cloned(),
            video_state: self.clock.state(),
            chat_history: self.chat.to_vec(),
            voice_participants: self.voice_roster(),
        });
        self.send_to(connection_id, &snapshot);

        self.broadcast_except(
            connection_id,
            &ServerMessage::UserJoined(UserPresenceMsg {
                username: username.clone(),
                user_id: user_id.clone(),
                is_host,
                socket_id: connection_id,
                users: self.participant_infos(),
            }),
        );
        let line = match admission {
            Admission::Joined => format!("{username} joined the room"),
            Admission::Reconnected { .. } => format!("{username} reconnected"),
        };
        self.post_system(line, now_ms);

        tracing::info!(
            room = %self.code, user_id = %user_id, connection_id, is_host,
            members = self.participants.len(), "Participant joined"
        );
        Ok(admission)
    }

    /// Remove the participant bound to `connection_id`. Returns `None` if no
    /// participant uses that connection (already left, or superseded by a
    /// reconnect). Voice cleanup runs before the member is removed, and a new
    /// host is elected if the host left.
    pub fn remove_connection(
        &mut self,
        connection_id: ConnectionId,
        now_ms: u64,
    ) -> Option<Departure> {
        let index = self.index_of_connection(connection_id)?;
        let user_id = self.participants[index].user_id.clone();
        self.leave_voice(&user_id);

        let departed = self.participants.remove(index);
        self.touch();
        let was_host = departed.is_host || self.host.as_deref() == Some(user_id.as_str());
        let new_host = if was_host {
            self.host = None;
            self.elect_host()
        } else {
            None
        };

        tracing::info!(
            room = %self.code, user_id = %user_id, connection_id, was_host,
            members = self.participants.len(), "Participant left"
        );

        let departure = Departure {
            user_id,
            username: departed.username,
            was_host,
            new_host,
            room_empty: self.participants.is_empty(),
        };
        if departure.room_empty {
            return Some(departure);
        }

        self.broadcast(&ServerMessage::UserLeft(UserPresenceMsg {
            username: departure.username.clone(),
            user_id: departure.user_id.clone(),
            is_host: was_host,
            socket_id: connection_id,
            users: self.participant_infos(),
        }));
        self.post_system(format!("{} left the room", departure.username), now_ms);
        if let Some(ref host_id) = departure.new_host {
            self.announce_host(host_id, now_ms);
        }
        Some(departure)
    }

    /// Promote the longest-standing member. Resets every host flag so exactly
    /// one participant carries it afterwards.
    fn elect_host(&mut self) -> Option<UserId> {
        let index = self
            .participants
            .iter()
            .enumerate()
            .min_by_key(|(_, p)| (p.joined_at, p.join_seq))
            .map(|(i, _)| i)?;
        for (i, p) in self.participants.iter_mut().enumerate() {
            p.is_host = i == index;
        }
        let user_id = self.participants[index].user_id.clone();
        self.host = Some(user_id.clone());
        Some(user_id)
    }

    /// Tell the room who the new host is, handing over the stored playback
    /// state untouched so the new host resumes where the old one left off.
    fn announce_host(&mut self, host_id: &str, now_ms: u64) {
        let Some(host) = self.participant_by_user(host_id) else {
            return;
        };
        let username = host.username.clone();
        let msg = ServerMessage::HostChanged(HostChangedMsg {
            new_host: username.clone(),
            user_id: host.user_id.clone(),
            socket_id: host.connection_id,
            video_state: self.clock.state(),
            current_video: self.queue.current().cloned(),
            queue: self.queue.items(),
        });
        self.broadcast(&msg);
        self.post_system(format!("{username} is now the host"), now_ms);
        tracing::info!(room = %self.code, host = %host_id, "Host migrated");
    }

    /// Follow-up to a migration: resend the stored state while the new host's
    /// player re-initializes.
    pub fn broadcast_host_resync(&self) {
        if self.participants.is_empty() {
            return;
        }
        self.broadcast(&ServerMessage::VideoStateSync(self.clock.sync_state()));
    }

    /// Periodic clock broadcast to guests, extrapolated to `now_ms`. Only sent
    /// while a video is playing.
    pub fn broadcast_clock_tick(&self, now_ms: u64) {
        if self.queue.current().is_none() {
            return;
        }
        if let Some(state) = self.clock.extrapolated(now_ms) {
            self.send_where(&ServerMessage::VideoStateSync(state), |p| !p.is_host);
        }
    }

    /// Notify every member that the room is going away and return their
    /// connection ids.
    pub fn close(&self, reason: &str) -> Vec<ConnectionId> {
        self.broadcast(&ServerMessage::RoomClosed(RoomClosedMsg {
            reason: reason.to_string(),
        }));
        self.connection_ids()
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Apply one client command from a member of this room. Errors are meant
    /// for the requester only; room state is unchanged when one is returned.
    /// Only commands that were accepted count as room activity.
    pub fn handle(
        &mut self,
        connection_id: ConnectionId,
        msg: ClientMessage,
        now_ms: u64,
    ) -> Result<(), RoomError> {
        let Some(index) = self.index_of_connection(connection_id) else {
            return Err(RoomError::NotFound("You are not in this room".to_string()));
        };
        let mutating = msg.is_mutating();
        if self.apply(index, msg, now_ms)? && mutating {
            self.touch();
        }
        Ok(())
    }

    /// Returns whether the command took effect; ignored commands yield
    /// `Ok(false)`.
    fn apply(
        &mut self,
        index: usize,
        msg: ClientMessage,
        now_ms: u64,
    ) -> Result<bool, RoomError> {
        let connection_id = self.participants[index].connection_id;
        match msg {
            ClientMessage::ChatMessage(m) => {
                self.send_chat(index, &m.message, now_ms).map(|()| true)
            },
            ClientMessage::ChangeUsername(m) => self.change_username(index, &m.username, now_ms),
            ClientMessage::AddToQueue(m) => self.add_to_queue(index, m, now_ms).map(|()| true),
            ClientMessage::RemoveFromQueue(m) => self
                .remove_from_queue(index, &m.video_id, now_ms)
                .map(|()| true),
            ClientMessage::VideoStateChange(m) => Ok(self.video_state_change(index, m, now_ms)),
            ClientMessage::SkipVideo => self.skip_video(index, now_ms).map(|()| true),
            ClientMessage::VideoEnded => {
                if !self.participants[index].is_host {
                    tracing::debug!(room = %self.code, connection_id, "Ignoring video_ended from guest");
                    return Ok(false);
                }
                self.advance(now_ms);
                Ok(true)
            },
            ClientMessage::RequestSync => {
                self.send_to(
                    connection_id,
                    &ServerMessage::VideoStateSync(self.clock.sync_state()),
                );
                Ok(true)
            },
            ClientMessage::VoiceJoin => {
                self.voice_join(index);
                Ok(true)
            },
            ClientMessage::VoiceLeave => {
                let user_id = self.participants[index].user_id.clone();
                Ok(self.leave_voice(&user_id))
            },
            ClientMessage::VoiceOffer(m) => {
                Ok(self.relay_signal(index, &m.target_user_id, |from_user_id| {
                    ServerMessage::VoiceOffer(RelayedOfferMsg {
                        from_user_id,
                        offer: m.offer,
                    })
                }))
            },
            ClientMessage::VoiceAnswer(m) => {
                Ok(self.relay_signal(index, &m.target_user_id, |from_user_id| {
                    ServerMessage::VoiceAnswer(RelayedAnswerMsg {
                        from_user_id,
                        answer: m.answer,
                    })
                }))
            },
            ClientMessage::VoiceIceCandidate(m) => {
                Ok(self.relay_signal(index, &m.target_user_id, |from_user_id| {
                    ServerMessage::VoiceIceCandidate(RelayedIceCandidateMsg {
                        from_user_id,
                        candidate: m.candidate,
                    })
                }))
            },
            ClientMessage::VoiceMuteStatus(m) => {
                self.voice_mute(index, m.is_muted);
                Ok(true)
            },
            ClientMessage::VoiceActivity(m) => Ok(self.voice_activity(index, m)),
            // Membership changes go through the room manager.
            ClientMessage::JoinRoom(_) | ClientMessage::LeaveRoom => Ok(false),
        }
    }

    fn send_chat(&mut self, index: usize, raw: &str, now_ms: u64) -> Result<(), RoomError> {
        let text = normalize_chat(raw)?;
        let sender = &self.participants[index];
        let message = ChatMessage::from_user(&sender.username, text, sender.is_host, now_ms);
        self.chat.push(message.clone());
        self.broadcast(&ServerMessage::ChatMessage(message));
        Ok(())
    }

    fn change_username(
        &mut self,
        index: usize,
        raw: &str,
        now_ms: u64,
    ) -> Result<bool, RoomError> {
        let username = normalize_username(raw)?;
        if self.participants[index].username == username {
            return Ok(false);
        }
        let user_id = self.participants[index].user_id.clone();
        self.ensure_username_free(&username, &user_id)?;

        let p = &mut self.participants[index];
        let previous = std::mem::replace(&mut p.username, username.clone());
        let update = UserUpdatedMsg {
            user_id: user_id.clone(),
            username: username.clone(),
            previous_username: previous.clone(),
            is_host: p.is_host,
            is_muted: p.is_muted,
        };
        if let Some(voice) = self.voice.as_mut() {
            voice.rename(&user_id, &username);
        }
        self.broadcast(&ServerMessage::UserUpdated(update));
        self.post_system(format!("{previous} is now known as {username}"), now_ms);
        Ok(true)
    }

    fn add_to_queue(
        &mut self,
        index: usize,
        msg: AddToQueueMsg,
        now_ms: u64,
    ) -> Result<(), RoomError> {
        let video_id = extract_video_id(&msg.video_url)?;
        let added_by = self.participants[index].username.clone();
        let thumbnail = thumbnail_or_default(&msg.thumbnail, &video_id);
        let item = QueueItem::new(
            video_id,
            sanitize_title(&msg.title),
            sanitize_duration(msg.duration),
            thumbnail,
            added_by.clone(),
            now_ms,
        );
        let title = item.title.clone();
        let video_id = item.video_id.clone();
        let outcome = self.queue.enqueue(item)?;

        tracing::info!(room = %self.code, %video_id, %added_by, "Video queued");
        self.broadcast(&ServerMessage::QueueUpdated(QueueUpdatedMsg {
            queue: self.queue.items(),
            added_by: Some(added_by.clone()),
            removed_by: None,
        }));
        self.post_system(format!("{added_by} added \"{title}\" to the queue"), now_ms);
        if let Enqueued::Started(video) = outcome {
            self.start_video(video, now_ms);
        }
        Ok(())
    }

    fn remove_from_queue(&mut self, index: usize, key: &str, now_ms: u64) -> Result<(), RoomError> {
        let requester = &self.participants[index];
        if !requester.is_host {
            return Err(RoomError::Permission(
                "Only the host can remove videos from the queue".to_string(),
            ));
        }
        let removed_by = requester.username.clone();
        let removed = self
            .queue
            .remove(key)
            .ok_or_else(|| RoomError::NotFound("Video not found in queue".to_string()))?;

        self.broadcast(&ServerMessage::QueueUpdated(QueueUpdatedMsg {
            queue: self.queue.items(),
            added_by: None,
            removed_by: Some(removed_by.clone()),
        }));
        self.post_system(
            format!("{removed_by} removed \"{}\" from the queue", removed.title),
            now_ms,
        );
        Ok(())
    }

    fn video_state_change(
        &mut self,
        index: usize,
        msg: VideoStateChangeMsg,
        now_ms: u64,
    ) -> bool {
        let p = &self.participants[index];
        let connection_id = p.connection_id;
        match self.clock.host_update(
            p.is_host,
            msg.is_playing,
            msg.current_time,
            msg.action,
            now_ms,
        ) {
            Some(state) => {
                self.broadcast_except(connection_id, &ServerMessage::VideoStateSync(state));
                true
            },
            None => {
                tracing::debug!(room = %self.code, connection_id, "Ignoring playback update from guest");
                false
            },
        }
    }

    fn skip_video(&mut self, index: usize, now_ms: u64) -> Result<(), RoomError> {
        if !self.participants[index].is_host {
            return Err(RoomError::Permission(
                "Only the host can skip videos".to_string(),
            ));
        }
        self.advance(now_ms);
        Ok(())
    }

    /// Move past the current video: promote the queue head and start it from
    /// zero, or stop the clock if nothing is left.
    fn advance(&mut self, now_ms: u64) {
        match self.queue.advance() {
            Advance::Next { next, .. } => {
                let title = next.title.clone();
                self.start_video(next, now_ms);
                self.post_system(format!("Now playing: {title}"), now_ms);
            },
            Advance::Exhausted { .. } => {
                self.clock.stop(now_ms);
                self.broadcast(&ServerMessage::VideoEnded(VideoEndedMsg {
                    queue: self.queue.items(),
                }));
            },
        }
    }

    fn start_video(&mut self, video: QueueItem, now_ms: u64) {
        let video_state = self.clock.start_video(now_ms);
        tracing::info!(room = %self.code, video_id = %video.video_id, "Video started");
        self.broadcast(&ServerMessage::VideoChanged(VideoChangedMsg {
            video,
            queue: self.queue.items(),
            video_state,
        }));
    }

    // ------------------------------------------------------------------
    // Voice
    // ------------------------------------------------------------------

    fn voice_join(&mut self, index: usize) {
        let p = &mut self.participants[index];
        p.voice_connected = true;
        let user_id = p.user_id.clone();
        let username = p.username.clone();
        let connection_id = p.connection_id;
        let is_muted = p.is_muted;
        self.voice
            .get_or_insert_with(VoiceChannel::default)
            .join(&user_id, &username, is_muted);

        let participants = self.voice_roster();
        self.broadcast(&ServerMessage::VoiceParticipants(VoiceRosterMsg {
            participants: participants.clone(),
        }));
        self.broadcast_except(
            connection_id,
            &ServerMessage::VoiceUserJoined(VoicePresenceMsg {
                user_id,
                username,
                participants,
            }),
        );
    }

    /// Drop `user_id` from voice, tearing the channel down once empty.
    /// Returns false if they were not in voice.
    fn leave_voice(&mut self, user_id: &str) -> bool {
        let Some(voice) = self.voice.as_mut() else {
            return false;
        };
        let Some(left) = voice.leave(user_id) else {
            return false;
        };
        if voice.is_empty() {
            self.voice = None;
        }

        let mut connection_id = None;
        if let Some(p) = self.participants.iter_mut().find(|p| p.user_id == user_id) {
            p.voice_connected = false;
            connection_id = Some(p.connection_id);
        }
        let participants = self.voice_roster();
        let left_msg = ServerMessage::VoiceUserLeft(VoicePresenceMsg {
            user_id: left.user_id,
            username: left.username,
            participants: participants.clone(),
        });
        match connection_id {
            Some(id) => self.broadcast_except(id, &left_msg),
            None => self.broadcast(&left_msg),
        }
        self.broadcast(&ServerMessage::VoiceParticipants(VoiceRosterMsg { participants }));
        true
    }

    /// Forward a signaling payload to one peer. Dropped unless both ends are
    /// in voice.
    fn relay_signal(
        &self,
        from_index: usize,
        target_user_id: &str,
        build: impl FnOnce(UserId) -> ServerMessage,
    ) -> bool {
        let from = &self.participants[from_index];
        let in_voice = |user_id: &str| self.voice.as_ref().is_some_and(|v| v.contains(user_id));
        if from.user_id == target_user_id || !in_voice(&from.user_id) || !in_voice(target_user_id)
        {
            tracing::debug!(
                room = %self.code, from = %from.user_id, target = %target_user_id,
                "Dropping signaling message outside voice"
            );
            return false;
        }
        let Some(target) = self.participant_by_user(target_user_id) else {
            tracing::debug!(room = %self.code, target = %target_user_id, "Signaling target gone");
            return false;
        };
        self.send_to(target.connection_id, &build(from.user_id.clone()));
        true
    }

    fn voice_mute(&mut self, index: usize, is_muted: bool) {
        let p = &mut self.participants[index];
        p.is_muted = is_muted;
        let user_id = p.user_id.clone();
        let connection_id = p.connection_id;
        if let Some(voice) = self.voice.as_mut() {
            voice.set_muted(&user_id, is_muted);
        }
        self.broadcast_except(
            connection_id,
            &ServerMessage::VoiceMuteStatus(VoiceMuteBroadcastMsg { user_id, is_muted }),
        );
    }

    fn voice_activity(&mut self, index: usize, msg: VoiceActivityMsg) -> bool {
        let user_id = self.participants[index].user_id.clone();
        let connection_id = self.participants[index].connection_id;
        let Some(update) = self.voice.as_mut().and_then(|v| {
            v.record_activity(
                &user_id,
                msg.is_speaking,
                msg.volume,
                msg.connection_state.as_deref(),
            )
        }) else {
            return false;
        };
        self.broadcast_except(
            connection_id,
            &ServerMessage::VoiceActivity(VoiceActivityBroadcastMsg {
                user_id,
                is_speaking: update.is_speaking,
                volume: update.volume,
                connection_quality: update.connection_quality,
            }),
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use watchroom_core::net::messages::{
        ChangeUsernameMsg, RemoveFromQueueMsg, SendChatMsg, VoiceActivityMsg, VoiceMuteStatusMsg,
        VoiceOfferMsg,
    };
    use watchroom_core::net::protocol::decode_server_message;
    use watchroom_core::room::PlaybackAction;
    use watchroom_core::test_helpers::{add_video, video_id};

    type Inbox = mpsc::Receiver<Bytes>;

    fn config() -> RoomsConfig {
        RoomsConfig {
            max_users_per_room: 3,
            max_chat_history: 10,
            ..RoomsConfig::default()
        }
    }

    fn room() -> Room {
        Room::new("ABC123".into(), &config(), 1_000)
    }

    /// Admit a member on connection `conn` with user id `u<conn>`.
    fn admit(room: &mut Room, conn: ConnectionId, name: &str, now_ms: u64) -> Inbox {
        let (tx, rx) = mpsc::channel(256);
        room.admit(format!("u{conn}"), name.into(), conn, tx, now_ms)
            .unwrap();
        rx
    }

    fn drain(rx: &mut Inbox) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            out.push(decode_server_message(&bytes).unwrap());
        }
        out
    }

    fn state_change(is_playing: bool, current_time: f64) -> ClientMessage {
        ClientMessage::VideoStateChange(VideoStateChangeMsg {
            is_playing,
            current_time,
            action: Some(PlaybackAction::Seek),
        })
    }

    #[test]
    fn first_member_becomes_host_and_gets_snapshot() {
        let mut room = room();
        let mut alice = admit(&mut room, 1, "Alice", 1_000);
        assert_eq!(room.host(), Some("u1"));

        let msgs = drain(&mut alice);
        let ServerMessage::RoomJoined(snapshot) = &msgs[0] else {
            panic!("expected room_joined, got {:?}", msgs[0]);
        };
        assert!(snapshot.is_host);
        assert_eq!(snapshot.room_id, "ABC123");
        assert_eq!(snapshot.users.len(), 1);
        assert!(snapshot.current_video.is_none());
        assert!(!snapshot.video_state.is_playing);
    }

    #[test]
    fn others_see_join_and_system_line() {
        let mut room = room();
        let mut alice = admit(&mut room, 1, "Alice", 1_000);
        drain(&mut alice);
        let mut bob = admit(&mut room, 2, "Bob", 2_000);

        let bob_msgs = drain(&mut bob);
        let ServerMessage::RoomJoined(snapshot) = &bob_msgs[0] else {
            panic!("expected room_joined");
        };
        assert!(!snapshot.is_host);
        assert!(snapshot.users.iter().any(|u| u.username == "Alice" && u.is_host));

        let alice_msgs = drain(&mut alice);
        assert!(matches!(&alice_msgs[0], ServerMessage::UserJoined(m) if m.username == "Bob"));
        assert!(matches!(
            &alice_msgs[1],
            ServerMessage::ChatMessage(c) if c.is_system && c.message == "Bob joined the room"
        ));
    }

    #[test]
    fn duplicate_username_rejected_case_insensitively() {
        let mut room = room();
        let _alice = admit(&mut room, 1, "Alice", 1_000);
        let (tx, _rx) = mpsc::channel(8);
        let err = room
            .admit("u2".into(), "ALICE".into(), 2, tx, 2_000)
            .unwrap_err();
        assert!(matches!(err, RoomError::Validation(_)));
        assert_eq!(room.member_count(), 1);
    }

    #[test]
    fn full_room_rejects_new_members() {
        let mut room = room();
        let _a = admit(&mut room, 1, "Alice", 1_000);
        let _b = admit(&mut room, 2, "Bob", 1_001);
        let _c = admit(&mut room, 3, "Carol", 1_002);
        let (tx, _rx) = mpsc::channel(8);
        let err = room.admit("u4".into(), "Dave".into(), 4, tx, 1_003).unwrap_err();
        assert!(matches!(err, RoomError::Capacity(_)));
        assert_eq!(room.member_count(), 3);
    }

    #[test]
    fn reconnect_keeps_host_and_supersedes_old_connection() {
        let mut room = room();
        let _alice = admit(&mut room, 1, "Alice", 1_000);
        let _bob = admit(&mut room, 2, "Bob", 2_000);
        room.handle(
            1,
            ClientMessage::VoiceMuteStatus(VoiceMuteStatusMsg { is_muted: true }),
            2_500,
        )
        .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let admission = room
            .admit("u1".into(), "Alice".into(), 7, tx, 3_000)
            .unwrap();
        assert_eq!(admission, Admission::Reconnected { superseded: 1 });
        assert_eq!(room.member_count(), 2);
        assert_eq!(room.host(), Some("u1"));

        let p = &room.participants()[0];
        assert_eq!(p.connection_id, 7);
        assert!(p.is_host);
        assert!(p.is_muted);
        assert_eq!(p.joined_at, 1_000);

        // The stale connection's disconnect must not evict the member.
        assert_eq!(room.remove_connection(1, 3_500), None);
        assert_eq!(room.member_count(), 2);

        let msgs = drain(&mut rx);
        assert!(matches!(&msgs[0], ServerMessage::RoomJoined(s) if s.is_host && s.socket_id == 7));
    }

    #[test]
    fn host_leaving_promotes_earliest_remaining_member() {
        let mut room = room();
        let _alice = admit(&mut room, 1, "Alice", 1_000);
        let mut bob = admit(&mut room, 2, "Bob", 2_000);
        let mut carol = admit(&mut room, 3, "Carol", 3_000);

        room.handle(1, ClientMessage::AddToQueue(add_video(1)), 4_000).unwrap();
        room.handle(1, state_change(true, 42.0), 5_000).unwrap();
        drain(&mut bob);
        drain(&mut carol);

        let departure = room.remove_connection(1, 6_000).unwrap();
        assert!(departure.was_host);
        assert_eq!(departure.new_host.as_deref(), Some("u2"));
        assert!(!departure.room_empty);

        let hosts: Vec<_> = room.participants().iter().filter(|p| p.is_host).collect();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].user_id, "u2");

        let msgs = drain(&mut carol);
        assert!(matches!(&msgs[0], ServerMessage::UserLeft(m) if m.is_host && m.username == "Alice"));
        let changed = msgs
            .iter()
            .find_map(|m| match m {
                ServerMessage::HostChanged(h) => Some(h.clone()),
                _ => None,
            })
            .expect("host_changed");
        assert_eq!(changed.new_host, "Bob");
        assert_eq!(changed.video_state.current_time, 42.0);
        assert_eq!(changed.video_state.last_update, 5_000);
        assert!(changed.video_state.is_playing);
        assert_eq!(changed.current_video.map(|v| v.video_id), Some(video_id(1)));
    }

    #[test]
    fn joined_at_ties_fall_back_to_join_order() {
        let mut room = room();
        let _a = admit(&mut room, 1, "Alice", 1_000);
        let _b = admit(&mut room, 2, "Bob", 1_000);
        let _c = admit(&mut room, 3, "Carol", 1_000);
        let departure = room.remove_connection(1, 2_000).unwrap();
        assert_eq!(departure.new_host.as_deref(), Some("u2"));
    }

    #[test]
    fn guest_leaving_keeps_host() {
        let mut room = room();
        let _a = admit(&mut room, 1, "Alice", 1_000);
        let _b = admit(&mut room, 2, "Bob", 2_000);
        let departure = room.remove_connection(2, 3_000).unwrap();
        assert!(!departure.was_host);
        assert_eq!(departure.new_host, None);
        assert_eq!(room.host(), Some("u1"));
    }

    #[test]
    fn last_member_leaving_empties_room() {
        let mut room = room();
        let _a = admit(&mut room, 1, "Alice", 1_000);
        let departure = room.remove_connection(1, 2_000).unwrap();
        assert!(departure.room_empty);
        assert!(room.is_empty());
        assert_eq!(room.host(), None);
    }

    #[test]
    fn guest_add_to_idle_room_starts_playback() {
        let mut room = room();
        let _a = admit(&mut room, 1, "Alice", 1_000);
        let mut bob = admit(&mut room, 2, "Bob", 2_000);
        drain(&mut bob);

        room.handle(2, ClientMessage::AddToQueue(add_video(1)), 3_000).unwrap();
        assert_eq!(room.queue().current().map(|v| v.video_id.clone()), Some(video_id(1)));
        assert!(room.clock().state().is_playing);

        let msgs = drain(&mut bob);
        assert!(matches!(&msgs[0], ServerMessage::QueueUpdated(q) if q.queue.is_empty()));
        let changed = msgs
            .iter()
            .find_map(|m| match m {
                ServerMessage::VideoChanged(v) => Some(v.clone()),
                _ => None,
            })
            .expect("video_changed");
        assert_eq!(changed.video.added_by, "Bob");
        assert_eq!(changed.video_state.current_time, 0.0);
    }

    #[test]
    fn add_while_playing_only_queues() {
        let mut room = room();
        let mut alice = admit(&mut room, 1, "Alice", 1_000);
        room.handle(1, ClientMessage::AddToQueue(add_video(1)), 2_000).unwrap();
        drain(&mut alice);

        room.handle(1, ClientMessage::AddToQueue(add_video(2)), 3_000).unwrap();
        assert_eq!(room.queue().len(), 1);
        let msgs = drain(&mut alice);
        assert!(!msgs.iter().any(|m| matches!(m, ServerMessage::VideoChanged(_))));

        let err = room
            .handle(1, ClientMessage::AddToQueue(add_video(2)), 4_000)
            .unwrap_err();
        assert!(matches!(err, RoomError::Duplicate(_)));
    }

    #[test]
    fn invalid_url_is_a_validation_error() {
        let mut room = room();
        let _a = admit(&mut room, 1, "Alice", 1_000);
        let mut msg = add_video(1);
        msg.video_url = "https://vimeo.com/123".into();
        let err = room.handle(1, ClientMessage::AddToQueue(msg), 2_000).unwrap_err();
        assert_eq!(err, RoomError::Validation("Invalid YouTube URL".into()));
        assert!(room.queue().current().is_none());
    }

    #[test]
    fn guest_playback_updates_are_ignored() {
        let mut room = room();
        let mut alice = admit(&mut room, 1, "Alice", 1_000);
        let _bob = admit(&mut room, 2, "Bob", 2_000);
        drain(&mut alice);
        let before = room.clock().state();

        room.handle(2, state_change(true, 99.0), 3_000).unwrap();
        assert_eq!(room.clock().state(), before);
        assert!(drain(&mut alice).is_empty());
    }

    #[test]
    fn host_playback_updates_reach_guests_only() {
        let mut room = room();
        let mut alice = admit(&mut room, 1, "Alice", 1_000);
        let mut bob = admit(&mut room, 2, "Bob", 2_000);
        drain(&mut alice);
        drain(&mut bob);

        room.handle(1, state_change(true, 12.5), 3_000).unwrap();
        assert!(drain(&mut alice).is_empty());
        let msgs = drain(&mut bob);
        assert!(matches!(
            &msgs[..],
            [ServerMessage::VideoStateSync(s)] if s.current_time == 12.5 && s.last_update == 3_000
        ));
    }

    #[test]
    fn remove_and_skip_require_host() {
        let mut room = room();
        let _a = admit(&mut room, 1, "Alice", 1_000);
        let _b = admit(&mut room, 2, "Bob", 2_000);
        room.handle(1, ClientMessage::AddToQueue(add_video(1)), 3_000).unwrap();
        room.handle(1, ClientMessage::AddToQueue(add_video(2)), 3_001).unwrap();

        let remove = ClientMessage::RemoveFromQueue(RemoveFromQueueMsg {
            video_id: video_id(2),
        });
        let err = room.handle(2, remove.clone(), 4_000).unwrap_err();
        assert!(matches!(err, RoomError::Permission(_)));
        let err = room.handle(2, ClientMessage::SkipVideo, 4_000).unwrap_err();
        assert!(matches!(err, RoomError::Permission(_)));
        assert_eq!(room.queue().len(), 1);

        room.handle(1, remove.clone(), 5_000).unwrap();
        assert!(room.queue().is_empty());
        let err = room.handle(1, remove, 5_001).unwrap_err();
        assert!(matches!(err, RoomError::NotFound(_)));
    }

    #[test]
    fn skip_promotes_next_and_blocks_replay() {
        let mut room = room();
        let mut alice = admit(&mut room, 1, "Alice", 1_000);
        room.handle(1, ClientMessage::AddToQueue(add_video(1)), 2_000).unwrap();
        room.handle(1, ClientMessage::AddToQueue(add_video(2)), 2_001).unwrap();
        room.handle(1, state_change(true, 30.0), 2_500).unwrap();
        drain(&mut alice);

        room.handle(1, ClientMessage::SkipVideo, 3_000).unwrap();
        assert_eq!(room.queue().current().map(|v| v.video_id.clone()), Some(video_id(2)));
        let state = room.clock().state();
        assert!(state.is_playing);
        assert_eq!(state.current_time, 0.0);
        assert!(drain(&mut alice).iter().any(|m| matches!(m, ServerMessage::VideoChanged(_))));

        let err = room
            .handle(1, ClientMessage::AddToQueue(add_video(1)), 4_000)
            .unwrap_err();
        assert!(matches!(err, RoomError::Duplicate(_)));
    }

    #[test]
    fn guest_video_ended_is_ignored_and_host_exhausts_queue() {
        let mut room = room();
        let mut alice = admit(&mut room, 1, "Alice", 1_000);
        let _bob = admit(&mut room, 2, "Bob", 2_000);
        room.handle(1, ClientMessage::AddToQueue(add_video(1)), 3_000).unwrap();
        drain(&mut alice);

        room.handle(2, ClientMessage::VideoEnded, 4_000).unwrap();
        assert!(room.queue().current().is_some());

        room.handle(1, ClientMessage::VideoEnded, 5_000).unwrap();
        assert!(room.queue().current().is_none());
        assert!(!room.clock().state().is_playing);
        assert!(drain(&mut alice).iter().any(|m| matches!(m, ServerMessage::VideoEnded(_))));
    }

    #[test]
    fn chat_is_validated_and_tagged_with_host_status() {
        let mut room = room();
        let mut alice = admit(&mut room, 1, "Alice", 1_000);
        let _bob = admit(&mut room, 2, "Bob", 2_000);
        drain(&mut alice);

        let chat = |text: &str| {
            ClientMessage::ChatMessage(SendChatMsg {
                message: text.into(),
            })
        };
        let err = room.handle(2, chat("   "), 3_000).unwrap_err();
        assert!(matches!(err, RoomError::Validation(_)));

        room.handle(1, chat("  hello  "), 3_000).unwrap();
        room.handle(2, chat("hi"), 3_001).unwrap();
        let msgs = drain(&mut alice);
        assert!(matches!(
            &msgs[0],
            ServerMessage::ChatMessage(c) if c.message == "hello" && c.is_host && !c.is_system
        ));
        assert!(matches!(&msgs[1], ServerMessage::ChatMessage(c) if c.username == "Bob" && !c.is_host));
    }

    #[test]
    fn chat_history_is_capped() {
        let mut room = room();
        let _a = admit(&mut room, 1, "Alice", 1_000);
        for n in 0..25 {
            room.handle(
                1,
                ClientMessage::ChatMessage(SendChatMsg {
                    message: format!("line {n}"),
                }),
                2_000 + n,
            )
            .unwrap();
        }
        let (tx, mut rx) = mpsc::channel(8);
        room.admit("u2".into(), "Bob".into(), 2, tx, 3_000).unwrap();
        let ServerMessage::RoomJoined(snapshot) = &drain(&mut rx)[0] else {
            panic!("expected room_joined");
        };
        assert_eq!(snapshot.chat_history.len(), 10);
        assert_eq!(snapshot.chat_history[9].message, "line 24");
    }

    #[test]
    fn rename_checks_uniqueness_and_announces() {
        let mut room = room();
        let mut alice = admit(&mut room, 1, "Alice", 1_000);
        let _bob = admit(&mut room, 2, "Bob", 2_000);
        drain(&mut alice);

        let rename = |name: &str| {
            ClientMessage::ChangeUsername(ChangeUsernameMsg {
                username: name.into(),
            })
        };
        let err = room.handle(2, rename("alice"), 3_000).unwrap_err();
        assert!(matches!(err, RoomError::Validation(_)));

        room.handle(2, rename("Robert"), 3_001).unwrap();
        assert_eq!(room.participants()[1].username, "Robert");
        let msgs = drain(&mut alice);
        assert!(matches!(
            &msgs[0],
            ServerMessage::UserUpdated(u) if u.username == "Robert" && u.previous_username == "Bob"
        ));
    }

    #[test]
    fn request_sync_answers_requester_only() {
        let mut room = room();
        let mut alice = admit(&mut room, 1, "Alice", 1_000);
        let mut bob = admit(&mut room, 2, "Bob", 2_000);
        room.handle(1, state_change(false, 77.0), 3_000).unwrap();
        drain(&mut alice);
        drain(&mut bob);

        room.handle(2, ClientMessage::RequestSync, 9_000).unwrap();
        assert!(drain(&mut alice).is_empty());
        assert!(matches!(
            &drain(&mut bob)[..],
            [ServerMessage::VideoStateSync(s)] if s.current_time == 77.0 && s.action == Some(PlaybackAction::Sync)
        ));
    }

    #[test]
    fn clock_tick_goes_to_guests_while_playing() {
        let mut room = room();
        let mut alice = admit(&mut room, 1, "Alice", 1_000);
        let mut bob = admit(&mut room, 2, "Bob", 2_000);
        room.handle(1, ClientMessage::AddToQueue(add_video(1)), 3_000).unwrap();
        room.handle(1, state_change(true, 10.0), 4_000).unwrap();
        drain(&mut alice);
        drain(&mut bob);

        room.broadcast_clock_tick(9_000);
        assert!(drain(&mut alice).is_empty());
        let msgs = drain(&mut bob);
        assert!(matches!(
            &msgs[..],
            [ServerMessage::VideoStateSync(s)] if (s.current_time - 15.0).abs() < 1e-9
        ));

        room.handle(1, state_change(false, 15.0), 9_500).unwrap();
        drain(&mut bob);
        room.broadcast_clock_tick(12_000);
        assert!(drain(&mut bob).is_empty());
    }

    fn offer(target: &str) -> ClientMessage {
        ClientMessage::VoiceOffer(VoiceOfferMsg {
            target_user_id: target.into(),
            offer: serde_json::json!({"type": "offer", "sdp": "v=0"}),
        })
    }

    #[test]
    fn voice_join_broadcasts_roster() {
        let mut room = room();
        let mut alice = admit(&mut room, 1, "Alice", 1_000);
        let mut bob = admit(&mut room, 2, "Bob", 2_000);
        drain(&mut alice);
        drain(&mut bob);

        room.handle(1, ClientMessage::VoiceJoin, 3_000).unwrap();
        assert!(room.participants()[0].voice_connected);
        let alice_msgs = drain(&mut alice);
        assert!(matches!(&alice_msgs[..], [ServerMessage::VoiceParticipants(r)] if r.participants.len() == 1));
        let bob_msgs = drain(&mut bob);
        assert!(bob_msgs.iter().any(|m| matches!(m, ServerMessage::VoiceUserJoined(j) if j.user_id == "u1")));
    }

    #[test]
    fn signaling_is_relayed_between_voice_members_only() {
        let mut room = room();
        let _alice = admit(&mut room, 1, "Alice", 1_000);
        let mut bob = admit(&mut room, 2, "Bob", 2_000);

        // Bob is not in voice yet.
        room.handle(1, ClientMessage::VoiceJoin, 3_000).unwrap();
        drain(&mut bob);
        room.handle(1, offer("u2"), 3_100).unwrap();
        assert!(drain(&mut bob).is_empty());

        room.handle(2, ClientMessage::VoiceJoin, 3_200).unwrap();
        drain(&mut bob);
        room.handle(1, offer("u2"), 3_300).unwrap();
        let msgs = drain(&mut bob);
        let [ServerMessage::VoiceOffer(relayed)] = &msgs[..] else {
            panic!("expected one voice_offer, got {msgs:?}");
        };
        assert_eq!(relayed.from_user_id, "u1");
        assert_eq!(relayed.offer["sdp"], "v=0");

        room.handle(1, offer("ghost"), 3_400).unwrap();
        assert!(drain(&mut bob).is_empty());
    }

    #[test]
    fn muted_activity_is_not_rebroadcast() {
        let mut room = room();
        let _alice = admit(&mut room, 1, "Alice", 1_000);
        let mut bob = admit(&mut room, 2, "Bob", 2_000);
        room.handle(1, ClientMessage::VoiceJoin, 3_000).unwrap();
        room.handle(
            1,
            ClientMessage::VoiceMuteStatus(VoiceMuteStatusMsg { is_muted: true }),
            3_100,
        )
        .unwrap();
        drain(&mut bob);

        room.handle(
            1,
            ClientMessage::VoiceActivity(VoiceActivityMsg {
                is_speaking: true,
                volume: 0.8,
                connection_state: None,
            }),
            3_200,
        )
        .unwrap();
        assert!(drain(&mut bob).is_empty());
    }

    #[test]
    fn disconnect_cleans_up_voice() {
        let mut room = room();
        let _alice = admit(&mut room, 1, "Alice", 1_000);
        let mut bob = admit(&mut room, 2, "Bob", 2_000);
        room.handle(1, ClientMessage::VoiceJoin, 3_000).unwrap();
        drain(&mut bob);

        room.remove_connection(1, 4_000).unwrap();
        assert!(room.voice_roster().is_empty());
        assert!(room.voice.is_none());
        let msgs = drain(&mut bob);
        assert!(matches!(&msgs[0], ServerMessage::VoiceUserLeft(l) if l.user_id == "u1"));
    }

    #[test]
    fn explicit_voice_leave_keeps_membership() {
        let mut room = room();
        let mut alice = admit(&mut room, 1, "Alice", 1_000);
        let mut bob = admit(&mut room, 2, "Bob", 2_000);
        room.handle(1, ClientMessage::VoiceJoin, 3_000).unwrap();
        room.handle(2, ClientMessage::VoiceJoin, 3_100).unwrap();
        drain(&mut alice);
        drain(&mut bob);

        room.handle(2, ClientMessage::VoiceLeave, 3_200).unwrap();
        assert_eq!(room.member_count(), 2);
        assert!(!room.participants()[1].voice_connected);
        assert_eq!(room.voice_count(), 1);

        let msgs = drain(&mut alice);
        assert!(matches!(
            &msgs[..],
            [ServerMessage::VoiceUserLeft(l), ServerMessage::VoiceParticipants(r)]
                if l.user_id == "u2" && l.participants.len() == 1 && r.participants.len() == 1
        ));
        let msgs = drain(&mut bob);
        assert!(matches!(&msgs[..], [ServerMessage::VoiceParticipants(r)] if r.participants.len() == 1));

        // Signaling to someone who left voice goes nowhere.
        room.handle(1, offer("u2"), 3_300).unwrap();
        assert!(drain(&mut bob).is_empty());

        // Leaving twice is a no-op.
        room.handle(2, ClientMessage::VoiceLeave, 3_400).unwrap();
        assert!(drain(&mut alice).is_empty());

        room.handle(1, ClientMessage::VoiceLeave, 3_500).unwrap();
        assert!(room.voice.is_none());
        assert_eq!(room.voice_count(), 0);
        assert!(!room.participants()[0].voice_connected);
    }

    #[test]
    fn snapshot_with_full_chat_history_is_delivered() {
        let roomy = RoomsConfig {
            max_chat_history: 100,
            ..config()
        };
        let mut room = Room::new("BIG".into(), &roomy, 1_000);
        let mut alice = admit(&mut room, 1, "Alice", 1_000);
        let line = "\u{1F600}".repeat(500);
        for n in 0..100 {
            room.handle(
                1,
                ClientMessage::ChatMessage(SendChatMsg {
                    message: line.clone(),
                }),
                2_000 + n,
            )
            .unwrap();
        }
        drain(&mut alice);

        let mut bob = admit(&mut room, 2, "Bob", 3_000);
        let msgs = drain(&mut bob);
        let Some(ServerMessage::RoomJoined(snapshot)) = msgs.first() else {
            panic!("expected room_joined, got {msgs:?}");
        };
        assert_eq!(snapshot.chat_history.len(), 100);
        assert!(snapshot.chat_history.iter().all(|c| c.message == line));
    }

    #[test]
    fn only_accepted_commands_count_as_activity() {
        let mut room = room();
        let _alice = admit(&mut room, 1, "Alice", 1_000);
        let _bob = admit(&mut room, 2, "Bob", 2_000);
        room.handle(1, ClientMessage::AddToQueue(add_video(1)), 2_500).unwrap();
        let before = room.last_activity();
        std::thread::sleep(std::time::Duration::from_millis(5));

        assert!(room.handle(2, ClientMessage::SkipVideo, 3_000).is_err());
        room.handle(2, state_change(false, 10.0), 3_100).unwrap();
        room.handle(2, ClientMessage::VideoEnded, 3_200).unwrap();
        room.handle(2, offer("u1"), 3_300).unwrap();
        room.handle(2, ClientMessage::RequestSync, 3_400).unwrap();
        assert_eq!(room.last_activity(), before);

        room.handle(
            2,
            ClientMessage::ChatMessage(SendChatMsg {
                message: "hi".into(),
            }),
            3_500,
        )
        .unwrap();
        assert!(room.last_activity() > before);
    }

    #[test]
    fn commands_from_strangers_are_rejected() {
        let mut room = room();
        let _alice = admit(&mut room, 1, "Alice", 1_000);
        let err = room.handle(99, ClientMessage::SkipVideo, 2_000).unwrap_err();
        assert!(matches!(err, RoomError::NotFound(_)));
    }

    #[test]
    fn close_notifies_everyone() {
        let mut room = room();
        let mut alice = admit(&mut room, 1, "Alice", 1_000);
        drain(&mut alice);
        assert_eq!(room.close("Room closed due to inactivity"), vec![1]);
        assert!(matches!(&drain(&mut alice)[..], [ServerMessage::RoomClosed(_)]));
    }
}
