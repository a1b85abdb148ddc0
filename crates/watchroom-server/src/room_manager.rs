use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use watchroom_core::net::messages::{ClientMessage, JoinRoomMsg};
use watchroom_core::room::{
    ConnectionId, UserId, generate_room_code, is_valid_room_code, normalize_room_code,
};
use watchroom_core::validate::{ValidationError, normalize_user_id, normalize_username};

use crate::config::RoomsConfig;
use crate::error::RoomError;
use crate::room::{Admission, ConnectionSender, Room};

/// A room behind its own lock. Commands for different rooms never contend.
pub type SharedRoom = Arc<Mutex<Room>>;

/// Lock a room, recovering the guard if a previous holder panicked.
pub fn lock_room(room: &SharedRoom) -> MutexGuard<'_, Room> {
    room.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Which room a live connection belongs to.
struct ConnectionRecord {
    room_code: String,
    user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub room_code: String,
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub is_host: bool,
    pub created: bool,
    pub reconnected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub room_code: String,
    pub user_id: UserId,
    pub room_destroyed: bool,
    /// Set when the host left and someone else was promoted.
    pub new_host: Option<UserId>,
}

/// Result of routing a command to the sender's room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    Rejected(RoomError),
    /// The connection is not a member of any room (never joined, left,
    /// superseded by a reconnect, or its room was reaped).
    NotInRoom,
}

/// Aggregate counters across every live room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub rooms: usize,
    /// Rooms with a current video.
    pub playing: usize,
    pub participants: usize,
    /// Participants connected to their room's voice channel.
    pub in_voice: usize,
    /// Videos finished or skipped across all live rooms.
    pub videos_played: usize,
}

/// Registry of live rooms and of which room each connection belongs to.
///
/// Structural changes (join, leave, reaping) need `&mut self`; per-room
/// commands only need `&self` plus the room's own lock. Lock order is always
/// registry first, then room.
pub struct RoomManager {
    rooms: HashMap<String, SharedRoom>,
    connections: HashMap<ConnectionId, ConnectionRecord>,
    next_connection_id: ConnectionId,
    config: RoomsConfig,
}

impl RoomManager {
    pub fn new(config: RoomsConfig) -> Self {
        Self {
            rooms: HashMap::new(),
            connections: HashMap::new(),
            next_connection_id: 1,
            config,
        }
    }

    fn alloc_connection_id(&mut self) -> ConnectionId {
        let id = self.next_connection_id;
        self.next_connection_id += 1;
        id
    }

    fn unique_room_code(&self) -> String {
        loop {
            let code = generate_room_code();
            if !self.rooms.contains_key(&code) {
                return code;
            }
        }
    }

    /// Join (or create) a room. An empty room id creates a room under a fresh
    /// code; an unknown code creates that room. A user id already present in
    /// the room takes over the existing participant.
    pub fn join(
        &mut self,
        req: &JoinRoomMsg,
        sender: ConnectionSender,
        now_ms: u64,
    ) -> Result<JoinOutcome, RoomError> {
        let username = normalize_username(&req.username)?;
        let requested_user_id = normalize_user_id(req.user_id.as_deref())?;
        let room_code = if req.room_id.trim().is_empty() {
            self.unique_room_code()
        } else {
            let code = normalize_room_code(&req.room_id);
            if !is_valid_room_code(&code) {
                return Err(ValidationError::InvalidRoomCode.into());
            }
            code
        };

        let (room, created) = match self.rooms.get(&room_code) {
            Some(room) => (Arc::clone(room), false),
            None => {
                if self.rooms.len() >= self.config.max_rooms {
                    tracing::warn!(max_rooms = self.config.max_rooms, "Room limit reached");
                    return Err(RoomError::Capacity(
                        "Server is at capacity, try again later".to_string(),
                    ));
                }
                let room = Arc::new(Mutex::new(Room::new(
                    room_code.clone(),
                    &self.config,
                    now_ms,
                )));
                self.rooms.insert(room_code.clone(), Arc::clone(&room));
                tracing::info!(room = %room_code, "Room created");
                (room, true)
            },
        };

        let connection_id = self.alloc_connection_id();
        let user_id = requested_user_id.unwrap_or_else(|| format!("conn-{connection_id}"));
        let admitted = {
            let mut guard = lock_room(&room);
            guard
                .admit(user_id.clone(), username, connection_id, sender, now_ms)
                .map(|admission| (admission, guard.host() == Some(user_id.as_str())))
        };
        let (admission, is_host) = match admitted {
            Ok(result) => result,
            Err(e) => {
                if created {
                    self.rooms.remove(&room_code);
                }
                return Err(e);
            },
        };

        let reconnected = match admission {
            Admission::Joined => false,
            Admission::Reconnected { superseded } => {
                self.connections.remove(&superseded);
                tracing::info!(room = %room_code, %user_id, superseded, connection_id, "Participant reconnected");
                true
            },
        };
        self.connections.insert(
            connection_id,
            ConnectionRecord {
                room_code: room_code.clone(),
                user_id: user_id.clone(),
            },
        );

        Ok(JoinOutcome {
            room_code,
            connection_id,
            user_id,
            is_host,
            created,
            reconnected,
        })
    }

    /// Remove a connection from its room. Returns `None` if the connection was
    /// not registered, which makes repeated or superseded leaves no-ops. The
    /// room is destroyed when its last member leaves.
    pub fn leave(&mut self, connection_id: ConnectionId, now_ms: u64) -> Option<LeaveOutcome> {
        let record = self.connections.remove(&connection_id)?;
        let room = self.rooms.get(&record.room_code).map(Arc::clone)?;
        let departure = lock_room(&room).remove_connection(connection_id, now_ms)?;

        if departure.room_empty {
            self.rooms.remove(&record.room_code);
            tracing::info!(room = %record.room_code, "Room destroyed (last member left)");
        }
        Some(LeaveOutcome {
            room_code: record.room_code,
            user_id: record.user_id,
            room_destroyed: departure.room_empty,
            new_host: departure.new_host,
        })
    }

    /// Route a command to the room the connection belongs to.
    pub fn dispatch(&self, connection_id: ConnectionId, msg: ClientMessage, now_ms: u64) -> Dispatch {
        let Some(room) = self
            .connections
            .get(&connection_id)
            .and_then(|record| self.rooms.get(&record.room_code))
        else {
            return Dispatch::NotInRoom;
        };
        match lock_room(room).handle(connection_id, msg, now_ms) {
            Ok(()) => Dispatch::Handled,
            Err(e) => Dispatch::Rejected(e),
        }
    }

    pub fn room(&self, room_code: &str) -> Option<SharedRoom> {
        self.rooms.get(room_code).map(Arc::clone)
    }

    pub fn is_connected(&self, connection_id: ConnectionId) -> bool {
        self.connections.contains_key(&connection_id)
    }

    /// Resend the stored playback state after a host migration, if the room
    /// still exists.
    pub fn resync_host(&self, room_code: &str) {
        if let Some(room) = self.rooms.get(room_code) {
            lock_room(room).broadcast_host_resync();
        }
    }

    /// Send every playing room's extrapolated clock to its guests.
    pub fn broadcast_clock_sync(&self, now_ms: u64) {
        for room in self.rooms.values() {
            lock_room(room).broadcast_clock_tick(now_ms);
        }
    }

    /// Remove rooms that are empty or have been idle past the configured
    /// timeout as of `now`. Members are told the room closed and their
    /// connections are unregistered. Returns the number of rooms removed.
    pub fn cleanup_inactive_rooms(&mut self, now: Instant) -> usize {
        let timeout = self.config.inactive_timeout();
        let stale: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, room)| {
                let guard = lock_room(room);
                guard.is_empty() || now.saturating_duration_since(guard.last_activity()) > timeout
            })
            .map(|(code, _)| code.clone())
            .collect();

        for code in &stale {
            let Some(room) = self.rooms.remove(code) else {
                continue;
            };
            let guard = lock_room(&room);
            let members = guard.member_count();
            for connection_id in guard.close("Room closed due to inactivity") {
                self.connections.remove(&connection_id);
            }
            tracing::info!(room = %code, members, "Reaped inactive room");
        }
        stale.len()
    }

    pub fn stats(&self) -> RoomStats {
        self.rooms
            .values()
            .fold(RoomStats::default(), |mut stats, room| {
                let room = lock_room(room);
                stats.rooms += 1;
                stats.playing += usize::from(room.queue().current().is_some());
                stats.participants += room.member_count();
                stats.in_voice += room.voice_count();
                stats.videos_played += room.queue().played_count();
                stats
            })
    }
}
