use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::RwLock;

use crate::config::ServerConfig;
use crate::room_manager::RoomManager;

pub type SharedRoomManager = Arc<RwLock<RoomManager>>;
pub type IpConnectionCounts = Arc<Mutex<HashMap<IpAddr, usize>>>;

#[derive(Clone)]
pub struct AppState {
    pub rooms: SharedRoomManager,
    pub config: Arc<ServerConfig>,
    pub ws_connection_count: Arc<AtomicUsize>,
    pub ws_per_ip: IpConnectionCounts,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(RoomManager::new(config.rooms.clone()))),
            config: Arc::new(config),
            ws_connection_count: Arc::new(AtomicUsize::new(0)),
            ws_per_ip: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Counts one open WebSocket for as long as it lives.
pub struct ConnectionGuard {
    count: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    pub fn new(count: Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::Relaxed);
        Self { count }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Holds one of an IP address's connection slots; released on drop.
pub struct IpConnectionGuard {
    ip: IpAddr,
    counts: IpConnectionCounts,
}

impl IpConnectionGuard {
    /// Take a slot for `ip`, or `None` if it already has `max` connections.
    pub fn try_acquire(ip: IpAddr, counts: IpConnectionCounts, max: usize) -> Option<Self> {
        {
            let mut map = counts.lock().unwrap_or_else(PoisonError::into_inner);
            let slot = map.entry(ip).or_insert(0);
            if *slot >= max {
                return None;
            }
            *slot += 1;
        }
        Some(Self { ip, counts })
    }
}

impl Drop for IpConnectionGuard {
    fn drop(&mut self) {
        let mut map = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = map.get_mut(&self.ip) {
            *slot = slot.saturating_sub(1);
            if *slot == 0 {
                map.remove(&self.ip);
            }
        }
    }
}
