use std::time::Duration;

use serde::Deserialize;

/// Default config file, read from the working directory.
const DEFAULT_CONFIG_PATH: &str = "watchroom.toml";

/// Top-level server configuration, loaded from `watchroom.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub web_root: String,
    pub limits: LimitsConfig,
    pub rooms: RoomsConfig,
    pub heartbeat: HeartbeatConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3001".to_string(),
            web_root: "web".to_string(),
            limits: LimitsConfig::default(),
            rooms: RoomsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

/// Infrastructure limits (connection caps, buffer sizes, rate limits).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_ws_connections: usize,
    /// Maximum concurrent WebSocket connections per IP address.
    pub max_ws_per_ip: usize,
    pub ws_rate_limit_per_sec: f64,
    pub player_message_buffer: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_ws_connections: 500,
            max_ws_per_ip: 20,
            ws_rate_limit_per_sec: 30.0,
            player_message_buffer: 256,
        }
    }
}

/// Room capacity and lifecycle configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoomsConfig {
    pub max_rooms: usize,
    pub max_users_per_room: usize,
    pub max_queue_size: usize,
    pub max_chat_history: usize,
    pub inactive_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    /// Delay before re-sending the playback state after a host migration.
    pub host_resync_delay_ms: u64,
    /// Interval of the extrapolated clock broadcast to guests; 0 disables it.
    pub sync_broadcast_interval_secs: u64,
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            max_rooms: 1000,
            max_users_per_room: 50,
            max_queue_size: 100,
            max_chat_history: 100,
            inactive_timeout_secs: 24 * 60 * 60,
            cleanup_interval_secs: 300,
            host_resync_delay_ms: 1000,
            sync_broadcast_interval_secs: 5,
        }
    }
}

impl RoomsConfig {
    pub fn inactive_timeout(&self) -> Duration {
        Duration::from_secs(self.inactive_timeout_secs)
    }

    pub fn host_resync_delay(&self) -> Duration {
        Duration::from_millis(self.host_resync_delay_ms)
    }
}

/// WebSocket liveness detection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 25,
            timeout_secs: 60,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ServerConfig {
    /// Check every constraint, returning all violations at once.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "listen_addr '{}' is not a valid socket address",
                self.listen_addr
            ));
        }

        let positive = [
            ("limits.max_ws_connections", self.limits.max_ws_connections),
            ("limits.max_ws_per_ip", self.limits.max_ws_per_ip),
            ("limits.player_message_buffer", self.limits.player_message_buffer),
            ("rooms.max_rooms", self.rooms.max_rooms),
            ("rooms.max_users_per_room", self.rooms.max_users_per_room),
            ("rooms.max_queue_size", self.rooms.max_queue_size),
            ("rooms.max_chat_history", self.rooms.max_chat_history),
        ];
        for (name, value) in positive {
            if value == 0 {
                errors.push(format!("{name} must be > 0"));
            }
        }

        if self.limits.ws_rate_limit_per_sec <= 0.0 {
            errors.push("limits.ws_rate_limit_per_sec must be > 0".to_string());
        }
        if self.rooms.inactive_timeout_secs == 0 {
            errors.push("rooms.inactive_timeout_secs must be > 0".to_string());
        }
        if self.rooms.cleanup_interval_secs == 0 {
            errors.push("rooms.cleanup_interval_secs must be > 0".to_string());
        }
        if self.heartbeat.interval_secs == 0 {
            errors.push("heartbeat.interval_secs must be > 0".to_string());
        }
        if self.heartbeat.timeout_secs <= self.heartbeat.interval_secs {
            errors.push("heartbeat.timeout_secs must be greater than heartbeat.interval_secs".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Load config from `watchroom.toml` (or `$WATCHROOM_CONFIG`) if it
    /// exists, then apply env var overrides.
    pub fn load() -> Self {
        let path = std::env::var("WATCHROOM_CONFIG")
            .ok()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        let mut config = match std::fs::read_to_string(&path) {
            Ok(content) => match toml::from_str::<ServerConfig>(&content) {
                Ok(cfg) => {
                    tracing::info!(path = %path, "Loaded configuration");
                    cfg
                },
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Failed to parse config, using defaults");
                    ServerConfig::default()
                },
            },
            Err(_) => {
                tracing::info!(path = %path, "No config file found, using defaults");
                ServerConfig::default()
            },
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Apply `WATCHROOM_*` overrides from the given lookup. Unparseable
    /// values are ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("WATCHROOM_LISTEN_ADDR")
            && !addr.is_empty()
        {
            self.listen_addr = addr;
        }
        if let Some(root) = lookup("WATCHROOM_WEB_ROOT")
            && !root.is_empty()
        {
            self.web_root = root;
        }

        let usize_overrides: [(&str, &mut usize); 4] = [
            ("WATCHROOM_MAX_ROOMS", &mut self.rooms.max_rooms),
            (
                "WATCHROOM_MAX_USERS_PER_ROOM",
                &mut self.rooms.max_users_per_room,
            ),
            ("WATCHROOM_MAX_QUEUE_SIZE", &mut self.rooms.max_queue_size),
            ("WATCHROOM_MAX_CHAT_HISTORY", &mut self.rooms.max_chat_history),
        ];
        for (key, slot) in usize_overrides {
            if let Some(val) = lookup(key)
                && let Ok(n) = val.parse::<usize>()
            {
                *slot = n;
            }
        }

        if let Some(val) = lookup("WATCHROOM_INACTIVE_TIMEOUT_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            self.rooms.inactive_timeout_secs = n;
        }
        if let Some(val) = lookup("WATCHROOM_CLEANUP_INTERVAL_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            self.rooms.cleanup_interval_secs = n;
        }
        if let Some(val) = lookup("WATCHROOM_WS_RATE_LIMIT")
            && let Ok(n) = val.parse::<f64>()
        {
            self.limits.ws_rate_limit_per_sec = n;
        }
    }
}
