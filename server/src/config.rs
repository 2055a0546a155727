//! Server configuration.
//!
//! Every threshold the engine uses lives here. Values are read from an
//! optional TOML file and the binary then applies its command-line overrides.
//! The defaults reproduce a 10 Hz server with a 70 ms network budget; they are
//! a starting point for tuning rather than guaranteed-correct values.

use crate::error::ServerError;
use crate::security::SecurityConfig;
use serde::Deserialize;
use shared::{AccessLevel, MAX_PLAYERS_PER_CONNECTION, SERVER_VERSION};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the UDP transport binds to
    pub bind_address: String,
    pub tick: TickConfig,
    pub admission: AdmissionConfig,
    pub overload: OverloadConfig,
    pub pool: PoolConfig,
    pub relevance: RelevanceConfig,
    pub session: SessionConfig,
    pub security: SecurityConfig,
}

/// Main loop pacing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    /// Ticks per second
    pub tick_rate: u32,
    /// Share of the tick reserved for draining the network queues
    pub network_budget_ms: u64,
    /// Handler errors logged per tick before the rest are only counted
    pub max_error_logs_per_tick: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub server_version: String,
    pub max_players: usize,
    pub queue_enabled: bool,
    /// Waiting connections beyond this are refused with `ServerFull`
    pub queue_capacity: usize,
    pub queue_timeout_secs: u64,
    /// Queued connections are only promoted while their latency is below this
    pub max_queue_ping_ms: u32,
    /// Pre-authentication connections are dropped after this long
    pub login_grace_secs: u64,
    /// Connection slots beyond players and the queue, for logins still in
    /// progress and for staff joining a full server
    pub max_pending: usize,
    /// Banned-content phrases for usernames and chat
    pub filter_phrases: Vec<String>,
    pub filter_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OverloadConfig {
    /// Consecutive overrun ticks before entering degraded mode
    pub enter_after: u32,
    /// Consecutive clean ticks before leaving degraded mode
    pub recover_after: u32,
    pub deny_logins_when_overloaded: bool,
    pub pressure_cap: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on envelopes checked out at once
    pub max_envelopes: usize,
    pub buffer_capacity: usize,
    pub preallocate: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelevanceConfig {
    pub view_radius_chunks: u32,
    pub chat_radius: f32,
    /// Lowest access level that sees privileged broadcasts
    pub privileged_level: AccessLevel,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub keepalive_timeout_secs: u64,
    pub checksum_grace_secs: u64,
    /// Expected content checksum; `None` accepts any report
    pub content_checksum: Option<u64>,
    pub pvp_enabled: bool,
    pub probe_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:16261".to_string(),
            tick: TickConfig::default(),
            admission: AdmissionConfig::default(),
            overload: OverloadConfig::default(),
            pool: PoolConfig::default(),
            relevance: RelevanceConfig::default(),
            session: SessionConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            tick_rate: 10,
            network_budget_ms: 70,
            max_error_logs_per_tick: 10,
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            server_version: SERVER_VERSION.to_string(),
            max_players: 32,
            queue_enabled: true,
            queue_capacity: 16,
            queue_timeout_secs: 300,
            max_queue_ping_ms: 400,
            login_grace_secs: 30,
            max_pending: 8,
            filter_phrases: Vec::new(),
            filter_file: None,
        }
    }
}

impl Default for OverloadConfig {
    fn default() -> Self {
        Self {
            enter_after: 3,
            recover_after: 10,
            deny_logins_when_overloaded: true,
            pressure_cap: 100,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_envelopes: 8192,
            buffer_capacity: 256,
            preallocate: 256,
        }
    }
}

impl Default for RelevanceConfig {
    fn default() -> Self {
        Self {
            view_radius_chunks: 5,
            chat_radius: 30.0,
            privileged_level: AccessLevel::Moderator,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_timeout_secs: 60,
            checksum_grace_secs: 10,
            content_checksum: None,
            pvp_enabled: true,
            probe_interval_ms: 1000,
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ServerError> {
        let text = std::fs::read_to_string(path).map_err(|source| ServerError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ServerError> {
        let config: ServerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.tick.tick_rate == 0 || self.tick.tick_rate > 1000 {
            return Err(ServerError::InvalidConfig(format!(
                "tick_rate must be within 1..=1000, got {}",
                self.tick.tick_rate
            )));
        }
        if self.admission.max_players == 0 {
            return Err(ServerError::InvalidConfig(
                "max_players must be at least 1".to_string(),
            ));
        }
        // Online ids are u16 and every connection owns four of them
        let max_online_ids = self.max_connections().saturating_mul(MAX_PLAYERS_PER_CONNECTION);
        if max_online_ids > usize::from(u16::MAX) + 1 {
            return Err(ServerError::InvalidConfig(format!(
                "{} connection slots exceed the {} available online ids",
                self.max_connections(),
                usize::from(u16::MAX) + 1
            )));
        }
        if self.pool.max_envelopes == 0 {
            return Err(ServerError::InvalidConfig(
                "pool.max_envelopes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Connection slots: admitted players, everyone allowed to wait and the
    /// pending headroom. Player capacity itself is enforced at login.
    pub fn max_connections(&self) -> usize {
        let queue = if self.admission.queue_enabled {
            self.admission.queue_capacity
        } else {
            0
        };
        self.admission
            .max_players
            .saturating_add(queue)
            .saturating_add(self.admission.max_pending)
    }
}

impl TickConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }

    pub fn network_budget(&self) -> Duration {
        Duration::from_millis(self.network_budget_ms)
    }
}

impl AdmissionConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }

    pub fn login_grace(&self) -> Duration {
        Duration::from_secs(self.login_grace_secs)
    }
}

impl SessionConfig {
    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout_secs)
    }

    pub fn checksum_grace(&self) -> Duration {
        Duration::from_secs(self.checksum_grace_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}
