use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

mod frame;
mod messages;
mod opcode;
mod reason;

pub use frame::{decode_frame, decode_payload, encode_frame, split_frame, ProtocolError};
pub use messages::*;
pub use opcode::Opcode;
pub use reason::DenyReason;

/// Version string a client must present at login.
pub const SERVER_VERSION: &str = "1.4.2";
/// Local co-op players one connection may host.
pub const MAX_PLAYERS_PER_CONNECTION: usize = 4;
/// World cells per chunk edge.
pub const CHUNK_SIZE: f32 = 10.0;
/// Bytes taken by the opcode at the front of every frame.
pub const OPCODE_LEN: usize = 2;

/// Short integer identifying a player identity on the wire.
pub type OnlineId = u16;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkCoord {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn distance(&self, other: &Position) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    pub fn chunk(&self) -> ChunkCoord {
        ChunkCoord {
            x: (self.x / CHUNK_SIZE).floor() as i32,
            y: (self.y / CHUNK_SIZE).floor() as i32,
        }
    }
}

impl ChunkCoord {
    /// Chebyshev distance in chunks.
    pub fn distance(&self, other: &ChunkCoord) -> u32 {
        let dx = (self.x - other.x).unsigned_abs();
        let dy = (self.y - other.y).unsigned_abs();
        dx.max(dy)
    }
}

/// Role of a connection, ordered from least to most privileged.
#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
pub enum AccessLevel {
    #[default]
    None,
    Observer,
    Gm,
    Overseer,
    Moderator,
    Admin,
}

impl AccessLevel {
    pub fn is_staff(&self) -> bool {
        *self > AccessLevel::None
    }

    pub fn name(&self) -> &'static str {
        match self {
            AccessLevel::None => "none",
            AccessLevel::Observer => "observer",
            AccessLevel::Gm => "gm",
            AccessLevel::Overseer => "overseer",
            AccessLevel::Moderator => "moderator",
            AccessLevel::Admin => "admin",
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AccessLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "player" => Ok(AccessLevel::None),
            "observer" => Ok(AccessLevel::Observer),
            "gm" => Ok(AccessLevel::Gm),
            "overseer" => Ok(AccessLevel::Overseer),
            "moderator" => Ok(AccessLevel::Moderator),
            "admin" => Ok(AccessLevel::Admin),
            other => Err(format!("unknown access level '{}'", other)),
        }
    }
}
