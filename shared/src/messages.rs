use crate::{AccessLevel, OnlineId, Position};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LoginRequest {
    pub slot: u8,
    pub username: String,
    pub password: String,
    pub client_version: String,
    /// Identity issued by an external platform, if the client has one.
    pub platform_id: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LoginAccepted {
    pub slot: u8,
    pub online_id: OnlineId,
    pub access_level: AccessLevel,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AccessDenied {
    pub slot: u8,
    /// Machine-readable reason code, see [`crate::DenyReason::code`].
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct QueuePosition {
    pub position: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SpawnState {
    pub online_id: OnlineId,
    pub position: Position,
    pub visuals: Vec<u8>,
    pub inventory: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum WorldStateKind {
    Weather,
    Chunk { x: i32, y: i32 },
    Safehouse,
    NonPvpZone,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct WorldState {
    pub kind: WorldStateKind,
    pub data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Kicked {
    pub reason: String,
}

/// Ping and its pong reply share this layout.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Ping {
    pub timestamp: u64,
}

/// Transport-level latency probe; echoed back unchanged by the client.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct TransportProbe {
    pub timestamp: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct ScoreboardProbe;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Scoreboard {
    pub players: Vec<String>,
}

/// Must keep `slot` as the first field: triage reads it straight from the payload.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct PlayerUpdate {
    pub slot: u8,
    pub position: Position,
    pub direction: f32,
    pub moving: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct PlayerSync {
    pub online_id: OnlineId,
    pub position: Position,
    pub direction: f32,
    pub moving: bool,
}

/// Sent inbound as `VehiclePhysics` and relayed as `VehicleSync`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct VehiclePhysics {
    pub vehicle_id: u32,
    pub position: Position,
    pub data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct PlayerDeath {
    pub online_id: OnlineId,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PlayerDied {
    pub online_id: OnlineId,
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct ChecksumReport {
    pub checksum: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub online_id: OnlineId,
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatRelay {
    pub online_id: OnlineId,
    pub author: String,
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Teleport {
    pub target: String,
    pub position: Position,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct TreatPlayer {
    pub target: OnlineId,
    pub body_part: u8,
    pub apply: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct HitCharacter {
    pub target: OnlineId,
    pub damage: f32,
}

/// Sent inbound as `WorldSound` and relayed as `SoundRelay`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct WorldSound {
    pub position: Position,
    pub radius: f32,
    pub volume: f32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AdminCommand {
    pub command: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AdminReply {
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct ServerBusy {
    pub busy: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Quit;
