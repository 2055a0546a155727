//! Connection table and player identity tracking.
//!
//! A connection is one transport endpoint. It carries up to four local
//! co-op player slots. Each populated slot gets an online id derived from the
//! connection's table index, so identities stay short and unique while the
//! connection lives:
//!
//! ```text
//! online_id = table_index * 4 + slot
//! ```
//!
//! The table also keeps the identity index (online id -> player, player ->
//! connection, username -> online id) in step with the slots, and the shared
//! "fully connected" gate the receive tasks consult before letting gameplay
//! traffic through. Only the main loop mutates the table.

use crate::transport::ConnectionId;
use dashmap::DashSet;
use log::{debug, info};
use shared::{AccessLevel, DenyReason, OnlineId, Position, MAX_PLAYERS_PER_CONNECTION};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Server-side identifier of one player identity. Never reused.
pub type PlayerId = u64;

/// Shared set of connections allowed to send gameplay traffic.
pub type ConnectedGate = Arc<DashSet<ConnectionId>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AwaitingCredentials,
    Authenticating,
    AdmissionQueued,
    FullyConnected,
    Disconnected,
}

impl SessionState {
    pub fn is_pre_auth(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting
                | SessionState::AwaitingCredentials
                | SessionState::Authenticating
        )
    }
}

/// Result of comparing the client's content checksum with the server's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumState {
    Init,
    Done,
    Different { since: Instant },
}

/// Square of chunks around an anchor position that a player can see.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AreaOfInterest {
    pub anchor: Position,
    pub radius_chunks: u32,
}

impl AreaOfInterest {
    pub fn new(anchor: Position, radius_chunks: u32) -> Self {
        Self {
            anchor,
            radius_chunks,
        }
    }

    pub fn contains(&self, position: &Position) -> bool {
        self.anchor.chunk().distance(&position.chunk()) <= self.radius_chunks
    }
}

#[derive(Debug, Clone)]
pub struct PlayerSlot {
    pub player_id: PlayerId,
    pub online_id: OnlineId,
    pub username: String,
    pub alive: bool,
    pub interest: AreaOfInterest,
    pub connected_at: Instant,
    pub disconnected_at: Option<Instant>,
}

/// Login progress of a connection that is not yet fully connected.
#[derive(Debug, Clone)]
pub struct AdmissionRecord {
    /// Pre-authentication connections are dropped once this passes
    pub grace_deadline: Instant,
    pub queued_at: Option<Instant>,
    pub queue_position: Option<u32>,
    /// Login held while waiting in the admission queue
    pub pending: Option<PendingLogin>,
}

#[derive(Debug, Clone)]
pub struct PendingLogin {
    pub slot: u8,
    pub username: String,
    pub access_level: AccessLevel,
}

pub struct Connection {
    pub id: ConnectionId,
    pub index: usize,
    pub peer: String,
    pub state: SessionState,
    pub admission: Option<AdmissionRecord>,
    pub access_level: AccessLevel,
    pub platform_id: Option<u64>,
    pub checksum: ChecksumState,
    pub players: [Option<PlayerSlot>; MAX_PLAYERS_PER_CONNECTION],
    pub connected_at: Instant,
    pub last_seen: Instant,
    pub packets_sent: u64,
}

impl Connection {
    fn new(id: ConnectionId, index: usize, peer: String, now: Instant, grace: Instant) -> Self {
        Self {
            id,
            index,
            peer,
            state: SessionState::AwaitingCredentials,
            admission: Some(AdmissionRecord {
                grace_deadline: grace,
                queued_at: None,
                queue_position: None,
                pending: None,
            }),
            access_level: AccessLevel::None,
            platform_id: None,
            checksum: ChecksumState::Init,
            players: Default::default(),
            connected_at: now,
            last_seen: now,
            packets_sent: 0,
        }
    }

    pub fn is_fully_connected(&self) -> bool {
        self.state == SessionState::FullyConnected
    }

    pub fn player(&self, slot: u8) -> Option<&PlayerSlot> {
        self.players.get(slot as usize).and_then(Option::as_ref)
    }

    pub fn player_mut(&mut self, slot: u8) -> Option<&mut PlayerSlot> {
        self.players.get_mut(slot as usize).and_then(Option::as_mut)
    }

    /// Populated slots with their slot number.
    pub fn occupied(&self) -> impl Iterator<Item = (u8, &PlayerSlot)> {
        self.players
            .iter()
            .enumerate()
            .filter_map(|(slot, player)| player.as_ref().map(|p| (slot as u8, p)))
    }

    pub fn slot_of(&self, online_id: OnlineId) -> Option<u8> {
        self.occupied()
            .find(|(_, player)| player.online_id == online_id)
            .map(|(slot, _)| slot)
    }

    /// Name of the primary player, falling back to the peer address.
    pub fn display_name(&self) -> &str {
        self.occupied()
            .next()
            .map(|(_, player)| player.username.as_str())
            .unwrap_or(self.peer.as_str())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("index", &self.index)
            .field("state", &self.state)
            .field("players", &self.occupied().count())
            .finish()
    }
}

/// Why a connection is being removed. Each variant maps to one wire code.
#[derive(Debug, Clone, PartialEq)]
pub enum KickReason {
    /// Login refused; the client receives `AccessDenied` for the slot
    Denied { slot: u8, reason: DenyReason },
    ProtocolViolation(String),
    Timeout,
    ChecksumMismatch,
    Security { check: String, message: String },
    Admin(String),
    /// Client said goodbye; nothing is sent back
    ClientQuit,
    /// Transport lost the endpoint; nothing is sent back
    TransportClosed(String),
    ServerShutdown,
}

impl KickReason {
    pub fn code(&self) -> String {
        match self {
            KickReason::Denied { reason, .. } => reason.code(),
            KickReason::ProtocolViolation(_) => "ProtocolViolation".to_string(),
            KickReason::Timeout => "Timeout".to_string(),
            KickReason::ChecksumMismatch => "ChecksumMismatch".to_string(),
            KickReason::Security { .. } => "SecurityViolation".to_string(),
            KickReason::Admin(_) => "Kicked".to_string(),
            KickReason::ClientQuit => "Quit".to_string(),
            KickReason::TransportClosed(_) => "ConnectionLost".to_string(),
            KickReason::ServerShutdown => "ServerShutdown".to_string(),
        }
    }

    /// Text shown to the client. Security and admin kicks carry their message.
    pub fn client_text(&self) -> String {
        match self {
            KickReason::Security { message, .. } => message.clone(),
            KickReason::Admin(message) if !message.is_empty() => message.clone(),
            other => other.code(),
        }
    }

    /// Whether the client should be told before the endpoint is dropped.
    pub fn notifies_client(&self) -> bool {
        !matches!(self, KickReason::ClientQuit | KickReason::TransportClosed(_))
    }
}

impl fmt::Display for KickReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KickReason::Denied { slot, reason } => write!(f, "denied slot {}: {}", slot, reason),
            KickReason::ProtocolViolation(detail) => write!(f, "protocol violation: {}", detail),
            KickReason::Security { check, message } => write!(f, "{} ({})", message, check),
            KickReason::Admin(message) => write!(f, "kicked: {}", message),
            KickReason::TransportClosed(detail) => write!(f, "connection lost: {}", detail),
            other => f.write_str(&other.code()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotError {
    UnknownConnection,
    InvalidSlot,
    /// Slot holds a living player
    Occupied,
}

impl From<SlotError> for DenyReason {
    fn from(err: SlotError) -> Self {
        match err {
            SlotError::Occupied => DenyReason::SlotOccupied,
            SlotError::UnknownConnection | SlotError::InvalidSlot => DenyReason::Unauthorized,
        }
    }
}

#[derive(Debug, Default)]
pub struct IdentityIndex {
    players: HashMap<OnlineId, PlayerId>,
    owners: HashMap<PlayerId, ConnectionId>,
    usernames: HashMap<String, OnlineId>,
}

impl IdentityIndex {
    fn insert(&mut self, player: &PlayerSlot, connection: ConnectionId) {
        self.players.insert(player.online_id, player.player_id);
        self.owners.insert(player.player_id, connection);
        self.usernames
            .insert(player.username.to_lowercase(), player.online_id);
    }

    fn remove(&mut self, player: &PlayerSlot) {
        self.players.remove(&player.online_id);
        self.owners.remove(&player.player_id);
        self.usernames.remove(&player.username.to_lowercase());
    }

    pub fn player(&self, online_id: OnlineId) -> Option<PlayerId> {
        self.players.get(&online_id).copied()
    }

    pub fn owner(&self, player_id: PlayerId) -> Option<ConnectionId> {
        self.owners.get(&player_id).copied()
    }

    /// Case-insensitive lookup.
    pub fn by_username(&self, username: &str) -> Option<OnlineId> {
        self.usernames.get(&username.to_lowercase()).copied()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}

pub struct ConnectionTable {
    slots: Vec<Option<Connection>>,
    index_of: HashMap<ConnectionId, usize>,
    identities: IdentityIndex,
    gate: ConnectedGate,
    next_player_id: PlayerId,
}

impl ConnectionTable {
    pub fn new(capacity: usize, gate: ConnectedGate) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            index_of: HashMap::new(),
            identities: IdentityIndex::default(),
            gate,
            next_player_id: 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.index_of.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index_of.is_empty()
    }

    /// Claims the lowest free table index for a new endpoint.
    /// Returns `None` when every index is taken.
    pub fn insert(
        &mut self,
        id: ConnectionId,
        peer: String,
        now: Instant,
        grace_deadline: Instant,
    ) -> Option<usize> {
        if let Some(&index) = self.index_of.get(&id) {
            return Some(index);
        }
        let index = self.slots.iter().position(Option::is_none)?;
        self.slots[index] = Some(Connection::new(id, index, peer, now, grace_deadline));
        self.index_of.insert(id, index);
        debug!("Connection {} assigned table index {}", id, index);
        Some(index)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.index_of.contains_key(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        let index = *self.index_of.get(&id)?;
        self.slots[index].as_ref()
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        let index = *self.index_of.get(&id)?;
        self.slots[index].as_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.slots.iter_mut().filter_map(Option::as_mut)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.iter().map(|conn| conn.id).collect()
    }

    /// Frees the table index and every identity the connection held.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let index = self.index_of.remove(&id)?;
        let mut connection = self.slots[index].take()?;
        for player in connection.players.iter().flatten() {
            self.identities.remove(player);
        }
        self.gate.remove(&id);
        connection.state = SessionState::Disconnected;
        Some(connection)
    }

    /// Moves a connection to fully connected and opens its gameplay gate.
    pub fn promote(&mut self, id: ConnectionId) -> bool {
        let Some(connection) = self.get_mut(id) else {
            return false;
        };
        connection.state = SessionState::FullyConnected;
        connection.admission = None;
        self.gate.insert(id);
        true
    }

    /// Mints an identity for `slot`. A dead occupant is replaced in place; a
    /// living one refuses the login.
    pub fn populate_slot(
        &mut self,
        id: ConnectionId,
        slot: u8,
        username: &str,
        interest: AreaOfInterest,
        now: Instant,
    ) -> Result<OnlineId, SlotError> {
        if slot as usize >= MAX_PLAYERS_PER_CONNECTION {
            return Err(SlotError::InvalidSlot);
        }
        let index = *self.index_of.get(&id).ok_or(SlotError::UnknownConnection)?;
        let connection = self.slots[index]
            .as_mut()
            .ok_or(SlotError::UnknownConnection)?;

        let online_id = OnlineId::try_from(index * MAX_PLAYERS_PER_CONNECTION + slot as usize)
            .map_err(|_| SlotError::InvalidSlot)?;

        if let Some(existing) = &connection.players[slot as usize] {
            if existing.alive {
                return Err(SlotError::Occupied);
            }
            info!(
                "Replacing dead player {} in slot {} of connection {}",
                existing.username, slot, id
            );
            self.identities.remove(existing);
        }

        let player = PlayerSlot {
            player_id: self.next_player_id,
            online_id,
            username: username.to_string(),
            alive: true,
            interest,
            connected_at: now,
            disconnected_at: None,
        };
        self.next_player_id += 1;
        self.identities.insert(&player, id);
        connection.players[slot as usize] = Some(player);
        Ok(online_id)
    }

    pub fn vacate_slot(&mut self, id: ConnectionId, slot: u8) -> Option<PlayerSlot> {
        let connection = self.get_mut(id)?;
        let player = connection.players.get_mut(slot as usize)?.take()?;
        self.identities.remove(&player);
        Some(player)
    }

    pub fn identities(&self) -> &IdentityIndex {
        &self.identities
    }

    /// Connection and slot currently holding `online_id`.
    pub fn locate(&self, online_id: OnlineId) -> Option<(ConnectionId, u8)> {
        let player_id = self.identities.player(online_id)?;
        let connection = self.identities.owner(player_id)?;
        let slot = self.get(connection)?.slot_of(online_id)?;
        Some((connection, slot))
    }

    pub fn player(&self, online_id: OnlineId) -> Option<&PlayerSlot> {
        let (connection, slot) = self.locate(online_id)?;
        self.get(connection)?.player(slot)
    }

    pub fn player_mut(&mut self, online_id: OnlineId) -> Option<&mut PlayerSlot> {
        let (connection, slot) = self.locate(online_id)?;
        self.get_mut(connection)?.player_mut(slot)
    }

    /// Populated player slots across all connections.
    pub fn player_count(&self) -> usize {
        self.identities.len()
    }

    /// Connections that have reached fully connected.
    pub fn connected_count(&self) -> usize {
        self.iter().filter(|conn| conn.is_fully_connected()).count()
    }

    pub fn usernames(&self) -> Vec<String> {
        self.iter()
            .filter(|conn| conn.is_fully_connected())
            .flat_map(|conn| conn.occupied().map(|(_, p)| p.username.clone()))
            .collect()
    }

    pub fn gate(&self) -> &ConnectedGate {
        &self.gate
    }
}
