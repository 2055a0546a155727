//! Relevance-filtered broadcast.
//!
//! Outbound world updates are collected into a per-tick outbox and delivered
//! at the end of the tick. For each update the broadcaster selects the fully
//! connected connections that have at least one player slot for which the
//! update is relevant: either the position lies inside the slot's chunk-square
//! area of interest, or, for updates that carry their own radius, the position
//! is within that many cells of the slot's anchor. The originating connection
//! never receives its own update back, except for privileged notices, which
//! reach every qualifying staff connection.

use crate::connection::{Connection, ConnectionTable};
use crate::transport::{ConnectionId, Transport};
use serde::Serialize;
use shared::{encode_frame, AccessLevel, Opcode, Position, ProtocolError};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Connections with a player that can perceive the anchor
    Relevant,
    /// Fully connected connections at or above this access level
    Privileged { min_level: AccessLevel },
    /// Every fully connected connection
    Everyone,
}

/// One outbound update waiting in the outbox.
#[derive(Debug, Clone)]
pub struct Broadcast {
    pub opcode: Opcode,
    pub frame: Vec<u8>,
    pub anchor: Position,
    pub radius: Option<f32>,
    pub origin: Option<ConnectionId>,
    pub audience: Audience,
}

impl Broadcast {
    pub fn relevant<T: Serialize>(
        opcode: Opcode,
        payload: &T,
        anchor: Position,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            opcode,
            frame: encode_frame(opcode, payload)?,
            anchor,
            radius: None,
            origin: None,
            audience: Audience::Relevant,
        })
    }

    pub fn everyone<T: Serialize>(opcode: Opcode, payload: &T) -> Result<Self, ProtocolError> {
        let mut broadcast = Self::relevant(opcode, payload, Position::default())?;
        broadcast.audience = Audience::Everyone;
        Ok(broadcast)
    }

    pub fn privileged<T: Serialize>(
        opcode: Opcode,
        payload: &T,
        min_level: AccessLevel,
    ) -> Result<Self, ProtocolError> {
        let mut broadcast = Self::relevant(opcode, payload, Position::default())?;
        broadcast.audience = Audience::Privileged { min_level };
        Ok(broadcast)
    }

    /// Also reach players whose anchor is within `radius` cells.
    pub fn within(mut self, radius: f32) -> Self {
        self.radius = Some(radius);
        self
    }

    /// Excludes the sending connection from the recipients.
    pub fn from(mut self, origin: ConnectionId) -> Self {
        self.origin = Some(origin);
        self
    }
}

pub struct RelevanceBroadcaster {
    transport: Arc<dyn Transport>,
}

impl RelevanceBroadcaster {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn is_relevant(connection: &Connection, broadcast: &Broadcast) -> bool {
        if !connection.is_fully_connected() {
            return false;
        }
        let is_origin = broadcast.origin == Some(connection.id);
        match broadcast.audience {
            Audience::Everyone => !is_origin,
            // Staff get privileged notices even about their own actions
            Audience::Privileged { min_level } => {
                connection.access_level >= min_level
                    || (!is_origin && Self::perceives(connection, broadcast))
            }
            Audience::Relevant => !is_origin && Self::perceives(connection, broadcast),
        }
    }

    /// Some live player of the connection can see or hear the anchor. A dead
    /// player perceives nothing until it logs in to its slot again; a live
    /// co-op partner on the same connection still counts.
    fn perceives(connection: &Connection, broadcast: &Broadcast) -> bool {
        connection
            .occupied()
            .filter(|(_, player)| player.alive)
            .any(|(_, player)| {
                player.interest.contains(&broadcast.anchor)
                    || broadcast
                        .radius
                        .is_some_and(|r| player.interest.anchor.distance(&broadcast.anchor) <= r)
            })
    }

    pub fn recipients(&self, table: &ConnectionTable, broadcast: &Broadcast) -> Vec<ConnectionId> {
        table
            .iter()
            .filter(|connection| Self::is_relevant(connection, broadcast))
            .map(|connection| connection.id)
            .collect()
    }

    /// Sends `broadcast` to every relevant connection. Returns the recipient count.
    pub fn deliver(&self, table: &mut ConnectionTable, broadcast: &Broadcast) -> usize {
        let mut delivered = 0;
        for connection in table.iter_mut() {
            if Self::is_relevant(connection, broadcast) {
                self.send_frame(connection, &broadcast.frame);
                delivered += 1;
            }
        }
        delivered
    }

    pub fn send_frame(&self, connection: &mut Connection, frame: &[u8]) {
        self.transport.send(connection.id, frame);
        connection.packets_sent += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::AreaOfInterest;
    use crate::transport::MemoryTransport;
    use dashmap::DashSet;
    use shared::{PlayerSync, WorldSound};
    use std::time::{Duration, Instant};

    struct Fixture {
        table: ConnectionTable,
        transport: Arc<MemoryTransport>,
        broadcaster: RelevanceBroadcaster,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(MemoryTransport::new());
        Fixture {
            table: ConnectionTable::new(8, Arc::new(DashSet::new())),
            broadcaster: RelevanceBroadcaster::new(transport.clone()),
            transport,
        }
    }

    impl Fixture {
        fn player_at(&mut self, id: ConnectionId, x: f32, y: f32) {
            let now = Instant::now();
            self.table
                .insert(id, format!("peer-{}", id), now, now + Duration::from_secs(30));
            let aoi = AreaOfInterest::new(Position::new(x, y, 0.0), 2);
            self.table
                .populate_slot(id, 0, &format!("player{}", id), aoi, now)
                .unwrap();
            self.table.promote(id);
        }
    }

    fn sync(anchor: Position) -> Broadcast {
        Broadcast::relevant(
            Opcode::PlayerSync,
            &PlayerSync {
                online_id: 0,
                position: anchor,
                direction: 0.0,
                moving: false,
            },
            anchor,
        )
        .unwrap()
    }

    #[test]
    fn test_recipients_filtered_by_area_of_interest() {
        let mut f = fixture();
        f.player_at(1, 0.0, 0.0);
        f.player_at(2, 15.0, 15.0);
        f.player_at(3, 200.0, 200.0);

        let recipients = f.broadcaster.recipients(&f.table, &sync(Position::new(5.0, 5.0, 0.0)));

        assert_eq!(recipients, vec![1, 2]);
    }

    #[test]
    fn test_origin_never_receives_its_own_update() {
        let mut f = fixture();
        f.player_at(1, 0.0, 0.0);
        f.player_at(2, 0.0, 0.0);

        let update = sync(Position::new(1.0, 1.0, 0.0)).from(1);
        let delivered = f.broadcaster.deliver(&mut f.table, &update);

        assert_eq!(delivered, 1);
        assert!(f.transport.opcodes_for(1).is_empty());
        assert_eq!(f.transport.opcodes_for(2), vec![Opcode::PlayerSync]);
        assert_eq!(f.table.get(2).unwrap().packets_sent, 1);
    }

    #[test]
    fn test_radius_extends_reach() {
        let mut f = fixture();
        f.player_at(1, 0.0, 0.0);

        let far = Position::new(45.0, 0.0, 0.0);
        let sound = Broadcast::relevant(
            Opcode::SoundRelay,
            &WorldSound {
                position: far,
                radius: 50.0,
                volume: 1.0,
            },
            far,
        )
        .unwrap();
        assert!(f.broadcaster.recipients(&f.table, &sound).is_empty());

        let sound = sound.within(50.0);
        assert_eq!(f.broadcaster.recipients(&f.table, &sound), vec![1]);
    }

    #[test]
    fn test_pending_connections_receive_nothing() {
        let mut f = fixture();
        let now = Instant::now();
        f.table.insert(9, "pending".into(), now, now);
        f.player_at(1, 0.0, 0.0);

        let everyone = Broadcast::everyone(Opcode::ServerBusy, &shared::ServerBusy { busy: true })
            .unwrap();
        assert_eq!(f.broadcaster.recipients(&f.table, &everyone), vec![1]);
    }

    #[test]
    fn test_privileged_audience() {
        let mut f = fixture();
        f.player_at(1, 500.0, 500.0);
        f.player_at(2, 900.0, 900.0);
        f.player_at(3, 0.0, 0.0);
        f.table.get_mut(2).unwrap().access_level = AccessLevel::Admin;
        f.table.get_mut(3).unwrap().access_level = AccessLevel::Gm;

        let notice = Broadcast::privileged(
            Opcode::AdminReply,
            &shared::AdminReply {
                text: "heads up".into(),
            },
            AccessLevel::Moderator,
        )
        .unwrap()
        .from(2);

        // the admin is the origin but still qualifies; the gm only sees it
        // because the anchor is in view
        assert_eq!(f.broadcaster.recipients(&f.table, &notice), vec![2, 3]);
    }

    #[test]
    fn test_dead_players_do_not_perceive() {
        let mut f = fixture();
        f.player_at(1, 0.0, 0.0);
        f.table.get_mut(1).unwrap().player_mut(0).unwrap().alive = false;

        assert!(f
            .broadcaster
            .recipients(&f.table, &sync(Position::new(1.0, 1.0, 0.0)))
            .is_empty());
    }

    #[test]
    fn test_live_coop_partner_keeps_connection_perceiving() {
        let mut f = fixture();
        f.player_at(1, 0.0, 0.0);
        let far = AreaOfInterest::new(Position::new(500.0, 500.0, 0.0), 2);
        f.table.populate_slot(1, 1, "partner", far, Instant::now()).unwrap();
        f.table.get_mut(1).unwrap().player_mut(0).unwrap().alive = false;

        assert!(f
            .broadcaster
            .recipients(&f.table, &sync(Position::new(1.0, 1.0, 0.0)))
            .is_empty());
        assert_eq!(
            f.broadcaster
                .recipients(&f.table, &sync(Position::new(501.0, 501.0, 0.0))),
            vec![1]
        );
    }
}
