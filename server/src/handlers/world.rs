use super::HandlerContext;
use crate::broadcast::Broadcast;
use crate::error::{HandlerError, HandlerResult};
use crate::transport::ConnectionId;
use shared::{Opcode, VehiclePhysics, WorldSound};

pub fn vehicle(ctx: &mut HandlerContext<'_>, from: ConnectionId, msg: VehiclePhysics) -> HandlerResult {
    ctx.connected(from)?;
    let broadcast = Broadcast::relevant(Opcode::VehicleSync, &msg, msg.position)?.from(from);
    ctx.broadcast(broadcast);
    Ok(())
}

/// Sounds carry their own audible radius on top of the usual area of interest.
pub fn sound(ctx: &mut HandlerContext<'_>, from: ConnectionId, msg: WorldSound) -> HandlerResult {
    ctx.connected(from)?;
    if !msg.radius.is_finite() || msg.radius < 0.0 {
        return Err(HandlerError::rejected(format!("sound radius {}", msg.radius)));
    }
    let broadcast = Broadcast::relevant(Opcode::SoundRelay, &msg, msg.position)?
        .within(msg.radius)
        .from(from);
    ctx.broadcast(broadcast);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::Harness;
    use shared::Position;

    #[test]
    fn test_vehicle_relay_is_queued_for_relevant_players() {
        let mut h = Harness::new();
        h.player(1, "alice", Position::new(10.0, 10.0, 0.0));
        h.player(2, "bob", Position::new(15.0, 10.0, 0.0));

        let msg = VehiclePhysics {
            vehicle_id: 7,
            position: Position::new(12.0, 10.0, 0.0),
            data: vec![1, 2, 3],
        };
        vehicle(&mut h.ctx(), 1, msg).unwrap();

        assert_eq!(h.outbox.len(), 1);
        let recipients = h.broadcaster.recipients(&h.connections, &h.outbox[0]);
        assert_eq!(recipients, vec![2]);
        assert_eq!(h.outbox[0].opcode, Opcode::VehicleSync);
    }

    #[test]
    fn test_loud_sound_reaches_beyond_view() {
        let mut h = Harness::new();
        h.player(1, "alice", Position::new(0.0, 0.0, 0.0));
        h.player(2, "bob", Position::new(150.0, 0.0, 0.0));

        let quiet = WorldSound {
            position: Position::new(0.0, 0.0, 0.0),
            radius: 10.0,
            volume: 1.0,
        };
        let loud = WorldSound {
            radius: 200.0,
            ..quiet
        };
        sound(&mut h.ctx(), 1, quiet).unwrap();
        sound(&mut h.ctx(), 1, loud).unwrap();

        assert!(h.broadcaster.recipients(&h.connections, &h.outbox[0]).is_empty());
        assert_eq!(h.broadcaster.recipients(&h.connections, &h.outbox[1]), vec![2]);
    }

    #[test]
    fn test_sound_with_bad_radius_rejected() {
        let mut h = Harness::new();
        h.player(1, "alice", Position::default());
        let msg = WorldSound {
            position: Position::default(),
            radius: f32::NAN,
            volume: 1.0,
        };

        assert!(sound(&mut h.ctx(), 1, msg).is_err());
        assert!(h.outbox.is_empty());
    }

    #[test]
    fn test_gameplay_before_login_rejected() {
        let mut h = Harness::new();
        h.connect(1);
        let msg = VehiclePhysics {
            vehicle_id: 1,
            position: Position::default(),
            data: Vec::new(),
        };

        assert!(vehicle(&mut h.ctx(), 1, msg).is_err());
    }
}
