use super::HandlerContext;
use crate::admission;
use crate::connection::{ChecksumState, KickReason};
use crate::error::HandlerResult;
use crate::transport::ConnectionId;
use log::{debug, info, warn};
use shared::{
    ChecksumReport, LoginRequest, Opcode, Ping, Quit, Scoreboard, ScoreboardProbe, TransportProbe,
};

pub fn login(ctx: &mut HandlerContext<'_>, from: ConnectionId, req: LoginRequest) -> HandlerResult {
    admission::handle_login(ctx, from, req)
}

/// Echoes the timestamp back so the client can measure its round trip.
pub fn ping(ctx: &mut HandlerContext<'_>, from: ConnectionId, ping: Ping) -> HandlerResult {
    ctx.send(from, Opcode::Pong, &ping)
}

pub fn scoreboard(
    ctx: &mut HandlerContext<'_>,
    from: ConnectionId,
    _probe: ScoreboardProbe,
) -> HandlerResult {
    let players = ctx.connections.usernames();
    ctx.send(from, Opcode::Scoreboard, &Scoreboard { players })
}

/// Latency is measured by the transport; the main loop only refreshes
/// liveness, which the dispatcher already did.
pub fn probe_ack(
    _ctx: &mut HandlerContext<'_>,
    from: ConnectionId,
    probe: TransportProbe,
) -> HandlerResult {
    debug!("Probe ack from {} (sent at {})", from, probe.timestamp);
    Ok(())
}

pub fn checksum(
    ctx: &mut HandlerContext<'_>,
    from: ConnectionId,
    report: ChecksumReport,
) -> HandlerResult {
    let expected = ctx.config.session.content_checksum;
    let now = ctx.now;
    let connection = ctx.connected(from)?;
    let previous = connection.checksum;

    let next = match expected {
        None => ChecksumState::Done,
        Some(expected) if expected == report.checksum => ChecksumState::Done,
        Some(expected) => {
            if !matches!(previous, ChecksumState::Different { .. }) {
                warn!(
                    "Content checksum of {} differs: {:016x}, expected {:016x}",
                    connection.display_name(),
                    report.checksum,
                    expected
                );
            }
            match previous {
                ChecksumState::Different { since } => ChecksumState::Different { since },
                _ => ChecksumState::Different { since: now },
            }
        }
    };
    if next == ChecksumState::Done && matches!(previous, ChecksumState::Different { .. }) {
        info!("Content checksum of {} now matches", connection.display_name());
    }
    ctx.connection_mut(from)?.checksum = next;
    Ok(())
}

pub fn quit(ctx: &mut HandlerContext<'_>, from: ConnectionId, _quit: Quit) -> HandlerResult {
    ctx.disconnect(from, KickReason::ClientQuit);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::handlers::testing::Harness;
    use shared::Position;

    #[test]
    fn test_ping_echoes_timestamp() {
        let mut h = Harness::new();
        h.connect(1);

        ping(&mut h.ctx(), 1, Ping { timestamp: 777 }).unwrap();

        assert_eq!(
            h.transport.messages_for::<Ping>(1, Opcode::Pong),
            vec![Ping { timestamp: 777 }]
        );
    }

    #[test]
    fn test_scoreboard_lists_logged_in_players() {
        let mut h = Harness::new();
        h.player(1, "alice", Position::default());
        h.player(2, "bob", Position::default());
        h.connect(3);

        scoreboard(&mut h.ctx(), 3, ScoreboardProbe).unwrap();

        let mut players = h.transport.messages_for::<Scoreboard>(3, Opcode::Scoreboard)[0]
            .players
            .clone();
        players.sort();
        assert_eq!(players, vec!["alice".to_string(), "bob".to_string()]);
    }

    #[test]
    fn test_checksum_mismatch_then_match() {
        let mut config = ServerConfig::default();
        config.session.content_checksum = Some(0xfeed);
        let mut h = Harness::with_config(config);
        h.player(1, "alice", Position::default());

        checksum(&mut h.ctx(), 1, ChecksumReport { checksum: 0xbeef }).unwrap();
        let first = h.connections.get(1).unwrap().checksum;
        assert!(matches!(first, ChecksumState::Different { .. }));

        checksum(&mut h.ctx(), 1, ChecksumReport { checksum: 0xbeef }).unwrap();
        assert_eq!(h.connections.get(1).unwrap().checksum, first);

        checksum(&mut h.ctx(), 1, ChecksumReport { checksum: 0xfeed }).unwrap();
        assert_eq!(h.connections.get(1).unwrap().checksum, ChecksumState::Done);
    }

    #[test]
    fn test_checksum_without_expected_value_is_accepted() {
        let mut h = Harness::new();
        h.player(1, "alice", Position::default());

        checksum(&mut h.ctx(), 1, ChecksumReport { checksum: 1 }).unwrap();

        assert_eq!(h.connections.get(1).unwrap().checksum, ChecksumState::Done);
    }

    #[test]
    fn test_checksum_before_login_is_rejected() {
        let mut h = Harness::new();
        h.connect(1);

        let result = checksum(&mut h.ctx(), 1, ChecksumReport { checksum: 1 });

        assert!(result.is_err());
        assert_eq!(h.connections.get(1).unwrap().checksum, ChecksumState::Init);
    }

    #[test]
    fn test_quit_removes_silently() {
        let mut h = Harness::new();
        h.player(1, "alice", Position::default());

        quit(&mut h.ctx(), 1, Quit).unwrap();

        assert!(h.connections.get(1).is_none());
        assert!(h.transport.opcodes_for(1).is_empty());
        assert_eq!(h.transport.disconnects(), vec![(1, "Quit".to_string())]);
        assert!(h.connections.identities().by_username("alice").is_none());
    }
}
