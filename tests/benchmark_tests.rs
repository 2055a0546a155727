//! Performance benchmarks for the hot paths of the dispatch engine

use server::admission::{LoginAdmission, OpenAuthenticator};
use server::broadcast::{Broadcast, RelevanceBroadcaster};
use server::config::ServerConfig;
use server::engine::{Engine, Inbound};
use server::simulation::IdleWorld;
use server::text_filter::TextFilter;
use server::transport::{ConnectionId, MemoryTransport};
use server::triage::InboundTriage;
use shared::{encode_frame, LoginRequest, Opcode, PlayerSync, PlayerUpdate, Position, SERVER_VERSION};
use std::sync::Arc;
use std::time::Instant;

fn update_frame(slot: u8, x: f32) -> Vec<u8> {
    let update = PlayerUpdate {
        slot,
        position: Position::new(x, 100.0, 0.0),
        direction: 0.0,
        moving: true,
    };
    encode_frame(Opcode::PlayerUpdate, &update).unwrap()
}

/// Builds an engine with `players` logged in, spread along the x axis.
fn populated_engine(players: u64) -> (Engine, InboundTriage, Arc<MemoryTransport>) {
    let mut config = ServerConfig::default();
    config.admission.max_players = players as usize;
    let transport = Arc::new(MemoryTransport::new());
    let inbound = Inbound::new(&config);
    let triage = inbound.triage();
    let admission = LoginAdmission::new(Box::new(OpenAuthenticator::new()), TextFilter::default());
    let mut engine = Engine::new(
        config,
        inbound,
        transport.clone(),
        Box::new(IdleWorld::default().with_jitter(0.0)),
        admission,
    );

    for id in 1..=players {
        transport.open(id);
        triage.connected(id, format!("10.0.0.{}:27000", id));
        let login = LoginRequest {
            slot: 0,
            username: format!("player{}", id),
            password: String::new(),
            client_version: SERVER_VERSION.to_string(),
            platform_id: None,
        };
        triage.submit(id, &encode_frame(Opcode::Login, &login).unwrap());
    }
    engine.run_tick();
    for id in 1..=players {
        triage.submit(id, &update_frame(0, id as f32 * 4.0));
    }
    engine.run_tick();
    transport.clear();

    (engine, triage, transport)
}

/// Benchmarks submitting position updates through triage
#[test]
fn benchmark_triage_submit() {
    let (_engine, triage, _transport) = populated_engine(16);
    let frames: Vec<Vec<u8>> = (0..16).map(|i| update_frame(0, i as f32)).collect();

    let iterations = 100_000;
    let start = Instant::now();

    for i in 0..iterations {
        let connection = (i % 16) as ConnectionId + 1;
        triage.submit(connection, &frames[i % 16]);
    }

    let duration = start.elapsed();
    println!(
        "Triage submit: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks a tick that collapses a flood of updates per player
#[test]
fn benchmark_coalesced_tick() {
    let (mut engine, triage, _transport) = populated_engine(32);

    let rounds = 20;
    let updates_per_player = 200;
    let start = Instant::now();

    for round in 0..rounds {
        for id in 1..=32u64 {
            for step in 0..updates_per_player {
                let x = id as f32 * 4.0 + (round * updates_per_player + step) as f32 * 0.001;
                triage.submit(id, &update_frame(0, x));
            }
        }
        let report = engine.run_tick();
        assert_eq!(report.coalesced, 32);
    }

    let duration = start.elapsed();
    println!(
        "Coalesced ticks: {} ticks of {} updates in {:?} ({:.2} ms/tick)",
        rounds,
        32 * updates_per_player,
        duration,
        duration.as_secs_f64() * 1000.0 / rounds as f64
    );
    assert_eq!(engine.pool().outstanding(), 0);

    // Should complete in under 3 seconds
    assert!(duration.as_millis() < 3000);
}

/// Benchmarks relevance filtering across a full connection table
#[test]
fn benchmark_broadcast_recipients() {
    let (engine, _triage, transport) = populated_engine(64);
    let broadcaster = RelevanceBroadcaster::new(transport);
    let sync = PlayerSync {
        online_id: 1,
        position: Position::new(120.0, 100.0, 0.0),
        direction: 0.0,
        moving: true,
    };
    let broadcast = Broadcast::relevant(Opcode::PlayerSync, &sync, sync.position).unwrap();

    let iterations = 10_000;
    let start = Instant::now();
    let mut delivered = 0;

    for _ in 0..iterations {
        delivered += broadcaster.recipients(engine.connections(), &broadcast).len();
    }

    let duration = start.elapsed();
    println!(
        "Broadcast recipients: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );
    assert!(delivered > 0);

    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks idle ticks with a populated server
#[test]
fn benchmark_idle_ticks() {
    let (mut engine, _triage, _transport) = populated_engine(32);

    let ticks = 1_000;
    let start = Instant::now();

    for _ in 0..ticks {
        engine.run_tick();
    }

    let duration = start.elapsed();
    println!(
        "Idle ticks: {} ticks in {:?} ({:.2} μs/tick)",
        ticks,
        duration,
        duration.as_micros() as f64 / ticks as f64
    );
    assert_eq!(engine.connections().player_count(), 32);

    // Should complete in under 1 second
    assert!(duration.as_millis() < 1000);
}
