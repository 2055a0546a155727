//! World simulation collaborator.
//!
//! The engine owns sessions and traffic; everything about the world itself
//! sits behind [`Simulation`]. It produces the state a newly admitted player
//! needs and advances once per tick, pushing any updates into the outbox.

use crate::broadcast::Broadcast;
use log::{debug, info};
use rand::Rng;
use shared::{OnlineId, Opcode, Position, SpawnState, WorldState, WorldStateKind};

pub trait Simulation: Send {
    /// Advances the world by one tick.
    fn tick(&mut self, tick: u64, outbox: &mut Vec<Broadcast>);

    /// Where and how a newly admitted player starts.
    fn spawn_state(&mut self, username: &str, online_id: OnlineId) -> SpawnState;

    /// State burst sent right after admission: weather, nearby chunks,
    /// safehouses and non-PvP zones.
    fn initial_world_state(&self, anchor: Position) -> Vec<WorldState>;

    fn player_moved(&mut self, _online_id: OnlineId, _position: Position) {}

    fn player_left(&mut self, _online_id: OnlineId) {}
}

/// A world with nothing happening in it. Players spawn around a fixed point
/// and the weather is re-announced every `weather_interval` ticks.
#[derive(Debug, Clone)]
pub struct IdleWorld {
    spawn: Position,
    spawn_jitter: f32,
    weather: Vec<u8>,
    weather_interval: u64,
    chunk_radius: i32,
    players: usize,
}

impl IdleWorld {
    pub fn new(spawn: Position) -> Self {
        Self {
            spawn,
            spawn_jitter: 2.0,
            weather: vec![0],
            weather_interval: 600,
            chunk_radius: 1,
            players: 0,
        }
    }

    pub fn with_jitter(mut self, jitter: f32) -> Self {
        self.spawn_jitter = jitter.max(0.0);
        self
    }

    pub fn with_weather_interval(mut self, ticks: u64) -> Self {
        self.weather_interval = ticks;
        self
    }

    pub fn players(&self) -> usize {
        self.players
    }
}

impl Default for IdleWorld {
    fn default() -> Self {
        Self::new(Position::new(100.0, 100.0, 0.0))
    }
}

impl Simulation for IdleWorld {
    fn tick(&mut self, tick: u64, outbox: &mut Vec<Broadcast>) {
        if self.weather_interval == 0 || tick == 0 || tick % self.weather_interval != 0 {
            return;
        }
        let weather = WorldState {
            kind: WorldStateKind::Weather,
            data: self.weather.clone(),
        };
        match Broadcast::everyone(Opcode::WorldState, &weather) {
            Ok(broadcast) => outbox.push(broadcast),
            Err(e) => debug!("Failed to encode weather update: {}", e),
        }
    }

    fn spawn_state(&mut self, username: &str, online_id: OnlineId) -> SpawnState {
        let mut position = self.spawn;
        if self.spawn_jitter > 0.0 {
            let mut rng = rand::thread_rng();
            position.x += rng.gen_range(-self.spawn_jitter..=self.spawn_jitter);
            position.y += rng.gen_range(-self.spawn_jitter..=self.spawn_jitter);
        }
        self.players += 1;
        info!(
            "Spawning {} ({}) at ({:.1}, {:.1})",
            username, online_id, position.x, position.y
        );
        SpawnState {
            online_id,
            position,
            visuals: Vec::new(),
            inventory: Vec::new(),
        }
    }

    fn initial_world_state(&self, anchor: Position) -> Vec<WorldState> {
        let center = anchor.chunk();
        let mut burst = vec![WorldState {
            kind: WorldStateKind::Weather,
            data: self.weather.clone(),
        }];
        for dx in -self.chunk_radius..=self.chunk_radius {
            for dy in -self.chunk_radius..=self.chunk_radius {
                burst.push(WorldState {
                    kind: WorldStateKind::Chunk {
                        x: center.x + dx,
                        y: center.y + dy,
                    },
                    data: Vec::new(),
                });
            }
        }
        burst.push(WorldState {
            kind: WorldStateKind::Safehouse,
            data: Vec::new(),
        });
        burst.push(WorldState {
            kind: WorldStateKind::NonPvpZone,
            data: Vec::new(),
        });
        burst
    }

    fn player_left(&mut self, online_id: OnlineId) {
        self.players = self.players.saturating_sub(1);
        debug!("Player {} left the world", online_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_spawn_within_jitter() {
        let mut world = IdleWorld::new(Position::new(50.0, 50.0, 0.0)).with_jitter(3.0);
        for id in 0..50 {
            let spawn = world.spawn_state("p", id);
            assert_eq!(spawn.online_id, id);
            assert!((spawn.position.x - 50.0).abs() <= 3.0);
            assert!((spawn.position.y - 50.0).abs() <= 3.0);
        }
        assert_eq!(world.players(), 50);
    }

    #[test]
    fn test_spawn_without_jitter_is_exact() {
        let mut world = IdleWorld::new(Position::new(12.5, -4.0, 0.0)).with_jitter(0.0);
        let spawn = world.spawn_state("p", 0);
        assert_approx_eq!(spawn.position.x, 12.5);
        assert_approx_eq!(spawn.position.y, -4.0);
    }

    #[test]
    fn test_initial_burst_covers_surrounding_chunks() {
        let world = IdleWorld::default();
        let burst = world.initial_world_state(Position::new(25.0, 25.0, 0.0));

        assert_eq!(burst.first().map(|s| s.kind), Some(WorldStateKind::Weather));
        let chunks = burst
            .iter()
            .filter(|s| matches!(s.kind, WorldStateKind::Chunk { .. }))
            .count();
        assert_eq!(chunks, 9);
        assert!(burst
            .iter()
            .any(|s| s.kind == WorldStateKind::Chunk { x: 1, y: 3 }));
        assert_eq!(burst.last().map(|s| s.kind), Some(WorldStateKind::NonPvpZone));
    }

    #[test]
    fn test_weather_rebroadcast_interval() {
        let mut world = IdleWorld::default().with_weather_interval(5);
        let mut outbox = Vec::new();
        for tick in 0..11 {
            world.tick(tick, &mut outbox);
        }
        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox[0].opcode, Opcode::WorldState);
    }
}
