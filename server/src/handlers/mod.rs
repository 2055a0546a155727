//! Message handlers and the context they run in.
//!
//! Each inbound opcode has one [`Handler`]. Handlers run on the main loop
//! only, one message at a time, with mutable access to session state through
//! [`HandlerContext`]. A handler reports failure through its `Result`; the
//! dispatcher logs it and, for malformed payloads, kicks the sender. Nothing a
//! handler returns can stop the loop.

mod admin;
mod player;
mod session;
mod world;

use crate::admission::LoginAdmission;
use crate::broadcast::{Broadcast, RelevanceBroadcaster};
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionTable, KickReason};
use crate::envelope::{EnvelopePool, PacketEnvelope};
use crate::error::{HandlerError, HandlerResult};
use crate::registry::MessageTypeRegistry;
use crate::security::PacketChecker;
use crate::simulation::Simulation;
use crate::transport::ConnectionId;
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared::{encode_frame, AccessDenied, AdminReply, Kicked, Opcode};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::time::Instant;

pub trait Handler: Send + Sync {
    fn handle(&self, ctx: &mut HandlerContext<'_>, envelope: &PacketEnvelope) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(&mut HandlerContext<'_>, &PacketEnvelope) -> HandlerResult + Send + Sync,
{
    fn handle(&self, ctx: &mut HandlerContext<'_>, envelope: &PacketEnvelope) -> HandlerResult {
        self(ctx, envelope)
    }
}

/// Adapter that decodes the payload into `M` before calling the function.
pub struct Typed<M, F> {
    f: F,
    _msg: PhantomData<fn() -> M>,
}

pub fn typed<M, F>(f: F) -> Typed<M, F>
where
    M: DeserializeOwned,
    F: Fn(&mut HandlerContext<'_>, ConnectionId, M) -> HandlerResult + Send + Sync,
{
    Typed {
        f,
        _msg: PhantomData,
    }
}

impl<M, F> Handler for Typed<M, F>
where
    M: DeserializeOwned,
    F: Fn(&mut HandlerContext<'_>, ConnectionId, M) -> HandlerResult + Send + Sync,
{
    fn handle(&self, ctx: &mut HandlerContext<'_>, envelope: &PacketEnvelope) -> HandlerResult {
        let msg = envelope.decode::<M>()?;
        (self.f)(ctx, envelope.connection(), msg)
    }
}

pub fn register_builtin(registry: &mut MessageTypeRegistry) {
    registry.register(Opcode::Login, typed(session::login));
    registry.register(Opcode::Ping, typed(session::ping));
    registry.register(Opcode::ScoreboardProbe, typed(session::scoreboard));
    registry.register(Opcode::TransportProbeAck, typed(session::probe_ack));
    registry.register(Opcode::Checksum, typed(session::checksum));
    registry.register(Opcode::Quit, typed(session::quit));
    registry.register(Opcode::PlayerUpdate, typed(player::update));
    registry.register(Opcode::PlayerDeath, typed(player::death));
    registry.register(Opcode::ChatMessage, typed(player::chat));
    registry.register(Opcode::Teleport, typed(player::teleport));
    registry.register(Opcode::TreatPlayer, typed(player::treat));
    registry.register(Opcode::HitCharacter, typed(player::hit));
    registry.register(Opcode::VehiclePhysics, typed(world::vehicle));
    registry.register(Opcode::WorldSound, typed(world::sound));
    registry.register(Opcode::AdminCommand, typed(admin::command));
}

/// Engine-level switches handlers and console commands may flip.
#[derive(Debug, Default)]
pub struct EngineControl {
    pub shutdown_requested: bool,
    /// File the configuration was loaded from, re-read by `reloadsecurity`
    pub config_path: Option<PathBuf>,
}

pub struct HandlerContext<'a> {
    pub config: &'a ServerConfig,
    pub connections: &'a mut ConnectionTable,
    pub admission: &'a mut LoginAdmission,
    pub broadcaster: &'a RelevanceBroadcaster,
    pub world: &'a mut dyn Simulation,
    pub security: &'a mut PacketChecker,
    pub outbox: &'a mut Vec<Broadcast>,
    pub control: &'a mut EngineControl,
    pub pool: &'a EnvelopePool,
    pub overloaded: bool,
    pub tick: u64,
    pub now: Instant,
}

impl HandlerContext<'_> {
    pub fn connection(&self, id: ConnectionId) -> Result<&Connection, HandlerError> {
        self.connections
            .get(id)
            .ok_or(HandlerError::UnknownConnection(id))
    }

    pub fn connection_mut(&mut self, id: ConnectionId) -> Result<&mut Connection, HandlerError> {
        self.connections
            .get_mut(id)
            .ok_or(HandlerError::UnknownConnection(id))
    }

    /// Fully connected connection, or a rejection for gameplay before login.
    pub fn connected(&self, id: ConnectionId) -> Result<&Connection, HandlerError> {
        let connection = self.connection(id)?;
        if !connection.is_fully_connected() {
            return Err(HandlerError::rejected("connection is not logged in"));
        }
        Ok(connection)
    }

    pub fn send<T: Serialize>(
        &mut self,
        to: ConnectionId,
        opcode: Opcode,
        payload: &T,
    ) -> HandlerResult {
        let frame = encode_frame(opcode, payload)?;
        self.send_frame(to, &frame)
    }

    pub fn send_frame(&mut self, to: ConnectionId, frame: &[u8]) -> HandlerResult {
        let connection = self
            .connections
            .get_mut(to)
            .ok_or(HandlerError::UnknownConnection(to))?;
        self.broadcaster.send_frame(connection, frame);
        Ok(())
    }

    /// Queues a broadcast for delivery at the end of the tick.
    pub fn broadcast(&mut self, broadcast: Broadcast) {
        self.outbox.push(broadcast);
    }

    /// Sends a line of text to every online staff member.
    pub fn notify_staff(&mut self, text: &str) {
        let reply = AdminReply {
            text: text.to_string(),
        };
        match Broadcast::privileged(
            Opcode::AdminReply,
            &reply,
            self.config.relevance.privileged_level,
        ) {
            Ok(broadcast) => self.outbox.push(broadcast),
            Err(e) => warn!("Failed to encode staff notice: {}", e),
        }
    }

    pub fn round_trip_ms(&self, id: ConnectionId) -> Option<u32> {
        self.broadcaster.transport().round_trip_ms(id)
    }

    /// Removes a connection: tells the client why (when it is still there),
    /// closes the endpoint and releases every identity it held. Returns
    /// `false` if the connection was not in the table.
    pub fn disconnect(&mut self, id: ConnectionId, reason: KickReason) -> bool {
        let transport = self.broadcaster.transport();
        let Some(connection) = self.connections.get_mut(id) else {
            transport.force_disconnect(id, &reason.code());
            return false;
        };

        if reason.notifies_client() {
            let frame = match &reason {
                KickReason::Denied { slot, reason } => encode_frame(
                    Opcode::AccessDenied,
                    &AccessDenied {
                        slot: *slot,
                        reason: reason.code(),
                    },
                ),
                other => encode_frame(
                    Opcode::Kicked,
                    &Kicked {
                        reason: other.client_text(),
                    },
                ),
            };
            match frame {
                Ok(frame) => self.broadcaster.send_frame(connection, &frame),
                Err(e) => warn!("Failed to encode disconnect notice for {}: {}", id, e),
            }
        }

        let name = connection.display_name().to_string();
        transport.force_disconnect(id, &reason.code());
        self.admission.forget(id);
        if let Some(removed) = self.connections.remove(id) {
            for (_, player) in removed.occupied() {
                self.world.player_left(player.online_id);
            }
        }

        match reason {
            KickReason::ClientQuit | KickReason::TransportClosed(_) | KickReason::Denied { .. } => {
                info!("Connection {} ({}) closed: {}", id, name, reason)
            }
            _ => warn!("Connection {} ({}) kicked: {}", id, name, reason),
        }
        true
    }
}
