use super::HandlerContext;
use crate::broadcast::Broadcast;
use crate::error::{HandlerError, HandlerResult};
use crate::transport::ConnectionId;
use log::{debug, info};
use shared::{
    ChatMessage, ChatRelay, HitCharacter, OnlineId, Opcode, PlayerDeath, PlayerDied, PlayerSync,
    PlayerUpdate, Teleport, TreatPlayer,
};

/// Slot of `online_id` on `from`, or a rejection if another connection owns it.
fn own_slot(ctx: &HandlerContext<'_>, from: ConnectionId, online_id: OnlineId) -> Result<u8, HandlerError> {
    match ctx.connections.locate(online_id) {
        Some((owner, slot)) if owner == from => Ok(slot),
        Some(_) => Err(HandlerError::rejected(format!(
            "player {} belongs to another connection",
            online_id
        ))),
        None => Err(HandlerError::rejected(format!("player {} is not online", online_id))),
    }
}

pub fn update(ctx: &mut HandlerContext<'_>, from: ConnectionId, update: PlayerUpdate) -> HandlerResult {
    let connection = ctx.connected(from)?;
    let player = connection
        .player(update.slot)
        .ok_or_else(|| HandlerError::rejected(format!("no player in slot {}", update.slot)))?;
    if !player.alive {
        return Err(HandlerError::rejected("update for a dead player"));
    }
    let online_id = player.online_id;

    if let Some(player) = ctx.connection_mut(from)?.player_mut(update.slot) {
        player.interest.anchor = update.position;
    }
    ctx.world.player_moved(online_id, update.position);

    let sync = PlayerSync {
        online_id,
        position: update.position,
        direction: update.direction,
        moving: update.moving,
    };
    ctx.broadcast(Broadcast::relevant(Opcode::PlayerSync, &sync, update.position)?.from(from));
    Ok(())
}

pub fn death(ctx: &mut HandlerContext<'_>, from: ConnectionId, death: PlayerDeath) -> HandlerResult {
    ctx.connected(from)?;
    let slot = own_slot(ctx, from, death.online_id)?;
    let now = ctx.now;

    let connection = ctx.connection_mut(from)?;
    let player = connection
        .player_mut(slot)
        .ok_or_else(|| HandlerError::rejected("slot emptied"))?;
    if !player.alive {
        return Err(HandlerError::rejected("player is already dead"));
    }
    player.alive = false;
    player.disconnected_at = Some(now);
    let anchor = player.interest.anchor;
    let died = PlayerDied {
        online_id: death.online_id,
        username: player.username.clone(),
    };

    info!("{} died", died.username);
    ctx.broadcast(Broadcast::relevant(Opcode::PlayerDied, &died, anchor)?.from(from));
    Ok(())
}

pub fn chat(ctx: &mut HandlerContext<'_>, from: ConnectionId, msg: ChatMessage) -> HandlerResult {
    ctx.connected(from)?;
    let slot = own_slot(ctx, from, msg.online_id)?;
    let text = msg.text.trim();
    if text.is_empty() {
        return Ok(());
    }

    let connection = ctx.connection(from)?;
    let player = connection
        .player(slot)
        .ok_or_else(|| HandlerError::rejected("slot emptied"))?;
    let relay = ChatRelay {
        online_id: msg.online_id,
        author: player.username.clone(),
        text: ctx.admission.filter().censor(text),
    };
    let anchor = player.interest.anchor;

    debug!("[chat] {}: {}", relay.author, relay.text);
    let broadcast = Broadcast::relevant(Opcode::ChatRelay, &relay, anchor)?
        .within(ctx.config.relevance.chat_radius)
        .from(from);
    ctx.broadcast(broadcast);
    Ok(())
}

/// Staff moves a player, by username, to a new position.
pub fn teleport(ctx: &mut HandlerContext<'_>, from: ConnectionId, msg: Teleport) -> HandlerResult {
    let staff = ctx.connected(from)?;
    if !staff.access_level.is_staff() {
        return Err(HandlerError::NotPermitted("teleport"));
    }
    let staff_name = staff.display_name().to_string();

    let online_id = ctx
        .connections
        .identities()
        .by_username(&msg.target)
        .ok_or_else(|| HandlerError::rejected(format!("no player named {}", msg.target)))?;
    let (target, _) = ctx
        .connections
        .locate(online_id)
        .ok_or_else(|| HandlerError::rejected("target vanished"))?;
    if let Some(player) = ctx.connections.player_mut(online_id) {
        player.interest.anchor = msg.position;
    }
    ctx.world.player_moved(online_id, msg.position);

    let sync = PlayerSync {
        online_id,
        position: msg.position,
        direction: 0.0,
        moving: false,
    };
    ctx.send(target, Opcode::PlayerSync, &sync)?;
    ctx.broadcast(Broadcast::relevant(Opcode::PlayerSync, &sync, msg.position)?.from(target));

    info!(
        "{} teleported {} to ({:.1}, {:.1}, {:.1})",
        staff_name, msg.target, msg.position.x, msg.position.y, msg.position.z
    );
    Ok(())
}

/// Forwards a treatment to the connection hosting the target.
pub fn treat(ctx: &mut HandlerContext<'_>, from: ConnectionId, msg: TreatPlayer) -> HandlerResult {
    ctx.connected(from)?;
    let (target, _) = ctx
        .connections
        .locate(msg.target)
        .ok_or_else(|| HandlerError::rejected(format!("player {} is not online", msg.target)))?;
    ctx.send(target, Opcode::TreatPlayer, &msg)
}

pub fn hit(ctx: &mut HandlerContext<'_>, from: ConnectionId, msg: HitCharacter) -> HandlerResult {
    ctx.connected(from)?;
    if !ctx.config.session.pvp_enabled {
        return Err(HandlerError::rejected("pvp is disabled"));
    }
    let target = ctx
        .connections
        .player(msg.target)
        .ok_or_else(|| HandlerError::rejected(format!("player {} is not online", msg.target)))?;
    if !target.alive {
        return Err(HandlerError::rejected("target is dead"));
    }
    let anchor = target.interest.anchor;
    ctx.broadcast(Broadcast::relevant(Opcode::HitCharacter, &msg, anchor)?.from(from));
    Ok(())
}
