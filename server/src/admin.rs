//! Text admin commands, shared by the stdin console and the remote
//! `AdminCommand` opcode.

use crate::config::ServerConfig;
use crate::connection::KickReason;
use crate::handlers::HandlerContext;
use crate::security::PacketChecker;
use log::{info, warn};
use std::fmt::Write;

const HELP: &str = "commands: help, players, status, kick <user> [reason], reloadsecurity, quit";

/// Runs one command line and returns the reply text.
pub fn execute(ctx: &mut HandlerContext<'_>, line: &str, actor: &str) -> String {
    let line = line.trim();
    let (command, args) = match line.split_once(char::is_whitespace) {
        Some((command, args)) => (command, args.trim()),
        None => (line, ""),
    };
    info!("{} ran admin command: {}", actor, line);

    match command.to_ascii_lowercase().as_str() {
        "" | "help" => HELP.to_string(),
        "players" => players(ctx),
        "status" => status(ctx),
        "kick" => kick(ctx, args, actor),
        "reloadsecurity" => reload_security(ctx),
        "quit" | "shutdown" => {
            ctx.control.shutdown_requested = true;
            "shutting down".to_string()
        }
        other => format!("unknown command '{}'. {}", other, HELP),
    }
}

fn players(ctx: &HandlerContext<'_>) -> String {
    let mut out = String::new();
    let mut count = 0;
    for connection in ctx.connections.iter().filter(|c| c.is_fully_connected()) {
        for (slot, player) in connection.occupied() {
            count += 1;
            let _ = write!(
                out,
                "\n  {} (id {}, connection {} slot {}{}{})",
                player.username,
                player.online_id,
                connection.id,
                slot,
                if player.alive { "" } else { ", dead" },
                if connection.access_level.is_staff() {
                    format!(", {}", connection.access_level)
                } else {
                    String::new()
                },
            );
        }
    }
    format!("{} player(s) online{}", count, out)
}

fn status(ctx: &HandlerContext<'_>) -> String {
    format!(
        "tick {}, {} connection(s), {} player(s) of {}, {} queued, {}envelopes {}/{}, {} security check(s) active",
        ctx.tick,
        ctx.connections.len(),
        ctx.connections.player_count(),
        ctx.config.admission.max_players,
        ctx.admission.queue_len(),
        if ctx.overloaded { "OVERLOADED, " } else { "" },
        ctx.pool.outstanding(),
        ctx.pool.capacity(),
        ctx.security.active_checks(),
    )
}

fn kick(ctx: &mut HandlerContext<'_>, args: &str, actor: &str) -> String {
    let (username, reason) = match args.split_once(char::is_whitespace) {
        Some((username, reason)) => (username, reason.trim()),
        None => (args, ""),
    };
    if username.is_empty() {
        return "usage: kick <user> [reason]".to_string();
    }
    let Some((connection, _)) = ctx
        .connections
        .identities()
        .by_username(username)
        .and_then(|online_id| ctx.connections.locate(online_id))
    else {
        return format!("no player named {}", username);
    };

    let message = if reason.is_empty() {
        format!("Kicked by {}", actor)
    } else {
        reason.to_string()
    };
    ctx.disconnect(connection, KickReason::Admin(message));
    format!("kicked {}", username)
}

fn reload_security(ctx: &mut HandlerContext<'_>) -> String {
    let Some(path) = ctx.control.config_path.clone() else {
        return "no config file to reload from".to_string();
    };
    match ServerConfig::from_file(&path) {
        Ok(config) => {
            *ctx.security = PacketChecker::new(&config.security);
            format!(
                "reloaded {} active security check(s) from {}",
                ctx.security.active_checks(),
                path.display()
            )
        }
        Err(e) => {
            warn!("Security reload failed: {}", e);
            format!("reload failed: {}", e)
        }
    }
}
