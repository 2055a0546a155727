use super::HandlerContext;
use crate::error::{HandlerError, HandlerResult};
use crate::transport::ConnectionId;
use shared::{AdminCommand, AdminReply, Opcode};

/// Remote admin command from a staff client. Replies go to the sender only.
pub fn command(ctx: &mut HandlerContext<'_>, from: ConnectionId, msg: AdminCommand) -> HandlerResult {
    let connection = ctx.connected(from)?;
    if !connection.access_level.is_staff() {
        return Err(HandlerError::NotPermitted("admin command"));
    }
    let actor = connection.display_name().to_string();

    let text = crate::admin::execute(ctx, &msg.command, &actor);
    if ctx.connections.contains(from) {
        ctx.send(from, Opcode::AdminReply, &AdminReply { text })?;
    }
    Ok(())
}
