//! Login admission.
//!
//! A login is checked in a fixed order and the first failure decides the
//! denial reason:
//!
//! 1. client version (before anything else, so outdated clients always learn
//!    why they were refused)
//! 2. username: present and free of banned content
//! 3. credentials, through the [`Authenticator`]
//! 4. duplicates: the username or platform identity is already online
//! 5. overload: the governor is refusing logins
//! 6. capacity: queue the connection if possible, otherwise refuse
//!
//! Staff skip the capacity check. While anyone is queued, other newcomers
//! join the back of the queue instead of taking a freed place. Co-op logins
//! (slots 1-3, or slot 0 again after its player died) happen on an already
//! connected connection: they are never queued, and a failure only refuses
//! that slot.

use crate::config::AdmissionConfig;
use crate::connection::{AreaOfInterest, KickReason, PendingLogin, SessionState, SlotError};
use crate::error::{HandlerError, HandlerResult, ServerError};
use crate::handlers::HandlerContext;
use crate::text_filter::TextFilter;
use crate::transport::ConnectionId;
use log::{debug, info, warn};
use shared::{
    AccessDenied, AccessLevel, DenyReason, LoginAccepted, LoginRequest, Opcode, Position,
    QueuePosition, MAX_PLAYERS_PER_CONNECTION,
};
use std::collections::{HashMap, HashSet, VecDeque};

pub struct Credentials<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub platform_id: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthVerdict {
    Authorized { access_level: AccessLevel },
    Denied,
    Banned,
}

pub trait Authenticator: Send {
    fn authenticate(&self, credentials: &Credentials<'_>) -> AuthVerdict;
}

/// Lets everyone in. Named accounts can be given a staff access level.
#[derive(Debug, Clone, Default)]
pub struct OpenAuthenticator {
    staff: HashMap<String, AccessLevel>,
}

impl OpenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_staff(mut self, username: &str, level: AccessLevel) -> Self {
        self.staff.insert(username.to_lowercase(), level);
        self
    }
}

impl Authenticator for OpenAuthenticator {
    fn authenticate(&self, credentials: &Credentials<'_>) -> AuthVerdict {
        let access_level = self
            .staff
            .get(&credentials.username.to_lowercase())
            .copied()
            .unwrap_or_default();
        AuthVerdict::Authorized { access_level }
    }
}

#[derive(Debug, Clone)]
struct Account {
    password: String,
    access_level: AccessLevel,
}

/// Only known accounts with the right password get in.
#[derive(Debug, Clone, Default)]
pub struct WhitelistAuthenticator {
    accounts: HashMap<String, Account>,
    banned_names: HashSet<String>,
    banned_platforms: HashSet<u64>,
}

impl WhitelistAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_account(&mut self, username: &str, password: &str, access_level: AccessLevel) {
        self.accounts.insert(
            username.to_lowercase(),
            Account {
                password: password.to_string(),
                access_level,
            },
        );
    }

    pub fn ban(&mut self, username: &str) {
        self.banned_names.insert(username.to_lowercase());
    }

    pub fn ban_platform(&mut self, platform_id: u64) {
        self.banned_platforms.insert(platform_id);
    }
}

impl Authenticator for WhitelistAuthenticator {
    fn authenticate(&self, credentials: &Credentials<'_>) -> AuthVerdict {
        let name = credentials.username.to_lowercase();
        if self.banned_names.contains(&name)
            || credentials
                .platform_id
                .is_some_and(|id| self.banned_platforms.contains(&id))
        {
            return AuthVerdict::Banned;
        }
        match self.accounts.get(&name) {
            Some(account) if account.password == credentials.password => AuthVerdict::Authorized {
                access_level: account.access_level,
            },
            _ => AuthVerdict::Denied,
        }
    }
}

/// Credentials, content filter and the admission queue.
pub struct LoginAdmission {
    authenticator: Box<dyn Authenticator>,
    filter: TextFilter,
    queue: VecDeque<ConnectionId>,
}

impl LoginAdmission {
    pub fn new(authenticator: Box<dyn Authenticator>, filter: TextFilter) -> Self {
        Self {
            authenticator,
            filter,
            queue: VecDeque::new(),
        }
    }

    /// Builds the content filter from the configured phrases and phrase file.
    pub fn from_config(
        config: &AdmissionConfig,
        authenticator: Box<dyn Authenticator>,
    ) -> Result<Self, ServerError> {
        let mut filter = match &config.filter_file {
            Some(path) => TextFilter::from_file(path)?,
            None => TextFilter::default(),
        };
        for phrase in &config.filter_phrases {
            filter.add(phrase);
        }
        Ok(Self::new(authenticator, filter))
    }

    pub fn filter(&self) -> &TextFilter {
        &self.filter
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queued(&self) -> Vec<ConnectionId> {
        self.queue.iter().copied().collect()
    }

    /// Drops a connection from the queue, if it was waiting.
    pub fn forget(&mut self, id: ConnectionId) {
        self.queue.retain(|queued| *queued != id);
    }
}

/// Handles one `Login` message.
pub fn handle_login(ctx: &mut HandlerContext<'_>, id: ConnectionId, req: LoginRequest) -> HandlerResult {
    let slot = req.slot;
    if slot as usize >= MAX_PLAYERS_PER_CONNECTION {
        ctx.disconnect(
            id,
            KickReason::ProtocolViolation(format!("login for slot {}", slot)),
        );
        return Ok(());
    }

    let connection = ctx.connection(id)?;
    let in_place = match connection.state {
        SessionState::AwaitingCredentials if slot == 0 => false,
        SessionState::FullyConnected => true,
        SessionState::AwaitingCredentials => {
            return deny(ctx, id, slot, DenyReason::Unauthorized);
        }
        state => {
            return Err(HandlerError::rejected(format!(
                "login while {:?}",
                state
            )))
        }
    };
    if !in_place {
        let connection = ctx.connection_mut(id)?;
        connection.state = SessionState::Authenticating;
        connection.platform_id = req.platform_id;
    }

    let server_version = &ctx.config.admission.server_version;
    if req.client_version != *server_version {
        let reason = DenyReason::ClientVersionMismatch {
            client: req.client_version.clone(),
            server: server_version.clone(),
        };
        return deny(ctx, id, slot, reason);
    }

    let username = req.username.trim();
    if username.is_empty() || ctx.admission.filter.test(username) {
        return deny(ctx, id, slot, DenyReason::InvalidUsername);
    }

    let verdict = ctx.admission.authenticator.authenticate(&Credentials {
        username,
        password: &req.password,
        platform_id: req.platform_id,
    });
    let access_level = match verdict {
        AuthVerdict::Authorized { access_level } => access_level,
        AuthVerdict::Denied => return deny(ctx, id, slot, DenyReason::Unauthorized),
        AuthVerdict::Banned => return deny(ctx, id, slot, DenyReason::Banned),
    };

    if is_duplicate(ctx, id, slot, username, req.platform_id, in_place) {
        return deny(ctx, id, slot, DenyReason::AlreadyConnected);
    }

    if ctx.overloaded && ctx.config.overload.deny_logins_when_overloaded {
        return deny(ctx, id, slot, DenyReason::ServerBusy);
    }

    let login = PendingLogin {
        slot,
        username: username.to_string(),
        access_level,
    };
    if access_level.is_staff() {
        return admit(ctx, id, login);
    }

    let full = ctx.connections.player_count() >= ctx.config.admission.max_players;
    if in_place {
        // Replacing a dead player keeps the identity count unchanged
        let adds_identity = ctx.connection(id)?.player(slot).is_none();
        if full && adds_identity {
            return deny(ctx, id, slot, DenyReason::ServerFull);
        }
        return admit(ctx, id, login);
    }

    // Newcomers wait behind everyone already queued
    if full || !ctx.admission.queue.is_empty() {
        let admission = &ctx.config.admission;
        if admission.queue_enabled && ctx.admission.queue.len() < admission.queue_capacity {
            return enqueue(ctx, id, login);
        }
        return deny(ctx, id, slot, DenyReason::ServerFull);
    }

    admit(ctx, id, login)
}

/// The username or platform identity is online somewhere else, or the
/// username is already waiting in the queue. A dead player being replaced in
/// the very slot it occupied does not count.
fn is_duplicate(
    ctx: &HandlerContext<'_>,
    id: ConnectionId,
    slot: u8,
    username: &str,
    platform_id: Option<u64>,
    in_place: bool,
) -> bool {
    if let Some(online_id) = ctx.connections.identities().by_username(username) {
        let replacing = ctx.connections.locate(online_id) == Some((id, slot))
            && ctx
                .connections
                .player(online_id)
                .is_some_and(|player| !player.alive);
        if !replacing {
            return true;
        }
    }
    let waiting = ctx.admission.queue.iter().any(|&queued| {
        queued != id
            && ctx
                .connections
                .get(queued)
                .and_then(|connection| connection.admission.as_ref())
                .and_then(|record| record.pending.as_ref())
                .is_some_and(|login| login.username.to_lowercase() == username.to_lowercase())
    });
    if waiting {
        return true;
    }
    if in_place {
        return false;
    }
    platform_id.is_some_and(|platform| {
        ctx.connections
            .iter()
            .any(|other| other.id != id && other.platform_id == Some(platform))
    })
}

fn enqueue(ctx: &mut HandlerContext<'_>, id: ConnectionId, login: PendingLogin) -> HandlerResult {
    ctx.admission.queue.push_back(id);
    let position = ctx.admission.queue.len() as u32;
    let now = ctx.now;
    let username = login.username.clone();

    let connection = ctx.connection_mut(id)?;
    connection.state = SessionState::AdmissionQueued;
    if let Some(record) = connection.admission.as_mut() {
        record.queued_at = Some(now);
        record.queue_position = Some(position);
        record.pending = Some(login);
    }

    info!(
        "Server full, {} waits in the admission queue at position {}",
        username, position
    );
    ctx.send(id, Opcode::QueuePosition, &QueuePosition { position })
}

/// Populates the slot and sends the accept, spawn and world-state burst.
fn admit(ctx: &mut HandlerContext<'_>, id: ConnectionId, login: PendingLogin) -> HandlerResult {
    let PendingLogin {
        slot,
        username,
        access_level,
    } = login;

    // Someone with this name may have got in while the login was queued
    let connection = ctx.connection(id)?;
    let in_place = connection.is_fully_connected();
    let platform_id = connection.platform_id;
    if is_duplicate(ctx, id, slot, &username, platform_id, in_place) {
        return deny(ctx, id, slot, DenyReason::AlreadyConnected);
    }

    let radius = ctx.config.relevance.view_radius_chunks;
    let placeholder = AreaOfInterest::new(Position::default(), radius);

    let online_id = match ctx
        .connections
        .populate_slot(id, slot, &username, placeholder, ctx.now)
    {
        Ok(online_id) => online_id,
        Err(SlotError::UnknownConnection) => return Err(HandlerError::UnknownConnection(id)),
        Err(err) => return deny(ctx, id, slot, err.into()),
    };

    let spawn = ctx.world.spawn_state(&username, online_id);
    if let Some(player) = ctx.connections.player_mut(online_id) {
        player.interest.anchor = spawn.position;
    }

    let connection = ctx.connection_mut(id)?;
    let first_login = !connection.is_fully_connected();
    connection.access_level = connection.access_level.max(access_level);
    let granted = connection.access_level;
    if first_login {
        ctx.connections.promote(id);
    }

    ctx.send(
        id,
        Opcode::LoginAccepted,
        &LoginAccepted {
            slot,
            online_id,
            access_level: granted,
        },
    )?;
    ctx.send(id, Opcode::SpawnState, &spawn)?;
    for state in ctx.world.initial_world_state(spawn.position) {
        ctx.send(id, Opcode::WorldState, &state)?;
    }

    if granted.is_staff() {
        info!(
            "{} logged in as online id {} (slot {}, connection {}, {})",
            username, online_id, slot, id, granted
        );
    } else {
        info!(
            "{} logged in as online id {} (slot {}, connection {})",
            username, online_id, slot, id
        );
    }
    Ok(())
}

/// Refuses a login. A connection that is already playing keeps its other
/// players and only hears about the refused slot; any other connection is
/// closed after the single `AccessDenied`.
fn deny(ctx: &mut HandlerContext<'_>, id: ConnectionId, slot: u8, reason: DenyReason) -> HandlerResult {
    let keep = ctx
        .connections
        .get(id)
        .is_some_and(|connection| connection.is_fully_connected());
    if keep {
        info!("Login for slot {} on connection {} refused: {}", slot, id, reason);
        return ctx.send(
            id,
            Opcode::AccessDenied,
            &AccessDenied {
                slot,
                reason: reason.code(),
            },
        );
    }
    ctx.disconnect(id, KickReason::Denied { slot, reason });
    Ok(())
}

/// Times out and promotes queued connections. Runs once per tick.
pub fn service_queue(ctx: &mut HandlerContext<'_>) {
    let timeout = ctx.config.admission.queue_timeout();
    let max_ping = ctx.config.admission.max_queue_ping_ms;

    for id in ctx.admission.queued() {
        let queued_at = ctx
            .connections
            .get(id)
            .and_then(|connection| connection.admission.as_ref())
            .and_then(|record| record.queued_at);
        let Some(queued_at) = queued_at else {
            ctx.admission.forget(id);
            continue;
        };
        if ctx.now.duration_since(queued_at) < timeout {
            continue;
        }
        let reason = if ctx.round_trip_ms(id).is_some_and(|rtt| rtt > max_ping) {
            DenyReason::PingTooHigh
        } else {
            DenyReason::QueueTimeout
        };
        let slot = pending_slot(ctx, id);
        ctx.disconnect(id, KickReason::Denied { slot, reason });
    }

    let mut index = 0;
    while index < ctx.admission.queue.len()
        && ctx.connections.player_count() < ctx.config.admission.max_players
    {
        let id = ctx.admission.queue[index];
        if ctx.round_trip_ms(id).is_some_and(|rtt| rtt > max_ping) {
            debug!("Queued connection {} skipped: latency above {} ms", id, max_ping);
            index += 1;
            continue;
        }
        ctx.admission.queue.remove(index);

        let pending = ctx
            .connections
            .get_mut(id)
            .and_then(|connection| connection.admission.as_mut())
            .and_then(|record| record.pending.take());
        let Some(login) = pending else {
            continue;
        };
        info!("Admitting {} from the queue", login.username);
        if let Err(e) = admit(ctx, id, login) {
            warn!("Failed to admit queued connection {}: {}", id, e);
        }
    }

    for (index, id) in ctx.admission.queued().into_iter().enumerate() {
        let position = index as u32 + 1;
        let Some(record) = ctx
            .connections
            .get_mut(id)
            .and_then(|connection| connection.admission.as_mut())
        else {
            continue;
        };
        if record.queue_position == Some(position) {
            continue;
        }
        record.queue_position = Some(position);
        if let Err(e) = ctx.send(id, Opcode::QueuePosition, &QueuePosition { position }) {
            debug!("Failed to send queue position to {}: {}", id, e);
        }
    }
}

fn pending_slot(ctx: &HandlerContext<'_>, id: ConnectionId) -> u8 {
    ctx.connections
        .get(id)
        .and_then(|connection| connection.admission.as_ref())
        .and_then(|record| record.pending.as_ref())
        .map_or(0, |login| login.slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::handlers::testing::Harness;
    use crate::simulation::Simulation;
    use shared::{Kicked, SpawnState, WorldState, SERVER_VERSION};
    use std::time::{Duration, Instant};

    fn login(slot: u8, username: &str) -> LoginRequest {
        LoginRequest {
            slot,
            username: username.to_string(),
            password: String::new(),
            client_version: SERVER_VERSION.to_string(),
            platform_id: None,
        }
    }

    fn denial(h: &Harness, id: ConnectionId) -> Vec<String> {
        h.transport
            .messages_for::<AccessDenied>(id, Opcode::AccessDenied)
            .into_iter()
            .map(|denied| denied.reason)
            .collect()
    }

    fn small_server(max_players: usize, queue_capacity: usize) -> Harness {
        let mut config = ServerConfig::default();
        config.admission.max_players = max_players;
        config.admission.queue_capacity = queue_capacity;
        Harness::with_config(config)
    }

    #[test]
    fn test_successful_login_sequence() {
        let mut h = Harness::new();
        h.connect(1);

        handle_login(&mut h.ctx(), 1, login(0, "alice")).unwrap();

        let opcodes = h.transport.opcodes_for(1);
        assert_eq!(opcodes[0], Opcode::LoginAccepted);
        assert_eq!(opcodes[1], Opcode::SpawnState);
        assert!(opcodes[2..].iter().all(|op| *op == Opcode::WorldState));
        assert!(opcodes.len() > 3);

        let accepted = &h.transport.messages_for::<LoginAccepted>(1, Opcode::LoginAccepted)[0];
        assert_eq!(accepted.online_id, 0);
        let spawn = &h.transport.messages_for::<SpawnState>(1, Opcode::SpawnState)[0];

        let connection = h.connections.get(1).unwrap();
        assert!(connection.is_fully_connected());
        assert!(connection.admission.is_none());
        assert!(h.connections.gate().contains(&1));
        assert_eq!(connection.player(0).unwrap().interest.anchor, spawn.position);
    }

    #[test]
    fn test_version_checked_before_credentials() {
        let mut h = Harness::new();
        h.connect(1);
        let mut req = login(0, "");
        req.client_version = "0.9.0".to_string();

        handle_login(&mut h.ctx(), 1, req).unwrap();

        assert_eq!(
            denial(&h, 1),
            vec![format!("ClientVersionMismatch##0.9.0##{}", SERVER_VERSION)]
        );
        assert!(h.connections.get(1).is_none());
        assert!(!h.transport.is_open(1));
    }

    #[test]
    fn test_banned_content_username() {
        let mut h = Harness::new();
        h.admission.filter = TextFilter::new(["badword"]);
        h.connect(1);

        handle_login(&mut h.ctx(), 1, login(0, "xXBadWordXx")).unwrap();

        assert_eq!(denial(&h, 1), vec!["InvalidUsername".to_string()]);
    }

    #[test]
    fn test_whitelist_verdicts() {
        let mut whitelist = WhitelistAuthenticator::new();
        whitelist.add_account("alice", "secret", AccessLevel::Admin);
        whitelist.ban("mallory");

        let mut h = Harness::new();
        h.admission.authenticator = Box::new(whitelist);
        h.connect(1);
        h.connect(2);
        h.connect(3);

        let mut wrong = login(0, "alice");
        wrong.password = "guess".to_string();
        handle_login(&mut h.ctx(), 1, wrong).unwrap();
        handle_login(&mut h.ctx(), 2, login(0, "mallory")).unwrap();
        let mut right = login(0, "Alice");
        right.password = "secret".to_string();
        handle_login(&mut h.ctx(), 3, right).unwrap();

        assert_eq!(denial(&h, 1), vec!["Unauthorized".to_string()]);
        assert_eq!(denial(&h, 2), vec!["Banned".to_string()]);
        assert_eq!(h.connections.get(3).unwrap().access_level, AccessLevel::Admin);
    }

    #[test]
    fn test_duplicate_username_denied() {
        let mut h = Harness::new();
        h.connect(1);
        h.connect(2);
        handle_login(&mut h.ctx(), 1, login(0, "Alice")).unwrap();

        handle_login(&mut h.ctx(), 2, login(0, "alice")).unwrap();

        assert_eq!(denial(&h, 2), vec!["AlreadyConnected".to_string()]);
        assert!(h.connections.get(1).unwrap().is_fully_connected());
    }

    #[test]
    fn test_duplicate_platform_identity_denied() {
        let mut h = Harness::new();
        h.connect(1);
        h.connect(2);
        let mut first = login(0, "alice");
        first.platform_id = Some(42);
        let mut second = login(0, "bob");
        second.platform_id = Some(42);

        handle_login(&mut h.ctx(), 1, first).unwrap();
        handle_login(&mut h.ctx(), 2, second).unwrap();

        assert_eq!(denial(&h, 2), vec!["AlreadyConnected".to_string()]);
    }

    #[test]
    fn test_overloaded_server_refuses_logins() {
        let mut h = Harness::new();
        h.overloaded = true;
        h.connect(1);

        handle_login(&mut h.ctx(), 1, login(0, "alice")).unwrap();

        assert_eq!(denial(&h, 1), vec!["ServerBusy".to_string()]);
    }

    #[test]
    fn test_full_server_queues_then_refuses() {
        let mut h = small_server(1, 1);
        for id in 1..=3 {
            h.connect(id);
        }
        handle_login(&mut h.ctx(), 1, login(0, "alice")).unwrap();
        handle_login(&mut h.ctx(), 2, login(0, "bob")).unwrap();
        handle_login(&mut h.ctx(), 3, login(0, "carol")).unwrap();

        let queued = h.connections.get(2).unwrap();
        assert_eq!(queued.state, SessionState::AdmissionQueued);
        assert_eq!(
            h.transport.messages_for::<QueuePosition>(2, Opcode::QueuePosition),
            vec![QueuePosition { position: 1 }]
        );
        assert!(!h.connections.gate().contains(&2));
        assert_eq!(denial(&h, 3), vec!["ServerFull".to_string()]);
    }

    #[test]
    fn test_staff_bypass_capacity() {
        let mut h = small_server(1, 0);
        h.admission.authenticator =
            Box::new(OpenAuthenticator::new().with_staff("admin", AccessLevel::Admin));
        h.connect(1);
        h.connect(2);
        handle_login(&mut h.ctx(), 1, login(0, "alice")).unwrap();

        handle_login(&mut h.ctx(), 2, login(0, "admin")).unwrap();

        assert!(h.connections.get(2).unwrap().is_fully_connected());
        assert_eq!(h.connections.player_count(), 2);
    }

    #[test]
    fn test_queue_promotion_when_capacity_frees() {
        let mut h = small_server(1, 4);
        h.connect(1);
        h.connect(2);
        h.connect(3);
        handle_login(&mut h.ctx(), 1, login(0, "alice")).unwrap();
        handle_login(&mut h.ctx(), 2, login(0, "bob")).unwrap();
        handle_login(&mut h.ctx(), 3, login(0, "carol")).unwrap();
        assert_eq!(h.admission.queue_len(), 2);

        h.ctx().disconnect(1, KickReason::ClientQuit);
        service_queue(&mut h.ctx());

        assert!(h.connections.get(2).unwrap().is_fully_connected());
        assert_eq!(h.admission.queued(), vec![3]);
        assert_eq!(
            h.transport.messages_for::<QueuePosition>(3, Opcode::QueuePosition),
            vec![QueuePosition { position: 2 }, QueuePosition { position: 1 }]
        );
    }

    #[test]
    fn test_high_latency_is_skipped_in_queue() {
        let mut h = small_server(1, 4);
        for id in 1..=3 {
            h.connect(id);
        }
        handle_login(&mut h.ctx(), 1, login(0, "alice")).unwrap();
        handle_login(&mut h.ctx(), 2, login(0, "bob")).unwrap();
        handle_login(&mut h.ctx(), 3, login(0, "carol")).unwrap();
        h.transport.set_round_trip(2, 5_000);
        h.transport.set_round_trip(3, 50);

        h.ctx().disconnect(1, KickReason::ClientQuit);
        service_queue(&mut h.ctx());

        assert!(h.connections.get(3).unwrap().is_fully_connected());
        assert_eq!(h.connections.get(2).unwrap().state, SessionState::AdmissionQueued);
    }

    #[test]
    fn test_queue_timeout_reasons() {
        let mut h = small_server(1, 4);
        for id in 1..=3 {
            h.connect(id);
        }
        handle_login(&mut h.ctx(), 1, login(0, "alice")).unwrap();
        handle_login(&mut h.ctx(), 2, login(0, "bob")).unwrap();
        handle_login(&mut h.ctx(), 3, login(0, "carol")).unwrap();
        h.transport.set_round_trip(2, 5_000);

        let mut ctx = h.ctx();
        ctx.now = Instant::now() + Duration::from_secs(301);
        service_queue(&mut ctx);

        assert_eq!(denial(&h, 2), vec!["PingTooHigh".to_string()]);
        assert_eq!(denial(&h, 3), vec!["QueueTimeout".to_string()]);
        assert_eq!(h.admission.queue_len(), 0);
    }

    #[test]
    fn test_coop_slots_share_connection() {
        let mut h = Harness::new();
        h.connect(1);
        h.connect(2);
        handle_login(&mut h.ctx(), 1, login(0, "bob")).unwrap();
        handle_login(&mut h.ctx(), 2, login(0, "alice")).unwrap();

        handle_login(&mut h.ctx(), 2, login(2, "alice_coop")).unwrap();

        let accepted = h.transport.messages_for::<LoginAccepted>(2, Opcode::LoginAccepted);
        assert_eq!(accepted.len(), 2);
        assert_eq!(accepted[1].slot, 2);
        assert_eq!(accepted[1].online_id, 4 + 2);
    }

    #[test]
    fn test_coop_denial_keeps_connection() {
        let mut h = Harness::new();
        h.connect(1);
        handle_login(&mut h.ctx(), 1, login(0, "alice")).unwrap();
        handle_login(&mut h.ctx(), 1, login(1, "friend")).unwrap();

        handle_login(&mut h.ctx(), 1, login(1, "intruder")).unwrap();

        assert_eq!(denial(&h, 1), vec!["SlotOccupied".to_string()]);
        assert!(h.connections.get(1).unwrap().is_fully_connected());
        assert!(h.transport.is_open(1));
        assert_eq!(h.connections.player_count(), 2);
    }

    #[test]
    fn test_coop_before_primary_login_is_refused() {
        let mut h = Harness::new();
        h.connect(1);

        handle_login(&mut h.ctx(), 1, login(1, "friend")).unwrap();

        assert_eq!(denial(&h, 1), vec!["Unauthorized".to_string()]);
        assert!(h.connections.get(1).is_none());
    }

    #[test]
    fn test_dead_player_rejoins_slot_zero() {
        let mut h = Harness::new();
        h.connect(1);
        handle_login(&mut h.ctx(), 1, login(0, "alice")).unwrap();
        h.connections.player_mut(0).unwrap().alive = false;

        handle_login(&mut h.ctx(), 1, login(0, "alice")).unwrap();

        let accepted = h.transport.messages_for::<LoginAccepted>(1, Opcode::LoginAccepted);
        assert_eq!(accepted.len(), 2);
        assert_eq!(accepted[1].online_id, 0);
        assert!(h.connections.player(0).unwrap().alive);
        assert!(denial(&h, 1).is_empty());
    }

    #[test]
    fn test_invalid_slot_is_a_protocol_violation() {
        let mut h = Harness::new();
        h.connect(1);

        handle_login(&mut h.ctx(), 1, login(7, "alice")).unwrap();

        let kicked = h.transport.messages_for::<Kicked>(1, Opcode::Kicked);
        assert_eq!(kicked[0].reason, "ProtocolViolation");
        assert!(h.connections.get(1).is_none());
    }

    #[test]
    fn test_world_burst_follows_spawn() {
        let mut h = Harness::new();
        h.connect(1);
        handle_login(&mut h.ctx(), 1, login(0, "alice")).unwrap();

        let burst = h.transport.messages_for::<WorldState>(1, Opcode::WorldState);
        assert_eq!(burst.len(), h.world.initial_world_state(Position::new(100.0, 100.0, 0.0)).len());
    }

    #[test]
    fn test_newcomer_waits_behind_queue() {
        let mut h = small_server(2, 4);
        for id in 1..=4 {
            h.connect(id);
        }
        handle_login(&mut h.ctx(), 1, login(0, "alice")).unwrap();
        handle_login(&mut h.ctx(), 2, login(0, "carol")).unwrap();
        handle_login(&mut h.ctx(), 3, login(0, "bob")).unwrap();
        h.ctx().disconnect(1, KickReason::ClientQuit);

        handle_login(&mut h.ctx(), 4, login(0, "dave")).unwrap();

        assert_eq!(h.connections.get(4).unwrap().state, SessionState::AdmissionQueued);
        assert_eq!(h.admission.queued(), vec![3, 4]);

        service_queue(&mut h.ctx());

        assert!(h.connections.get(3).unwrap().is_fully_connected());
        assert_eq!(h.admission.queued(), vec![4]);
    }

    #[test]
    fn test_queued_username_cannot_log_in_twice() {
        let mut h = small_server(2, 4);
        for id in 1..=4 {
            h.connect(id);
        }
        handle_login(&mut h.ctx(), 1, login(0, "alice")).unwrap();
        handle_login(&mut h.ctx(), 2, login(0, "carol")).unwrap();
        handle_login(&mut h.ctx(), 3, login(0, "bob")).unwrap();
        h.ctx().disconnect(1, KickReason::ClientQuit);

        handle_login(&mut h.ctx(), 4, login(0, "BOB")).unwrap();
        h.ctx().disconnect(2, KickReason::ClientQuit);
        service_queue(&mut h.ctx());

        assert_eq!(denial(&h, 4), vec!["AlreadyConnected".to_string()]);
        assert!(h.connections.get(3).unwrap().is_fully_connected());
        assert_eq!(h.connections.player_count(), 1);
        assert!(h.connections.identities().by_username("bob").is_some());
    }

    #[test]
    fn test_promotion_rechecks_duplicates() {
        let mut h = small_server(1, 4);
        h.connect(1);
        h.connect(2);
        handle_login(&mut h.ctx(), 1, login(0, "alice")).unwrap();
        handle_login(&mut h.ctx(), 2, login(0, "bob")).unwrap();
        h.ctx().disconnect(1, KickReason::ClientQuit);
        h.player(3, "Bob", Position::new(0.0, 100.0, 0.0));
        h.config.admission.max_players = 2;

        service_queue(&mut h.ctx());

        assert_eq!(denial(&h, 2), vec!["AlreadyConnected".to_string()]);
        assert!(h.connections.get(2).is_none());
        assert_eq!(h.connections.player_count(), 1);
    }

    #[test]
    fn test_coop_login_respects_capacity() {
        let mut h = small_server(1, 4);
        h.connect(1);
        handle_login(&mut h.ctx(), 1, login(0, "alice")).unwrap();

        handle_login(&mut h.ctx(), 1, login(1, "friend")).unwrap();

        assert_eq!(denial(&h, 1), vec!["ServerFull".to_string()]);
        assert!(h.connections.get(1).unwrap().is_fully_connected());
        assert!(h.transport.is_open(1));
        assert_eq!(h.connections.player_count(), 1);
        assert_eq!(h.admission.queue_len(), 0);
    }

    #[test]
    fn test_coop_login_refused_while_overloaded() {
        let mut h = Harness::new();
        h.connect(1);
        handle_login(&mut h.ctx(), 1, login(0, "alice")).unwrap();
        h.overloaded = true;

        handle_login(&mut h.ctx(), 1, login(1, "friend")).unwrap();

        assert_eq!(denial(&h, 1), vec!["ServerBusy".to_string()]);
        assert!(h.connections.get(1).unwrap().is_fully_connected());
        assert_eq!(h.connections.player_count(), 1);
    }

    #[test]
    fn test_dead_player_rejoins_full_server() {
        let mut h = small_server(1, 0);
        h.connect(1);
        handle_login(&mut h.ctx(), 1, login(0, "alice")).unwrap();
        h.connections.player_mut(0).unwrap().alive = false;

        handle_login(&mut h.ctx(), 1, login(0, "alice")).unwrap();

        assert!(denial(&h, 1).is_empty());
        assert!(h.connections.player(0).unwrap().alive);
    }
}
