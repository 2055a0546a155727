//! Per-opcode security checks.
//!
//! A [`PacketCheck`] looks at one inbound message before its handler runs and
//! decides whether the sender was allowed to send it. Every check has a
//! [`Mode`]: `Off` skips it, `Ignore` drops the offending message and logs it,
//! `Kick` logs and removes the connection. Violations are logged under the
//! `security` target using a per-check template where `%field%` placeholders
//! are replaced with what the check observed. Staff skip every check except
//! the ones that exist to keep non-staff out.
//!
//! Settings come from the `[security]` config section: `[security.default]`
//! applies to all checks and `[security.checks."<id>"]` overrides single
//! fields for one check.

use crate::connection::{Connection, ConnectionTable};
use crate::envelope::PacketEnvelope;
use log::{info, warn};
use serde::Deserialize;
use shared::{
    AdminCommand, ChatMessage, HitCharacter, Opcode, PlayerDeath, Teleport, TreatPlayer,
};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum Mode {
    Off,
    Ignore,
    Kick,
}

impl Mode {
    /// Case-insensitive. `"false"` turns a check off; anything unrecognised
    /// falls back to `Ignore`.
    pub fn parse(text: &str) -> Mode {
        match text.trim().to_ascii_lowercase().as_str() {
            "off" | "false" => Mode::Off,
            "kick" => Mode::Kick,
            _ => Mode::Ignore,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Mode::Off => "OFF",
            Mode::Ignore => "IGNORE",
            Mode::Kick => "KICK",
        }
    }
}

impl From<String> for Mode {
    fn from(text: String) -> Self {
        Mode::parse(&text)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CheckSettings {
    pub mode: Mode,
    pub log_message: String,
    pub kick_message: String,
    /// Range used by distance checks, in world cells
    pub distance: f32,
    /// Relay violation log lines to online staff
    pub notify_staff: bool,
}

impl Default for CheckSettings {
    fn default() -> Self {
        Self {
            mode: Mode::Kick,
            log_message: "%player_username% (%player_id%) failed %check%. %action%.".to_string(),
            kick_message: "Kicked by security check %check%.".to_string(),
            distance: 16.0,
            notify_staff: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CheckOverride {
    pub mode: Option<Mode>,
    pub log_message: Option<String>,
    pub kick_message: Option<String>,
    pub distance: Option<f32>,
    pub notify_staff: Option<bool>,
}

impl CheckSettings {
    fn overridden(&self, over: &CheckOverride) -> CheckSettings {
        CheckSettings {
            mode: over.mode.unwrap_or(self.mode),
            log_message: over
                .log_message
                .clone()
                .unwrap_or_else(|| self.log_message.clone()),
            kick_message: over
                .kick_message
                .clone()
                .unwrap_or_else(|| self.kick_message.clone()),
            distance: over.distance.unwrap_or(self.distance),
            notify_staff: over.notify_staff.unwrap_or(self.notify_staff),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub default: CheckSettings,
    pub checks: HashMap<String, CheckOverride>,
}

impl SecurityConfig {
    /// Effective settings for one check id.
    pub fn settings_for(&self, id: &str) -> CheckSettings {
        match self.checks.get(id) {
            Some(over) => self.default.overridden(over),
            None => self.default.clone(),
        }
    }
}

/// Observed values recorded by a failing check, for message templates.
pub type Fields = Vec<(&'static str, String)>;

/// What a check gets to look at.
pub struct Inspection<'a> {
    pub connection: &'a Connection,
    pub connections: &'a ConnectionTable,
    pub envelope: &'a PacketEnvelope,
    pub distance: f32,
    pub pvp_enabled: bool,
}

pub trait PacketCheck: Send + Sync {
    fn id(&self) -> &'static str;

    fn opcode(&self) -> Opcode;

    /// Whether staff connections skip this check.
    fn staff_bypass(&self) -> bool {
        true
    }

    /// Returns `false` when the message fails. Undecodable payloads pass;
    /// the handler reports them as malformed.
    fn inspect(&self, inspection: &Inspection<'_>, fields: &mut Fields) -> bool;
}

struct TeleportNotStaff;

impl PacketCheck for TeleportNotStaff {
    fn id(&self) -> &'static str {
        "teleport.not_staff"
    }

    fn opcode(&self) -> Opcode {
        Opcode::Teleport
    }

    fn staff_bypass(&self) -> bool {
        false
    }

    fn inspect(&self, inspection: &Inspection<'_>, fields: &mut Fields) -> bool {
        if inspection.connection.access_level.is_staff() {
            return true;
        }
        if let Ok(msg) = inspection.envelope.decode::<Teleport>() {
            fields.push(("target_username", msg.target));
            fields.push(("x", msg.position.x.to_string()));
            fields.push(("y", msg.position.y.to_string()));
            fields.push(("z", msg.position.z.to_string()));
        }
        false
    }
}

struct AdminCommandNotStaff;

impl PacketCheck for AdminCommandNotStaff {
    fn id(&self) -> &'static str {
        "admin_command.not_staff"
    }

    fn opcode(&self) -> Opcode {
        Opcode::AdminCommand
    }

    fn staff_bypass(&self) -> bool {
        false
    }

    fn inspect(&self, inspection: &Inspection<'_>, fields: &mut Fields) -> bool {
        if inspection.connection.access_level.is_staff() {
            return true;
        }
        if let Ok(msg) = inspection.envelope.decode::<AdminCommand>() {
            fields.push(("command", msg.command));
        }
        false
    }
}

struct TreatOfflinePlayer;

impl PacketCheck for TreatOfflinePlayer {
    fn id(&self) -> &'static str {
        "treat_player.offline_player"
    }

    fn opcode(&self) -> Opcode {
        Opcode::TreatPlayer
    }

    fn inspect(&self, inspection: &Inspection<'_>, fields: &mut Fields) -> bool {
        let Ok(msg) = inspection.envelope.decode::<TreatPlayer>() else {
            return true;
        };
        if inspection.connections.player(msg.target).is_some() {
            return true;
        }
        fields.push(("target_id", msg.target.to_string()));
        fields.push(("body_part", msg.body_part.to_string()));
        false
    }
}

struct TreatDistance;

impl PacketCheck for TreatDistance {
    fn id(&self) -> &'static str {
        "treat_player.distance"
    }

    fn opcode(&self) -> Opcode {
        Opcode::TreatPlayer
    }

    fn inspect(&self, inspection: &Inspection<'_>, fields: &mut Fields) -> bool {
        let Ok(msg) = inspection.envelope.decode::<TreatPlayer>() else {
            return true;
        };
        // Offline targets are the other check's business
        let Some(target) = inspection.connections.player(msg.target) else {
            return true;
        };
        let measured = inspection
            .connection
            .occupied()
            .filter(|(_, player)| player.alive)
            .map(|(_, player)| player.interest.anchor.distance(&target.interest.anchor))
            .fold(f32::INFINITY, f32::min);
        if measured <= inspection.distance {
            return true;
        }
        fields.push(("target_username", target.username.clone()));
        fields.push(("body_part", msg.body_part.to_string()));
        fields.push(("apply", msg.apply.to_string()));
        fields.push(("distance", inspection.distance.to_string()));
        fields.push(("distance_measured", format!("{:.1}", measured)));
        false
    }
}

struct HitPvpDisabled;

impl PacketCheck for HitPvpDisabled {
    fn id(&self) -> &'static str {
        "hit_character.pvp_disabled"
    }

    fn opcode(&self) -> Opcode {
        Opcode::HitCharacter
    }

    fn inspect(&self, inspection: &Inspection<'_>, fields: &mut Fields) -> bool {
        if inspection.pvp_enabled {
            return true;
        }
        if let Ok(msg) = inspection.envelope.decode::<HitCharacter>() {
            fields.push(("target_id", msg.target.to_string()));
            fields.push(("damage", msg.damage.to_string()));
        }
        false
    }
}

struct PlayerDeathSelf;

impl PacketCheck for PlayerDeathSelf {
    fn id(&self) -> &'static str {
        "player_death.self"
    }

    fn opcode(&self) -> Opcode {
        Opcode::PlayerDeath
    }

    fn inspect(&self, inspection: &Inspection<'_>, fields: &mut Fields) -> bool {
        let Ok(msg) = inspection.envelope.decode::<PlayerDeath>() else {
            return true;
        };
        if inspection.connection.slot_of(msg.online_id).is_some() {
            return true;
        }
        fields.push(("target_id", msg.online_id.to_string()));
        false
    }
}

struct ChatOtherPlayer;

impl PacketCheck for ChatOtherPlayer {
    fn id(&self) -> &'static str {
        "chat_message.other_player"
    }

    fn opcode(&self) -> Opcode {
        Opcode::ChatMessage
    }

    fn inspect(&self, inspection: &Inspection<'_>, fields: &mut Fields) -> bool {
        let Ok(msg) = inspection.envelope.decode::<ChatMessage>() else {
            return true;
        };
        if inspection.connection.slot_of(msg.online_id).is_some() {
            return true;
        }
        fields.push(("target_id", msg.online_id.to_string()));
        fields.push(("message", msg.text));
        false
    }
}

pub fn builtin_checks() -> Vec<Box<dyn PacketCheck>> {
    vec![
        Box::new(TeleportNotStaff),
        Box::new(AdminCommandNotStaff),
        Box::new(TreatOfflinePlayer),
        Box::new(TreatDistance),
        Box::new(HitPvpDisabled),
        Box::new(PlayerDeathSelf),
        Box::new(ChatOtherPlayer),
    ]
}

/// Outcome of running the checks for one message.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Pass,
    /// Drop the message, keep the connection
    Ignore {
        check: &'static str,
        notice: Option<String>,
    },
    Kick {
        check: &'static str,
        message: String,
        notice: Option<String>,
    },
}

struct ArmedCheck {
    check: Box<dyn PacketCheck>,
    settings: CheckSettings,
}

pub struct PacketChecker {
    checks: HashMap<Opcode, Vec<ArmedCheck>>,
    active: usize,
}

impl PacketChecker {
    pub fn new(config: &SecurityConfig) -> Self {
        Self::with_checks(config, builtin_checks())
    }

    pub fn with_checks(config: &SecurityConfig, checks: Vec<Box<dyn PacketCheck>>) -> Self {
        let known: Vec<&'static str> = checks.iter().map(|check| check.id()).collect();
        for id in config.checks.keys() {
            if !known.contains(&id.as_str()) {
                warn!("Unknown security check '{}' in config, ignoring", id);
            }
        }

        let mut by_opcode: HashMap<Opcode, Vec<ArmedCheck>> = HashMap::new();
        let mut active = 0;
        for check in checks {
            let settings = config.settings_for(check.id());
            if settings.distance != config.default.distance {
                info!(
                    "Loaded security check: [{:<6}] {} (distance: {})",
                    settings.mode.name(),
                    check.id(),
                    settings.distance
                );
            } else {
                info!(
                    "Loaded security check: [{:<6}] {}",
                    settings.mode.name(),
                    check.id()
                );
            }
            if settings.mode != Mode::Off {
                active += 1;
            }
            by_opcode
                .entry(check.opcode())
                .or_default()
                .push(ArmedCheck { check, settings });
        }
        info!("{} security check(s) active", active);

        Self {
            checks: by_opcode,
            active,
        }
    }

    pub fn active_checks(&self) -> usize {
        self.active
    }

    pub fn settings(&self, id: &str) -> Option<&CheckSettings> {
        self.checks
            .values()
            .flatten()
            .find(|armed| armed.check.id() == id)
            .map(|armed| &armed.settings)
    }

    /// Runs the checks registered for the envelope's opcode. The first
    /// failing check decides the verdict.
    pub fn inspect(
        &self,
        connection: &Connection,
        connections: &ConnectionTable,
        envelope: &PacketEnvelope,
        pvp_enabled: bool,
    ) -> Verdict {
        let Some(armed) = self.checks.get(&envelope.opcode()) else {
            return Verdict::Pass;
        };
        let staff = connection.access_level.is_staff();

        for ArmedCheck { check, settings } in armed {
            if settings.mode == Mode::Off || (staff && check.staff_bypass()) {
                continue;
            }
            let inspection = Inspection {
                connection,
                connections,
                envelope,
                distance: settings.distance,
                pvp_enabled,
            };
            let mut fields = Fields::new();
            if check.inspect(&inspection, &mut fields) {
                continue;
            }

            let player_id = connection
                .platform_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| connection.peer.clone());
            fields.push(("check", check.id().to_string()));
            fields.push(("player_id", player_id));
            fields.push(("player_username", connection.display_name().to_string()));
            fields.push((
                "action",
                match settings.mode {
                    Mode::Kick => "KICKING".to_string(),
                    _ => "IGNORING".to_string(),
                },
            ));

            let line = inject(&settings.log_message, &fields);
            warn!(target: "security", "{}", line);
            let notice = settings.notify_staff.then_some(line);

            return match settings.mode {
                Mode::Kick => Verdict::Kick {
                    check: check.id(),
                    message: inject(&settings.kick_message, &fields),
                    notice,
                },
                _ => Verdict::Ignore {
                    check: check.id(),
                    notice,
                },
            };
        }
        Verdict::Pass
    }
}

/// Replaces every `%name%` in `template` with the matching field value.
pub fn inject(template: &str, fields: &[(&'static str, String)]) -> String {
    let mut out = template.to_string();
    for (name, value) in fields {
        out = out.replace(&format!("%{}%", name), value);
    }
    out
}
