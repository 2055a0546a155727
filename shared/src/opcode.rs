//! Numeric opcodes carried in the first two bytes of every frame.

macro_rules! opcodes {
    ($($(#[$doc:meta])* $name:ident = $value:literal),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u16)]
        pub enum Opcode {
            $($(#[$doc])* $name = $value,)*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name,)*];

            pub fn from_u16(value: u16) -> Option<Self> {
                match value {
                    $($value => Some(Opcode::$name),)*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$name => stringify!($name),)*
                }
            }
        }
    };
}

opcodes! {
    // Client -> server
    Login = 1,
    Ping = 2,
    ScoreboardProbe = 3,
    /// Highest-frequency kind; coalesced per (connection, slot).
    PlayerUpdate = 4,
    /// Delay-tolerant physics detail; drained under the bulk budget.
    VehiclePhysics = 5,
    PlayerDeath = 6,
    Checksum = 7,
    ChatMessage = 8,
    Teleport = 9,
    TreatPlayer = 10,
    HitCharacter = 11,
    WorldSound = 12,
    AdminCommand = 13,
    Quit = 14,
    TransportProbeAck = 15,

    // Server -> client
    LoginAccepted = 100,
    AccessDenied = 101,
    QueuePosition = 102,
    SpawnState = 103,
    WorldState = 104,
    Kicked = 105,
    PlayerSync = 106,
    ServerBusy = 107,
    AdminReply = 108,
    Scoreboard = 109,
    Pong = 110,
    TransportProbe = 111,
    PlayerDied = 112,
    ChatRelay = 113,
    SoundRelay = 114,
    VehicleSync = 115,
}

impl Opcode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_opcode_lookup() {
        assert_eq!(Opcode::from_u16(1), Some(Opcode::Login));
        assert_eq!(Opcode::from_u16(4), Some(Opcode::PlayerUpdate));
        assert_eq!(Opcode::from_u16(115), Some(Opcode::VehicleSync));
        assert_eq!(Opcode::from_u16(0), None);
        assert_eq!(Opcode::from_u16(9999), None);
    }

    #[test]
    fn test_opcode_values_are_unique() {
        let values: HashSet<u16> = Opcode::ALL.iter().map(|op| op.as_u16()).collect();
        assert_eq!(values.len(), Opcode::ALL.len());
        for op in Opcode::ALL {
            assert_eq!(Opcode::from_u16(op.as_u16()), Some(*op));
        }
    }

    #[test]
    fn test_opcode_name() {
        assert_eq!(Opcode::PlayerUpdate.name(), "PlayerUpdate");
        assert_eq!(Opcode::AccessDenied.to_string(), "AccessDenied");
    }
}
