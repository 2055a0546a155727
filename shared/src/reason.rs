use std::fmt;

/// Why a login was refused. Sent to the client as [`DenyReason::code`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    ClientVersionMismatch { client: String, server: String },
    InvalidUsername,
    Unauthorized,
    Banned,
    AlreadyConnected,
    ServerFull,
    ServerBusy,
    QueueTimeout,
    PingTooHigh,
    SlotOccupied,
    LoginTimeout,
}

impl DenyReason {
    pub fn code(&self) -> String {
        match self {
            DenyReason::ClientVersionMismatch { client, server } => {
                format!("ClientVersionMismatch##{}##{}", client, server)
            }
            other => other.tag().to_string(),
        }
    }

    /// Reason code without arguments.
    pub fn tag(&self) -> &'static str {
        match self {
            DenyReason::ClientVersionMismatch { .. } => "ClientVersionMismatch",
            DenyReason::InvalidUsername => "InvalidUsername",
            DenyReason::Unauthorized => "Unauthorized",
            DenyReason::Banned => "Banned",
            DenyReason::AlreadyConnected => "AlreadyConnected",
            DenyReason::ServerFull => "ServerFull",
            DenyReason::ServerBusy => "ServerBusy",
            DenyReason::QueueTimeout => "QueueTimeout",
            DenyReason::PingTooHigh => "PingTooHigh",
            DenyReason::SlotOccupied => "SlotOccupied",
            DenyReason::LoginTimeout => "LoginTimeout",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code())
    }
}
