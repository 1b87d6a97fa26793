//! Device identity and NMT models

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Identifier of one node on the fieldbus (0-127 on a CANopen bus)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl DeviceId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// Parse a node id given in hex, with or without `0x` prefix (e.g. "0x7F", "05")
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        let cleaned = s.trim().trim_start_matches("0x").trim_start_matches("0X");
        u32::from_str_radix(cleaned, 16)
            .map(Self)
            .map_err(|_| Error::InvalidRequest(format!("Invalid node id: '{}'", s)))
    }
}

impl From<u32> for DeviceId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operating mode reported by a node through its heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NmtState {
    Initialising,
    PreOperational,
    Operational,
    Stopped,
    /// No heartbeat seen yet
    #[default]
    Unknown,
}

impl NmtState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NmtState::Initialising => "INITIALISING",
            NmtState::PreOperational => "PRE-OPERATIONAL",
            NmtState::Operational => "OPERATIONAL",
            NmtState::Stopped => "STOPPED",
            NmtState::Unknown => "UNKNOWN",
        }
    }

    /// Decode the state byte of a heartbeat frame
    pub fn from_heartbeat(byte: u8) -> Self {
        match byte & 0x7F {
            0x00 => NmtState::Initialising,
            0x04 => NmtState::Stopped,
            0x05 => NmtState::Operational,
            0x7F => NmtState::PreOperational,
            _ => NmtState::Unknown,
        }
    }
}

impl std::fmt::Display for NmtState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mode change a node can be commanded into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NmtCommand {
    Operational,
    Stopped,
    PreOperational,
    /// Reset application ("RESET")
    ResetNode,
    ResetCommunication,
}

impl NmtCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            NmtCommand::Operational => "OPERATIONAL",
            NmtCommand::Stopped => "STOPPED",
            NmtCommand::PreOperational => "PRE-OPERATIONAL",
            NmtCommand::ResetNode => "RESET",
            NmtCommand::ResetCommunication => "RESET COMMUNICATION",
        }
    }

    /// NMT command specifier sent on COB-ID 0x000
    pub fn command_specifier(&self) -> u8 {
        match self {
            NmtCommand::Operational => 0x01,
            NmtCommand::Stopped => 0x02,
            NmtCommand::PreOperational => 0x80,
            NmtCommand::ResetNode => 0x81,
            NmtCommand::ResetCommunication => 0x82,
        }
    }
}

impl std::fmt::Display for NmtCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NmtCommand {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OPERATIONAL" | "START" => Ok(NmtCommand::Operational),
            "STOPPED" | "STOP" => Ok(NmtCommand::Stopped),
            "PRE-OPERATIONAL" | "PREOPERATIONAL" => Ok(NmtCommand::PreOperational),
            "RESET" | "RESET NODE" => Ok(NmtCommand::ResetNode),
            "RESET COMMUNICATION" => Ok(NmtCommand::ResetCommunication),
            _ => Err(Error::InvalidState(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_from_hex() {
        assert_eq!(DeviceId::from_hex("0x7F").unwrap(), DeviceId(127));
        assert_eq!(DeviceId::from_hex("05").unwrap(), DeviceId(5));
        assert!(DeviceId::from_hex("node").is_err());
    }

    #[test]
    fn test_nmt_command_parse() {
        assert_eq!(
            "pre-operational".parse::<NmtCommand>().unwrap(),
            NmtCommand::PreOperational
        );
        assert_eq!("RESET".parse::<NmtCommand>().unwrap(), NmtCommand::ResetNode);
        assert!(matches!(
            "SLEEP".parse::<NmtCommand>(),
            Err(Error::InvalidState(s)) if s == "SLEEP"
        ));
    }

    #[test]
    fn test_heartbeat_decoding() {
        assert_eq!(NmtState::from_heartbeat(0x7F), NmtState::PreOperational);
        // toggle bit is ignored
        assert_eq!(NmtState::from_heartbeat(0x85), NmtState::Operational);
        assert_eq!(NmtState::from_heartbeat(0x33), NmtState::Unknown);
    }
}
