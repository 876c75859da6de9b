use std::fmt;

/// Reply codes of RFC 1928. The server emits `Success`, `ConnectionRefused` (0x05, used for
/// every failed outbound connect), `CommandNotSupported` and `AddressTypeNotSupported`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Success = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowedByRuleset = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TTLExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self {
            Reply::Success => "Success",
            Reply::GeneralFailure => "General Failure",
            Reply::ConnectionNotAllowedByRuleset => "Connection Not Allowed By Ruleset",
            Reply::NetworkUnreachable => "Network Unreachable",
            Reply::HostUnreachable => "Host Unreachable",
            Reply::ConnectionRefused => "Connection Refused",
            Reply::TTLExpired => "TTL Expired",
            Reply::CommandNotSupported => "Command Not Supported",
            Reply::AddressTypeNotSupported => "Address Type Not Supported",
        };
        write!(f, "{}", description)
    }
}

impl std::error::Error for Reply {}

impl Reply {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Reply::Success),
            0x01 => Some(Reply::GeneralFailure),
            0x02 => Some(Reply::ConnectionNotAllowedByRuleset),
            0x03 => Some(Reply::NetworkUnreachable),
            0x04 => Some(Reply::HostUnreachable),
            0x05 => Some(Reply::ConnectionRefused),
            0x06 => Some(Reply::TTLExpired),
            0x07 => Some(Reply::CommandNotSupported),
            0x08 => Some(Reply::AddressTypeNotSupported),
            _ => None,
        }
    }

    pub fn to_u8(&self) -> u8 {
        *self as u8
    }
}
