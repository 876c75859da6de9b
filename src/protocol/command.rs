/// Request commands of RFC 1928. Only `Connect` is served; the others are parsed so they
/// can be answered with "command not supported".
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            other => Err(other),
        }
    }
}

impl Command {
    pub fn is_supported(self) -> bool {
        self == Command::Connect
    }
}
