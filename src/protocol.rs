mod addr;
mod command;
mod methods;
mod reply;

pub use addr::Addr;
pub use addr::AddressType;
pub use addr::SocksSocketAddr;
pub use command::Command;
pub use methods::AuthMethod;
pub use reply::Reply;

pub const VERSION: u8 = 0x05;
pub const RESERVED: u8 = 0x00;

/// Sub-negotiation version of RFC 1929 username/password authentication.
pub const USER_PASSWORD_VERSION: u8 = 0x01;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Success = 0x00,
    Failure = 0xFF,
}

/// `[VER, METHOD]`
pub fn method_selection(method: AuthMethod) -> Vec<u8> {
    vec![VERSION, method.to_u8()]
}

/// `[0x01, STATUS]`
pub fn auth_result(status: AuthStatus) -> Vec<u8> {
    vec![USER_PASSWORD_VERSION, status as u8]
}

/// `[VER, REP, RSV]` followed by `addr_bytes`, which is ATYP+ADDR+PORT as produced by
/// [`SocksSocketAddr::to_bytes`].
pub fn reply(reply: Reply, addr_bytes: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(3 + addr_bytes.len());
    bytes.push(VERSION);
    bytes.push(reply.to_u8());
    bytes.push(RESERVED);
    bytes.extend_from_slice(addr_bytes);
    bytes
}

/// Error replies that have no target to echo carry only the header and an IPv4 address type.
pub fn short_reply(reply: Reply) -> Vec<u8> {
    vec![
        VERSION,
        reply.to_u8(),
        RESERVED,
        AddressType::Ipv4.to_u8(),
    ]
}
