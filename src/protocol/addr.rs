use std::{
    fmt,
    net::{Ipv4Addr, SocketAddrV4},
};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Ipv4 = 0x01,
    DomainName = 0x03,
}

impl AddressType {
    /// IPv6 (0x04) and unknown types are not supported and yield `None`.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(AddressType::Ipv4),
            0x03 => Some(AddressType::DomainName),
            _ => None,
        }
    }

    pub fn to_u8(&self) -> u8 {
        *self as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksSocketAddr {
    pub port: u16,
    pub addr: Addr,
}

impl SocksSocketAddr {
    pub fn new(addr: Addr, port: u16) -> Self {
        SocksSocketAddr { port, addr }
    }

    /// Parses the 6 byte IPv4 request body: 4 address bytes then the port in network order.
    pub fn from_ipv4_body(body: &[u8]) -> Option<Self> {
        let octets: [u8; 4] = body.get(..4)?.try_into().ok()?;
        let port: [u8; 2] = body.get(4..6)?.try_into().ok()?;
        Some(SocksSocketAddr {
            addr: Addr::Ipv4(Ipv4Addr::from(octets)),
            port: u16::from_be_bytes(port),
        })
    }

    /// Parses the domain request body: `len` name bytes followed by the port.
    /// Names that are not valid UTF-8 yield `None`.
    pub fn from_domain_body(body: &[u8]) -> Option<Self> {
        let split = body.len().checked_sub(2)?;
        let (name, port) = body.split_at(split);
        let domain = String::from_utf8(name.to_vec()).ok()?;
        Some(SocksSocketAddr {
            addr: Addr::Domain(domain),
            port: u16::from_be_bytes([port[0], port[1]]),
        })
    }

    /// Turns `Self` into: AddrType+ADDR+PORT
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(7);

        bytes.push(self.addr.addr_type().to_u8());

        match &self.addr {
            Addr::Ipv4(addr) => bytes.extend_from_slice(&addr.octets()[..]),
            Addr::Domain(domain) => {
                // Domains come off the wire behind a single length byte.
                bytes.push(domain.len() as u8);
                bytes.extend_from_slice(domain.as_bytes())
            }
        }
        bytes.extend_from_slice(&self.port.to_be_bytes());

        bytes
    }

    /// `host` part suitable for name resolution.
    pub fn host(&self) -> String {
        match &self.addr {
            Addr::Ipv4(addr) => addr.to_string(),
            Addr::Domain(domain) => domain.clone(),
        }
    }
}

impl fmt::Display for SocksSocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host(), self.port)
    }
}

impl From<SocketAddrV4> for SocksSocketAddr {
    fn from(value: SocketAddrV4) -> Self {
        SocksSocketAddr {
            port: value.port(),
            addr: Addr::Ipv4(*value.ip()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    Ipv4(Ipv4Addr),
    Domain(String),
}

impl Addr {
    pub fn addr_type(&self) -> AddressType {
        match self {
            Addr::Ipv4(_) => AddressType::Ipv4,
            Addr::Domain(_) => AddressType::DomainName,
        }
    }
}
