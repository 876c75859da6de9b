const NO_AUTH_REQUIRED: u8 = 0x00;
const GSSAPI: u8 = 0x01;
const USERNAME_PASSWORD: u8 = 0x02;
const NO_ACCEPTABLE_METHODS: u8 = 0xFF;

/// Authentication methods a client may offer in the method selection message.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AuthMethod {
    NoAuthRequired,
    Gssapi,
    UsernamePassword,
    /// Anything else the client offers. Never selected by this server.
    Other(u8),
    NoAcceptableMethods,
}

impl AuthMethod {
    pub fn from_u8(value: u8) -> Self {
        match value {
            NO_AUTH_REQUIRED => AuthMethod::NoAuthRequired,
            GSSAPI => AuthMethod::Gssapi,
            USERNAME_PASSWORD => AuthMethod::UsernamePassword,
            NO_ACCEPTABLE_METHODS => AuthMethod::NoAcceptableMethods,
            other => AuthMethod::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            AuthMethod::NoAuthRequired => NO_AUTH_REQUIRED,
            AuthMethod::Gssapi => GSSAPI,
            AuthMethod::UsernamePassword => USERNAME_PASSWORD,
            AuthMethod::Other(value) => value,
            AuthMethod::NoAcceptableMethods => NO_ACCEPTABLE_METHODS,
        }
    }

    /// The server has exactly one method it is willing to use. It is chosen only when the
    /// client offered it; a server preferring username/password never falls back to no-auth.
    pub fn select(auth_required: bool, offered: &[u8]) -> Self {
        let wanted = if auth_required {
            AuthMethod::UsernamePassword
        } else {
            AuthMethod::NoAuthRequired
        };

        if offered.iter().any(|&m| AuthMethod::from_u8(m) == wanted) {
            wanted
        } else {
            AuthMethod::NoAcceptableMethods
        }
    }
}
