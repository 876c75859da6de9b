use std::mem;

use tracing::{debug, trace, warn};

use crate::{
    auth::User,
    protocol::{
        self, AddressType, AuthMethod, AuthStatus, Command, Reply, SocksSocketAddr,
        USER_PASSWORD_VERSION, VERSION,
    },
    unpacker::Unpacker,
};

/// Where the handshake currently is. The `Awaiting*` states wait for a frame of a known
/// length; `Authenticating` and `Connecting` wait for an answer from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    AwaitingMethodHeader,
    AwaitingMethodList,
    AwaitingAuthHeader,
    AwaitingUsername,
    AwaitingPassword { username: String },
    Authenticating,
    AwaitingRequestHeader,
    AwaitingIpv4Body,
    AwaitingDomainLength,
    AwaitingDomainBody,
    Connecting,
    Relaying,
    Closing,
}

/// What the session has to do on behalf of the handshake, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write these bytes to the client.
    Reply(Vec<u8>),
    /// Check the credentials and report back with [`Handshake::auth_result`].
    Authenticate(User),
    /// Open the outbound connection and report back with [`Handshake::connected`] or
    /// [`Handshake::connect_failed`].
    Connect(SocksSocketAddr),
    /// Payload for the remote connection.
    Forward(Vec<u8>),
    /// No more input is accepted. Close once everything queued so far is written.
    Close,
}

/// The SOCKS5 server side of RFC 1928/1929 as a plain state machine.
///
/// It consumes plaintext from the client in whatever pieces the socket produced and answers
/// with [`Action`]s. Client bytes that arrive while an authentication or connect is
/// outstanding stay buffered and are handed out as [`Action::Forward`] once the connection
/// is up.
#[derive(Debug)]
pub struct Handshake {
    unpacker: Unpacker<State>,
    auth_required: bool,
    state: State,
    valid: bool,
    target: Option<SocksSocketAddr>,
}

impl Handshake {
    pub fn new(auth_required: bool) -> Self {
        let mut unpacker = Unpacker::new();
        unpacker.expect(2, State::AwaitingMethodHeader);
        Handshake {
            unpacker,
            auth_required,
            state: State::AwaitingMethodHeader,
            valid: true,
            target: None,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// `false` once the session is past the point of accepting input.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn target(&self) -> Option<&SocksSocketAddr> {
        self.target.as_ref()
    }

    pub fn feed(&mut self, bytes: Vec<u8>) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.state {
            State::Closing => {}
            State::Relaying => {
                if !bytes.is_empty() {
                    actions.push(Action::Forward(bytes));
                }
            }
            _ => {
                self.unpacker.append(bytes);
                self.drive(&mut actions);
            }
        }
        actions
    }

    /// Outcome of the [`Action::Authenticate`] request.
    pub fn auth_result(&mut self, ok: bool) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state != State::Authenticating {
            return actions;
        }

        if !ok {
            warn!("Authentication failed");
            self.fail(&mut actions, Some(protocol::auth_result(AuthStatus::Failure)));
            return actions;
        }

        actions.push(Action::Reply(protocol::auth_result(AuthStatus::Success)));
        self.state = State::AwaitingRequestHeader;
        self.unpacker.expect(4, State::AwaitingRequestHeader);
        self.drive(&mut actions);
        actions
    }

    /// The outbound connection is up: reply with the echoed target and release whatever the
    /// client sent in the meantime.
    pub fn connected(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state != State::Connecting {
            return actions;
        }
        let addr_bytes = self
            .target
            .as_ref()
            .map(SocksSocketAddr::to_bytes)
            .unwrap_or_default();

        self.state = State::Relaying;
        actions.push(Action::Reply(protocol::reply(Reply::Success, &addr_bytes)));
        let pending = self.unpacker.take_remaining();
        if !pending.is_empty() {
            actions.push(Action::Forward(pending));
        }
        actions
    }

    pub fn connect_failed(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state != State::Connecting {
            return actions;
        }
        let addr_bytes = self
            .target
            .as_ref()
            .map(SocksSocketAddr::to_bytes)
            .unwrap_or_default();

        self.fail(
            &mut actions,
            Some(protocol::reply(Reply::ConnectionRefused, &addr_bytes)),
        );
        self.unpacker.take_remaining();
        actions
    }

    fn drive(&mut self, actions: &mut Vec<Action>) {
        let mut unpacker = mem::take(&mut self.unpacker);
        unpacker.drive(|unpacker, state, frame| self.handle(unpacker, state, frame, actions));
        self.unpacker = unpacker;
    }

    fn handle(
        &mut self,
        unpacker: &mut Unpacker<State>,
        state: State,
        frame: Vec<u8>,
        actions: &mut Vec<Action>,
    ) -> bool {
        match state {
            State::AwaitingMethodHeader => {
                if frame[0] != VERSION {
                    warn!("Unsupported protocol version {:#04x}", frame[0]);
                    return self.fail(actions, None);
                }
                let methods = frame[1] as usize;
                if methods == 0 {
                    warn!("Client offered no authentication methods");
                    return self.fail(
                        actions,
                        Some(protocol::method_selection(AuthMethod::NoAcceptableMethods)),
                    );
                }
                self.await_frame(unpacker, methods, State::AwaitingMethodList)
            }
            State::AwaitingMethodList => {
                let method = AuthMethod::select(self.auth_required, &frame);
                debug!("Selected method {:?} from {:?}", method, frame);
                match method {
                    AuthMethod::UsernamePassword => {
                        actions.push(Action::Reply(protocol::method_selection(method)));
                        self.await_frame(unpacker, 2, State::AwaitingAuthHeader)
                    }
                    AuthMethod::NoAuthRequired => {
                        actions.push(Action::Reply(protocol::method_selection(method)));
                        self.await_frame(unpacker, 4, State::AwaitingRequestHeader)
                    }
                    _ => self.fail(
                        actions,
                        Some(protocol::method_selection(AuthMethod::NoAcceptableMethods)),
                    ),
                }
            }
            State::AwaitingAuthHeader => {
                if frame[0] != USER_PASSWORD_VERSION {
                    warn!("Unsupported auth version {:#04x}", frame[0]);
                    return self.fail(actions, None);
                }
                let username_len = frame[1] as usize;
                if username_len == 0 {
                    return self.fail(actions, Some(protocol::auth_result(AuthStatus::Failure)));
                }
                // The password length byte rides along with the username.
                self.await_frame(unpacker, username_len + 1, State::AwaitingUsername)
            }
            State::AwaitingUsername => {
                let (name, password_len) = frame.split_at(frame.len() - 1);
                let Ok(username) = String::from_utf8(name.to_vec()) else {
                    warn!("Username is not valid UTF-8");
                    return self.fail(actions, Some(protocol::auth_result(AuthStatus::Failure)));
                };
                match password_len[0] as usize {
                    0 => self.authenticate(User::new(username, String::new()), actions),
                    len => self.await_frame(unpacker, len, State::AwaitingPassword { username }),
                }
            }
            State::AwaitingPassword { username } => {
                let Ok(password) = String::from_utf8(frame) else {
                    warn!("Password is not valid UTF-8");
                    return self.fail(actions, Some(protocol::auth_result(AuthStatus::Failure)));
                };
                self.authenticate(User::new(username, password), actions)
            }
            State::AwaitingRequestHeader => {
                let (version, command, address_type) = (frame[0], frame[1], frame[3]);
                if version != VERSION {
                    warn!("Unsupported request version {:#04x}", version);
                    return self.fail(actions, None);
                }
                if !Command::try_from(command).is_ok_and(Command::is_supported) {
                    warn!("Command {:#04x} not supported", command);
                    return self.fail(
                        actions,
                        Some(protocol::short_reply(Reply::CommandNotSupported)),
                    );
                }
                match AddressType::from_u8(address_type) {
                    Some(AddressType::Ipv4) => {
                        self.await_frame(unpacker, 6, State::AwaitingIpv4Body)
                    }
                    Some(AddressType::DomainName) => {
                        self.await_frame(unpacker, 1, State::AwaitingDomainLength)
                    }
                    None => {
                        warn!("Address type {:#04x} not supported", address_type);
                        self.fail(
                            actions,
                            Some(protocol::short_reply(Reply::AddressTypeNotSupported)),
                        )
                    }
                }
            }
            State::AwaitingIpv4Body => match SocksSocketAddr::from_ipv4_body(&frame) {
                Some(target) => self.request(target, actions),
                None => self.fail(actions, None),
            },
            State::AwaitingDomainLength => {
                let len = frame[0] as usize;
                self.await_frame(unpacker, len + 2, State::AwaitingDomainBody)
            }
            State::AwaitingDomainBody => match SocksSocketAddr::from_domain_body(&frame) {
                Some(target) => self.request(target, actions),
                None => {
                    warn!("Domain name is not valid UTF-8");
                    let mut echo = vec![AddressType::DomainName.to_u8(), (frame.len() - 2) as u8];
                    echo.extend_from_slice(&frame);
                    self.fail(
                        actions,
                        Some(protocol::reply(Reply::ConnectionRefused, &echo)),
                    )
                }
            },
            State::Authenticating | State::Connecting | State::Relaying | State::Closing => {
                false
            }
        }
    }

    fn await_frame(&mut self, unpacker: &mut Unpacker<State>, len: usize, state: State) -> bool {
        self.state = state.clone();
        unpacker.expect(len, state);
        true
    }

    fn authenticate(&mut self, user: User, actions: &mut Vec<Action>) -> bool {
        trace!("Authenticating {:?}", user);
        self.state = State::Authenticating;
        actions.push(Action::Authenticate(user));
        false
    }

    fn request(&mut self, target: SocksSocketAddr, actions: &mut Vec<Action>) -> bool {
        debug!("Connect request to {}", target);
        self.state = State::Connecting;
        self.target = Some(target.clone());
        actions.push(Action::Connect(target));
        false
    }

    fn fail(&mut self, actions: &mut Vec<Action>, reply: Option<Vec<u8>>) -> bool {
        if let Some(reply) = reply {
            actions.push(Action::Reply(reply));
        }
        self.close();
        actions.push(Action::Close);
        false
    }

    /// Stops accepting input. Safe to call in any state, any number of times.
    pub fn close(&mut self) {
        self.state = State::Closing;
        self.valid = false;
        self.unpacker.clear_expectation();
    }
}
