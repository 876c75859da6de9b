//! Gate mode: relay every accepted connection to one of a list of upstreams without
//! speaking SOCKS5 to the client.

mod selector;
mod service;
mod session;

pub use selector::{HostSelector, RandomPick, RoundRobin};
pub use service::GateService;
pub use session::GateSession;
