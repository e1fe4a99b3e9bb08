//! webgate is a forward HTTP/HTTPS proxy gateway that only lets clients
//! reach an administrator-curated set of upstream hosts.
//!
//! Everything runs on one readiness-driven event loop: plain HTTP requests
//! and CONNECT tunnels are parsed line by line, checked against the host
//! authorization store, resolved and connected asynchronously, then relayed
//! as opaque byte streams. A second listener serves a small administrative
//! web interface used to authorize or reject hosts.

pub mod admin;
pub mod authz;
pub mod config;
pub mod gateway;
pub mod http;
pub mod persist;
pub mod ready;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod socket;
pub mod stats;
pub mod timer;

/// Safety net for the per-session readiness loop. A session keeps handling
/// its pending interest/event intersections until they are exhausted; if it
/// spins this long something is stuck and the session is closed.
pub const MAX_LOOP_ITERATIONS: usize = 100_000;

/// What the dispatcher should do with a session after one resume call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionResult {
    Continue,
    Close,
}

/// The readiness sources a session may own. The source tag is encoded in
/// the low bits of every [`mio::Token`] handed to the poller, so one event
/// maps back to both the owning session and the slot to resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Client = 0,
    Target = 1,
    Resolver = 2,
    Timer = 3,
}

impl Source {
    pub fn from_bits(bits: usize) -> Source {
        match bits & 0b11 {
            0 => Source::Client,
            1 => Source::Target,
            2 => Source::Resolver,
            _ => Source::Timer,
        }
    }
}
