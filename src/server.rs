//! The event dispatcher.
//!
//! One poller, two listeners, one arena of sessions. Every readiness
//! event and every fired timer is decoded into (slot, generation,
//! source) and routed to the owning session's resume entry point; stale
//! generations are dropped on the floor. Accepted sockets above the
//! connection cap are closed immediately so the arena never grows past
//! its configured bound.

use std::{io, net::SocketAddr, time::Instant};

use log::{debug, error, info, warn};
use mio::{net::TcpListener, Events, Interest, Poll, Token};
use rusty_ulid::Ulid;

use crate::{
    admin::AdminSession,
    authz::{HostDb, Rules},
    config::Config,
    gateway::Gateway,
    persist,
    ready::Ready,
    registry::{decode_token, Registry},
    socket::server_bind,
    stats::Stats,
    timer::TimerQueue,
    SessionResult, Source,
};

const PROXY_LISTENER: Token = Token(0);
const ADMIN_LISTENER: Token = Token(1);
const EVENT_CAPACITY: usize = 1024;

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("could not bind {listener} listener on {addr}: {source}")]
    Bind {
        listener: &'static str,
        addr: SocketAddr,
        source: io::Error,
    },
    #[error("could not set up the poller: {0}")]
    Poll(#[from] io::Error),
}

/// Everything a session may touch while resuming, borrowed from the
/// server for the duration of one dispatch.
pub struct ProxyCtx<'a> {
    pub registry: &'a mio::Registry,
    pub hosts: &'a mut HostDb,
    pub rules: &'a Rules,
    pub timers: &'a mut TimerQueue,
    pub stats: &'a mut Stats,
    pub config: &'a Config,
}

pub enum Session {
    Proxy(Gateway),
    Admin(AdminSession),
}

impl Session {
    fn id(&self) -> Ulid {
        match self {
            Session::Proxy(gateway) => gateway.id(),
            Session::Admin(admin) => admin.id(),
        }
    }

    fn register(&mut self, registry: &mio::Registry) -> io::Result<()> {
        match self {
            Session::Proxy(gateway) => gateway.register(registry),
            Session::Admin(admin) => admin.register(registry),
        }
    }

    fn resume(&mut self, ctx: &mut ProxyCtx, source: Source, ready: Ready) -> SessionResult {
        match self {
            Session::Proxy(gateway) => gateway.resume(ctx, source, ready),
            Session::Admin(admin) => admin.resume(ctx, source, ready),
        }
    }

    fn teardown(self, ctx: &mut ProxyCtx) {
        match self {
            Session::Proxy(gateway) => gateway.teardown(ctx),
            Session::Admin(admin) => admin.teardown(ctx),
        }
    }
}

macro_rules! proxy_ctx {
    ($self:expr) => {
        ProxyCtx {
            registry: $self.poll.registry(),
            hosts: &mut $self.hosts,
            rules: &$self.rules,
            timers: &mut $self.timers,
            stats: &mut $self.stats,
            config: &$self.config,
        }
    };
}

pub struct Server {
    poll: Poll,
    proxy_listener: TcpListener,
    admin_listener: TcpListener,
    sessions: Registry<Session>,
    hosts: HostDb,
    rules: Rules,
    timers: TimerQueue,
    stats: Stats,
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Result<Server, ServerError> {
        let poll = Poll::new()?;

        let mut proxy_listener =
            server_bind(config.proxy_addr).map_err(|source| ServerError::Bind {
                listener: "proxy",
                addr: config.proxy_addr,
                source,
            })?;
        let mut admin_listener =
            server_bind(config.admin_addr).map_err(|source| ServerError::Bind {
                listener: "admin",
                addr: config.admin_addr,
                source,
            })?;
        poll.registry()
            .register(&mut proxy_listener, PROXY_LISTENER, Interest::READABLE)?;
        poll.registry()
            .register(&mut admin_listener, ADMIN_LISTENER, Interest::READABLE)?;

        let rules = match persist::load_rules(config.rules_file.as_ref()) {
            Ok(patterns) => {
                info!("loaded {} rules from {}", patterns.len(), config.rules_file);
                Rules::new(patterns)
            }
            Err(e) => {
                warn!("could not load {}: {}; no rules active", config.rules_file, e);
                Rules::default()
            }
        };

        info!("proxy listening on {}", config.proxy_addr);
        info!("admin interface listening on {}", config.admin_addr);

        Ok(Server {
            poll,
            proxy_listener,
            admin_listener,
            sessions: Registry::new(config.max_connections),
            hosts: HostDb::new(&config.hosts_file),
            rules,
            timers: TimerQueue::new(),
            stats: Stats::new(),
            config,
        })
    }

    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        loop {
            let timeout = self.timers.next_timeout(Instant::now());
            match self.poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                match event.token() {
                    PROXY_LISTENER => self.accept_proxy(),
                    ADMIN_LISTENER => self.accept_admin(),
                    token => self.dispatch(token, Ready::from(event)),
                }
            }
            for token in self.timers.expired(Instant::now()) {
                self.dispatch(token, Ready::EMPTY);
            }
        }
    }

    // edge-triggered listeners must be drained until WouldBlock
    fn accept_proxy(&mut self) {
        loop {
            let before = Instant::now();
            match self.proxy_listener.accept() {
                Ok((stream, peer)) => {
                    let config = &self.config;
                    let inserted = self.sessions.insert_with(|handle| {
                        Session::Proxy(Gateway::new(handle, stream, peer, config))
                    });
                    match inserted {
                        Some(handle) => {
                            self.finish_accept(handle, peer);
                            self.stats.accept.record(before.elapsed().as_micros() as u64);
                        }
                        None => {
                            // insert_with dropped the socket; the peer
                            // sees a plain close
                            warn!(
                                "connection cap ({}) reached, dropped client from {}",
                                self.config.max_connections, peer
                            );
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("accept on proxy listener: {}", e);
                    return;
                }
            }
        }
    }

    fn accept_admin(&mut self) {
        loop {
            match self.admin_listener.accept() {
                Ok((stream, peer)) => {
                    let config = &self.config;
                    let inserted = self.sessions.insert_with(|handle| {
                        Session::Admin(AdminSession::new(handle, stream, peer, config))
                    });
                    match inserted {
                        Some(handle) => self.finish_accept(handle, peer),
                        None => warn!(
                            "connection cap ({}) reached, dropped admin client from {}",
                            self.config.max_connections, peer
                        ),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("accept on admin listener: {}", e);
                    return;
                }
            }
        }
    }

    fn finish_accept(&mut self, handle: crate::registry::Handle, peer: SocketAddr) {
        let registry = self.poll.registry();
        let Some(session) = self.sessions.get_handle_mut(handle) else {
            return;
        };
        let id = session.id();
        match session.register(registry) {
            Ok(()) => {
                info!("[{}] new client from {} ({} active)", id, peer, self.sessions.len());
            }
            Err(e) => {
                error!("[{}] could not register client socket: {}", id, e);
                if let Some(session) = self.sessions.remove(handle) {
                    let mut ctx = proxy_ctx!(self);
                    session.teardown(&mut ctx);
                }
            }
        }
    }

    fn dispatch(&mut self, token: Token, ready: Ready) {
        let Some((index, generation, source)) = decode_token(token) else {
            return;
        };
        let Some((handle, session)) = self.sessions.get_mut(index, generation) else {
            debug!("stale event for {:?}, skipped", token);
            return;
        };
        let mut ctx = proxy_ctx!(self);
        if session.resume(&mut ctx, source, ready) == SessionResult::Close {
            if let Some(session) = self.sessions.remove(handle) {
                let id = session.id();
                session.teardown(&mut ctx);
                debug!("[{}] session closed ({} active)", id, self.sessions.len());
            }
        }
    }
}
