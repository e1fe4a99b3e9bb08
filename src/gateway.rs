//! The per-connection state machine of the proxy path.
//!
//! A gateway session moves through: request parsing, the authorization
//! decision (possibly held and retried on a timer), asynchronous name
//! resolution, a non-blocking target connect, and finally the relay
//! phase where both sockets are opaque byte pipes. Every transition is
//! driven by a readiness event routed here through
//! [`resume`](Gateway::resume); nothing in this module blocks.

use std::{
    io::{self, Read},
    net::SocketAddr,
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use mio::{net::TcpStream, Interest};
use rusty_ulid::Ulid;

use crate::{
    authz::{Decision, HostRef, RejectReason},
    config::Config,
    http::{answer, line::LineBuffer, ParseState, RequestError, RequestParser},
    ready::{Readiness, Ready},
    registry::Handle,
    resolver::{DnsQuery, ResolveStep},
    server::ProxyCtx,
    socket::write_all,
    SessionResult, Source, MAX_LOOP_ITERATIONS,
};

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

#[derive(Debug)]
enum Phase {
    /// reading and parsing the request head
    Request,
    /// authorization came back Hold; a one-shot retry timer is pending
    AwaitingRetry,
    Resolving(DnsQuery),
    Connecting,
    Relay,
}

pub struct Gateway {
    handle: Handle,
    id: Ulid,
    client: TcpStream,
    peer: SocketAddr,
    target: Option<TcpStream>,
    phase: Phase,
    parser: RequestParser,
    lines: LineBuffer,
    /// relay copy block, sized by `read_block_size`
    copy_buf: Vec<u8>,
    client_readiness: Readiness,
    target_readiness: Readiness,
    resolver_readiness: Readiness,
    host: Option<HostRef>,
    request_size: u64,
    bytes_from_client: u64,
    bytes_from_target: u64,
    ts_accept: Instant,
    ts_connect: Option<Instant>,
    ts_first_byte: Option<Instant>,
}

impl Gateway {
    pub fn new(handle: Handle, client: TcpStream, peer: SocketAddr, config: &Config) -> Gateway {
        let mut client_readiness = Readiness::new();
        client_readiness.interest = Ready::READABLE | Ready::HUP | Ready::ERROR;
        Gateway {
            handle,
            id: Ulid::generate(),
            client,
            peer,
            target: None,
            phase: Phase::Request,
            parser: RequestParser::new(config.connect_default_port),
            lines: LineBuffer::new(config.request_buffer_size),
            copy_buf: vec![0; config.read_block_size.max(1)],
            client_readiness,
            target_readiness: Readiness::new(),
            resolver_readiness: Readiness::new(),
            host: None,
            request_size: 0,
            bytes_from_client: 0,
            bytes_from_target: 0,
            ts_accept: Instant::now(),
            ts_connect: None,
            ts_first_byte: None,
        }
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn register(&mut self, registry: &mio::Registry) -> io::Result<()> {
        registry.register(
            &mut self.client,
            self.handle.token(Source::Client),
            Interest::READABLE,
        )
    }

    /// Single typed entry point for the dispatcher: merge the event into
    /// the matching readiness slot, then make progress until every
    /// interest/event intersection is exhausted.
    pub fn resume(&mut self, ctx: &mut ProxyCtx, source: Source, ready: Ready) -> SessionResult {
        match source {
            Source::Client => self.client_readiness.event |= ready,
            Source::Target => self.target_readiness.event |= ready,
            Source::Resolver => self.resolver_readiness.event |= ready,
            Source::Timer => return self.retry_decision(ctx),
        }

        let mut counter = 0;
        loop {
            counter += 1;
            if counter >= MAX_LOOP_ITERATIONS {
                error!("[{}] session loop did not settle, closing", self.id);
                return SessionResult::Close;
            }

            let client_ready = self.client_readiness.filter();
            let target_ready = self.target_readiness.filter();
            let resolver_ready = self.resolver_readiness.filter();

            let result = if resolver_ready.is_readable() || resolver_ready.is_hup() {
                let before = Instant::now();
                let result = self.resolver_step(ctx);
                ctx.stats.resolve_connect.record(elapsed_us(before));
                result
            } else if matches!(self.phase, Phase::Connecting) && !target_ready.is_empty() {
                let before = Instant::now();
                let result = self.connect_completed(ctx);
                ctx.stats.resolve_connect.record(elapsed_us(before));
                result
            } else if client_ready.is_readable() {
                let before = Instant::now();
                let result = self.client_readable(ctx);
                ctx.stats.client_read.record(elapsed_us(before));
                result
            } else if target_ready.is_readable() {
                let before = Instant::now();
                let result = self.target_readable();
                ctx.stats.target_read.record(elapsed_us(before));
                result
            } else if client_ready.is_hup() || client_ready.is_error() {
                debug!("[{}] client socket closed", self.id);
                return SessionResult::Close;
            } else if target_ready.is_hup() || target_ready.is_error() {
                debug!("[{}] target socket closed", self.id);
                return SessionResult::Close;
            } else {
                return SessionResult::Continue;
            };

            if result == SessionResult::Close {
                return SessionResult::Close;
            }
        }
    }

    fn client_readable(&mut self, ctx: &mut ProxyCtx) -> SessionResult {
        match self.phase {
            Phase::Relay => self.relay_client_to_target(),
            _ => self.read_request_bytes(ctx),
        }
    }

    /// Read into the line buffer. In the Request phase completed lines
    /// feed the parser; in later phases the bytes simply accumulate as
    /// residue until the target is connected (body or first tunnel
    /// bytes). Overrunning the buffer is fatal either way.
    fn read_request_bytes(&mut self, ctx: &mut ProxyCtx) -> SessionResult {
        loop {
            let space = self.lines.space();
            if space == 0 {
                warn!("[{}] discarded bytes; too long line", self.id);
                self.answer_request_error(ctx, RequestError::LineTooLong);
                return SessionResult::Close;
            }
            let len = space.min(self.copy_buf.len());
            match self.client.read(&mut self.copy_buf[..len]) {
                Ok(0) => {
                    debug!("[{}] read client: EOF", self.id);
                    return SessionResult::Close;
                }
                Ok(n) => {
                    self.bytes_from_client += n as u64;
                    self.lines.fill(&self.copy_buf[..n]);
                    if matches!(self.phase, Phase::Request) {
                        if self.drain_lines(ctx) == SessionResult::Close {
                            return SessionResult::Close;
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.client_readiness.event.remove(Ready::READABLE);
                    return SessionResult::Continue;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("[{}] read client: {}", self.id, e);
                    return SessionResult::Close;
                }
            }
        }
    }

    fn drain_lines(&mut self, ctx: &mut ProxyCtx) -> SessionResult {
        while matches!(self.phase, Phase::Request) {
            let Some(line) = self.lines.next_line() else {
                break;
            };
            self.request_size += line.consumed as u64;
            self.parser.feed_line(&line.text);
            match self.parser.state() {
                ParseState::Error => {
                    let err = self.parser.error().unwrap_or(RequestError::StartlineParse);
                    warn!("[{}] request parse failed: {}", self.id, err);
                    self.answer_request_error(ctx, err);
                    return SessionResult::Close;
                }
                ParseState::Body => return self.request_complete(ctx),
                _ => {}
            }
        }
        SessionResult::Continue
    }

    /// The head is fully parsed: claim the host record and run the
    /// authorization gate.
    fn request_complete(&mut self, ctx: &mut ProxyCtx) -> SessionResult {
        if !self.parser.is_supported_method() || self.parser.is_local() || self.parser.host.is_empty()
        {
            warn!("[{}] unsupported method '{}'", self.id, self.parser.method);
            answer::write_error(
                &mut self.client,
                400,
                &ctx.config.server_name,
                "Unsupported method.\r\n",
            );
            return SessionResult::Close;
        }

        info!(
            "[{}] {} {}:{} from {}",
            self.id, self.parser.method, self.parser.host, self.parser.port, self.peer
        );

        let host = ctx.hosts.find_or_create(&self.parser.host, self.parser.port);
        host.borrow_mut().add_ref();
        self.host = Some(host);
        self.run_decision(ctx)
    }

    /// One authorization decision. Re-run as-is when the hold timer
    /// fires; visits were already counted at claim time, so re-deciding
    /// has no side effects for the same physical request.
    fn run_decision(&mut self, ctx: &mut ProxyCtx) -> SessionResult {
        let Some(host) = self.host.clone() else {
            error!("[{}] decision without a claimed host", self.id);
            return SessionResult::Close;
        };
        match ctx.hosts.decide(&host, ctx.rules) {
            Decision::Proceed => self.start_resolve(ctx),
            Decision::Reject(RejectReason::IllegalPort) => {
                warn!("[{}] illegal port {}", self.id, self.parser.port);
                answer::write_error(
                    &mut self.client,
                    403,
                    &ctx.config.server_name,
                    "Illegal port.\r\n",
                );
                SessionResult::Close
            }
            Decision::Reject(RejectReason::Unauthorized) => {
                warn!(
                    "[{}] tried to connect: {}:{} (unauthorized)",
                    self.id, self.parser.host, self.parser.port
                );
                answer::write_error(
                    &mut self.client,
                    403,
                    &ctx.config.server_name,
                    "Illegal host.\r\n",
                );
                SessionResult::Close
            }
            Decision::Hold => {
                info!(
                    "[{}] tried to connect: {}:{} (holding)",
                    self.id, self.parser.host, self.parser.port
                );
                ctx.timers.schedule(
                    Duration::from_millis(ctx.config.hold_retry_ms),
                    self.handle.token(Source::Timer),
                );
                self.phase = Phase::AwaitingRetry;
                SessionResult::Continue
            }
        }
    }

    fn retry_decision(&mut self, ctx: &mut ProxyCtx) -> SessionResult {
        match self.phase {
            Phase::AwaitingRetry => self.run_decision(ctx),
            // the connection progressed some other way; stale timer
            _ => SessionResult::Continue,
        }
    }

    fn start_resolve(&mut self, ctx: &mut ProxyCtx) -> SessionResult {
        let mut query = match DnsQuery::spawn(&self.parser.host) {
            Ok(query) => query,
            Err(e) => {
                error!("[{}] could not start resolver: {}", self.id, e);
                answer::write_error(
                    &mut self.client,
                    500,
                    &ctx.config.server_name,
                    "Failed to start resolver.\r\n",
                );
                return SessionResult::Close;
            }
        };
        if let Err(e) = ctx.registry.register(
            query.source(),
            self.handle.token(Source::Resolver),
            Interest::READABLE,
        ) {
            error!("[{}] could not register resolver: {}", self.id, e);
            answer::write_error(
                &mut self.client,
                500,
                &ctx.config.server_name,
                "Failed to start resolver.\r\n",
            );
            return SessionResult::Close;
        }
        self.resolver_readiness.interest = Ready::READABLE | Ready::HUP | Ready::ERROR;
        self.phase = Phase::Resolving(query);
        // first step right away; the query may already have finished
        self.resolver_step(ctx)
    }

    fn resolver_step(&mut self, ctx: &mut ProxyCtx) -> SessionResult {
        let step = match &mut self.phase {
            Phase::Resolving(query) => query.step(),
            _ => return SessionResult::Continue,
        };
        match step {
            ResolveStep::Pending => {
                self.resolver_readiness.event = Ready::EMPTY;
                SessionResult::Continue
            }
            ResolveStep::Complete(result) => {
                let previous = std::mem::replace(&mut self.phase, Phase::Connecting);
                if let Phase::Resolving(mut query) = previous {
                    let _ = ctx.registry.deregister(query.source());
                }
                self.resolver_readiness = Readiness::new();
                match result {
                    Ok(addr) => self.start_connect(ctx, SocketAddr::new(addr, self.parser.port)),
                    Err(e) => {
                        warn!("[{}] {}", self.id, e);
                        answer::write_error(
                            &mut self.client,
                            503,
                            &ctx.config.server_name,
                            "Proxy failed to resolve host.\r\n",
                        );
                        SessionResult::Close
                    }
                }
            }
        }
    }

    fn start_connect(&mut self, ctx: &mut ProxyCtx, addr: SocketAddr) -> SessionResult {
        let mut stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    "[{}] connect {}:{}: {}",
                    self.id, self.parser.host, self.parser.port, e
                );
                answer::write_error(
                    &mut self.client,
                    502,
                    &ctx.config.server_name,
                    "Failed to connect.\r\n",
                );
                return SessionResult::Close;
            }
        };
        if let Err(e) = ctx.registry.register(
            &mut stream,
            self.handle.token(Source::Target),
            Interest::WRITABLE,
        ) {
            error!("[{}] could not register target socket: {}", self.id, e);
            answer::write_error(
                &mut self.client,
                500,
                &ctx.config.server_name,
                "Failed to watch target socket.\r\n",
            );
            return SessionResult::Close;
        }
        self.target = Some(stream);
        self.target_readiness.interest = Ready::WRITABLE | Ready::HUP | Ready::ERROR;
        self.phase = Phase::Connecting;
        SessionResult::Continue
    }

    /// Write readiness on a connecting socket: the connect finished, one
    /// way or the other. The pending socket error decides which.
    fn connect_completed(&mut self, ctx: &mut ProxyCtx) -> SessionResult {
        self.target_readiness.event = Ready::EMPTY;
        let Some(target) = self.target.as_mut() else {
            return SessionResult::Continue;
        };

        match target.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => {
                warn!(
                    "[{}] connect {}:{}: {}",
                    self.id, self.parser.host, self.parser.port, e
                );
                answer::write_error(
                    &mut self.client,
                    502,
                    &ctx.config.server_name,
                    "Failed to connect.\r\n",
                );
                return SessionResult::Close;
            }
        }
        match target.peer_addr() {
            Ok(_) => {}
            // spurious wakeup, still connecting
            Err(e) if e.kind() == io::ErrorKind::NotConnected => return SessionResult::Continue,
            Err(e) => {
                warn!(
                    "[{}] connect {}:{}: {}",
                    self.id, self.parser.host, self.parser.port, e
                );
                answer::write_error(
                    &mut self.client,
                    502,
                    &ctx.config.server_name,
                    "Failed to connect.\r\n",
                );
                return SessionResult::Close;
            }
        }

        info!(
            "[{}] connected {}:{} via {}",
            self.id, self.parser.host, self.parser.port, self.parser.method
        );
        self.ts_connect = Some(Instant::now());

        if self.parser.is_connect() {
            if let Some(referer) = self
                .parser
                .headers
                .iter()
                .find(|h| h.key.eq_ignore_ascii_case("Referer"))
            {
                info!("[{}] Referer: {}", self.id, referer.value);
            }
            if let Err(e) = write_all(&mut self.client, CONNECT_ESTABLISHED) {
                warn!("[{}] write on success reply: {}", self.id, e);
                return SessionResult::Close;
            }
        } else if self.forward_request(ctx) == SessionResult::Close {
            return SessionResult::Close;
        }

        let Some(target) = self.target.as_mut() else {
            return SessionResult::Close;
        };
        if let Err(e) = ctx.registry.reregister(
            target,
            self.handle.token(Source::Target),
            Interest::READABLE,
        ) {
            error!("[{}] could not watch target for reads: {}", self.id, e);
            return SessionResult::Close;
        }
        self.target_readiness.interest = Ready::READABLE | Ready::HUP | Ready::ERROR;
        self.phase = Phase::Relay;

        // bytes that arrived with the request head belong to the target:
        // first tunnel bytes for CONNECT, leading body bytes otherwise
        let residue = self.lines.take_residue();
        if !residue.is_empty() {
            if let Err(e) = write_all(target, &residue) {
                warn!("[{}] write to target: {}", self.id, e);
                return SessionResult::Close;
            }
            if let Some(host) = &self.host {
                host.borrow_mut().add_tx_bytes(residue.len() as u64);
            }
        }
        SessionResult::Continue
    }

    /// Reconstruct the request head for the target: rewritten startline,
    /// client headers minus the proxy-only connection header, plus a
    /// forwarding identity carrying the correlation id.
    fn forward_request(&mut self, ctx: &mut ProxyCtx) -> SessionResult {
        let head = build_forward_head(&self.parser, self.id);
        let Some(target) = self.target.as_mut() else {
            return SessionResult::Close;
        };
        match write_all(target, head.as_bytes()) {
            Ok(()) => SessionResult::Continue,
            Err(e) => {
                warn!("[{}] write on request head: {}", self.id, e);
                answer::write_error(
                    &mut self.client,
                    500,
                    &ctx.config.server_name,
                    "Write on request head.\r\n",
                );
                SessionResult::Close
            }
        }
    }

    fn relay_client_to_target(&mut self) -> SessionResult {
        loop {
            match self.client.read(&mut self.copy_buf) {
                Ok(0) => {
                    debug!("[{}] read client: EOF", self.id);
                    return SessionResult::Close;
                }
                Ok(n) => {
                    self.bytes_from_client += n as u64;
                    let Some(target) = self.target.as_mut() else {
                        return SessionResult::Close;
                    };
                    if let Err(e) = write_all(target, &self.copy_buf[..n]) {
                        warn!("[{}] write to target: {}", self.id, e);
                        return SessionResult::Close;
                    }
                    if let Some(host) = &self.host {
                        host.borrow_mut().add_tx_bytes(n as u64);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.client_readiness.event.remove(Ready::READABLE);
                    return SessionResult::Continue;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("[{}] read client: {}", self.id, e);
                    return SessionResult::Close;
                }
            }
        }
    }

    fn target_readable(&mut self) -> SessionResult {
        loop {
            let Some(target) = self.target.as_mut() else {
                return SessionResult::Close;
            };
            match target.read(&mut self.copy_buf) {
                Ok(0) => {
                    debug!("[{}] read target: EOF", self.id);
                    return SessionResult::Close;
                }
                Ok(n) => {
                    if self.bytes_from_target == 0 {
                        self.ts_first_byte = Some(Instant::now());
                    }
                    self.bytes_from_target += n as u64;
                    if let Some(host) = &self.host {
                        host.borrow_mut().add_rx_bytes(n as u64);
                    }
                    if let Err(e) = write_all(&mut self.client, &self.copy_buf[..n]) {
                        warn!("[{}] write to client: {}", self.id, e);
                        return SessionResult::Close;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.target_readiness.event.remove(Ready::READABLE);
                    return SessionResult::Continue;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("[{}] read target: {}", self.id, e);
                    return SessionResult::Close;
                }
            }
        }
    }

    fn answer_request_error(&mut self, ctx: &mut ProxyCtx, err: RequestError) {
        let (code, body) = err.response();
        answer::write_error(&mut self.client, code, &ctx.config.server_name, body);
    }

    /// Release everything this session owns, exactly once. The caller
    /// already vacated the registry slot, so no event or timer still in
    /// flight can reach this session again.
    pub fn teardown(mut self, ctx: &mut ProxyCtx) {
        let _ = ctx.registry.deregister(&mut self.client);
        if let Some(target) = self.target.as_mut() {
            debug!("[{}] closing target socket", self.id);
            let _ = ctx.registry.deregister(target);
        }
        if let Phase::Resolving(query) = &mut self.phase {
            warn!("[{}] aborted resolver query for {}", self.id, query.host());
            let _ = ctx.registry.deregister(query.source());
        }
        if let Some(host) = self.host.take() {
            host.borrow_mut().release_ref();
        }
        if self.request_size > 0 {
            ctx.stats.request_size.record(self.request_size);
        }

        let end = Instant::now();
        if self.bytes_from_target > 0 {
            info!(
                "[{}] target was: {}:{} from_client: {:.1} kB from_target: {:.1} kB",
                self.id,
                self.parser.host,
                self.parser.port,
                self.bytes_from_client as f64 / 1024.0,
                self.bytes_from_target as f64 / 1024.0,
            );
        }
        if let Some(connect) = self.ts_connect {
            info!(
                "[{}] lifetime: {:.3} s ({})",
                self.id,
                end.duration_since(self.ts_accept).as_secs_f64(),
                self.parser.host,
            );
            info!(
                "[{}] time to connect: {:.1} ms ({})",
                self.id,
                connect.duration_since(self.ts_accept).as_secs_f64() * 1000.0,
                self.parser.host,
            );
            if let Some(first_byte) = self.ts_first_byte {
                info!(
                    "[{}] time to first byte: {:.1} ms ({})",
                    self.id,
                    first_byte.duration_since(self.ts_accept).as_secs_f64() * 1000.0,
                    self.parser.host,
                );
            }
        }
        info!("{}", ctx.stats.summary());
        // dropping self closes both sockets and cancels any query
    }
}

fn elapsed_us(since: Instant) -> u64 {
    since.elapsed().as_micros() as u64
}

/// Rewritten head sent upstream for non-CONNECT methods.
pub fn build_forward_head(parser: &RequestParser, id: Ulid) -> String {
    let mut head = format!("{} /{} HTTP/1.1\r\n", parser.method, parser.path);
    for header in &parser.headers {
        if header.key.eq_ignore_ascii_case("Proxy-Connection") {
            continue;
        }
        head.push_str(&header.key);
        head.push_str(": ");
        head.push_str(&header.value);
        head.push_str("\r\n");
    }
    head.push_str(&format!("Forwarded: for=_{}\r\n\r\n", id));
    head
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        authz::{HostDb, Rules},
        registry::Registry,
        stats::Stats,
        timer::TimerQueue,
    };
    use mio::Poll;
    use std::{io::Write, thread, time::Duration};
    use tempfile::TempDir;

    fn parsed(lines: &[&str]) -> RequestParser {
        let mut parser = RequestParser::new(80);
        for line in lines {
            parser.feed_line(line);
        }
        parser.feed_line("");
        parser
    }

    #[test]
    fn forward_head_rewrites_startline_and_strips_proxy_header() {
        let parser = parsed(&[
            "GET http://example.com:8080/a/b HTTP/1.1",
            "Host: example.com",
            "Proxy-Connection: keep-alive",
            "Accept: */*",
        ]);
        let id = Ulid::generate();
        let head = build_forward_head(&parser, id);
        assert!(head.starts_with("GET /a/b HTTP/1.1\r\n"));
        assert!(head.contains("Host: example.com\r\n"));
        assert!(head.contains("Accept: */*\r\n"));
        assert!(!head.to_ascii_lowercase().contains("proxy-connection"));
        assert!(head.contains(&format!("Forwarded: for=_{}\r\n", id)));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn forward_head_keeps_header_order() {
        let parser = parsed(&[
            "POST http://x.com/submit HTTP/1.1",
            "A: 1",
            "B: 2",
            "C: 3",
        ]);
        let head = build_forward_head(&parser, Ulid::generate());
        let a = head.find("A: 1").unwrap();
        let b = head.find("B: 2").unwrap();
        let c = head.find("C: 3").unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn teardown_releases_the_host_claim_exactly_once() {
        let dir = TempDir::new().unwrap();
        let poll = Poll::new().unwrap();
        let mut hosts = HostDb::new(dir.path().join("known_hosts"));
        let rules = Rules::default();
        let mut timers = TimerQueue::new();
        let mut stats = Stats::new();
        let config = Config::default();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut remote = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, peer) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let client = TcpStream::from_std(accepted);

        let mut arena: Registry<u8> = Registry::new(1);
        let handle = arena.insert_with(|_| 0).unwrap();
        let mut gateway = Gateway::new(handle, client, peer, &config);

        // no rules and no prior sighting, so the request parks in the
        // hold phase with the host claimed
        remote
            .write_all(b"CONNECT unknown-host.example:8080 HTTP/1.1\r\n\r\n")
            .unwrap();

        let mut ctx = ProxyCtx {
            registry: poll.registry(),
            hosts: &mut hosts,
            rules: &rules,
            timers: &mut timers,
            stats: &mut stats,
            config: &config,
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            assert_eq!(
                gateway.resume(&mut ctx, Source::Client, Ready::READABLE),
                SessionResult::Continue
            );
            if !ctx.hosts.iterate().is_empty() {
                break;
            }
            assert!(Instant::now() < deadline, "request never parsed");
            thread::sleep(Duration::from_millis(5));
        }

        let host = ctx.hosts.iterate()[0].clone();
        assert_eq!(host.borrow().ref_count(), 1);
        assert!(host.borrow().is_held());

        gateway.teardown(&mut ctx);
        assert_eq!(host.borrow().ref_count(), 0);
        // the claim was released, not the record
        assert_eq!(host.borrow().name(), "unknown-host.example");
    }
}
