//! Administrative web interface.
//!
//! A tiny request/response server on its own listener: one origin-form
//! request per connection, an HTML answer, then close. It is the only
//! place where pending hosts get decided by a human, so it stays
//! deliberately dependency-free: a table of known hosts with
//! authorize/block links and a view of the loaded rules.

use std::{
    io::{self, Read},
    net::SocketAddr,
};

use log::{debug, info, warn};
use mio::{net::TcpStream, Interest};
use rusty_ulid::Ulid;

use crate::{
    authz::{AuthState, HostRef},
    config::Config,
    http::{answer, line::LineBuffer, parse_hostport, ParseState, RequestError, RequestParser},
    ready::{Readiness, Ready},
    registry::Handle,
    server::ProxyCtx,
    SessionResult, Source,
};

#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Index,
    Rules,
    Authorize(&'a str),
    Unauthorize(&'a str),
    Unknown,
}

fn route(path: &str) -> Route<'_> {
    if path == "/" {
        Route::Index
    } else if path == "/rules" {
        Route::Rules
    } else if let Some(target) = path.strip_prefix("/authorize/") {
        Route::Authorize(target)
    } else if let Some(target) = path.strip_prefix("/unauthorize/") {
        Route::Unauthorize(target)
    } else {
        Route::Unknown
    }
}

pub struct AdminSession {
    handle: Handle,
    id: Ulid,
    client: TcpStream,
    peer: SocketAddr,
    parser: RequestParser,
    lines: LineBuffer,
    read_buf: Vec<u8>,
    readiness: Readiness,
}

impl AdminSession {
    pub fn new(handle: Handle, client: TcpStream, peer: SocketAddr, config: &Config) -> AdminSession {
        let mut readiness = Readiness::new();
        readiness.interest = Ready::READABLE | Ready::HUP | Ready::ERROR;
        AdminSession {
            handle,
            id: Ulid::generate(),
            client,
            peer,
            parser: RequestParser::new(80),
            lines: LineBuffer::new(config.request_buffer_size),
            read_buf: vec![0; config.read_block_size.max(1)],
            readiness,
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

    pub fn resume(&mut self, ctx: &mut ProxyCtx, _source: Source, ready: Ready) -> SessionResult {
        self.readiness.event |= ready;
        loop {
            let filtered = self.readiness.filter();
            if filtered.is_readable() {
                if self.readable(ctx) == SessionResult::Close {
                    return SessionResult::Close;
                }
            } else if filtered.is_hup() || filtered.is_error() {
                debug!("[{}] admin client closed", self.id);
                return SessionResult::Close;
            } else {
                return SessionResult::Continue;
            }
        }
    }

    fn readable(&mut self, ctx: &mut ProxyCtx) -> SessionResult {
        loop {
            let space = self.lines.space();
            if space == 0 {
                warn!("[{}] admin request exceeded the read buffer", self.id);
                let (code, body) = RequestError::LineTooLong.response();
                answer::write_error(&mut self.client, code, &ctx.config.server_name, body);
                return SessionResult::Close;
            }
            let len = space.min(self.read_buf.len());
            match self.client.read(&mut self.read_buf[..len]) {
                Ok(0) => return SessionResult::Close,
                Ok(n) => {
                    self.lines.fill(&self.read_buf[..n]);
                    while let Some(line) = self.lines.next_line() {
                        self.parser.feed_line(&line.text);
                        match self.parser.state() {
                            ParseState::Error => {
                                let err =
                                    self.parser.error().unwrap_or(RequestError::StartlineParse);
                                let (code, body) = err.response();
                                answer::write_error(
                                    &mut self.client,
                                    code,
                                    &ctx.config.server_name,
                                    body,
                                );
                                return SessionResult::Close;
                            }
                            ParseState::Body => return self.respond(ctx),
                            _ => {}
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.readiness.event.remove(Ready::READABLE);
                    return SessionResult::Continue;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("[{}] read admin client: {}", self.id, e);
                    return SessionResult::Close;
                }
            }
        }
    }

    /// Route the parsed request and write the one-shot HTML answer. The
    /// session always closes afterwards.
    fn respond(&mut self, ctx: &mut ProxyCtx) -> SessionResult {
        if !self.parser.is_local() || !self.parser.method.eq_ignore_ascii_case("GET") {
            answer::write_error(
                &mut self.client,
                400,
                &ctx.config.server_name,
                "Unsupported method.\r\n",
            );
            return SessionResult::Close;
        }

        debug!("[{}] admin {} from {}", self.id, self.parser.path, self.peer);
        match route(&self.parser.path) {
            Route::Index => {
                let page = render_index(ctx.hosts.iterate());
                answer::write_html(&mut self.client, 200, &ctx.config.server_name, &page);
            }
            Route::Rules => {
                let page = render_rules(ctx.rules.patterns());
                answer::write_html(&mut self.client, 200, &ctx.config.server_name, &page);
            }
            Route::Authorize(target) => {
                let target = target.to_string();
                self.mutate(ctx, &target, true)
            }
            Route::Unauthorize(target) => {
                let target = target.to_string();
                self.mutate(ctx, &target, false)
            }
            Route::Unknown => {
                answer::write_error(
                    &mut self.client,
                    400,
                    &ctx.config.server_name,
                    "No such page.\r\n",
                );
            }
        }
        SessionResult::Close
    }

    fn mutate(&mut self, ctx: &mut ProxyCtx, target: &str, authorize: bool) {
        let Ok((name, port)) = parse_hostport(target, 80) else {
            answer::write_error(
                &mut self.client,
                400,
                &ctx.config.server_name,
                "Parse error while parsing startline.\r\n",
            );
            return;
        };
        let found: Option<HostRef> = ctx
            .hosts
            .iterate()
            .iter()
            .find(|h| {
                let h = h.borrow();
                h.name() == name && h.port() == port
            })
            .cloned();
        match found {
            Some(host) => {
                if authorize {
                    info!("[{}] operator authorized {}:{}", self.id, name, port);
                    ctx.hosts.authorize(&host, None);
                } else {
                    info!("[{}] operator blocked {}:{}", self.id, name, port);
                    ctx.hosts.unauthorize(&host);
                }
                answer::write_html(&mut self.client, 200, &ctx.config.server_name, REDIRECT_HOME);
            }
            None => {
                answer::write_error(
                    &mut self.client,
                    400,
                    &ctx.config.server_name,
                    "No such host.\r\n",
                );
            }
        }
    }

    pub fn teardown(mut self, ctx: &mut ProxyCtx) {
        let _ = ctx.registry.deregister(&mut self.client);
    }
}

const REDIRECT_HOME: &str =
    "<html><head><meta http-equiv=\"refresh\" content=\"0; url=/\"></head>\
     <body>Done.</body></html>\r\n";

fn render_index(hosts: &[HostRef]) -> String {
    let mut page = String::from(
        "<html><head><title>webgate</title></head><body>\
         <h1>Known hosts</h1>\
         <table border=\"1\">\
         <tr><th>host</th><th>port</th><th>visits</th><th>received</th>\
         <th>sent</th><th>state</th><th>rule</th><th>active</th><th></th></tr>",
    );
    for host in hosts {
        let h = host.borrow();
        let state = match h.auth() {
            AuthState::Authorized => "authorized",
            AuthState::Rejected => "blocked",
            AuthState::Pending => "pending",
        };
        page.push_str(&format!(
            "<tr><td>{name}</td><td>{port}</td><td>{visits}</td>\
             <td>{rx:.1} kB</td><td>{tx:.1} kB</td><td>{state}</td>\
             <td>{pattern}</td><td>{active}</td>\
             <td><a href=\"/authorize/{name}:{port}\">authorize</a> \
             <a href=\"/unauthorize/{name}:{port}\">block</a></td></tr>",
            name = h.name(),
            port = h.port(),
            visits = h.visits(),
            rx = h.rx_bytes() as f64 / 1024.0,
            tx = h.tx_bytes() as f64 / 1024.0,
            state = state,
            pattern = h.pattern().unwrap_or(""),
            active = h.ref_count(),
        ));
    }
    page.push_str("</table><p><a href=\"/rules\">rules</a></p></body></html>\r\n");
    page
}

fn render_rules(patterns: &[String]) -> String {
    let mut page = String::from(
        "<html><head><title>webgate rules</title></head><body>\
         <h1>Rules</h1><ol>",
    );
    for pattern in patterns {
        page.push_str(&format!("<li>{}</li>", pattern));
    }
    page.push_str("</ol><p><a href=\"/\">back</a></p></body></html>\r\n");
    page
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::Host;
    use std::{cell::RefCell, rc::Rc};

    #[test]
    fn routing() {
        assert_eq!(route("/"), Route::Index);
        assert_eq!(route("/rules"), Route::Rules);
        assert_eq!(route("/authorize/x.com:443"), Route::Authorize("x.com:443"));
        assert_eq!(
            route("/unauthorize/x.com:443"),
            Route::Unauthorize("x.com:443")
        );
        assert_eq!(route("/favicon.ico"), Route::Unknown);
    }

    #[test]
    fn index_lists_hosts_with_action_links() {
        let mut host = Host::new("x.com", 443, 5);
        host.authorize(Some("*.x.com:*"));
        let hosts = vec![Rc::new(RefCell::new(host))];
        let page = render_index(&hosts);
        assert!(page.contains("<td>x.com</td>"));
        assert!(page.contains("<td>443</td>"));
        assert!(page.contains("<td>5</td>"));
        assert!(page.contains("authorized"));
        assert!(page.contains("*.x.com:*"));
        assert!(page.contains("href=\"/authorize/x.com:443\""));
        assert!(page.contains("href=\"/unauthorize/x.com:443\""));
    }

    #[test]
    fn rules_page_lists_patterns_in_order() {
        let page = render_rules(&["*.a.com:443".to_string(), "*:8080".to_string()]);
        let a = page.find("*.a.com:443").unwrap();
        let b = page.find("*:8080").unwrap();
        assert!(a < b);
    }
}
