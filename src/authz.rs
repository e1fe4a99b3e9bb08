//! Host authorization: the host store, the wildcard rules, and the
//! decision every parsed request goes through before any resolution.
//!
//! A host is identified by (name, port) and carries a tri-state flag:
//! authorized, rejected, or pending. New hosts start pending; a pending
//! host stays pending until an administrator or a matching rule decides,
//! and requests for it are held and retried rather than refused outright.

use std::{cell::RefCell, path::PathBuf, rc::Rc};

use log::{info, warn};

use crate::persist;

/// upstream ports the gateway will ever connect to
pub const ALLOWED_PORTS: [u16; 3] = [80, 443, 8080];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Authorized,
    Rejected,
    Pending,
}

impl AuthState {
    /// the on-disk encoding: 1 authorized, -1 rejected, 0 pending
    pub fn to_flag(self) -> i8 {
        match self {
            AuthState::Authorized => 1,
            AuthState::Rejected => -1,
            AuthState::Pending => 0,
        }
    }

    pub fn from_flag(flag: i8) -> AuthState {
        match flag {
            1 => AuthState::Authorized,
            -1 => AuthState::Rejected,
            _ => AuthState::Pending,
        }
    }
}

#[derive(Debug)]
pub struct Host {
    name: String,
    port: u16,
    visits: u64,
    rx_bytes: u64,
    tx_bytes: u64,
    auth: AuthState,
    pattern: Option<String>,
    /// connections currently using this host; not persisted
    active: u32,
}

pub type HostRef = Rc<RefCell<Host>>;

impl Host {
    pub fn new(name: &str, port: u16, visits: u64) -> Host {
        Host {
            name: name.to_string(),
            port,
            visits,
            rx_bytes: 0,
            tx_bytes: 0,
            auth: AuthState::Pending,
            pattern: None,
            active: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn visits(&self) -> u64 {
        self.visits
    }

    pub fn incr_visits(&mut self) {
        self.visits += 1;
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes
    }

    pub fn add_rx_bytes(&mut self, bytes: u64) {
        self.rx_bytes += bytes;
    }

    pub fn add_tx_bytes(&mut self, bytes: u64) {
        self.tx_bytes += bytes;
    }

    pub fn auth(&self) -> AuthState {
        self.auth
    }

    pub fn is_authorized(&self) -> bool {
        self.auth == AuthState::Authorized
    }

    pub fn is_held(&self) -> bool {
        self.auth == AuthState::Pending
    }

    pub fn authorize(&mut self, pattern: Option<&str>) {
        self.auth = AuthState::Authorized;
        if let Some(pattern) = pattern {
            self.pattern = Some(pattern.to_string());
        }
    }

    pub fn unauthorize(&mut self) {
        self.auth = AuthState::Rejected;
    }

    pub fn pattern(&self) -> Option<&str> {
        self.pattern.as_deref()
    }

    pub fn add_ref(&mut self) {
        self.active += 1;
    }

    pub fn release_ref(&mut self) {
        debug_assert!(self.active > 0, "host reference underflow");
        self.active = self.active.saturating_sub(1);
    }

    pub fn ref_count(&self) -> u32 {
        self.active
    }

    /// the `key value` block persisted to the hosts file
    pub fn to_block(&self) -> String {
        let mut block = format!(
            "host {}\nport {}\nvisits {}\nrx_bytes {}\ntx_bytes {}\nis_authorized {}\n",
            self.name,
            self.port,
            self.visits,
            self.rx_bytes,
            self.tx_bytes,
            self.auth.to_flag(),
        );
        if let Some(pattern) = &self.pattern {
            block.push_str(&format!("pattern {}\n", pattern));
        }
        block
    }

    pub fn from_block(block: &str) -> Option<Host> {
        let mut name = None;
        let mut port = None;
        let mut visits = 0;
        let mut rx_bytes = 0;
        let mut tx_bytes = 0;
        let mut auth = AuthState::Pending;
        let mut pattern = None;

        for line in block.lines() {
            let Some((key, value)) = line.split_once(' ') else {
                continue;
            };
            match key {
                "host" => name = Some(value.to_string()),
                "port" => port = value.parse().ok(),
                "visits" => visits = value.parse().unwrap_or(0),
                "rx_bytes" => rx_bytes = value.parse().unwrap_or(0),
                "tx_bytes" => tx_bytes = value.parse().unwrap_or(0),
                "is_authorized" => auth = AuthState::from_flag(value.parse().unwrap_or(0)),
                "pattern" => pattern = Some(value.to_string()),
                _ => {}
            }
        }

        Some(Host {
            name: name?,
            port: port?,
            visits,
            rx_bytes,
            tx_bytes,
            auth,
            pattern,
            active: 0,
        })
    }
}

/// Ordered wildcard rules over `host:port`; first match wins.
#[derive(Debug, Default)]
pub struct Rules {
    patterns: Vec<String>,
}

impl Rules {
    pub fn new(patterns: Vec<String>) -> Rules {
        Rules { patterns }
    }

    pub fn matches(&self, host: &str, port: u16) -> Option<&str> {
        let hostport = format!("{}:{}", host, port);
        self.patterns
            .iter()
            .find(|pattern| glob_match(pattern, &hostport))
            .map(String::as_str)
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

/// fnmatch-style glob: `*` matches any run, `?` any single character
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            // backtrack: let the last star swallow one more character
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

/// Authorization outcome for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    Reject(RejectReason),
    /// not decided yet; the caller schedules a retry and asks again
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    IllegalPort,
    Unauthorized,
}

/// Host store backing the authorization gate. Lazily loads the hosts file
/// on first lookup and persists on every mutation.
#[derive(Debug)]
pub struct HostDb {
    hosts: Vec<HostRef>,
    loaded: bool,
    path: PathBuf,
}

impl HostDb {
    pub fn new<P: Into<PathBuf>>(path: P) -> HostDb {
        HostDb {
            hosts: Vec::new(),
            loaded: false,
            path: path.into(),
        }
    }

    fn ensure_loaded(&mut self) {
        if self.loaded {
            return;
        }
        self.loaded = true;
        match persist::load_hosts(&self.path) {
            Ok(hosts) => {
                info!("loaded {} known hosts from {}", hosts.len(), self.path.display());
                self.hosts = hosts.into_iter().map(|h| Rc::new(RefCell::new(h))).collect();
            }
            Err(e) => warn!("could not load {}: {}", self.path.display(), e),
        }
    }

    /// Look the host up, counting the visit, or create it pending with
    /// zero visits. Creation persists the store.
    pub fn find_or_create(&mut self, name: &str, port: u16) -> HostRef {
        self.ensure_loaded();
        for host in &self.hosts {
            let found = {
                let h = host.borrow();
                h.name() == name && h.port() == port
            };
            if found {
                host.borrow_mut().incr_visits();
                return Rc::clone(host);
            }
        }
        let host = Rc::new(RefCell::new(Host::new(name, port, 0)));
        self.hosts.push(Rc::clone(&host));
        self.save();
        host
    }

    pub fn iterate(&mut self) -> &[HostRef] {
        self.ensure_loaded();
        &self.hosts
    }

    pub fn authorize(&mut self, host: &HostRef, pattern: Option<&str>) {
        host.borrow_mut().authorize(pattern);
        self.save();
    }

    pub fn unauthorize(&mut self, host: &HostRef) {
        host.borrow_mut().unauthorize();
        self.save();
    }

    fn save(&self) {
        if let Err(e) = persist::save_hosts(&self.path, &self.hosts) {
            warn!("could not save {}: {}", self.path.display(), e);
        }
    }

    /// The authorization gate. Does not touch visit counts: those are
    /// recorded once per parsed request by [`find_or_create`], so a held
    /// request re-deciding after its cooldown is idempotent.
    pub fn decide(&mut self, host: &HostRef, rules: &Rules) -> Decision {
        let (name, port, auth) = {
            let h = host.borrow();
            (h.name().to_string(), h.port(), h.auth())
        };

        if !ALLOWED_PORTS.contains(&port) {
            return Decision::Reject(RejectReason::IllegalPort);
        }
        if auth == AuthState::Authorized {
            return Decision::Proceed;
        }
        if let Some(pattern) = rules.matches(&name, port) {
            let pattern = pattern.to_string();
            info!("rule {} authorizes {}:{}", pattern, name, port);
            self.authorize(host, Some(&pattern));
            return Decision::Proceed;
        }
        match auth {
            AuthState::Rejected => Decision::Reject(RejectReason::Unauthorized),
            _ => Decision::Hold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn db(dir: &TempDir) -> HostDb {
        HostDb::new(dir.path().join("known_hosts"))
    }

    #[test]
    fn glob_matching() {
        assert!(glob_match("*.example.com:443", "foo.example.com:443"));
        assert!(glob_match("*.example.com:443", "a.b.example.com:443"));
        assert!(!glob_match("*.example.com:443", "example.com:443"));
        assert!(!glob_match("*.example.com:443", "foo.example.com:80"));
        assert!(glob_match("exact.com:80", "exact.com:80"));
        assert!(glob_match("??.com:80", "ab.com:80"));
        assert!(!glob_match("??.com:80", "abc.com:80"));
        assert!(glob_match("*", "anything:8080"));
    }

    #[test]
    fn first_rule_match_wins() {
        let rules = Rules::new(vec!["*.example.com:*".into(), "*:443".into()]);
        assert_eq!(rules.matches("foo.example.com", 443), Some("*.example.com:*"));
        assert_eq!(rules.matches("other.com", 443), Some("*:443"));
        assert_eq!(rules.matches("other.com", 80), None);
    }

    #[test]
    fn first_sighting_with_rule_proceeds_and_records_pattern() {
        let dir = TempDir::new().unwrap();
        let mut hosts = db(&dir);
        let rules = Rules::new(vec!["*.example.com:443".into()]);

        let host = hosts.find_or_create("foo.example.com", 443);
        assert_eq!(host.borrow().visits(), 0);
        assert_eq!(hosts.decide(&host, &rules), Decision::Proceed);
        assert!(host.borrow().is_authorized());
        assert_eq!(host.borrow().pattern(), Some("*.example.com:443"));

        // a second sighting only counts the visit; the rule is not re-run
        let host = hosts.find_or_create("foo.example.com", 443);
        assert_eq!(host.borrow().visits(), 1);
        assert_eq!(hosts.decide(&host, &Rules::default()), Decision::Proceed);
    }

    #[test]
    fn unknown_host_is_held_and_redecision_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut hosts = db(&dir);
        let rules = Rules::default();

        let host = hosts.find_or_create("unknown.com", 443);
        assert_eq!(hosts.decide(&host, &rules), Decision::Hold);
        // the retry re-decides without another visit being counted
        assert_eq!(hosts.decide(&host, &rules), Decision::Hold);
        assert_eq!(host.borrow().visits(), 0);
        assert!(host.borrow().is_held());
    }

    #[test]
    fn rejected_host_is_refused() {
        let dir = TempDir::new().unwrap();
        let mut hosts = db(&dir);
        let host = hosts.find_or_create("banned.com", 80);
        hosts.unauthorize(&host);
        assert_eq!(
            hosts.decide(&host, &Rules::default()),
            Decision::Reject(RejectReason::Unauthorized)
        );
    }

    #[test]
    fn illegal_port_is_rejected_regardless_of_host_state() {
        let dir = TempDir::new().unwrap();
        let mut hosts = db(&dir);
        let host = hosts.find_or_create("x.com", 22);
        hosts.authorize(&host, None);
        assert_eq!(
            hosts.decide(&host, &Rules::default()),
            Decision::Reject(RejectReason::IllegalPort)
        );
    }

    #[test]
    fn host_block_round_trip() {
        let mut host = Host::new("x.com", 443, 3);
        host.add_rx_bytes(100);
        host.add_tx_bytes(200);
        host.authorize(Some("x.com:443"));
        host.add_ref();

        let restored = Host::from_block(&host.to_block()).unwrap();
        assert_eq!(restored.name(), "x.com");
        assert_eq!(restored.port(), 443);
        assert_eq!(restored.visits(), 3);
        assert_eq!(restored.rx_bytes(), 100);
        assert_eq!(restored.tx_bytes(), 200);
        assert!(restored.is_authorized());
        assert_eq!(restored.pattern(), Some("x.com:443"));
        // the active reference count is not persisted
        assert_eq!(restored.ref_count(), 0);
    }

    #[test]
    fn block_without_pattern_round_trips() {
        let host = Host::new("plain.com", 80, 0);
        let restored = Host::from_block(&host.to_block()).unwrap();
        assert_eq!(restored.pattern(), None);
        assert!(restored.is_held());
    }
}
