//! Line-oriented HTTP/1.1 request parsing.
//!
//! The parser is a small state machine fed one completed line at a time by
//! the [`line`] reassembler: STARTLINE, then HEADERS until a blank line,
//! then BODY (which is never parsed, only relayed). Errors latch as they
//! are found and flip the state to ERROR on the blank-line transition, so
//! a request is always consumed up to its header terminator before the
//! error response goes out.

pub mod answer;
pub mod line;

pub const MAX_HEADERS: usize = 16;
pub const MAX_HEADER_KEY: usize = 63;
pub const MAX_HEADER_VALUE: usize = 1023;

/// methods the gateway will forward; anything else is a 400
pub const SUPPORTED_METHODS: &[&str] = &[
    "CONNECT", "GET", "POST", "HEAD", "PUT", "DELETE", "OPTIONS", "PATCH",
];

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    #[error("line exceeded the read buffer without a terminator")]
    LineTooLong,
    #[error("could not parse startline")]
    StartlineParse,
    #[error("could not parse a header line")]
    HeaderParse,
    #[error("a header key or value was too long")]
    HeaderTooLong,
    #[error("too many headers submitted")]
    TooManyHeaders,
}

impl RequestError {
    /// status code and plain-text body for the client-facing response
    pub fn response(&self) -> (u16, &'static str) {
        match self {
            RequestError::LineTooLong => (500, "Too long line.\r\n"),
            RequestError::StartlineParse => (400, "Parse error while parsing startline.\r\n"),
            RequestError::HeaderParse => (400, "Parse error while parsing a header.\r\n"),
            RequestError::HeaderTooLong => (400, "A submitted header was too long.\r\n"),
            RequestError::TooManyHeaders => (400, "Too many headers submitted.\r\n"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    StartLine,
    Headers,
    Body,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub key: String,
    pub value: String,
}

/// Parse `host[:port]`, using `default_port` when the port is absent or
/// zero. A colon not followed by a digit is a parse error.
pub fn parse_hostport(input: &str, default_port: u16) -> Result<(String, u16), RequestError> {
    let (host, port) = match input.split_once(':') {
        Some((host, rest)) => {
            if !rest.starts_with(|c: char| c.is_ascii_digit()) {
                return Err(RequestError::StartlineParse);
            }
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            let port: u16 = digits.parse().map_err(|_| RequestError::StartlineParse)?;
            (host, port)
        }
        None => (input, 0),
    };
    let port = if port == 0 { default_port } else { port };
    Ok((host.to_string(), port))
}

/// Parse `scheme://host[:port]/path`. The scheme is not interpreted and
/// the returned path excludes its leading slash.
fn parse_url(url: &str) -> Result<(String, u16, String), RequestError> {
    let (_scheme, rest) = url.split_once("://").ok_or(RequestError::StartlineParse)?;
    let (hostport, path) = rest.split_once('/').ok_or(RequestError::StartlineParse)?;
    let (host, port) = parse_hostport(hostport, 80)?;
    Ok((host, port, path.to_string()))
}

#[derive(Debug)]
pub struct RequestParser {
    state: ParseState,
    error: Option<RequestError>,
    pub method: String,
    pub uri: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub headers: Vec<Header>,
    connect_default_port: u16,
}

impl RequestParser {
    pub fn new(connect_default_port: u16) -> RequestParser {
        RequestParser {
            state: ParseState::StartLine,
            error: None,
            method: String::new(),
            uri: String::new(),
            host: String::new(),
            port: 0,
            path: String::new(),
            headers: Vec::new(),
            connect_default_port,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn error(&self) -> Option<RequestError> {
        self.error
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// origin-form request: no host/port were derived, only a local path
    pub fn is_local(&self) -> bool {
        self.host.is_empty() && self.path.starts_with('/')
    }

    pub fn is_supported_method(&self) -> bool {
        SUPPORTED_METHODS
            .iter()
            .any(|m| self.method.eq_ignore_ascii_case(m))
    }

    /// Advance the state machine by one line.
    pub fn feed_line(&mut self, line: &str) {
        match self.state {
            ParseState::StartLine => self.feed_startline(line),
            ParseState::Headers => self.feed_header(line),
            // body bytes are relayed, never parsed
            ParseState::Body | ParseState::Error => {}
        }
    }

    fn feed_startline(&mut self, line: &str) {
        self.state = ParseState::Headers;

        let mut parts = line.splitn(3, ' ');
        let (method, target) = match (parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(target), Some(_version)) => (method, target),
            _ => {
                self.error = Some(RequestError::StartlineParse);
                return;
            }
        };
        self.method = method.to_string();
        self.uri = target.to_string();

        if self.is_connect() {
            // the historical default here is 80, not the conventional 443
            match parse_hostport(target, self.connect_default_port) {
                Ok((host, port)) => {
                    self.host = host;
                    self.port = port;
                }
                Err(e) => self.error = Some(e),
            }
        } else if target.starts_with('/') {
            // origin-form, only meaningful on the administrative listener
            self.path = target.to_string();
        } else {
            match parse_url(target) {
                Ok((host, port, path)) => {
                    self.host = host;
                    self.port = port;
                    self.path = path;
                }
                Err(e) => self.error = Some(e),
            }
        }
    }

    fn feed_header(&mut self, line: &str) {
        if line.is_empty() {
            // errors found earlier only surface here
            self.state = match self.error {
                Some(_) => ParseState::Error,
                None => ParseState::Body,
            };
            return;
        }

        let (key, value) = match line.split_once(':') {
            Some((key, value)) => (key, value.trim_start()),
            None => {
                self.error = Some(RequestError::HeaderParse);
                return;
            }
        };

        if self.headers.len() >= MAX_HEADERS {
            self.error = Some(RequestError::TooManyHeaders);
            return;
        }
        if key.len() > MAX_HEADER_KEY || value.len() > MAX_HEADER_VALUE {
            self.error = Some(RequestError::HeaderTooLong);
            return;
        }
        self.headers.push(Header {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> RequestParser {
        RequestParser::new(80)
    }

    #[test]
    fn connect_with_port() {
        let mut p = parser();
        p.feed_line("CONNECT example.com:8443 HTTP/1.1");
        assert_eq!(p.method, "CONNECT");
        assert_eq!(p.host, "example.com");
        assert_eq!(p.port, 8443);
        assert_eq!(p.state(), ParseState::Headers);
    }

    #[test]
    fn connect_without_port_uses_configured_default() {
        let mut p = parser();
        p.feed_line("CONNECT example.com HTTP/1.1");
        assert_eq!(p.port, 80);

        let mut p = RequestParser::new(443);
        p.feed_line("CONNECT example.com HTTP/1.1");
        assert_eq!(p.port, 443);
    }

    #[test]
    fn connect_with_bare_colon_is_an_error() {
        let mut p = parser();
        p.feed_line("CONNECT example.com: HTTP/1.1");
        assert_eq!(p.error(), Some(RequestError::StartlineParse));
        p.feed_line("");
        assert_eq!(p.state(), ParseState::Error);
    }

    #[test]
    fn absolute_uri_with_port_and_path() {
        let mut p = parser();
        p.feed_line("GET http://example.com:8080/a/b HTTP/1.1");
        assert_eq!(p.method, "GET");
        assert_eq!(p.host, "example.com");
        assert_eq!(p.port, 8080);
        assert_eq!(p.path, "a/b");
    }

    #[test]
    fn absolute_uri_without_port_defaults_to_80() {
        let mut p = parser();
        p.feed_line("GET http://example.com/ HTTP/1.1");
        assert_eq!(p.port, 80);
        assert_eq!(p.path, "");
    }

    #[test]
    fn absolute_uri_without_path_is_an_error() {
        let mut p = parser();
        p.feed_line("GET http://example.com HTTP/1.1");
        assert_eq!(p.error(), Some(RequestError::StartlineParse));
    }

    #[test]
    fn origin_form_is_local() {
        let mut p = parser();
        p.feed_line("GET /authorize/x.com:443 HTTP/1.1");
        assert!(p.is_local());
        assert_eq!(p.path, "/authorize/x.com:443");
        assert!(p.host.is_empty());
    }

    #[test]
    fn startline_with_missing_version_is_an_error() {
        let mut p = parser();
        p.feed_line("GET /");
        assert_eq!(p.error(), Some(RequestError::StartlineParse));
    }

    #[test]
    fn headers_accumulate_in_order() {
        let mut p = parser();
        p.feed_line("GET http://x.com/ HTTP/1.1");
        p.feed_line("Host: x.com");
        p.feed_line("Accept:   everything");
        p.feed_line("");
        assert_eq!(p.state(), ParseState::Body);
        assert_eq!(p.headers.len(), 2);
        assert_eq!(p.headers[0].key, "Host");
        assert_eq!(p.headers[1].value, "everything");
    }

    #[test]
    fn header_without_colon_latches_error_until_blank_line() {
        let mut p = parser();
        p.feed_line("GET http://x.com/ HTTP/1.1");
        p.feed_line("broken header");
        // the error latches; the state machine keeps consuming headers
        assert_eq!(p.state(), ParseState::Headers);
        p.feed_line("Host: x.com");
        p.feed_line("");
        assert_eq!(p.state(), ParseState::Error);
        assert_eq!(p.error(), Some(RequestError::HeaderParse));
    }

    #[test]
    fn seventeenth_header_is_rejected_and_not_stored() {
        let mut p = parser();
        p.feed_line("GET http://x.com/ HTTP/1.1");
        for i in 0..17 {
            p.feed_line(&format!("X-Header-{i}: value"));
        }
        assert_eq!(p.error(), Some(RequestError::TooManyHeaders));
        assert_eq!(p.headers.len(), MAX_HEADERS);
        p.feed_line("");
        assert_eq!(p.state(), ParseState::Error);
    }

    #[test]
    fn oversized_header_value_is_rejected() {
        let mut p = parser();
        p.feed_line("GET http://x.com/ HTTP/1.1");
        p.feed_line(&format!("X-Big: {}", "v".repeat(MAX_HEADER_VALUE + 1)));
        assert_eq!(p.error(), Some(RequestError::HeaderTooLong));
    }

    #[test]
    fn method_support_is_case_insensitive() {
        let mut p = parser();
        p.feed_line("get http://x.com/ HTTP/1.1");
        assert!(p.is_supported_method());

        let mut p = parser();
        p.feed_line("BREW http://x.com/ HTTP/1.1");
        assert!(!p.is_supported_method());
    }
}
