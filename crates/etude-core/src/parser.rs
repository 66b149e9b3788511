// src/parser.rs
use crate::auth::CredentialVerifier;
use crate::buffer::{Buffer, BufferError};
use crate::http::{FormDecoding, Method, ParseState, Request};
use memchr::memmem;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

const CRLF: &[u8] = b"\r\n";

pub const MAX_BODY_SIZE: usize = 1 << 20;

/// Limit on the request line plus headers, terminated or not.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Paths that are served with an implicit `.html` suffix.
pub const DEFAULT_PAGES: [&str; 6] = [
    "/index", "/register", "/login", "/welcome", "/video", "/picture",
];

pub const WELCOME_PAGE: &str = "/welcome.html";
pub const ERROR_PAGE: &str = "/error.html";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed request line")]
    MalformedRequestLine,
    #[error("invalid Content-Length header")]
    InvalidContentLength,
    #[error("request body of {0} bytes exceeds the limit")]
    BodyTooLarge(usize),
    #[error("request head exceeds 64 KiB")]
    HeaderTooLarge,
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthPage {
    Register,
    Login,
}

impl AuthPage {
    fn from_path(path: &str) -> Option<Self> {
        match path {
            "/register.html" => Some(AuthPage::Register),
            "/login.html" => Some(AuthPage::Login),
            _ => None,
        }
    }
}

/// Incremental HTTP/1.1 request parser.
///
/// Lines are consumed from the front of a [`Buffer`] as they complete; a
/// partial line stays in the buffer until the next call, so a request may
/// arrive across any number of reads.
#[derive(Debug, Default)]
pub struct RequestParser {
    state: ParseState,
    req: Request,
    decoding: FormDecoding,
    head_bytes: usize,
}

impl RequestParser {
    pub fn new(decoding: FormDecoding) -> Self {
        Self {
            state: ParseState::RequestLine,
            req: Request::default(),
            decoding,
            head_bytes: 0,
        }
    }

    /// Reset for the next request on the same connection.
    pub fn init(&mut self) {
        self.state = ParseState::RequestLine;
        self.req = Request::default();
        self.head_bytes = 0;
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == ParseState::Finish
    }

    pub fn request(&self) -> &Request {
        &self.req
    }

    pub fn is_keep_alive(&self) -> bool {
        self.req.is_keep_alive()
    }

    /// Consume as much of `buf` as forms complete lines.
    ///
    /// `Ok(())` does not mean the request is complete; check
    /// [`is_finished`](Self::is_finished). On error nothing past the
    /// offending line has been consumed.
    pub fn parse(
        &mut self,
        buf: &mut Buffer,
        verifier: &dyn CredentialVerifier,
    ) -> Result<(), ParseError> {
        while buf.readable_bytes() > 0 && self.state != ParseState::Finish {
            if self.state == ParseState::Body {
                if !self.parse_body(buf, verifier)? {
                    break;
                }
                continue;
            }

            let Some(end) = memmem::find(buf.peek(), CRLF) else {
                if self.head_bytes + buf.readable_bytes() > MAX_HEADER_BYTES {
                    return Err(ParseError::HeaderTooLarge);
                }
                break;
            };
            self.head_bytes += end + CRLF.len();
            if self.head_bytes > MAX_HEADER_BYTES {
                return Err(ParseError::HeaderTooLarge);
            }
            let line = String::from_utf8_lossy(&buf.peek()[..end]).into_owned();
            let rest = buf.readable_bytes() - end - CRLF.len();

            match self.state {
                ParseState::RequestLine => self.parse_request_line(&line)?,
                ParseState::Headers => self.parse_header(&line, rest)?,
                ParseState::Body | ParseState::Finish => {}
            }
            buf.retrieve(end + CRLF.len())?;
        }

        if self.state == ParseState::Finish {
            debug!(
                method = %self.req.method,
                path = %self.req.path,
                version = %self.req.version,
                "request parsed"
            );
        }
        Ok(())
    }

    fn parse_request_line(&mut self, line: &str) -> Result<(), ParseError> {
        // tolerate stray CRLF between keep-alive requests
        if line.is_empty() {
            return Ok(());
        }

        let mut parts = line.split(' ');
        let (Some(method), Some(target), Some(protocol), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            warn!(line, "request line error");
            return Err(ParseError::MalformedRequestLine);
        };
        let version = match protocol.strip_prefix("HTTP/") {
            Some(v) if !v.is_empty() && !method.is_empty() && !target.is_empty() => v,
            _ => {
                warn!(line, "request line error");
                return Err(ParseError::MalformedRequestLine);
            }
        };

        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p, Some(q.to_string())),
            None => (target, None),
        };

        self.req.method = Method::from_bytes(method.as_bytes());
        self.req.path = alias_path(path);
        self.req.query = query;
        self.req.version = version.to_string();
        self.state = ParseState::Headers;
        Ok(())
    }

    /// `rest` is what remains in the buffer after this line.
    fn parse_header(&mut self, line: &str, rest: usize) -> Result<(), ParseError> {
        if let Some((name, value)) = line.split_once(':') {
            let value = value.strip_prefix(' ').unwrap_or(value);
            self.req.set_header(name, value);
            return Ok(());
        }

        // anything that is not `name: value` ends the header block
        self.state = match self.content_length()? {
            Some(0) => ParseState::Finish,
            Some(n) if n > MAX_BODY_SIZE => return Err(ParseError::BodyTooLarge(n)),
            Some(_) => ParseState::Body,
            None if rest == 0 || !self.may_carry_body() => ParseState::Finish,
            None => ParseState::Body,
        };
        if self.state == ParseState::Finish {
            self.parse_post_without_body();
        }
        Ok(())
    }

    /// Returns `false` when more bytes are needed.
    fn parse_body(
        &mut self,
        buf: &mut Buffer,
        verifier: &dyn CredentialVerifier,
    ) -> Result<bool, ParseError> {
        let body = match self.content_length()? {
            Some(n) => {
                if buf.readable_bytes() < n {
                    return Ok(false);
                }
                let body = String::from_utf8_lossy(&buf.peek()[..n]).into_owned();
                buf.retrieve(n)?;
                body
            }
            None => match memmem::find(buf.peek(), CRLF) {
                Some(end) => {
                    let body = String::from_utf8_lossy(&buf.peek()[..end]).into_owned();
                    buf.retrieve(end + CRLF.len())?;
                    body
                }
                None => buf.retrieve_all_as_string(),
            },
        };

        debug!(len = body.len(), "body parsed");
        self.req.body = body;
        self.parse_post(verifier);
        self.state = ParseState::Finish;
        Ok(true)
    }

    fn parse_post(&mut self, verifier: &dyn CredentialVerifier) {
        if self.req.method != Method::Post
            || self.req.header("Content-Type") != Some(FORM_CONTENT_TYPE)
        {
            return;
        }

        self.req.form = decode_form(&self.req.body, self.decoding);

        if let Some(page) = AuthPage::from_path(&self.req.path) {
            let username = self.req.form_value("username").unwrap_or_default();
            let password = self.req.form_value("password").unwrap_or_default();
            let is_login = page == AuthPage::Login;
            debug!(username, is_login, "verifying credentials");
            let verified = verifier.verify(username, password, is_login);
            self.req.path = if verified { WELCOME_PAGE } else { ERROR_PAGE }.to_string();
        }
    }

    /// A form POST whose body is empty still resolves the auth pages.
    fn parse_post_without_body(&mut self) {
        if self.req.method == Method::Post
            && AuthPage::from_path(&self.req.path).is_some()
            && self.req.header("Content-Type") == Some(FORM_CONTENT_TYPE)
        {
            self.req.path = ERROR_PAGE.to_string();
        }
    }

    fn may_carry_body(&self) -> bool {
        matches!(self.req.method, Method::Post | Method::Put | Method::Patch)
    }

    fn content_length(&self) -> Result<Option<usize>, ParseError> {
        self.req
            .header("Content-Length")
            .map(|v| {
                v.trim()
                    .parse::<usize>()
                    .map_err(|_| ParseError::InvalidContentLength)
            })
            .transpose()
    }
}

/// `/` becomes `/index.html`; the default pages gain `.html`.
pub fn alias_path(path: &str) -> String {
    if path == "/" {
        "/index.html".to_string()
    } else if DEFAULT_PAGES.contains(&path) {
        format!("{}.html", path)
    } else {
        path.to_string()
    }
}

/// Decode an urlencoded form body into a field map.
pub fn decode_form(body: &str, decoding: FormDecoding) -> HashMap<String, String> {
    if body.is_empty() {
        return HashMap::new();
    }
    match decoding {
        FormDecoding::Standard => {
            match serde_urlencoded::from_str::<Vec<(String, String)>>(body) {
                Ok(pairs) => pairs.into_iter().collect(),
                Err(e) => {
                    warn!(error = %e, "undecodable form body");
                    HashMap::new()
                }
            }
        }
        FormDecoding::Legacy => decode_form_legacy(body),
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn decode_form_legacy(body: &str) -> HashMap<String, String> {
    let mut bytes = body.as_bytes().to_vec();
    let mut form = HashMap::new();
    let mut key = String::new();
    let n = bytes.len();
    let (mut i, mut j) = (0, 0);

    while i < n {
        match bytes[i] {
            b'=' => {
                key = String::from_utf8_lossy(&bytes[j..i]).into_owned();
                j = i + 1;
            }
            b'+' => bytes[i] = b' ',
            b'%' if i + 2 < n => {
                if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    let v = hi * 16 + lo;
                    bytes[i + 1] = b'0' + v / 10;
                    bytes[i + 2] = b'0' + v % 10;
                }
                i += 2;
            }
            b'&' => {
                let value = String::from_utf8_lossy(&bytes[j..i]).into_owned();
                j = i + 1;
                form.insert(key.clone(), value);
            }
            _ => {}
        }
        i += 1;
    }

    if !form.contains_key(&key) && j < i {
        form.insert(key, String::from_utf8_lossy(&bytes[j..i]).into_owned());
    }
    form
}
