// src/http.rs
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Trace,
    Connect,
    #[default]
    Unknown,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"PATCH" => Method::Patch,
            b"HEAD" => Method::Head,
            b"OPTIONS" => Method::Options,
            b"TRACE" => Method::Trace,
            b"CONNECT" => Method::Connect,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the incremental parser currently is within a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseState {
    #[default]
    RequestLine,
    Headers,
    Body,
    /// Terminal until the parser is re-initialised.
    Finish,
}

/// How `application/x-www-form-urlencoded` bodies are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormDecoding {
    /// RFC 3986 percent-decoding, `+` as space.
    #[default]
    Standard,
    /// Byte-compatible with the legacy service: every `%XY` escape is
    /// rewritten in place as `%` followed by two characters `'0' + v / 10`
    /// and `'0' + v % 10`, where `v` is the hex value.
    Legacy,
}

impl FromStr for FormDecoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "standard" => Ok(FormDecoding::Standard),
            "legacy" => Ok(FormDecoding::Legacy),
            other => Err(format!("unknown form decoding `{}`", other)),
        }
    }
}

/// A request as accumulated by the parser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub version: String,
    /// Insertion-ordered; a repeated name replaces the earlier value in place.
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub form: HashMap<String, String>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.form.get(key).map(String::as_str)
    }

    /// True only for `Connection: keep-alive` on HTTP/1.1.
    pub fn is_keep_alive(&self) -> bool {
        self.header("Connection") == Some("keep-alive") && self.version == "1.1"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_round_trip() {
        for m in ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"] {
            assert_eq!(Method::from_bytes(m.as_bytes()).as_str(), m);
        }
        assert_eq!(Method::from_bytes(b"BREW"), Method::Unknown);
    }

    #[test]
    fn headers_replace_in_place() {
        let mut req = Request::default();
        req.set_header("Host", "a");
        req.set_header("Accept", "*/*");
        req.set_header("host", "b");
        assert_eq!(req.headers.len(), 2);
        assert_eq!(req.headers[0], ("Host".to_string(), "b".to_string()));
        assert_eq!(req.header("HOST"), Some("b"));
    }

    #[test]
    fn keep_alive_requires_exact_value_and_version() {
        let mut req = Request {
            version: "1.1".into(),
            ..Default::default()
        };
        assert!(!req.is_keep_alive());
        req.set_header("Connection", "keep-alive");
        assert!(req.is_keep_alive());
        req.version = "1.0".into();
        assert!(!req.is_keep_alive());
        req.version = "1.1".into();
        req.set_header("Connection", "Keep-Alive");
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn form_decoding_from_str() {
        assert_eq!("legacy".parse::<FormDecoding>(), Ok(FormDecoding::Legacy));
        assert_eq!("Standard".parse::<FormDecoding>(), Ok(FormDecoding::Standard));
        assert!("rot13".parse::<FormDecoding>().is_err());
    }
}
