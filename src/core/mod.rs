/// Core abstractions shared by the pool, router and transports
pub mod connection;
pub mod endpoints;
pub mod http;

use bytes::Bytes;
use fnv::FnvHashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{RouterError, RouterResult};

pub use connection::{Connection, Session, Transport};
pub use endpoints::EndpointSet;

/// Response header naming the endpoint of the current leader
pub const ENDPOINT_HEADER: &str = "x-arango-endpoint";

/// Request header opting a single request into dirty reads
pub const DIRTY_READ_HEADER: &str = "x-arango-allow-dirty-read";

const SCHEMES: &[&str] = &["tcp://", "http://", "ssl://", "https://"];

/// Host and port of one server process
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`, optionally prefixed by `tcp://`, `http://`,
    /// `ssl://` or `https://`. IPv6 hosts must be bracketed.
    pub fn parse(input: &str) -> RouterResult<Self> {
        let trimmed = input.trim();
        let without_scheme = SCHEMES
            .iter()
            .find_map(|scheme| trimmed.strip_prefix(scheme))
            .unwrap_or(trimmed);
        let address = without_scheme.trim_end_matches('/');

        let (host, port) = if let Some(rest) = address.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| RouterError::invalid_endpoint(input, "unterminated IPv6 bracket"))?;
            let port = after
                .strip_prefix(':')
                .ok_or_else(|| RouterError::invalid_endpoint(input, "missing port"))?;
            (host, port)
        } else {
            address
                .rsplit_once(':')
                .ok_or_else(|| RouterError::invalid_endpoint(input, "missing port"))?
        };

        if host.is_empty() {
            return Err(RouterError::invalid_endpoint(input, "empty host"));
        }
        if host.contains(':') && !address.starts_with('[') {
            return Err(RouterError::invalid_endpoint(
                input,
                "IPv6 hosts must be enclosed in brackets",
            ));
        }

        let port: u16 = port
            .parse()
            .map_err(|_| RouterError::invalid_endpoint(input, format!("invalid port '{port}'")))?;
        if port == 0 {
            return Err(RouterError::invalid_endpoint(input, "port must be non-zero"));
        }

        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Value used for the `Host` header and for connecting
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Form used by the server in redirect headers and endpoint lists
    pub fn to_tcp_uri(&self) -> String {
        format!("tcp://{}", self.authority())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

impl FromStr for Endpoint {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}

impl TryFrom<String> for Endpoint {
    type Error = RouterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Endpoint::parse(&value)
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.authority()
    }
}

/// HTTP method of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request the router can send to any endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub database: Option<String>,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl Request {
    pub fn new<P: Into<String>>(method: Method, path: P) -> Self {
        Self {
            method,
            database: None,
            path: path.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get<P: Into<String>>(path: P) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post<P: Into<String>>(path: P) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn put<P: Into<String>>(path: P) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn delete<P: Into<String>>(path: P) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn patch<P: Into<String>>(path: P) -> Self {
        Self::new(Method::Patch, path)
    }

    pub fn with_database<S: Into<String>>(mut self, database: S) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_header<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn with_body<B: Into<Bytes>>(mut self, body: B) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body
    pub fn with_json<T: Serialize>(self, value: &T) -> RouterResult<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|e| RouterError::protocol(format!("failed to encode request body: {e}")))?;
        Ok(self
            .with_header("content-type", "application/json")
            .with_body(body))
    }

    /// Set a header, replacing any previous value with the same name
    pub fn set_header<K: Into<String>, V: Into<String>>(&mut self, name: K, value: V) {
        let name = name.into();
        self.headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Path including the database prefix, as sent on the wire
    pub fn full_path(&self) -> String {
        match &self.database {
            Some(db) => format!("/_db/{}{}", db, self.path),
            None => self.path.clone(),
        }
    }
}

/// A response together with the endpoint that produced it
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub status: u16,
    /// Header metadata, keys lower-cased
    pub meta: FnvHashMap<String, String>,
    pub body: Bytes,
    pub served_by: Option<Endpoint>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_header<K: AsRef<str>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.meta
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body<B: Into<Bytes>>(mut self, body: B) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_json<T: Serialize>(self, value: &T) -> RouterResult<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|e| RouterError::protocol(format!("failed to encode response body: {e}")))?;
        Ok(self.with_header("content-type", "application/json").with_body(body))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.meta
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Raw value of the leader redirect header, if any
    pub fn redirect_header(&self) -> Option<&str> {
        self.header(ENDPOINT_HEADER)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> RouterResult<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| RouterError::protocol(format!("failed to decode response body: {e}")))
    }
}

/// Per-request routing options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Accept a possibly stale answer from whichever node serves the request
    pub dirty_read: bool,
    /// Deadline for the whole call, including retry and redirect hop
    pub timeout: Option<Duration>,
    /// Send to exactly this endpoint. Pinned requests are never retried
    /// elsewhere and never follow a redirect, so server-local state such as
    /// an open cursor stays reachable.
    pub pin: Option<Endpoint>,
}

impl RequestOptions {
    pub fn dirty_read() -> Self {
        Self {
            dirty_read: true,
            ..Self::default()
        }
    }

    pub fn pinned_to(endpoint: Endpoint) -> Self {
        Self {
            pin: Some(endpoint),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
