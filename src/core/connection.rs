/// Transport abstraction and the pooled connection wrapper
///
/// The router never talks to sockets directly. A `Transport` opens sessions
/// to endpoints and a `Session` sends one request at a time. The HTTP
/// implementation lives in `core::http`; tests and the simulated cluster
/// provide their own.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{Endpoint, Request, Response};
use crate::error::RouterResult;

/// Opens sessions to endpoints
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a session, bounded by the transport's own connect timeout.
    /// Failure must be reported as `RouterError::ConnectFailure`.
    async fn connect(&self, endpoint: &Endpoint) -> RouterResult<Box<dyn Session>>;
}

/// One live session bound to a single endpoint
#[async_trait]
pub trait Session: Send {
    /// Send a request and wait for its response. Failures of the session
    /// itself must be reported as `RouterError::Transport`.
    async fn send(&mut self, request: &Request) -> RouterResult<Response>;

    /// Whether the session can still carry requests
    fn is_open(&self) -> bool;

    async fn close(&mut self) {}
}

/// A session owned by one pool slot, with its creation time and TTL
pub struct Connection {
    id: u64,
    endpoint: Endpoint,
    created_at: Instant,
    ttl: Option<Duration>,
    requests: u64,
    session: Box<dyn Session>,
}

impl Connection {
    pub fn new(id: u64, endpoint: Endpoint, ttl: Option<Duration>, session: Box<dyn Session>) -> Self {
        Self {
            id,
            endpoint,
            created_at: Instant::now(),
            ttl,
            requests: 0,
            session,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Number of requests sent over this connection
    pub fn requests(&self) -> u64 {
        self.requests
    }

    pub fn is_expired(&self) -> bool {
        match self.ttl {
            Some(ttl) => self.age() > ttl,
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.session.is_open()
    }

    /// Send over the session and tag the response with this endpoint
    pub async fn send(&mut self, request: &Request) -> RouterResult<Response> {
        self.requests += 1;
        debug!(
            "Connection {} -> {}: {} {}",
            self.id,
            self.endpoint,
            request.method,
            request.full_path()
        );
        let mut response = self.session.send(request).await?;
        response.served_by = Some(self.endpoint.clone());
        Ok(response)
    }

    pub async fn close(mut self) {
        debug!("Closing connection {} to {}", self.id, self.endpoint);
        self.session.close().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("age", &self.age())
            .field("ttl", &self.ttl)
            .field("requests", &self.requests)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct EchoSession {
        open: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Session for EchoSession {
        async fn send(&mut self, request: &Request) -> RouterResult<Response> {
            Ok(Response::new(200).with_body(request.full_path()))
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn close(&mut self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    fn connection(ttl: Option<Duration>) -> (Connection, Arc<AtomicBool>) {
        let open = Arc::new(AtomicBool::new(true));
        let session = Box::new(EchoSession { open: Arc::clone(&open) });
        (
            Connection::new(7, Endpoint::new("127.0.0.1", 8529), ttl, session),
            open,
        )
    }

    #[tokio::test]
    async fn test_send_tags_served_by() {
        let (mut conn, _) = connection(None);
        let response = conn.send(&Request::get("/_api/version")).await.unwrap();

        assert_eq!(response.served_by, Some(Endpoint::new("127.0.0.1", 8529)));
        assert_eq!(&response.body[..], b"/_api/version");
        assert_eq!(conn.requests(), 1);
        assert_eq!(conn.id(), 7);
    }

    #[tokio::test]
    async fn test_expiry_follows_ttl() {
        let (conn, _) = connection(None);
        assert!(!conn.is_expired());

        let (conn, _) = connection(Some(Duration::from_millis(20)));
        assert!(!conn.is_expired());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(conn.is_expired());
    }

    #[tokio::test]
    async fn test_close_closes_session() {
        let (conn, open) = connection(None);
        assert!(conn.is_open());
        conn.close().await;
        assert!(!open.load(Ordering::SeqCst));
    }
}
