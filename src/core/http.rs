/// HTTP/1.1 transport over plain TCP
///
/// One `HttpSession` wraps one keep-alive connection. The hyper connection
/// driver runs on its own task and is aborted when the session closes.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::connection::{Session, Transport};
use super::{Endpoint, Method, Request, Response};
use crate::error::{RouterError, RouterResult};

/// Result of a TCP connection attempt
#[derive(Debug)]
enum ConnectOutcome {
    Success(TcpStream),
    Timeout,
    ConnectionRefused,
    NetworkError(io::Error),
}

/// Transport opening HTTP/1.1 sessions
#[derive(Debug, Clone)]
pub struct HttpTransport {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    async fn open_stream(&self, endpoint: &Endpoint) -> ConnectOutcome {
        let address = (endpoint.host(), endpoint.port());
        Self::bounded_connect(self.connect_timeout, TcpStream::connect(address)).await
    }

    async fn bounded_connect<F>(limit: Duration, connecting: F) -> ConnectOutcome
    where
        F: Future<Output = io::Result<TcpStream>>,
    {
        match timeout(limit, connecting).await {
            Ok(Ok(stream)) => ConnectOutcome::Success(stream),
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                ConnectOutcome::ConnectionRefused
            }
            Ok(Err(e)) => ConnectOutcome::NetworkError(e),
            Err(_) => ConnectOutcome::Timeout,
        }
    }

    fn configure_stream(stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(true)?;
        socket2::SockRef::from(stream).set_keepalive(true)?;
        Ok(())
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(30))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self, endpoint: &Endpoint) -> RouterResult<Box<dyn Session>> {
        let stream = match self.open_stream(endpoint).await {
            ConnectOutcome::Success(stream) => stream,
            ConnectOutcome::Timeout => {
                return Err(RouterError::connect_failure(
                    endpoint,
                    format!("connect timed out after {:?}", self.connect_timeout),
                ))
            }
            ConnectOutcome::ConnectionRefused => {
                return Err(RouterError::connect_failure(endpoint, "connection refused"))
            }
            ConnectOutcome::NetworkError(e) => {
                return Err(RouterError::connect_failure(endpoint, e.to_string()))
            }
        };

        if let Err(e) = Self::configure_stream(&stream) {
            warn!("Failed to configure stream to {}: {}", endpoint, e);
        }

        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| RouterError::connect_failure(endpoint, format!("handshake failed: {e}")))?;

        let driver_endpoint = endpoint.clone();
        let driver = tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("HTTP connection to {} ended: {}", driver_endpoint, e);
            }
        });

        debug!("Opened HTTP session to {}", endpoint);
        Ok(Box::new(HttpSession {
            endpoint: endpoint.clone(),
            sender,
            driver,
            request_timeout: self.request_timeout,
        }))
    }
}

/// One keep-alive HTTP/1.1 connection
pub struct HttpSession {
    endpoint: Endpoint,
    sender: SendRequest<Full<Bytes>>,
    driver: JoinHandle<()>,
    request_timeout: Duration,
}

impl HttpSession {
    fn build_request(&self, request: &Request) -> RouterResult<hyper::Request<Full<Bytes>>> {
        let method = match request.method {
            Method::Get => hyper::Method::GET,
            Method::Post => hyper::Method::POST,
            Method::Put => hyper::Method::PUT,
            Method::Patch => hyper::Method::PATCH,
            Method::Delete => hyper::Method::DELETE,
            Method::Head => hyper::Method::HEAD,
        };

        let mut builder = hyper::Request::builder()
            .method(method)
            .uri(request.full_path())
            .header(hyper::header::HOST, self.endpoint.authority());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let body = request.body.clone().unwrap_or_default();
        builder
            .body(Full::new(body))
            .map_err(|e| RouterError::protocol(format!("invalid request: {e}")))
    }

    async fn round_trip(&mut self, request: hyper::Request<Full<Bytes>>) -> RouterResult<Response> {
        self.sender
            .ready()
            .await
            .map_err(|e| RouterError::transport(&self.endpoint, e.to_string()))?;

        let response = self
            .sender
            .send_request(request)
            .await
            .map_err(|e| RouterError::transport(&self.endpoint, e.to_string()))?;

        let status = response.status().as_u16();
        let mut converted = Response::new(status);
        for (name, value) in response.headers() {
            match value.to_str() {
                Ok(value) => converted = converted.with_header(name.as_str(), value),
                Err(_) => debug!("Skipping non-ASCII header {} from {}", name, self.endpoint),
            }
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| RouterError::transport(&self.endpoint, format!("reading body: {e}")))?
            .to_bytes();
        Ok(converted.with_body(body))
    }
}

#[async_trait]
impl Session for HttpSession {
    async fn send(&mut self, request: &Request) -> RouterResult<Response> {
        let request = self.build_request(request)?;
        let limit = self.request_timeout;
        match timeout(limit, self.round_trip(request)).await {
            Ok(result) => result,
            Err(_) => Err(RouterError::transport(
                &self.endpoint,
                format!("no response within {:?}", limit),
            )),
        }
    }

    fn is_open(&self) -> bool {
        !self.sender.is_closed() && !self.driver.is_finished()
    }

    async fn close(&mut self) {
        self.driver.abort();
    }
}

impl Drop for HttpSession {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
