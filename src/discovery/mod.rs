/// Host-list acquisition and periodic refresh
pub mod cluster;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::core::Endpoint;
use crate::router::RequestRouter;
use crate::error::RouterResult;
use crate::utils::format_duration;

pub use cluster::{parse_endpoint_list, ClusterEndpoints};

/// Outcome of one host-list refresh
#[derive(Debug, Clone, PartialEq)]
pub enum HostListStatus {
    /// Endpoint set replaced; carries the new size
    Updated(usize),
    Unchanged,
    Failed { reason: String },
    Timeout,
}

impl fmt::Display for HostListStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostListStatus::Updated(n) => write!(f, "Updated ({} endpoints)", n),
            HostListStatus::Unchanged => write!(f, "Unchanged"),
            HostListStatus::Failed { reason } => write!(f, "Failed: {}", reason),
            HostListStatus::Timeout => write!(f, "Timeout"),
        }
    }
}

impl HostListStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, HostListStatus::Updated(_) | HostListStatus::Unchanged)
    }
}

/// Source of the authoritative endpoint list
#[async_trait]
pub trait HostListSource: Send + Sync {
    /// Fetch the current endpoint list, using `router` to reach the cluster
    async fn fetch(&self, router: &RequestRouter) -> RouterResult<Vec<Endpoint>>;
}

/// Refreshes a router's endpoint set from a `HostListSource`
pub struct HostListDiscovery {
    source: Box<dyn HostListSource>,
    interval: Duration,
    timeout: Duration,
}

impl HostListDiscovery {
    pub fn new(source: Box<dyn HostListSource>, interval: Duration, timeout: Duration) -> Self {
        Self {
            source,
            interval,
            timeout,
        }
    }

    /// Discovery against the cluster's own endpoint list
    pub fn cluster(interval: Duration, timeout: Duration) -> Self {
        Self::new(Box::new(ClusterEndpoints), interval, timeout)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Fetch once, with timeout, and feed the result to the endpoint set
    pub async fn refresh(&self, router: &RequestRouter) -> HostListStatus {
        let hosts = match timeout(self.timeout, self.source.fetch(router)).await {
            Ok(Ok(hosts)) => hosts,
            Ok(Err(e)) => {
                return HostListStatus::Failed {
                    reason: e.to_string(),
                }
            }
            Err(_) => return HostListStatus::Timeout,
        };

        match router.endpoints().replace(hosts) {
            Ok(true) => HostListStatus::Updated(router.endpoints().size()),
            Ok(false) => HostListStatus::Unchanged,
            Err(e) => HostListStatus::Failed {
                reason: e.to_string(),
            },
        }
    }

    /// Refresh on every interval tick; failures keep the current set
    pub async fn run(self, router: Arc<RequestRouter>) {
        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately; the initial list was
        // acquired at construction.
        interval.tick().await;

        loop {
            interval.tick().await;

            match self.refresh(&router).await {
                HostListStatus::Updated(n) => info!("Host list refreshed: {} endpoints", n),
                HostListStatus::Unchanged => debug!("Host list unchanged"),
                HostListStatus::Failed { reason } => {
                    warn!("Host list refresh failed, keeping current endpoints: {}", reason)
                }
                HostListStatus::Timeout => {
                    warn!("Host list refresh timed out after {}", format_duration(self.timeout))
                }
            }
        }
    }

    pub fn spawn(self, router: Arc<RequestRouter>) -> JoinHandle<()> {
        tokio::spawn(self.run(router))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EndpointSet, Request, Response, Session, Transport};
    use crate::error::RouterError;
    use crate::pool::PoolConfig;
    use crate::router::RouterSettings;
    use crate::routing::{PolicyKind, RoutingPolicy};
    use std::sync::Mutex;

    struct NullTransport;

    struct NullSession;

    #[async_trait]
    impl Transport for NullTransport {
        async fn connect(&self, _endpoint: &Endpoint) -> RouterResult<Box<dyn Session>> {
            Ok(Box::new(NullSession))
        }
    }

    #[async_trait]
    impl Session for NullSession {
        async fn send(&mut self, _request: &Request) -> RouterResult<Response> {
            Ok(Response::new(200))
        }

        fn is_open(&self) -> bool {
            true
        }
    }

    /// Source returning scripted results in order
    struct ScriptedSource {
        results: Mutex<Vec<RouterResult<Vec<Endpoint>>>>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl HostListSource for ScriptedSource {
        async fn fetch(&self, _router: &RequestRouter) -> RouterResult<Vec<Endpoint>> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.results
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(RouterError::protocol("no more scripted results")))
        }
    }

    fn endpoints(ports: &[u16]) -> Vec<Endpoint> {
        ports.iter().map(|p| Endpoint::new("127.0.0.1", *p)).collect()
    }

    fn router(ports: &[u16]) -> Arc<RequestRouter> {
        Arc::new(RequestRouter::new(
            Arc::new(EndpointSet::new(endpoints(ports)).unwrap()),
            Arc::new(NullTransport),
            RoutingPolicy::new(PolicyKind::RoundRobin),
            PoolConfig::default(),
            RouterSettings::default(),
        ))
    }

    fn discovery(results: Vec<RouterResult<Vec<Endpoint>>>, delay: Option<Duration>) -> HostListDiscovery {
        // Popped from the back
        let mut results = results;
        results.reverse();
        HostListDiscovery::new(
            Box::new(ScriptedSource {
                results: Mutex::new(results),
                delay,
            }),
            Duration::from_millis(20),
            Duration::from_millis(50),
        )
    }

    #[test]
    fn test_status_display() {
        assert_eq!(HostListStatus::Updated(3).to_string(), "Updated (3 endpoints)");
        assert_eq!(HostListStatus::Unchanged.to_string(), "Unchanged");
        assert_eq!(
            HostListStatus::Failed { reason: "x".to_string() }.to_string(),
            "Failed: x"
        );
        assert!(HostListStatus::Unchanged.is_success());
        assert!(!HostListStatus::Timeout.is_success());
    }

    #[tokio::test]
    async fn test_refresh_outcomes() {
        let router = router(&[1]);
        let discovery = discovery(
            vec![
                Ok(endpoints(&[1, 2, 3])),
                Ok(endpoints(&[1, 2, 3])),
                Ok(vec![]),
                Err(RouterError::protocol("bad body")),
            ],
            None,
        );

        assert_eq!(discovery.refresh(&router).await, HostListStatus::Updated(3));
        assert_eq!(discovery.refresh(&router).await, HostListStatus::Unchanged);
        // Empty list is rejected and the set survives
        assert!(matches!(discovery.refresh(&router).await, HostListStatus::Failed { .. }));
        assert!(matches!(discovery.refresh(&router).await, HostListStatus::Failed { .. }));
        assert_eq!(router.endpoints().size(), 3);
    }

    #[tokio::test]
    async fn test_refresh_timeout() {
        let router = router(&[1]);
        let discovery = discovery(vec![Ok(endpoints(&[2]))], Some(Duration::from_millis(200)));

        assert_eq!(discovery.refresh(&router).await, HostListStatus::Timeout);
        assert_eq!(*router.endpoints().snapshot(), endpoints(&[1]));
    }

    #[tokio::test]
    async fn test_background_refresh_applies_updates() {
        let router = router(&[1]);
        let handle = discovery(vec![Ok(endpoints(&[4, 5]))], None).spawn(Arc::clone(&router));

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();
        assert_eq!(*router.endpoints().snapshot(), endpoints(&[4, 5]));
    }
}
