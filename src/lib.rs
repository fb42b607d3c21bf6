/// Failover Router - client-side request routing for replicated database deployments
///
/// A `Client` holds a set of server endpoints, a bounded pool of connections
/// to them and a view of which endpoint currently leads. It supports two
/// deployment shapes:
/// 1. Clusters of interchangeable coordinators, balanced round-robin with
///    per-connection affinity
/// 2. Leader/follower pairs, where followers redirect writes to the leader
///    and the client fails over when the leader goes away
pub mod config;
pub mod core;
pub mod discovery;
pub mod error;
pub mod failover;
pub mod harness;
pub mod pool;
pub mod router;
pub mod routing;
pub mod utils;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use crate::config::{Config, ConfigError};
pub use crate::core::http::HttpTransport;
pub use crate::core::{
    Endpoint, EndpointSet, Method, Request, RequestOptions, Response, Session, Transport,
};
pub use crate::error::{ErrorSeverity, RouterError, RouterResult};
pub use crate::failover::{LeaderBelief, LeaderState};
pub use crate::pool::{PoolConfig, PoolStatistics};
pub use crate::router::{RequestRouter, RouterSettings, RouterStatistics};
pub use crate::routing::{PolicyKind, RoutingPolicy};

use crate::config::MAX_BOUND;
use crate::discovery::HostListDiscovery;
use crate::utils::format_duration;

/// Builder for a `Client`
#[derive(Clone)]
pub struct ClientBuilder {
    hosts: Vec<Endpoint>,
    policy: PolicyKind,
    randomize_start: bool,
    max_connections: usize,
    connection_ttl: Option<Duration>,
    acquire_host_list: bool,
    acquire_host_list_interval: Duration,
    connect_timeout: Duration,
    request_timeout: Duration,
    settings: RouterSettings,
    transport: Option<Arc<dyn Transport>>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            policy: PolicyKind::default(),
            randomize_start: false,
            max_connections: 1,
            connection_ttl: None,
            acquire_host_list: false,
            acquire_host_list_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            settings: RouterSettings::default(),
            transport: None,
        }
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder preloaded from a validated configuration file
    pub fn from_config(config: &Config) -> RouterResult<Self> {
        config.validate()?;
        Ok(Self {
            hosts: config.endpoints()?,
            policy: config.routing.policy,
            randomize_start: config.routing.randomize_start,
            max_connections: config.pool.max_connections,
            connection_ttl: config.pool.connection_ttl(),
            acquire_host_list: config.client.acquire_host_list,
            acquire_host_list_interval: Duration::from_secs(
                config.client.acquire_host_list_interval_sec,
            ),
            connect_timeout: config.pool.connect_timeout(),
            request_timeout: config.pool.request_timeout(),
            settings: RouterSettings {
                max_connect_retries: config.failover.max_connect_retries,
                max_redirects: config.failover.max_redirects,
                default_timeout: None,
            },
            transport: None,
        })
    }

    /// Add an endpoint given as `host:port`
    pub fn host<S: Into<String>>(mut self, host: S, port: u16) -> Self {
        self.hosts.push(Endpoint::new(host, port));
        self
    }

    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.hosts.push(endpoint);
        self
    }

    pub fn hosts<I: IntoIterator<Item = Endpoint>>(mut self, hosts: I) -> Self {
        self.hosts.extend(hosts);
        self
    }

    pub fn load_balancing(mut self, policy: PolicyKind) -> Self {
        self.policy = policy;
        self
    }

    pub fn randomize_start(mut self, enabled: bool) -> Self {
        self.randomize_start = enabled;
        self
    }

    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn connection_ttl(mut self, ttl: Duration) -> Self {
        self.connection_ttl = Some(ttl);
        self
    }

    pub fn acquire_host_list(mut self, enabled: bool) -> Self {
        self.acquire_host_list = enabled;
        self
    }

    pub fn acquire_host_list_interval(mut self, interval: Duration) -> Self {
        self.acquire_host_list_interval = interval;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn settings(mut self, settings: RouterSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Use a custom transport instead of HTTP over TCP
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    fn validate(&self) -> RouterResult<()> {
        let invalid = |message: String| RouterError::Config(ConfigError::ValidationError(message));

        if self.settings.max_connect_retries > MAX_BOUND {
            return Err(invalid(format!("max_connect_retries must be at most {}", MAX_BOUND)));
        }
        if self.settings.max_redirects > MAX_BOUND {
            return Err(invalid(format!("max_redirects must be at most {}", MAX_BOUND)));
        }
        if self.acquire_host_list_interval.is_zero() {
            return Err(invalid("acquire_host_list_interval must be greater than 0".to_string()));
        }
        if self.connect_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(invalid("timeouts must be greater than 0".to_string()));
        }
        Ok(())
    }

    /// Build the client. With host-list acquisition on, the initial list is
    /// fetched here and refreshed in the background afterwards.
    pub async fn build(self) -> RouterResult<Client> {
        self.validate()?;

        let endpoints = Arc::new(EndpointSet::new(self.hosts)?);
        let pool_config = PoolConfig::new(self.max_connections, self.connection_ttl)
            .map_err(|e| RouterError::Config(ConfigError::ValidationError(e)))?;
        let policy = if self.randomize_start {
            RoutingPolicy::randomized(self.policy, endpoints.size())
        } else {
            RoutingPolicy::new(self.policy)
        };
        let transport = self.transport.unwrap_or_else(|| {
            Arc::new(HttpTransport::new(self.connect_timeout, self.request_timeout))
        });

        let router = Arc::new(RequestRouter::new(
            endpoints,
            transport,
            policy,
            pool_config,
            self.settings,
        ));

        let discovery = if self.acquire_host_list {
            match router.acquire_host_list().await {
                Ok(changed) => info!(
                    "Acquired host list ({} endpoints, changed: {})",
                    router.endpoints().size(),
                    changed
                ),
                Err(e) => warn!("Initial host list acquisition failed, using configured hosts: {}", e),
            }
            info!(
                "Refreshing host list every {}",
                format_duration(self.acquire_host_list_interval)
            );
            let discovery =
                HostListDiscovery::cluster(self.acquire_host_list_interval, self.request_timeout);
            Some(discovery.spawn(Arc::clone(&router)))
        } else {
            None
        };

        info!(
            "Client ready: {} endpoints, {} policy, {} connections",
            router.endpoints().size(),
            router.policy_kind(),
            self.max_connections
        );

        Ok(Client { router, discovery })
    }
}

/// Routing client over a replicated deployment
pub struct Client {
    router: Arc<RequestRouter>,
    discovery: Option<JoinHandle<()>>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub async fn execute(&self, request: Request) -> RouterResult<Response> {
        self.router.execute(request).await
    }

    pub async fn execute_with(
        &self,
        request: Request,
        options: RequestOptions,
    ) -> RouterResult<Response> {
        self.router.execute_with(request, options).await
    }

    pub fn router(&self) -> &Arc<RequestRouter> {
        &self.router
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.router.endpoints().snapshot().to_vec()
    }

    /// Currently believed leader
    pub fn leader(&self) -> Option<Endpoint> {
        self.router.failover().leader()
    }

    /// Refetch the host list now
    pub async fn acquire_host_list(&self) -> RouterResult<bool> {
        self.router.acquire_host_list().await
    }

    /// Close every pooled connection; later calls reconnect
    pub async fn shutdown(&self) -> usize {
        self.router.close_all().await
    }

    pub fn statistics(&self) -> RouterStatistics {
        self.router.statistics()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(handle) = self.discovery.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("router", &self.router)
            .field("discovery", &self.discovery.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{ClusterTopology, Orchestrator, SimulatedCluster};

    #[tokio::test]
    async fn test_build_requires_hosts() {
        let err = Client::builder().build().await.unwrap_err();
        assert!(matches!(err, RouterError::EmptySet));
    }

    #[tokio::test]
    async fn test_build_rejects_bad_bounds() {
        let result = Client::builder()
            .host("127.0.0.1", 8529)
            .settings(RouterSettings {
                max_redirects: 9,
                ..Default::default()
            })
            .build()
            .await;
        assert!(matches!(result, Err(RouterError::Config(_))));

        let result = Client::builder()
            .host("127.0.0.1", 8529)
            .max_connections(0)
            .build()
            .await;
        assert!(matches!(result, Err(RouterError::Config(_))));
    }

    #[tokio::test]
    async fn test_builder_from_config() {
        let mut config = Config::default();
        config.client.hosts = vec!["tcp://127.0.0.1:8529".into(), "127.0.0.1:8530".into()];
        config.routing.policy = PolicyKind::FixedList;
        config.pool.max_connections = 2;

        let client = ClientBuilder::from_config(&config).unwrap().build().await.unwrap();
        assert_eq!(client.endpoints().len(), 2);
        assert_eq!(client.router().policy_kind(), PolicyKind::FixedList);
        assert_eq!(client.statistics().pool.capacity, 2);
        assert!(client.leader().is_none());
    }

    #[tokio::test]
    async fn test_build_acquires_host_list() {
        let sim = SimulatedCluster::new();
        let first = sim.start_cluster(ClusterTopology::default()).await.unwrap();

        let client = Client::builder()
            .endpoint(first)
            .acquire_host_list(true)
            .transport(Arc::new(sim.clone()))
            .build()
            .await
            .unwrap();

        let coordinators: Vec<Endpoint> = sim
            .coordinators()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.endpoint)
            .collect();
        assert_eq!(client.endpoints(), coordinators);
    }

    #[tokio::test]
    async fn test_failed_acquisition_keeps_configured_hosts() {
        let sim = SimulatedCluster::new();
        let client = Client::builder()
            .host("127.0.0.1", 1)
            .acquire_host_list(true)
            .transport(Arc::new(sim))
            .build()
            .await
            .unwrap();

        assert_eq!(client.endpoints(), vec![Endpoint::new("127.0.0.1", 1)]);
    }

    #[tokio::test]
    async fn test_shutdown_keeps_client_usable() {
        let sim = SimulatedCluster::new();
        let first = sim.start_cluster(ClusterTopology::default()).await.unwrap();
        let client = Client::builder()
            .endpoint(first)
            .transport(Arc::new(sim.clone()))
            .build()
            .await
            .unwrap();

        client.execute(Request::get("/_api/version")).await.unwrap();
        assert_eq!(client.shutdown().await, 1);
        client.execute(Request::get("/_api/version")).await.unwrap();
        assert_eq!(sim.connections_opened(), 2);
    }
}
