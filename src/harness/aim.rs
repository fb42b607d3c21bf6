/// Client for the external instance manager service
///
/// The service starts and stops database processes on request and speaks
/// JSON over HTTP. Its default address is `127.0.0.1:9000`, overridable
/// through the `AIM_ENDPOINT` environment variable.

use async_trait::async_trait;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{ClusterTopology, Instance, InstanceRole, LeaderId, Orchestrator};
use crate::core::http::HttpTransport;
use crate::core::{Endpoint, EndpointSet, Request, Response};
use crate::error::{RouterError, RouterResult};
use crate::pool::PoolConfig;
use crate::router::{RequestRouter, RouterSettings};
use crate::routing::{PolicyKind, RoutingPolicy};

pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:9000";
pub const ENDPOINT_ENV: &str = "AIM_ENDPOINT";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartClusterBody {
    num_agents: usize,
    num_coordinators: usize,
    // Key spelled the way the service expects it
    #[serde(rename = "numDbServeres")]
    num_db_servers: usize,
}

#[derive(Debug, Serialize)]
struct StartSingleBody {
    num: usize,
}

#[derive(Debug, Deserialize)]
struct EndpointReply {
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct InstanceEntry {
    name: String,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct StatusReply {
    status: String,
}

#[derive(Debug, Deserialize)]
struct LeaderReply {
    name: String,
    endpoint: String,
    #[serde(rename = "serverId")]
    server_id: String,
}

pub struct InstanceManagerClient {
    router: RequestRouter,
    poll_interval: Duration,
}

impl InstanceManagerClient {
    pub fn new(endpoint: Endpoint) -> RouterResult<Self> {
        let endpoints = Arc::new(EndpointSet::new(vec![endpoint])?);
        let pool = PoolConfig::new(1, None).map_err(RouterError::internal)?;
        // Cluster startup can take minutes
        let transport = HttpTransport::new(Duration::from_secs(5), Duration::from_secs(300));

        Ok(Self {
            router: RequestRouter::new(
                endpoints,
                Arc::new(transport),
                RoutingPolicy::new(PolicyKind::FixedList),
                pool,
                RouterSettings::default(),
            ),
            poll_interval: Duration::from_millis(500),
        })
    }

    /// Client for `AIM_ENDPOINT`, or the default address
    pub fn from_env() -> RouterResult<Self> {
        let address = std::env::var(ENDPOINT_ENV).unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
        Self::new(Endpoint::parse(&address)?)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn endpoint(&self) -> Endpoint {
        self.router.endpoints().get(0)
    }

    async fn call(&self, request: Request) -> RouterResult<Response> {
        let description = format!("{} {}", request.method, request.path);
        let response = self.router.execute(request).await?;
        if !response.is_success() {
            return Err(RouterError::orchestration(format!(
                "{} returned status {}: {}",
                description,
                response.status,
                String::from_utf8_lossy(&response.body)
            )));
        }
        debug!("Instance manager {} -> {}", description, response.status);
        Ok(response)
    }

    async fn call_json<T: DeserializeOwned>(&self, request: Request) -> RouterResult<T> {
        self.call(request).await?.json()
    }

    /// Instances behind `path`. The service answers 404 while that kind of
    /// deployment is not started, which reads as an empty list.
    async fn list(&self, path: &str, role: InstanceRole) -> RouterResult<Vec<Instance>> {
        let response = self.router.execute(Request::get(path)).await?;
        if response.status == 404 {
            debug!("Instance manager GET {} -> 404; nothing started", path);
            return Ok(Vec::new());
        }
        if !response.is_success() {
            return Err(RouterError::orchestration(format!(
                "GET {} returned status {}: {}",
                path,
                response.status,
                String::from_utf8_lossy(&response.body)
            )));
        }
        let entries: Vec<InstanceEntry> = response.json()?;
        entries
            .into_iter()
            .map(|entry| -> RouterResult<Instance> {
                Ok(Instance::new(entry.name, Endpoint::parse(&entry.endpoint)?, role))
            })
            .collect()
    }

    async fn leader_reply(&self) -> RouterResult<LeaderReply> {
        self.call_json(Request::get("/replication/leader")).await
    }

    /// Close the connection to the service
    pub async fn shutdown(&self) {
        self.router.close_all().await;
    }
}

#[async_trait]
impl Orchestrator for InstanceManagerClient {
    async fn start_cluster(&self, topology: ClusterTopology) -> RouterResult<Endpoint> {
        let body = StartClusterBody {
            num_agents: topology.agents,
            num_coordinators: topology.coordinators,
            num_db_servers: topology.db_servers,
        };
        let reply: EndpointReply = self
            .call_json(Request::post("/cluster").with_json(&body)?)
            .await?;
        let endpoint = Endpoint::parse(&reply.endpoint)?;
        info!("Started cluster {:?}, coordinator at {}", topology, endpoint);
        Ok(endpoint)
    }

    async fn start_agency(&self) -> RouterResult<()> {
        self.call(Request::post("/agency")).await?;
        Ok(())
    }

    async fn start_single_servers(&self, count: usize) -> RouterResult<Vec<Instance>> {
        let request = Request::post("/single").with_json(&StartSingleBody { num: count })?;
        let entries: Vec<InstanceEntry> = self.call_json(request).await?;
        entries
            .into_iter()
            .map(|entry| -> RouterResult<Instance> {
                Ok(Instance::new(
                    entry.name,
                    Endpoint::parse(&entry.endpoint)?,
                    InstanceRole::Single,
                ))
            })
            .collect()
    }

    async fn coordinators(&self) -> RouterResult<Vec<Instance>> {
        self.list("/cluster/coordinators", InstanceRole::Coordinator).await
    }

    async fn single_servers(&self) -> RouterResult<Vec<Instance>> {
        self.list("/single", InstanceRole::Single).await
    }

    async fn is_running(&self, instance: &Instance) -> RouterResult<bool> {
        let reply: StatusReply = self
            .call_json(Request::get(format!("/instance/{}", instance.name)))
            .await?;
        Ok(reply.status == "RUNNING")
    }

    async fn stop(&self, instance: &Instance, kill: bool) -> RouterResult<()> {
        let path = if kill {
            format!("/instance/{}?kill=true", instance.name)
        } else {
            format!("/instance/{}", instance.name)
        };
        self.call(Request::delete(path)).await?;
        info!("Stopped {} (kill: {})", instance, kill);
        Ok(())
    }

    async fn restart(&self, instance: &Instance) -> RouterResult<()> {
        self.call(Request::patch(format!("/instance/{}", instance.name)))
            .await?;
        info!("Restarted {}", instance);
        Ok(())
    }

    async fn current_leader(&self) -> RouterResult<Instance> {
        let reply = self.leader_reply().await?;
        Ok(Instance::new(
            reply.name,
            Endpoint::parse(&reply.endpoint)?,
            InstanceRole::Single,
        ))
    }

    async fn current_leader_id(&self) -> RouterResult<LeaderId> {
        Ok(LeaderId(self.leader_reply().await?.server_id))
    }

    async fn await_leader_change(&self, exclude: &LeaderId, timeout: Duration) -> RouterResult<LeaderId> {
        // The service has no push channel, so poll on a fixed interval
        let poll = async {
            let mut ticker = tokio::time::interval(self.poll_interval);
            loop {
                ticker.tick().await;
                match self.leader_reply().await {
                    Ok(reply) if reply.server_id != exclude.0 => return LeaderId(reply.server_id),
                    Ok(_) => debug!("Leader is still {}", exclude),
                    Err(e) => debug!("Leader lookup failed while waiting: {}", e),
                }
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| RouterError::timeout(format!("leader change away from {}", exclude), timeout))
    }

    async fn wait_for_all_instances(&self, timeout: Duration) -> RouterResult<()> {
        let poll = async {
            let mut ticker = tokio::time::interval(self.poll_interval);
            loop {
                ticker.tick().await;
                let instances = self.instances().await?;
                if instances.is_empty() {
                    debug!("No instances started yet");
                    continue;
                }
                let checks = join_all(instances.iter().map(|i| self.is_running(i))).await;
                if checks.into_iter().all(|running| matches!(running, Ok(true))) {
                    return Ok::<(), RouterError>(());
                }
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| RouterError::timeout("waiting for all instances", timeout))?
    }

    async fn cleanup(&self) -> RouterResult<()> {
        self.call(Request::delete("/")).await?;
        info!("Instance manager cleaned up");
        Ok(())
    }

    async fn instances(&self) -> RouterResult<Vec<Instance>> {
        let mut instances = self.coordinators().await?;
        instances.extend(self.single_servers().await?);
        Ok(instances)
    }
}
