/// Test-cluster orchestration
///
/// The router never calls into this module. Resilience scenarios use an
/// `Orchestrator` to start topologies, kill and restart instances, and
/// wait for leadership to move. `aim` talks to an external instance
/// manager service; `sim` runs everything in-process.
pub mod aim;
pub mod sim;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::core::Endpoint;
use crate::error::{RouterError, RouterResult};

pub use aim::InstanceManagerClient;
pub use sim::SimulatedCluster;

/// Role of a database process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceRole {
    Agent,
    Coordinator,
    DbServer,
    Single,
}

impl fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceRole::Agent => write!(f, "agent"),
            InstanceRole::Coordinator => write!(f, "coordinator"),
            InstanceRole::DbServer => write!(f, "dbserver"),
            InstanceRole::Single => write!(f, "single"),
        }
    }
}

/// One managed database process
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Instance {
    pub name: String,
    pub endpoint: Endpoint,
    pub role: InstanceRole,
}

impl Instance {
    pub fn new<S: Into<String>>(name: S, endpoint: Endpoint, role: InstanceRole) -> Self {
        Self {
            name: name.into(),
            endpoint,
            role,
        }
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} at {})", self.name, self.role, self.endpoint)
    }
}

/// Opaque server identity of a replication leader
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaderId(pub String);

impl fmt::Display for LeaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Process counts for a cluster deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterTopology {
    pub agents: usize,
    pub coordinators: usize,
    pub db_servers: usize,
}

impl ClusterTopology {
    pub fn new(agents: usize, coordinators: usize, db_servers: usize) -> Result<Self, String> {
        if agents == 0 {
            return Err("a cluster needs at least one agent".to_string());
        }
        if coordinators == 0 {
            return Err("a cluster needs at least one coordinator".to_string());
        }
        if db_servers == 0 {
            return Err("a cluster needs at least one DB server".to_string());
        }
        Ok(Self {
            agents,
            coordinators,
            db_servers,
        })
    }
}

impl Default for ClusterTopology {
    fn default() -> Self {
        Self {
            agents: 1,
            coordinators: 3,
            db_servers: 2,
        }
    }
}

/// Starts, stops and inspects database processes for resilience scenarios
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Start a cluster; returns the endpoint of one coordinator
    async fn start_cluster(&self, topology: ClusterTopology) -> RouterResult<Endpoint>;

    async fn start_agency(&self) -> RouterResult<()>;

    /// Start `count` single servers in an active-failover group
    async fn start_single_servers(&self, count: usize) -> RouterResult<Vec<Instance>>;

    async fn coordinators(&self) -> RouterResult<Vec<Instance>>;

    async fn single_servers(&self) -> RouterResult<Vec<Instance>>;

    async fn is_running(&self, instance: &Instance) -> RouterResult<bool>;

    /// Stop an instance, gracefully or with `kill`
    async fn stop(&self, instance: &Instance, kill: bool) -> RouterResult<()>;

    async fn restart(&self, instance: &Instance) -> RouterResult<()>;

    async fn current_leader(&self) -> RouterResult<Instance>;

    async fn current_leader_id(&self) -> RouterResult<LeaderId>;

    /// Wait until a leader whose id differs from `exclude` is elected
    async fn await_leader_change(&self, exclude: &LeaderId, timeout: Duration) -> RouterResult<LeaderId>;

    /// Wait until every started instance reports running
    async fn wait_for_all_instances(&self, timeout: Duration) -> RouterResult<()>;

    /// Tear down everything that was started
    async fn cleanup(&self) -> RouterResult<()>;

    /// Every instance this orchestrator knows about
    async fn instances(&self) -> RouterResult<Vec<Instance>>;

    async fn instance_at(&self, endpoint: &Endpoint) -> RouterResult<Instance> {
        self.instances()
            .await?
            .into_iter()
            .find(|instance| &instance.endpoint == endpoint)
            .ok_or_else(|| RouterError::orchestration(format!("no instance at {}", endpoint)))
    }

    /// Kill whatever runs at `endpoint`
    async fn kill(&self, endpoint: &Endpoint) -> RouterResult<()> {
        let instance = self.instance_at(endpoint).await?;
        self.stop(&instance, true).await
    }

    /// Restart whatever was started at `endpoint`
    async fn restart_endpoint(&self, endpoint: &Endpoint) -> RouterResult<()> {
        let instance = self.instance_at(endpoint).await?;
        self.restart(&instance).await
    }
}
