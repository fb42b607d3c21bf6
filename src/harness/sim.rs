/// In-process simulated cluster
///
/// `SimulatedCluster` is both a `Transport` and an `Orchestrator`: routers
/// built on it "connect" to simulated processes, and scenarios kill and
/// restart those processes through the orchestrator side. Sessions break
/// when their process stops or restarts, exactly like a TCP connection to a
/// dead server would.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use super::{ClusterTopology, Instance, InstanceRole, LeaderId, Orchestrator};
use crate::core::{
    Endpoint, Method, Request, Response, Session, Transport, DIRTY_READ_HEADER, ENDPOINT_HEADER,
};
use crate::error::{RouterError, RouterResult};
use crate::utils::generate_id;

const BASE_PORT: u16 = 8529;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replication {
    Leader,
    Follower,
}

#[derive(Debug, Clone)]
struct SimServer {
    instance: Instance,
    server_id: String,
    running: bool,
    /// Bumped on every stop and restart; sessions from an older generation are dead
    generation: u64,
    replication: Option<Replication>,
    /// Open query cursors; only this process can continue them
    cursors: HashMap<String, SimCursor>,
}

#[derive(Debug, Clone)]
struct SimCursor {
    remaining: VecDeque<Value>,
    batch_size: usize,
}

impl SimCursor {
    /// Next batch plus whether more remain
    fn next_batch(&mut self) -> (Vec<Value>, bool) {
        let take = self.batch_size.min(self.remaining.len());
        let batch = self.remaining.drain(..take).collect();
        (batch, !self.remaining.is_empty())
    }
}

#[derive(Debug, Default)]
struct SimState {
    servers: Vec<SimServer>,
    next_port: u16,
    next_cursor: u64,
    next_name: HashMap<InstanceRole, usize>,
    connections_opened: u64,
    requests: HashMap<Endpoint, u64>,
}

impl SimState {
    fn server(&self, endpoint: &Endpoint) -> Option<&SimServer> {
        self.servers.iter().find(|s| &s.instance.endpoint == endpoint)
    }

    fn server_by_name_mut(&mut self, name: &str) -> Option<&mut SimServer> {
        self.servers.iter_mut().find(|s| s.instance.name == name)
    }

    fn leader(&self) -> Option<&SimServer> {
        self.servers
            .iter()
            .find(|s| s.running && s.replication == Some(Replication::Leader))
    }

    fn add(&mut self, role: InstanceRole, host: &str) -> Instance {
        if self.next_port == 0 {
            self.next_port = BASE_PORT;
        }
        let port = self.next_port;
        self.next_port += 1;

        let counter = self.next_name.entry(role).or_insert(0);
        *counter += 1;
        let name = format!("{}-{}", role, counter);

        let prefix = match role {
            InstanceRole::Agent => "AGNT",
            InstanceRole::Coordinator => "CRDN",
            InstanceRole::DbServer => "PRMR",
            InstanceRole::Single => "SNGL",
        };

        let instance = Instance::new(name, Endpoint::new(host, port), role);
        self.servers.push(SimServer {
            instance: instance.clone(),
            server_id: generate_id(prefix),
            running: true,
            generation: 0,
            replication: None,
            cursors: HashMap::new(),
        });
        instance
    }

    /// Make the first running follower the leader if nobody leads
    fn elect(&mut self) -> Option<String> {
        if let Some(leader) = self.leader() {
            return Some(leader.server_id.clone());
        }
        let candidate = self
            .servers
            .iter_mut()
            .find(|s| s.running && s.replication == Some(Replication::Follower))?;
        candidate.replication = Some(Replication::Leader);
        info!(
            "Simulated failover: {} is the new leader",
            candidate.instance.name
        );
        Some(candidate.server_id.clone())
    }
}

struct SimInner {
    state: Mutex<SimState>,
    host: String,
    leader_tx: watch::Sender<Option<LeaderId>>,
    changes_tx: watch::Sender<u64>,
}

impl SimInner {
    fn state(&self) -> MutexGuard<'_, SimState> {
        // A panic while holding the lock cannot leave the state half-written
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, leader: Option<String>) {
        self.leader_tx.send_replace(leader.map(LeaderId));
        self.changes_tx.send_modify(|n| *n += 1);
    }
}

/// Simulated database processes reachable through the `Transport` trait
#[derive(Clone)]
pub struct SimulatedCluster {
    inner: Arc<SimInner>,
}

impl SimulatedCluster {
    pub fn new() -> Self {
        Self::with_host("127.0.0.1")
    }

    /// Simulated processes get endpoints on `host`
    pub fn with_host<S: Into<String>>(host: S) -> Self {
        let (leader_tx, _) = watch::channel(None);
        let (changes_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(SimInner {
                state: Mutex::new(SimState::default()),
                host: host.into(),
                leader_tx,
                changes_tx,
            }),
        }
    }

    /// Sessions opened so far
    pub fn connections_opened(&self) -> u64 {
        self.inner.state().connections_opened
    }

    /// Requests served by the process at `endpoint`
    pub fn requests_served(&self, endpoint: &Endpoint) -> u64 {
        self.inner.state().requests.get(endpoint).copied().unwrap_or(0)
    }

    /// Server id of the process at `endpoint`
    pub fn server_id(&self, endpoint: &Endpoint) -> Option<String> {
        self.inner.state().server(endpoint).map(|s| s.server_id.clone())
    }

    fn instances_with(&self, role: InstanceRole) -> Vec<Instance> {
        self.inner
            .state()
            .servers
            .iter()
            .filter(|s| s.instance.role == role)
            .map(|s| s.instance.clone())
            .collect()
    }

    /// Ready once something was started and nothing is down
    fn all_running(&self) -> bool {
        let state = self.inner.state();
        !state.servers.is_empty() && state.servers.iter().all(|s| s.running)
    }
}

impl Default for SimulatedCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn route(server: &SimServer, state: &SimState, request: &Request) -> Response {
    let path = match &request.database {
        Some(_) => request.path.as_str(),
        None => strip_database(&request.path),
    };

    let body = match path {
        "/_api/version" => json!({
            "server": "arango",
            "version": "simulated",
            "license": "community",
        }),
        "/_admin/status" => json!({
            "serverInfo": {
                "serverId": server.server_id,
                "role": server.instance.role.to_string(),
            },
        }),
        "/_api/replication/server-id" => json!({ "serverId": server.server_id }),
        "/_api/cluster/endpoints" => {
            let role = if server.instance.role == InstanceRole::Coordinator {
                InstanceRole::Coordinator
            } else {
                InstanceRole::Single
            };
            let endpoints: Vec<_> = state
                .servers
                .iter()
                .filter(|s| s.running && s.instance.role == role)
                .map(|s| json!({ "endpoint": s.instance.endpoint.to_tcp_uri() }))
                .collect();
            json!({ "error": false, "code": 200, "endpoints": endpoints })
        }
        _ => {
            let body = json!({
                "error": true,
                "code": 404,
                "errorNum": 404,
                "errorMessage": format!("unknown path {}", request.path),
            });
            return Response::new(404).with_body(body.to_string());
        }
    };

    Response::new(200)
        .with_header("content-type", "application/json")
        .with_body(body.to_string())
}

/// Cursor API. Ids are local to the process that created the cursor, so a
/// continuation sent anywhere else fails with "cursor not found".
fn cursor_route(state: &mut SimState, endpoint: &Endpoint, request: &Request) -> Option<Response> {
    let path = match &request.database {
        Some(_) => request.path.as_str(),
        None => strip_database(&request.path),
    };
    let rest = path.strip_prefix("/_api/cursor")?;
    state.next_cursor += 1;
    let cursor_id = state.next_cursor.to_string();
    let server = state
        .servers
        .iter_mut()
        .find(|s| &s.instance.endpoint == endpoint)?;

    let response = match (request.method, rest.strip_prefix('/')) {
        (Method::Post, None) => {
            let Some((values, batch_size)) = request
                .body
                .as_ref()
                .and_then(|body| serde_json::from_slice::<Value>(body).ok())
                .and_then(|body| parse_cursor_request(&body))
            else {
                return Some(error_response(400, 1501, "query parse error"));
            };

            let mut cursor = SimCursor {
                remaining: values.into(),
                batch_size,
            };
            let (result, has_more) = cursor.next_batch();
            let mut body = json!({
                "error": false,
                "code": 201,
                "result": result,
                "hasMore": has_more,
            });
            if has_more {
                body["id"] = json!(cursor_id);
                server.cursors.insert(cursor_id, cursor);
            }
            Response::new(201).with_body(body.to_string())
        }
        (Method::Put, Some(id)) => {
            let Some(cursor) = server.cursors.get_mut(id) else {
                return Some(error_response(404, 1600, "cursor not found"));
            };
            let (result, has_more) = cursor.next_batch();
            if !has_more {
                server.cursors.remove(id);
            }
            let body = json!({
                "error": false,
                "code": 200,
                "result": result,
                "hasMore": has_more,
                "id": id,
            });
            Response::new(200).with_body(body.to_string())
        }
        (Method::Delete, Some(id)) => match server.cursors.remove(id) {
            Some(_) => Response::new(202).with_body(json!({ "error": false, "code": 202, "id": id }).to_string()),
            None => error_response(404, 1600, "cursor not found"),
        },
        _ => error_response(405, 405, "method not supported"),
    };

    Some(response.with_header("content-type", "application/json"))
}

/// Accepts queries of the form `FOR x IN a..b RETURN x`
fn parse_cursor_request(body: &Value) -> Option<(Vec<Value>, usize)> {
    let query = body.get("query")?.as_str()?;
    let range = query.split_whitespace().find(|word| word.contains(".."))?;
    let (from, to) = range.split_once("..")?;
    let (from, to): (i64, i64) = (from.parse().ok()?, to.parse().ok()?);
    let batch_size = body
        .get("batchSize")
        .and_then(Value::as_u64)
        .map_or(1000, |n| n.max(1) as usize);
    Some(((from..=to).map(Value::from).collect(), batch_size))
}

fn error_response(status: u16, error_num: u32, message: &str) -> Response {
    let body = json!({
        "error": true,
        "code": status,
        "errorNum": error_num,
        "errorMessage": message,
    });
    Response::new(status)
        .with_header("content-type", "application/json")
        .with_body(body.to_string())
}

fn strip_database(path: &str) -> &str {
    path.strip_prefix("/_db/")
        .and_then(|rest| rest.find('/').map(|i| &rest[i..]))
        .unwrap_or(path)
}

struct SimSession {
    inner: Arc<SimInner>,
    endpoint: Endpoint,
    generation: u64,
}

#[async_trait]
impl Transport for SimulatedCluster {
    async fn connect(&self, endpoint: &Endpoint) -> RouterResult<Box<dyn Session>> {
        let mut state = self.inner.state();
        let generation = match state.server(endpoint) {
            Some(server) if server.running => server.generation,
            Some(_) => return Err(RouterError::connect_failure(endpoint, "connection refused")),
            None => return Err(RouterError::connect_failure(endpoint, "no such host")),
        };
        state.connections_opened += 1;
        debug!("Simulated connection to {}", endpoint);

        Ok(Box::new(SimSession {
            inner: Arc::clone(&self.inner),
            endpoint: endpoint.clone(),
            generation,
        }))
    }
}

#[async_trait]
impl Session for SimSession {
    async fn send(&mut self, request: &Request) -> RouterResult<Response> {
        let mut state = self.inner.state();
        let server = match state.server(&self.endpoint) {
            Some(server) if server.running && server.generation == self.generation => server.clone(),
            _ => return Err(RouterError::transport(&self.endpoint, "connection reset by peer")),
        };
        *state.requests.entry(self.endpoint.clone()).or_insert(0) += 1;

        let mut response = match cursor_route(&mut state, &self.endpoint, request) {
            Some(response) => response,
            None => route(&server, &state, request),
        };
        let dirty = request.header(DIRTY_READ_HEADER) == Some("true");
        if server.replication == Some(Replication::Follower) && !dirty {
            if let Some(leader) = state.leader() {
                response = response.with_header(ENDPOINT_HEADER, leader.instance.endpoint.to_tcp_uri());
            }
        }
        Ok(response)
    }

    fn is_open(&self) -> bool {
        matches!(
            self.inner.state().server(&self.endpoint),
            Some(server) if server.running && server.generation == self.generation
        )
    }
}

#[async_trait]
impl Orchestrator for SimulatedCluster {
    async fn start_cluster(&self, topology: ClusterTopology) -> RouterResult<Endpoint> {
        let first = {
            let mut state = self.inner.state();
            let host = self.inner.host.clone();
            for _ in 0..topology.agents {
                state.add(InstanceRole::Agent, &host);
            }
            let coordinators: Vec<Instance> = (0..topology.coordinators)
                .map(|_| state.add(InstanceRole::Coordinator, &host))
                .collect();
            for _ in 0..topology.db_servers {
                state.add(InstanceRole::DbServer, &host);
            }
            coordinators.into_iter().next()
        };
        self.inner.changes_tx.send_modify(|n| *n += 1);

        first
            .map(|instance| instance.endpoint)
            .ok_or_else(|| RouterError::orchestration("topology has no coordinators"))
    }

    async fn start_agency(&self) -> RouterResult<()> {
        let host = self.inner.host.clone();
        self.inner.state().add(InstanceRole::Agent, &host);
        self.inner.changes_tx.send_modify(|n| *n += 1);
        Ok(())
    }

    async fn start_single_servers(&self, count: usize) -> RouterResult<Vec<Instance>> {
        let (started, leader) = {
            let mut state = self.inner.state();
            let host = self.inner.host.clone();
            let mut started = Vec::with_capacity(count);
            for _ in 0..count {
                let instance = state.add(InstanceRole::Single, &host);
                if let Some(server) = state.server_by_name_mut(&instance.name) {
                    server.replication = Some(Replication::Follower);
                }
                started.push(instance);
            }
            (started, state.elect())
        };
        self.inner.publish(leader);
        Ok(started)
    }

    async fn coordinators(&self) -> RouterResult<Vec<Instance>> {
        Ok(self.instances_with(InstanceRole::Coordinator))
    }

    async fn single_servers(&self) -> RouterResult<Vec<Instance>> {
        Ok(self.instances_with(InstanceRole::Single))
    }

    async fn is_running(&self, instance: &Instance) -> RouterResult<bool> {
        self.inner
            .state()
            .server(&instance.endpoint)
            .map(|s| s.running)
            .ok_or_else(|| RouterError::orchestration(format!("unknown instance {}", instance.name)))
    }

    async fn stop(&self, instance: &Instance, kill: bool) -> RouterResult<()> {
        let leader = {
            let mut state = self.inner.state();
            let server = state
                .server_by_name_mut(&instance.name)
                .ok_or_else(|| RouterError::orchestration(format!("unknown instance {}", instance.name)))?;
            server.running = false;
            server.generation += 1;
            server.cursors.clear();
            if server.replication == Some(Replication::Leader) {
                server.replication = Some(Replication::Follower);
            }
            info!("Simulated {} of {}", if kill { "kill" } else { "shutdown" }, instance);
            state.elect()
        };
        self.inner.publish(leader);
        Ok(())
    }

    async fn restart(&self, instance: &Instance) -> RouterResult<()> {
        let leader = {
            let mut state = self.inner.state();
            let server = state
                .server_by_name_mut(&instance.name)
                .ok_or_else(|| RouterError::orchestration(format!("unknown instance {}", instance.name)))?;
            server.running = true;
            server.generation += 1;
            server.cursors.clear();
            info!("Simulated restart of {}", instance);
            state.elect()
        };
        self.inner.publish(leader);
        Ok(())
    }

    async fn current_leader(&self) -> RouterResult<Instance> {
        self.inner
            .state()
            .leader()
            .map(|s| s.instance.clone())
            .ok_or_else(|| RouterError::orchestration("no replication leader"))
    }

    async fn current_leader_id(&self) -> RouterResult<LeaderId> {
        self.inner
            .state()
            .leader()
            .map(|s| LeaderId(s.server_id.clone()))
            .ok_or_else(|| RouterError::orchestration("no replication leader"))
    }

    async fn await_leader_change(&self, exclude: &LeaderId, timeout: Duration) -> RouterResult<LeaderId> {
        let mut rx = self.inner.leader_tx.subscribe();
        let wait = async {
            rx.wait_for(|leader| matches!(leader, Some(id) if id != exclude))
                .await
                .map(|leader| (*leader).clone())
        };

        let outcome = tokio::time::timeout(timeout, wait).await;
        match outcome {
            Ok(Ok(leader)) => {
                leader.ok_or_else(|| RouterError::internal("leader wait woke without a leader"))
            }
            Ok(Err(_)) => Err(RouterError::internal("leader channel closed")),
            Err(_) => Err(RouterError::timeout(
                format!("leader change away from {}", exclude),
                timeout,
            )),
        }
    }

    async fn wait_for_all_instances(&self, timeout: Duration) -> RouterResult<()> {
        let mut rx = self.inner.changes_tx.subscribe();
        let wait = async { rx.wait_for(|_| self.all_running()).await.map(|_| ()) };

        let outcome = tokio::time::timeout(timeout, wait).await;
        match outcome {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(RouterError::internal("change channel closed")),
            Err(_) => Err(RouterError::timeout("waiting for all instances", timeout)),
        }
    }

    async fn cleanup(&self) -> RouterResult<()> {
        {
            let mut state = self.inner.state();
            state.servers.clear();
            state.requests.clear();
        }
        self.inner.publish(None);
        Ok(())
    }

    async fn instances(&self) -> RouterResult<Vec<Instance>> {
        Ok(self
            .inner
            .state()
            .servers
            .iter()
            .map(|s| s.instance.clone())
            .collect())
    }
}
