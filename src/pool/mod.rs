/// Bounded connection pool with per-slot locking
///
/// Each slot holds at most one connection and has its own lock, so requests
/// on different slots never block each other. A slot keeps its connection
/// across requests until it expires, breaks, or is invalidated.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::core::{Connection, Endpoint, EndpointSet, Request, Response, Transport};
use crate::error::{RouterError, RouterResult};
use crate::routing::RoutingPolicy;

/// Pool sizing and expiry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub connection_ttl: Option<Duration>,
}

impl PoolConfig {
    /// Create a validated pool configuration
    pub fn new(max_connections: usize, connection_ttl: Option<Duration>) -> Result<Self, String> {
        if max_connections == 0 {
            return Err("max_connections must be greater than 0".to_string());
        }
        if connection_ttl == Some(Duration::ZERO) {
            return Err("connection_ttl must be greater than 0".to_string());
        }
        Ok(Self {
            max_connections,
            connection_ttl,
        })
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 1,
            connection_ttl: None,
        }
    }
}

/// Where the connection for this acquisition must point
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    /// Any endpoint the routing policy picks, except the excluded ones
    Next {
        exclude: &'a [Endpoint],
        leader: Option<&'a Endpoint>,
    },
    /// Exactly this endpoint (redirect hop)
    Pinned(&'a Endpoint),
}

impl Target<'_> {
    fn accepts(&self, endpoint: &Endpoint) -> bool {
        match self {
            Target::Next { exclude, .. } => !exclude.contains(endpoint),
            Target::Pinned(pinned) => *pinned == endpoint,
        }
    }
}

#[derive(Default)]
struct Slot {
    connection: Option<Connection>,
}

#[derive(Default)]
struct PoolCounters {
    opened: AtomicU64,
    reused: AtomicU64,
    expired: AtomicU64,
    invalidated: AtomicU64,
    closed: AtomicU64,
}

/// Pool statistics snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatistics {
    pub capacity: usize,
    /// Connections currently held by a slot, including those in use
    pub open_connections: usize,
    pub opened: u64,
    pub reused: u64,
    pub expired: u64,
    pub invalidated: u64,
    pub closed: u64,
}

pub struct ConnectionPool {
    slots: Vec<Arc<Mutex<Slot>>>,
    next_slot: AtomicUsize,
    next_connection_id: AtomicU64,
    config: PoolConfig,
    transport: Arc<dyn Transport>,
    endpoints: Arc<EndpointSet>,
    policy: Arc<RoutingPolicy>,
    counters: Arc<PoolCounters>,
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        transport: Arc<dyn Transport>,
        endpoints: Arc<EndpointSet>,
        policy: Arc<RoutingPolicy>,
    ) -> Self {
        let capacity = config.max_connections.max(1);
        Self {
            slots: (0..capacity)
                .map(|_| Arc::new(Mutex::new(Slot::default())))
                .collect(),
            next_slot: AtomicUsize::new(0),
            next_connection_id: AtomicU64::new(1),
            config,
            transport,
            endpoints,
            policy,
            counters: Arc::new(PoolCounters::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn policy(&self) -> &RoutingPolicy {
        &self.policy
    }

    /// Slot for the next request; consecutive calls walk the slots in order
    pub fn next_slot(&self) -> usize {
        self.next_slot.fetch_add(1, Ordering::Relaxed) % self.slots.len()
    }

    /// Acquire the connection of `slot`, opening a new one when the slot is
    /// empty or its connection is unusable for `target`.
    ///
    /// A connect failure is returned as is; trying another endpoint is the
    /// caller's decision.
    pub async fn acquire(&self, slot: usize, target: Target<'_>) -> RouterResult<PooledConnection> {
        let slot = slot % self.slots.len();
        let mut guard = Arc::clone(&self.slots[slot]).lock_owned().await;

        if let Some(existing) = guard.connection.take() {
            match self.discard_reason(&existing, &target) {
                None => {
                    self.counters.reused.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Slot {} reusing connection {} to {}",
                        slot,
                        existing.id(),
                        existing.endpoint()
                    );
                    return Ok(PooledConnection::new(guard, slot, existing, Arc::clone(&self.counters)));
                }
                Some(reason) => {
                    debug!(
                        "Slot {} discarding connection {} to {}: {}",
                        slot,
                        existing.id(),
                        existing.endpoint(),
                        reason
                    );
                    if reason == DiscardReason::Expired {
                        self.counters.expired.fetch_add(1, Ordering::Relaxed);
                    }
                    existing.close().await;
                }
            }
        }

        let endpoint = match target {
            Target::Pinned(endpoint) => endpoint.clone(),
            Target::Next { exclude, leader } => {
                self.policy.next_endpoint(&self.endpoints, exclude, leader)?
            }
        };

        let session = self.transport.connect(&endpoint).await?;
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.counters.opened.fetch_add(1, Ordering::Relaxed);
        debug!("Slot {} opened connection {} to {}", slot, id, endpoint);

        let connection = Connection::new(id, endpoint, self.config.connection_ttl, session);
        Ok(PooledConnection::new(guard, slot, connection, Arc::clone(&self.counters)))
    }

    fn discard_reason(&self, connection: &Connection, target: &Target<'_>) -> Option<DiscardReason> {
        if connection.is_expired() {
            Some(DiscardReason::Expired)
        } else if !connection.is_open() {
            Some(DiscardReason::Closed)
        } else if !self.endpoints.contains(connection.endpoint()) {
            Some(DiscardReason::NotInSet)
        } else if !target.accepts(connection.endpoint()) {
            Some(DiscardReason::TargetMismatch)
        } else {
            None
        }
    }

    /// Idle slot whose open connection already points at `endpoint`
    pub fn slot_holding(&self, endpoint: &Endpoint) -> Option<usize> {
        self.slots.iter().position(|slot| match slot.try_lock() {
            Ok(slot) => slot
                .connection
                .as_ref()
                .is_some_and(|conn| conn.endpoint() == endpoint && conn.is_open()),
            Err(_) => false,
        })
    }

    /// Close every idle connection and wait for busy slots to finish.
    /// The pool stays usable; slots reconnect lazily.
    pub async fn close_all(&self) -> usize {
        let mut closed = 0;
        for slot in &self.slots {
            let connection = slot.lock().await.connection.take();
            if let Some(connection) = connection {
                connection.close().await;
                closed += 1;
            }
        }

        self.counters.closed.fetch_add(closed as u64, Ordering::Relaxed);
        info!("Closed {} pooled connections", closed);
        closed
    }

    pub fn statistics(&self) -> PoolStatistics {
        let open_connections = self
            .slots
            .iter()
            .filter(|slot| match slot.try_lock() {
                Ok(slot) => slot.connection.is_some(),
                // Locked slots are serving a request over a live connection
                Err(_) => true,
            })
            .count();

        PoolStatistics {
            capacity: self.slots.len(),
            open_connections,
            opened: self.counters.opened.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            invalidated: self.counters.invalidated.load(Ordering::Relaxed),
            closed: self.counters.closed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiscardReason {
    Expired,
    Closed,
    NotInSet,
    TargetMismatch,
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscardReason::Expired => write!(f, "ttl expired"),
            DiscardReason::Closed => write!(f, "session closed"),
            DiscardReason::NotInSet => write!(f, "endpoint left the set"),
            DiscardReason::TargetMismatch => write!(f, "endpoint not acceptable for this request"),
        }
    }
}

/// Exclusive use of one slot's connection
///
/// Dropping the guard releases the connection back to its slot, unless a
/// send was still in flight, in which case the connection is discarded.
pub struct PooledConnection {
    guard: OwnedMutexGuard<Slot>,
    slot: usize,
    connection: Option<Connection>,
    endpoint: Endpoint,
    in_flight: bool,
    counters: Arc<PoolCounters>,
}

impl PooledConnection {
    fn new(
        guard: OwnedMutexGuard<Slot>,
        slot: usize,
        connection: Connection,
        counters: Arc<PoolCounters>,
    ) -> Self {
        Self {
            guard,
            slot,
            endpoint: connection.endpoint().clone(),
            connection: Some(connection),
            in_flight: false,
            counters,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn connection_id(&self) -> Option<u64> {
        self.connection.as_ref().map(Connection::id)
    }

    pub async fn send(&mut self, request: &Request) -> RouterResult<Response> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| RouterError::internal("send on an invalidated connection"))?;

        self.in_flight = true;
        let result = connection.send(request).await;
        self.in_flight = false;
        result
    }

    /// Return the connection to its slot for reuse
    pub fn release(self) {}

    /// Remove the connection from its slot so the next acquisition opens a
    /// fresh one. Returns the endpoint it pointed at.
    pub fn invalidate(mut self) -> Endpoint {
        if let Some(connection) = self.connection.take() {
            self.counters.invalidated.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Invalidated connection {} to {} in slot {}",
                connection.id(),
                connection.endpoint(),
                self.slot
            );
        }
        self.endpoint.clone()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };

        if self.in_flight {
            self.counters.invalidated.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Request to {} cancelled mid-flight; discarding connection {}",
                connection.endpoint(),
                connection.id()
            );
        } else {
            self.guard.connection = Some(connection);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Session;
    use crate::routing::PolicyKind;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    /// Transport whose sessions answer with the endpoint they belong to
    #[derive(Default)]
    struct FakeTransport {
        down: StdMutex<HashSet<Endpoint>>,
        connects: AtomicU64,
        delay: Option<Duration>,
    }

    struct FakeSession {
        endpoint: Endpoint,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn connect(&self, endpoint: &Endpoint) -> RouterResult<Box<dyn Session>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.down.lock().unwrap().contains(endpoint) {
                return Err(RouterError::connect_failure(endpoint, "connection refused"));
            }
            Ok(Box::new(FakeSession {
                endpoint: endpoint.clone(),
                delay: self.delay,
            }))
        }
    }

    #[async_trait]
    impl Session for FakeSession {
        async fn send(&mut self, _request: &Request) -> RouterResult<Response> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(Response::new(200).with_body(self.endpoint.to_string()))
        }

        fn is_open(&self) -> bool {
            true
        }
    }

    fn endpoints(ports: &[u16]) -> Vec<Endpoint> {
        ports.iter().map(|p| Endpoint::new("127.0.0.1", *p)).collect()
    }

    fn pool_with(
        capacity: usize,
        ttl: Option<Duration>,
        transport: Arc<FakeTransport>,
        ports: &[u16],
    ) -> (ConnectionPool, Arc<EndpointSet>) {
        let set = Arc::new(EndpointSet::new(endpoints(ports)).unwrap());
        let pool = ConnectionPool::new(
            PoolConfig::new(capacity, ttl).unwrap(),
            transport,
            Arc::clone(&set),
            Arc::new(RoutingPolicy::new(PolicyKind::RoundRobin)),
        );
        (pool, set)
    }

    const ANY: Target<'static> = Target::Next {
        exclude: &[],
        leader: None,
    };

    #[test]
    fn test_pool_config_validation() {
        assert!(PoolConfig::new(0, None).is_err());
        assert!(PoolConfig::new(1, Some(Duration::ZERO)).is_err());
        assert!(PoolConfig::new(3, Some(Duration::from_secs(3))).is_ok());
    }

    #[tokio::test]
    async fn test_slots_stick_to_their_endpoint() {
        let transport = Arc::new(FakeTransport::default());
        let (pool, _) = pool_with(3, None, Arc::clone(&transport), &[1, 2, 3]);

        let mut first_round = Vec::new();
        for _ in 0..3 {
            let slot = pool.next_slot();
            let conn = pool.acquire(slot, ANY).await.unwrap();
            first_round.push(conn.endpoint().port());
        }
        assert_eq!(first_round, vec![1, 2, 3]);

        let mut second_round = Vec::new();
        for _ in 0..3 {
            let slot = pool.next_slot();
            let conn = pool.acquire(slot, ANY).await.unwrap();
            second_round.push(conn.endpoint().port());
        }
        assert_eq!(second_round, first_round);
        assert_eq!(transport.connects.load(Ordering::SeqCst), 3);

        let stats = pool.statistics();
        assert_eq!(stats.opened, 3);
        assert_eq!(stats.reused, 3);
        assert_eq!(stats.open_connections, 3);
    }

    #[tokio::test]
    async fn test_slot_holding_finds_idle_connection() {
        let transport = Arc::new(FakeTransport::default());
        let (pool, _) = pool_with(3, None, Arc::clone(&transport), &[1, 2, 3]);
        let second = Endpoint::new("127.0.0.1", 2);
        assert_eq!(pool.slot_holding(&second), None);

        for _ in 0..3 {
            let slot = pool.next_slot();
            pool.acquire(slot, ANY).await.unwrap().release();
        }
        assert_eq!(pool.slot_holding(&second), Some(1));

        // A busy slot is not offered
        let busy = pool.acquire(1, Target::Pinned(&second)).await.unwrap();
        assert_eq!(pool.slot_holding(&second), None);
        busy.release();
        assert_eq!(pool.slot_holding(&second), Some(1));
        assert_eq!(pool.slot_holding(&Endpoint::new("127.0.0.1", 9)), None);
    }

    #[tokio::test]
    async fn test_expired_connection_is_replaced() {
        let transport = Arc::new(FakeTransport::default());
        let (pool, _) = pool_with(1, Some(Duration::from_millis(30)), Arc::clone(&transport), &[1, 2]);

        let first = pool.acquire(0, ANY).await.unwrap();
        let first_id = first.connection_id();
        first.release();

        tokio::time::sleep(Duration::from_millis(60)).await;

        let second = pool.acquire(0, ANY).await.unwrap();
        assert_ne!(second.connection_id(), first_id);
        assert_eq!(second.endpoint().port(), 2);
        assert_eq!(pool.statistics().expired, 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_new_connection() {
        let transport = Arc::new(FakeTransport::default());
        let (pool, _) = pool_with(1, None, Arc::clone(&transport), &[1, 2]);

        let conn = pool.acquire(0, ANY).await.unwrap();
        assert_eq!(conn.invalidate().port(), 1);

        let conn = pool.acquire(0, ANY).await.unwrap();
        assert_eq!(conn.endpoint().port(), 2);
        assert_eq!(pool.statistics().invalidated, 1);
    }

    #[tokio::test]
    async fn test_connect_failure_is_not_retried() {
        let transport = Arc::new(FakeTransport::default());
        transport.down.lock().unwrap().insert(Endpoint::new("127.0.0.1", 1));
        let (pool, _) = pool_with(1, None, Arc::clone(&transport), &[1, 2]);

        let err = pool.acquire(0, ANY).await.err().unwrap();
        assert_eq!(err.failed_endpoint(), Some(&Endpoint::new("127.0.0.1", 1)));
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);

        // Slot stays empty and usable
        let conn = pool.acquire(0, ANY).await.unwrap();
        assert_eq!(conn.endpoint().port(), 2);
    }

    #[tokio::test]
    async fn test_pinned_target_replaces_mismatched_connection() {
        let transport = Arc::new(FakeTransport::default());
        let (pool, _) = pool_with(1, None, Arc::clone(&transport), &[1, 2]);

        pool.acquire(0, ANY).await.unwrap().release();

        let leader = Endpoint::new("127.0.0.1", 2);
        let conn = pool.acquire(0, Target::Pinned(&leader)).await.unwrap();
        assert_eq!(conn.endpoint(), &leader);
        drop(conn);

        // Pinned to the endpoint already held: reused
        let conn = pool.acquire(0, Target::Pinned(&leader)).await.unwrap();
        assert_eq!(conn.endpoint(), &leader);
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_excluded_endpoint_is_not_reused() {
        let transport = Arc::new(FakeTransport::default());
        let (pool, _) = pool_with(1, None, Arc::clone(&transport), &[1, 2]);

        pool.acquire(0, ANY).await.unwrap().release();

        let exclude = endpoints(&[1]);
        let conn = pool
            .acquire(0, Target::Next { exclude: &exclude, leader: None })
            .await
            .unwrap();
        assert_eq!(conn.endpoint().port(), 2);
    }

    #[tokio::test]
    async fn test_endpoint_removed_from_set_is_dropped() {
        let transport = Arc::new(FakeTransport::default());
        let (pool, set) = pool_with(1, None, Arc::clone(&transport), &[1, 2]);

        pool.acquire(0, ANY).await.unwrap().release();
        set.replace(endpoints(&[3])).unwrap();

        let conn = pool.acquire(0, ANY).await.unwrap();
        assert_eq!(conn.endpoint().port(), 3);
    }

    #[tokio::test]
    async fn test_identical_replace_keeps_connections() {
        let transport = Arc::new(FakeTransport::default());
        let (pool, set) = pool_with(2, None, Arc::clone(&transport), &[1, 2]);

        pool.acquire(0, ANY).await.unwrap().release();
        pool.acquire(1, ANY).await.unwrap().release();
        set.replace(endpoints(&[1, 2])).unwrap();
        set.replace(endpoints(&[1, 2])).unwrap();

        pool.acquire(0, ANY).await.unwrap().release();
        pool.acquire(1, ANY).await.unwrap().release();
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_slots_do_not_block_each_other() {
        let transport = Arc::new(FakeTransport::default());
        let (pool, _) = pool_with(2, None, Arc::clone(&transport), &[1, 2]);

        let held = pool.acquire(0, ANY).await.unwrap();
        let other = tokio::time::timeout(Duration::from_millis(200), pool.acquire(1, ANY))
            .await
            .expect("slot 1 must not wait for slot 0")
            .unwrap();
        assert_ne!(held.endpoint(), other.endpoint());
    }

    #[tokio::test]
    async fn test_cancelled_send_discards_connection() {
        let transport = Arc::new(FakeTransport {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let (pool, _) = pool_with(1, None, Arc::clone(&transport), &[1]);

        let mut conn = pool.acquire(0, ANY).await.unwrap();
        let request = Request::get("/_api/version");
        let result = tokio::time::timeout(Duration::from_millis(20), conn.send(&request)).await;
        assert!(result.is_err());
        drop(conn);

        assert_eq!(pool.statistics().invalidated, 1);
        assert_eq!(pool.statistics().open_connections, 0);
    }

    #[tokio::test]
    async fn test_close_all_keeps_pool_usable() {
        let transport = Arc::new(FakeTransport::default());
        let (pool, _) = pool_with(3, None, Arc::clone(&transport), &[1, 2, 3]);

        for slot in 0..3 {
            pool.acquire(slot, ANY).await.unwrap().release();
        }
        assert_eq!(pool.close_all().await, 3);
        assert_eq!(pool.statistics().open_connections, 0);

        let conn = pool.acquire(0, ANY).await.unwrap();
        assert!(conn.connection_id().is_some());
        assert_eq!(transport.connects.load(Ordering::SeqCst), 4);
    }
}
