/// Request routing with retry and leader redirect
///
/// `RequestRouter::execute` picks a pool slot, sends the request and looks
/// at the answer. A connection-level failure is retried on a different
/// endpoint, a redirect to another leader is followed by one hop, and the
/// connection goes back to its slot or is invalidated on every path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::core::{
    Endpoint, EndpointSet, Request, RequestOptions, Response, Transport, DIRTY_READ_HEADER,
};
use crate::discovery::{ClusterEndpoints, HostListSource};
use crate::error::{ErrorSeverity, RouterError, RouterResult};
use crate::failover::{FailoverController, RedirectSignal};
use crate::pool::{ConnectionPool, PoolConfig, PoolStatistics, PooledConnection, Target};
use crate::routing::{PolicyKind, RoutingPolicy};

/// Bounds on the work a single call may do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterSettings {
    /// Retries on another endpoint after a connection-level failure
    pub max_connect_retries: u8,
    /// Redirect hops followed per call
    pub max_redirects: u8,
    /// Deadline applied when the caller sets none
    pub default_timeout: Option<Duration>,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            max_connect_retries: 1,
            max_redirects: 1,
            default_timeout: None,
        }
    }
}

#[derive(Default)]
struct RouterCounters {
    requests: AtomicU64,
    dirty_reads: AtomicU64,
    connect_retries: AtomicU64,
    redirects_followed: AtomicU64,
    redirect_loops: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
}

/// Router statistics snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterStatistics {
    pub requests: u64,
    pub dirty_reads: u64,
    pub connect_retries: u64,
    pub redirects_followed: u64,
    pub redirect_loops: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub pool: PoolStatistics,
}

/// Retry and redirect bookkeeping for one call
#[derive(Debug)]
struct DispatchContext {
    failed: Vec<Endpoint>,
    redirect_chain: Vec<Endpoint>,
    max_connect_retries: u8,
    max_redirects: u8,
}

impl DispatchContext {
    fn new(settings: &RouterSettings) -> Self {
        Self {
            failed: Vec::new(),
            redirect_chain: Vec::new(),
            max_connect_retries: settings.max_connect_retries,
            max_redirects: settings.max_redirects,
        }
    }

    /// Record a failed endpoint; returns whether another attempt is allowed
    fn record_failure(&mut self, endpoint: Endpoint) -> bool {
        if !self.failed.contains(&endpoint) {
            self.failed.push(endpoint);
        }
        self.failed.len() <= usize::from(self.max_connect_retries)
    }

    fn can_redirect(&self) -> bool {
        self.redirect_chain.len() < usize::from(self.max_redirects)
    }

    fn add_redirect(&mut self, target: Endpoint) {
        self.redirect_chain.push(target);
    }
}

pub struct RequestRouter {
    endpoints: Arc<EndpointSet>,
    pool: ConnectionPool,
    failover: Arc<FailoverController>,
    settings: RouterSettings,
    counters: RouterCounters,
}

impl RequestRouter {
    pub fn new(
        endpoints: Arc<EndpointSet>,
        transport: Arc<dyn Transport>,
        policy: RoutingPolicy,
        pool_config: PoolConfig,
        settings: RouterSettings,
    ) -> Self {
        let failover = FailoverController::new(Arc::clone(&endpoints));
        failover.track_authoritative(policy.uses_leader_hint());
        let failover = Arc::new(failover);
        let pool = ConnectionPool::new(
            pool_config,
            transport,
            Arc::clone(&endpoints),
            Arc::new(policy),
        );

        Self {
            endpoints,
            pool,
            failover,
            settings,
            counters: RouterCounters::default(),
        }
    }

    pub fn endpoints(&self) -> &Arc<EndpointSet> {
        &self.endpoints
    }

    pub fn failover(&self) -> &Arc<FailoverController> {
        &self.failover
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn policy_kind(&self) -> PolicyKind {
        self.pool.policy().kind()
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    pub async fn execute(&self, request: Request) -> RouterResult<Response> {
        self.execute_with(request, RequestOptions::default()).await
    }

    /// Route one request. A deadline, from `options` or the router default,
    /// bounds the whole call including retry and redirect hop.
    pub async fn execute_with(
        &self,
        mut request: Request,
        options: RequestOptions,
    ) -> RouterResult<Response> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        if options.dirty_read {
            self.counters.dirty_reads.fetch_add(1, Ordering::Relaxed);
            request.set_header(DIRTY_READ_HEADER, "true");
        }

        let result = match options.timeout.or(self.settings.default_timeout) {
            Some(limit) => match tokio::time::timeout(limit, self.dispatch(&request, &options)).await {
                Ok(result) => result,
                Err(_) => {
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    Err(RouterError::timeout(
                        format!("{} {}", request.method, request.full_path()),
                        limit,
                    ))
                }
            },
            None => self.dispatch(&request, &options).await,
        };

        if let Err(err) = &result {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            match err.severity() {
                ErrorSeverity::Critical | ErrorSeverity::Error => {
                    error!("{} {} failed: {}", request.method, request.full_path(), err)
                }
                ErrorSeverity::Warning | ErrorSeverity::Info => {
                    warn!("{} {} failed: {}", request.method, request.full_path(), err)
                }
            }
        }
        result
    }

    async fn dispatch(&self, request: &Request, options: &RequestOptions) -> RouterResult<Response> {
        if let Some(pin) = &options.pin {
            return self.dispatch_pinned(request, pin).await;
        }

        let mut slot = self.pool.next_slot();
        let mut ctx = DispatchContext::new(&self.settings);
        let mut pinned: Option<Endpoint> = None;

        loop {
            let leader = self.failover.leader();
            let target = match &pinned {
                Some(endpoint) => Target::Pinned(endpoint),
                None => Target::Next {
                    exclude: &ctx.failed,
                    leader: leader.as_ref(),
                },
            };
            let sequence = self.failover.next_sequence();

            let (conn, response) = match self.attempt(slot, target, request).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    let Some(endpoint) = err.failed_endpoint().cloned() else {
                        return Err(err);
                    };
                    self.failover.observe_unreachable(sequence, &endpoint);
                    if !ctx.record_failure(endpoint) {
                        return Err(RouterError::Unreachable {
                            attempted: ctx.failed,
                        });
                    }
                    warn!("{}; retrying on another endpoint", err);
                    self.counters.connect_retries.fetch_add(1, Ordering::Relaxed);
                    // The failed slot stays empty; the retry borrows the next
                    // slot so no survivor ends up held by two slots.
                    slot = self.pool.next_slot();
                    pinned = None;
                    continue;
                }
            };

            if options.dirty_read {
                debug!("Dirty read served by {}", conn.endpoint());
                conn.release();
                return Ok(response);
            }

            let served_by = conn.endpoint().clone();
            match RedirectSignal::from_response(&response, &served_by) {
                RedirectSignal::Redirect(leader) => {
                    if !ctx.can_redirect() {
                        self.counters.redirect_loops.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "{} redirected to {} again after {:?}; returning response as is",
                            served_by, leader, ctx.redirect_chain
                        );
                        conn.release();
                        return Ok(response);
                    }

                    debug!("{} redirected request to leader {}", served_by, leader);
                    self.failover.observe_redirect(sequence, &leader);
                    conn.invalidate();
                    self.counters.redirects_followed.fetch_add(1, Ordering::Relaxed);
                    ctx.add_redirect(leader.clone());
                    pinned = Some(leader);
                }
                RedirectSignal::Malformed(raw) => {
                    warn!("Ignoring malformed redirect header '{}' from {}", raw, served_by);
                    conn.release();
                    return Ok(response);
                }
                RedirectSignal::None | RedirectSignal::SelfReferential => {
                    self.failover.observe_authoritative(sequence, &served_by);
                    conn.release();
                    return Ok(response);
                }
            }
        }
    }

    /// Send to one fixed endpoint, reusing the slot already connected to it.
    /// No retry and no redirect: the caller asked for this server.
    async fn dispatch_pinned(&self, request: &Request, pin: &Endpoint) -> RouterResult<Response> {
        let slot = self
            .pool
            .slot_holding(pin)
            .unwrap_or_else(|| self.pool.next_slot());
        let sequence = self.failover.next_sequence();

        match self.attempt(slot, Target::Pinned(pin), request).await {
            Ok((conn, response)) => {
                debug!("Pinned request served by {} in slot {}", conn.endpoint(), slot);
                conn.release();
                Ok(response)
            }
            Err(err) => {
                if err.is_connection_failure() {
                    self.failover.observe_unreachable(sequence, pin);
                }
                Err(err)
            }
        }
    }

    async fn attempt(
        &self,
        slot: usize,
        target: Target<'_>,
        request: &Request,
    ) -> RouterResult<(PooledConnection, Response)> {
        let mut conn = self.pool.acquire(slot, target).await?;
        match conn.send(request).await {
            Ok(response) => Ok((conn, response)),
            Err(err) => {
                if err.is_connection_failure() {
                    conn.invalidate();
                }
                Err(err)
            }
        }
    }

    /// Fetch the cluster's endpoint list and make it the active set.
    /// Returns whether the set changed.
    pub async fn acquire_host_list(&self) -> RouterResult<bool> {
        let hosts = ClusterEndpoints.fetch(self).await?;
        self.endpoints.replace(hosts)
    }

    /// Close every pooled connection; the router stays usable
    pub async fn close_all(&self) -> usize {
        self.pool.close_all().await
    }

    pub fn statistics(&self) -> RouterStatistics {
        RouterStatistics {
            requests: self.counters.requests.load(Ordering::Relaxed),
            dirty_reads: self.counters.dirty_reads.load(Ordering::Relaxed),
            connect_retries: self.counters.connect_retries.load(Ordering::Relaxed),
            redirects_followed: self.counters.redirects_followed.load(Ordering::Relaxed),
            redirect_loops: self.counters.redirect_loops.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            pool: self.pool.statistics(),
        }
    }
}

impl std::fmt::Debug for RequestRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRouter")
            .field("endpoints", &self.endpoints)
            .field("policy", &self.policy_kind())
            .field("settings", &self.settings)
            .finish()
    }
}
