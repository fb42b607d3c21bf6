/// Leader tracking and redirect signal handling
///
/// The controller holds the client's belief about which endpoint currently
/// leads. Observations arrive stamped with the sequence number of the
/// dispatch that produced them; an observation older than the one the
/// current belief came from is dropped, so a slow response can never
/// overwrite a newer belief.

use arc_swap::ArcSwap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core::{Endpoint, EndpointSet, Response};
use crate::error::{RouterError, RouterResult};

/// Believed leader
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LeaderState {
    /// No leader observed yet, or the last one became unreachable
    #[default]
    Unknown,
    Known(Endpoint),
}

impl LeaderState {
    pub fn endpoint(&self) -> Option<&Endpoint> {
        match self {
            LeaderState::Unknown => None,
            LeaderState::Known(endpoint) => Some(endpoint),
        }
    }
}

impl fmt::Display for LeaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaderState::Unknown => write!(f, "unknown"),
            LeaderState::Known(endpoint) => write!(f, "{}", endpoint),
        }
    }
}

/// Leader belief together with its freshness
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeaderBelief {
    pub state: LeaderState,
    /// Dispatch sequence number of the observation that set this belief
    pub observed_at: u64,
    /// Incremented on every state change
    pub version: u64,
}

/// What a response says about the leader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectSignal {
    /// No redirect header: the serving node is authoritative
    None,
    /// Header names the endpoint that served the request
    SelfReferential,
    /// Header names a different endpoint
    Redirect(Endpoint),
    /// Header present but unparsable
    Malformed(String),
}

impl RedirectSignal {
    /// Inspect the redirect header of `response`, served by `served_by`
    pub fn from_response(response: &Response, served_by: &Endpoint) -> Self {
        let Some(raw) = response.redirect_header() else {
            return RedirectSignal::None;
        };

        match Endpoint::parse(raw) {
            Ok(target) if &target == served_by => RedirectSignal::SelfReferential,
            Ok(target) => RedirectSignal::Redirect(target),
            Err(_) => RedirectSignal::Malformed(raw.to_string()),
        }
    }
}

pub struct FailoverController {
    belief: ArcSwap<LeaderBelief>,
    sequence: AtomicU64,
    endpoints: Arc<EndpointSet>,
    leader_tx: watch::Sender<LeaderState>,
    tracks_authoritative: AtomicBool,
}

impl FailoverController {
    pub fn new(endpoints: Arc<EndpointSet>) -> Self {
        let (leader_tx, _) = watch::channel(LeaderState::Unknown);
        Self {
            belief: ArcSwap::from_pointee(LeaderBelief::default()),
            sequence: AtomicU64::new(0),
            endpoints,
            leader_tx,
            tracks_authoritative: AtomicBool::new(true),
        }
    }

    /// Whether plain responses update the belief. Off for deployments where
    /// nothing routes by leader; the first redirect turns it back on.
    pub fn track_authoritative(&self, enabled: bool) {
        self.tracks_authoritative.store(enabled, Ordering::Release);
    }

    pub fn tracks_authoritative(&self) -> bool {
        self.tracks_authoritative.load(Ordering::Acquire)
    }

    /// Stamp for a new dispatch; later dispatches get larger numbers
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn belief(&self) -> Arc<LeaderBelief> {
        self.belief.load_full()
    }

    pub fn leader(&self) -> Option<Endpoint> {
        self.belief.load().state.endpoint().cloned()
    }

    /// Receiver notified on every leader state change
    pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.leader_tx.subscribe()
    }

    /// A redirect signal named `target` as the leader
    pub fn observe_redirect(&self, sequence: u64, target: &Endpoint) -> bool {
        if !self.tracks_authoritative.swap(true, Ordering::AcqRel) {
            debug!("Redirect seen; tracking leader from plain responses");
        }
        if self.endpoints.push(target.clone()) {
            info!("Redirect target {} was not in the endpoint set; added", target);
        }
        let changed = self.transition(sequence, |_| Some(LeaderState::Known(target.clone())));
        if changed {
            info!("Redirected to new leader {}", target);
        }
        changed
    }

    /// A non-dirty response without redirect header came from `endpoint`
    pub fn observe_authoritative(&self, sequence: u64, endpoint: &Endpoint) -> bool {
        if !self.tracks_authoritative() {
            return false;
        }
        self.transition(sequence, |_| Some(LeaderState::Known(endpoint.clone())))
    }

    /// The connection to `endpoint` was invalidated as unreachable. Only
    /// clears the belief if `endpoint` is the believed leader.
    pub fn observe_unreachable(&self, sequence: u64, endpoint: &Endpoint) -> bool {
        let changed = self.transition(sequence, |current| match current {
            LeaderState::Known(leader) if leader == endpoint => Some(LeaderState::Unknown),
            _ => None,
        });
        if changed {
            info!("Leader {} unreachable; leader unknown", endpoint);
        }
        changed
    }

    /// Apply `next` to the current state unless the observation is stale.
    /// Returns whether the leader state changed.
    fn transition<F>(&self, sequence: u64, next: F) -> bool
    where
        F: Fn(&LeaderState) -> Option<LeaderState>,
    {
        loop {
            let current = self.belief.load_full();
            if sequence < current.observed_at {
                debug!(
                    "Dropping stale leader observation #{} (belief from #{})",
                    sequence, current.observed_at
                );
                return false;
            }

            let Some(state) = next(&current.state) else {
                return false;
            };
            let changed = state != current.state;
            let updated = Arc::new(LeaderBelief {
                state: state.clone(),
                observed_at: sequence,
                version: current.version + u64::from(changed),
            });

            let previous = self.belief.compare_and_swap(&current, updated);
            if !Arc::ptr_eq(&previous, &current) {
                // Lost a race with a concurrent observation; re-evaluate
                continue;
            }

            if changed {
                debug!("Leader belief changed: {} -> {}", current.state, state);
                // Publish the latest belief, which a racing update may already have replaced
                self.leader_tx.send_replace(self.belief.load().state.clone());
            }
            return changed;
        }
    }

    /// Wait until a leader other than `exclude` is believed
    pub async fn await_leader_change(
        &self,
        exclude: Option<&Endpoint>,
        limit: Duration,
    ) -> RouterResult<Endpoint> {
        let mut rx = self.leader_tx.subscribe();
        let wait = async {
            rx.wait_for(|state| match state {
                LeaderState::Known(leader) => Some(leader) != exclude,
                LeaderState::Unknown => false,
            })
            .await
            .map(|state| state.endpoint().cloned())
        };

        let outcome = tokio::time::timeout(limit, wait).await;
        match outcome {
            Ok(Ok(leader)) => {
                leader.ok_or_else(|| RouterError::internal("leader wait woke without a leader"))
            }
            Ok(Err(_)) => Err(RouterError::internal("leader channel closed")),
            Err(_) => {
                warn!("No leader change observed within {:?}", limit);
                Err(RouterError::timeout("await leader change", limit))
            }
        }
    }
}

impl fmt::Debug for FailoverController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailoverController")
            .field("belief", &self.belief())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(port: u16) -> Endpoint {
        Endpoint::new("127.0.0.1", port)
    }

    fn controller(ports: &[u16]) -> FailoverController {
        let set = EndpointSet::new(ports.iter().map(|p| endpoint(*p)).collect()).unwrap();
        FailoverController::new(Arc::new(set))
    }

    #[test]
    fn test_redirect_signal_parsing() {
        let served_by = endpoint(1);

        let plain = Response::new(200);
        assert_eq!(RedirectSignal::from_response(&plain, &served_by), RedirectSignal::None);

        let redirect = Response::new(503).with_header("X-Arango-Endpoint", "tcp://127.0.0.1:2");
        assert_eq!(
            RedirectSignal::from_response(&redirect, &served_by),
            RedirectSignal::Redirect(endpoint(2))
        );

        let own = Response::new(200).with_header("x-arango-endpoint", "tcp://127.0.0.1:1");
        assert_eq!(
            RedirectSignal::from_response(&own, &served_by),
            RedirectSignal::SelfReferential
        );

        let garbage = Response::new(503).with_header("x-arango-endpoint", "leader");
        assert!(matches!(
            RedirectSignal::from_response(&garbage, &served_by),
            RedirectSignal::Malformed(_)
        ));
    }

    #[test]
    fn test_state_machine_transitions() {
        let controller = controller(&[1, 2]);
        assert_eq!(controller.belief().state, LeaderState::Unknown);

        // Unknown -> Known on first authoritative response
        let seq = controller.next_sequence();
        assert!(controller.observe_authoritative(seq, &endpoint(1)));
        assert_eq!(controller.leader(), Some(endpoint(1)));

        // Same leader again: no change, no version bump
        let seq = controller.next_sequence();
        assert!(!controller.observe_authoritative(seq, &endpoint(1)));
        assert_eq!(controller.belief().version, 1);

        // Known(e) -> Known(e') on redirect
        let seq = controller.next_sequence();
        assert!(controller.observe_redirect(seq, &endpoint(2)));
        assert_eq!(controller.leader(), Some(endpoint(2)));

        // Unreachable non-leader does not clear the belief
        let seq = controller.next_sequence();
        assert!(!controller.observe_unreachable(seq, &endpoint(1)));

        // Known(e) -> Unknown when e becomes unreachable
        let seq = controller.next_sequence();
        assert!(controller.observe_unreachable(seq, &endpoint(2)));
        assert_eq!(controller.belief().state, LeaderState::Unknown);
        assert_eq!(controller.belief().version, 3);
    }

    #[test]
    fn test_untracked_plain_responses_leave_belief_alone() {
        let controller = controller(&[1, 2, 3]);
        controller.track_authoritative(false);

        for port in [1, 2, 3, 1] {
            let seq = controller.next_sequence();
            assert!(!controller.observe_authoritative(seq, &endpoint(port)));
        }
        assert_eq!(controller.belief().state, LeaderState::Unknown);
        assert_eq!(controller.belief().version, 0);

        // A redirect shows a leader exists; plain responses count from here
        let seq = controller.next_sequence();
        assert!(controller.observe_redirect(seq, &endpoint(2)));
        assert!(controller.tracks_authoritative());
        let seq = controller.next_sequence();
        assert!(controller.observe_authoritative(seq, &endpoint(3)));
        assert_eq!(controller.leader(), Some(endpoint(3)));
    }

    #[test]
    fn test_stale_observation_does_not_clobber_newer_belief() {
        let controller = controller(&[1, 2]);
        let older = controller.next_sequence();
        let newer = controller.next_sequence();

        assert!(controller.observe_redirect(newer, &endpoint(2)));
        assert!(!controller.observe_authoritative(older, &endpoint(1)));
        assert_eq!(controller.leader(), Some(endpoint(2)));
        assert_eq!(controller.belief().observed_at, newer);
    }

    #[test]
    fn test_redirect_to_unknown_endpoint_extends_set() {
        let set = Arc::new(EndpointSet::new(vec![endpoint(1)]).unwrap());
        let controller = FailoverController::new(Arc::clone(&set));

        let seq = controller.next_sequence();
        controller.observe_redirect(seq, &endpoint(9));
        assert!(set.contains(&endpoint(9)));
        assert_eq!(set.size(), 2);
    }

    #[test]
    fn test_concurrent_observations_keep_latest() {
        let controller = Arc::new(controller(&[1, 2, 3, 4]));
        let handles: Vec<_> = (0..4u16)
            .map(|i| {
                let controller = Arc::clone(&controller);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let seq = controller.next_sequence();
                        controller.observe_authoritative(seq, &endpoint(i + 1));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let belief = controller.belief();
        assert!(belief.observed_at <= 800);
        assert!(belief.state.endpoint().is_some());
    }

    #[tokio::test]
    async fn test_await_leader_change_wakes_on_new_leader() {
        let controller = Arc::new(controller(&[1, 2]));
        let seq = controller.next_sequence();
        controller.observe_authoritative(seq, &endpoint(1));

        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                controller
                    .await_leader_change(Some(&endpoint(1)), Duration::from_secs(2))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let seq = controller.next_sequence();
        controller.observe_unreachable(seq, &endpoint(1));
        let seq = controller.next_sequence();
        controller.observe_authoritative(seq, &endpoint(2));

        assert_eq!(waiter.await.unwrap().unwrap(), endpoint(2));
    }

    #[tokio::test]
    async fn test_await_leader_change_returns_current_if_already_different() {
        let controller = controller(&[1, 2]);
        let seq = controller.next_sequence();
        controller.observe_authoritative(seq, &endpoint(2));

        let leader = controller
            .await_leader_change(Some(&endpoint(1)), Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(leader, endpoint(2));
    }

    #[tokio::test]
    async fn test_await_leader_change_times_out() {
        let controller = controller(&[1]);
        let seq = controller.next_sequence();
        controller.observe_authoritative(seq, &endpoint(1));

        let err = controller
            .await_leader_change(Some(&endpoint(1)), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::Timeout { .. }));
    }
}
