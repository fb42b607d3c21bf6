/// Endpoint selection policies
///
/// A policy is consulted only when a pool slot must open a new connection.
/// Reused connections never touch the cursor, which is what makes a slot
/// stick to its endpoint.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use crate::core::{Endpoint, EndpointSet};
use crate::error::{RouterError, RouterResult};

/// Policy selected by client configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Shared rotating cursor, connections stick to their slot
    #[default]
    RoundRobin,
    /// Endpoints in the order supplied, moving on only after a failure
    FixedList,
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyKind::RoundRobin => write!(f, "round_robin"),
            PolicyKind::FixedList => write!(f, "fixed_list"),
        }
    }
}

impl FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" | "round-robin" => Ok(PolicyKind::RoundRobin),
            "fixed_list" | "fixed-list" | "none" => Ok(PolicyKind::FixedList),
            other => Err(format!("Unknown routing policy: {other}")),
        }
    }
}

/// Endpoint selection strategy
pub trait SelectionStrategy: Send + Sync {
    /// Pick an index into `endpoints`, never one listed in `exclude`.
    /// `preferred` is the believed leader, if the caller routes by it.
    fn select(
        &self,
        endpoints: &[Endpoint],
        exclude: &[Endpoint],
        preferred: Option<&Endpoint>,
    ) -> Option<usize>;
}

/// Round-robin with affinity: one cursor shared by every pool slot
pub struct RoundRobinAffinity {
    cursor: AtomicUsize,
}

impl RoundRobinAffinity {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(start: usize) -> Self {
        Self {
            cursor: AtomicUsize::new(start),
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }
}

impl Default for RoundRobinAffinity {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for RoundRobinAffinity {
    fn select(
        &self,
        endpoints: &[Endpoint],
        exclude: &[Endpoint],
        _preferred: Option<&Endpoint>,
    ) -> Option<usize> {
        if endpoints.is_empty() {
            return None;
        }

        for _ in 0..endpoints.len() {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % endpoints.len();
            if !exclude.contains(&endpoints[index]) {
                return Some(index);
            }
        }
        None
    }
}

/// Fixed list: stay on the current endpoint until it fails
pub struct FixedList {
    current: AtomicUsize,
}

impl FixedList {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(start: usize) -> Self {
        Self {
            current: AtomicUsize::new(start),
        }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }
}

impl Default for FixedList {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for FixedList {
    fn select(
        &self,
        endpoints: &[Endpoint],
        exclude: &[Endpoint],
        preferred: Option<&Endpoint>,
    ) -> Option<usize> {
        if endpoints.is_empty() {
            return None;
        }

        if let Some(leader) = preferred.filter(|leader| !exclude.contains(leader)) {
            if let Some(index) = endpoints.iter().position(|e| e == leader) {
                self.current.store(index, Ordering::Relaxed);
                return Some(index);
            }
        }

        let start = self.current.load(Ordering::Relaxed) % endpoints.len();
        for offset in 0..endpoints.len() {
            let index = (start + offset) % endpoints.len();
            if !exclude.contains(&endpoints[index]) {
                if index != start {
                    self.current.store(index, Ordering::Relaxed);
                }
                return Some(index);
            }
        }
        None
    }
}

/// The configured policy, applied against an `EndpointSet`
pub struct RoutingPolicy {
    kind: PolicyKind,
    strategy: Box<dyn SelectionStrategy>,
}

impl RoutingPolicy {
    pub fn new(kind: PolicyKind) -> Self {
        Self::starting_at(kind, 0)
    }

    pub fn starting_at(kind: PolicyKind, start: usize) -> Self {
        let strategy: Box<dyn SelectionStrategy> = match kind {
            PolicyKind::RoundRobin => Box::new(RoundRobinAffinity::starting_at(start)),
            PolicyKind::FixedList => Box::new(FixedList::starting_at(start)),
        };
        Self { kind, strategy }
    }

    /// Start the cursor at a random position within `size` endpoints
    pub fn randomized(kind: PolicyKind, size: usize) -> Self {
        let start = rand::thread_rng().gen_range(0..size.max(1));
        debug!("Starting {} cursor at {}", kind, start);
        Self::starting_at(kind, start)
    }

    pub fn kind(&self) -> PolicyKind {
        self.kind
    }

    /// Only the fixed list routes by the believed leader
    pub fn uses_leader_hint(&self) -> bool {
        self.kind == PolicyKind::FixedList
    }

    /// Choose the endpoint for a new connection
    pub fn next_endpoint(
        &self,
        endpoints: &EndpointSet,
        exclude: &[Endpoint],
        leader: Option<&Endpoint>,
    ) -> RouterResult<Endpoint> {
        let snapshot = endpoints.snapshot();
        let preferred = if self.uses_leader_hint() { leader } else { None };

        match self.strategy.select(&snapshot, exclude, preferred) {
            Some(index) => {
                let endpoint = snapshot[index].clone();
                debug!("{} selected {} (index {})", self.kind, endpoint, index);
                Ok(endpoint)
            }
            None => Err(RouterError::Unreachable {
                attempted: exclude.to_vec(),
            }),
        }
    }
}

impl fmt::Debug for RoutingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingPolicy").field("kind", &self.kind).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(ports: &[u16]) -> Vec<Endpoint> {
        ports.iter().map(|p| Endpoint::new("127.0.0.1", *p)).collect()
    }

    #[test]
    fn test_round_robin_visits_distinct_endpoints() {
        let rr = RoundRobinAffinity::new();
        let list = endpoints(&[1, 2, 3]);

        assert_eq!(rr.select(&list, &[], None), Some(0));
        assert_eq!(rr.select(&list, &[], None), Some(1));
        assert_eq!(rr.select(&list, &[], None), Some(2));
        assert_eq!(rr.select(&list, &[], None), Some(0));
    }

    #[test]
    fn test_round_robin_skips_excluded() {
        let rr = RoundRobinAffinity::new();
        let list = endpoints(&[1, 2, 3]);
        let exclude = endpoints(&[2]);

        assert_eq!(rr.select(&list, &exclude, None), Some(0));
        assert_eq!(rr.select(&list, &exclude, None), Some(2));
        assert_eq!(rr.select(&list, &exclude, None), Some(0));
        assert_eq!(rr.select(&list, &list, None), None);
    }

    #[test]
    fn test_round_robin_ignores_preferred() {
        let rr = RoundRobinAffinity::new();
        let list = endpoints(&[1, 2]);
        assert_eq!(rr.select(&list, &[], Some(&list[1])), Some(0));
    }

    #[test]
    fn test_fixed_list_stays_put_until_failure() {
        let fixed = FixedList::new();
        let list = endpoints(&[1, 2, 3]);

        for _ in 0..5 {
            assert_eq!(fixed.select(&list, &[], None), Some(0));
        }

        // First endpoint failed: move on and stay there
        assert_eq!(fixed.select(&list, &endpoints(&[1]), None), Some(1));
        assert_eq!(fixed.select(&list, &[], None), Some(1));
        assert_eq!(fixed.current(), 1);
    }

    #[test]
    fn test_fixed_list_prefers_leader() {
        let fixed = FixedList::new();
        let list = endpoints(&[1, 2]);

        assert_eq!(fixed.select(&list, &[], Some(&list[1])), Some(1));
        // Excluded leader falls back to the list order
        assert_eq!(fixed.select(&list, &endpoints(&[2]), Some(&list[1])), Some(0));
        // Leader outside the list is ignored
        let outsider = Endpoint::new("10.0.0.1", 9);
        assert_eq!(fixed.select(&list, &[], Some(&outsider)), Some(0));
    }

    #[test]
    fn test_policy_over_endpoint_set() {
        let set = EndpointSet::new(endpoints(&[1, 2, 3])).unwrap();
        let policy = RoutingPolicy::starting_at(PolicyKind::RoundRobin, 1);

        assert_eq!(policy.next_endpoint(&set, &[], None).unwrap().port(), 2);
        assert_eq!(policy.next_endpoint(&set, &[], None).unwrap().port(), 3);
        assert_eq!(policy.next_endpoint(&set, &[], None).unwrap().port(), 1);
        assert!(!policy.uses_leader_hint());

        let err = policy
            .next_endpoint(&set, &endpoints(&[1, 2, 3]), None)
            .unwrap_err();
        assert!(matches!(err, RouterError::Unreachable { ref attempted } if attempted.len() == 3));
    }

    #[test]
    fn test_fixed_policy_routes_by_leader() {
        let set = EndpointSet::new(endpoints(&[1, 2])).unwrap();
        let policy = RoutingPolicy::new(PolicyKind::FixedList);
        let leader = Endpoint::new("127.0.0.1", 2);

        assert!(policy.uses_leader_hint());
        assert_eq!(policy.next_endpoint(&set, &[], Some(&leader)).unwrap(), leader);
    }

    #[test]
    fn test_randomized_start_is_in_range() {
        let set = EndpointSet::new(endpoints(&[1, 2, 3])).unwrap();
        for _ in 0..20 {
            let policy = RoutingPolicy::randomized(PolicyKind::RoundRobin, set.size());
            assert!(policy.next_endpoint(&set, &[], None).is_ok());
        }
        let policy = RoutingPolicy::randomized(PolicyKind::FixedList, 0);
        assert_eq!(policy.kind(), PolicyKind::FixedList);
    }

    #[test]
    fn test_policy_kind_parsing() {
        assert_eq!("round_robin".parse::<PolicyKind>(), Ok(PolicyKind::RoundRobin));
        assert_eq!("fixed-list".parse::<PolicyKind>(), Ok(PolicyKind::FixedList));
        assert!("random".parse::<PolicyKind>().is_err());
        assert_eq!(PolicyKind::FixedList.to_string(), "fixed_list");
    }
}
