/// Ordered, deduplicated set of reachable endpoints
///
/// Readers always see one complete list: `replace` builds a new vector and
/// swaps the pointer, so an in-flight `get` observes either the old or the
/// new list, never a mix.

use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::Endpoint;
use crate::error::{RouterError, RouterResult};

pub struct EndpointSet {
    endpoints: ArcSwap<Vec<Endpoint>>,
    generation: AtomicU64,
}

impl EndpointSet {
    /// Build a set from `endpoints`, dropping duplicates but keeping the
    /// first occurrence's position.
    pub fn new(endpoints: Vec<Endpoint>) -> RouterResult<Self> {
        let endpoints = dedup(endpoints);
        if endpoints.is_empty() {
            return Err(RouterError::EmptySet);
        }

        Ok(Self {
            endpoints: ArcSwap::from_pointee(endpoints),
            generation: AtomicU64::new(0),
        })
    }

    /// Atomically swap the active list. Returns `false` when the new list
    /// equals the current one, in which case nothing changes.
    pub fn replace(&self, endpoints: Vec<Endpoint>) -> RouterResult<bool> {
        let endpoints = dedup(endpoints);
        if endpoints.is_empty() {
            return Err(RouterError::EmptySet);
        }

        let current = self.endpoints.load();
        if **current == endpoints {
            debug!("Endpoint set unchanged ({} endpoints)", endpoints.len());
            return Ok(false);
        }

        info!(
            "Replacing endpoint set: {} -> {}",
            format_list(&current),
            format_list(&endpoints)
        );
        self.endpoints.store(Arc::new(endpoints));
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(true)
    }

    /// Append `endpoint` if it is not already a member
    pub fn push(&self, endpoint: Endpoint) -> bool {
        let mut added = false;
        self.endpoints.rcu(|current| {
            if current.contains(&endpoint) {
                added = false;
                return Arc::clone(current);
            }
            added = true;
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(endpoint.clone());
            Arc::new(next)
        });

        if added {
            self.generation.fetch_add(1, Ordering::AcqRel);
            info!("Added endpoint {} to the endpoint set", endpoint);
        }
        added
    }

    /// Endpoint at `index` modulo the current size
    pub fn get(&self, index: usize) -> Endpoint {
        let endpoints = self.endpoints.load();
        endpoints[index % endpoints.len()].clone()
    }

    pub fn size(&self) -> usize {
        self.endpoints.load().len()
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.endpoints.load().contains(endpoint)
    }

    /// The full current list, consistent for as long as the caller holds it
    pub fn snapshot(&self) -> Arc<Vec<Endpoint>> {
        self.endpoints.load_full()
    }

    /// Number of effective replacements so far
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for EndpointSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointSet")
            .field("endpoints", &self.snapshot())
            .field("generation", &self.generation())
            .finish()
    }
}

fn dedup(endpoints: Vec<Endpoint>) -> Vec<Endpoint> {
    let mut unique: Vec<Endpoint> = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        if !unique.contains(&endpoint) {
            unique.push(endpoint);
        }
    }
    unique
}

fn format_list(endpoints: &[Endpoint]) -> String {
    let items: Vec<String> = endpoints.iter().map(|e| e.to_string()).collect();
    format!("[{}]", items.join(", "))
}
