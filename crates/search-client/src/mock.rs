//! Mock SearchClient for unit testing
//!
//! Replays a script of (health, nodes) observations without a running cluster.
//! Each poll consumes one step; the final step repeats once the script runs out.

use crate::error::SearchError;
use crate::models::{ClusterHealth, NodeInfo};
use crate::search_trait::SearchClientTrait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One scripted observation; `None` makes the corresponding call fail.
#[derive(Debug, Clone)]
pub struct Observation {
    pub health: Option<ClusterHealth>,
    pub nodes: Option<Vec<NodeInfo>>,
}

/// Mock SearchClient for testing
#[derive(Debug, Clone)]
pub struct MockSearchClient {
    base_url: String,
    script: Arc<Mutex<VecDeque<Observation>>>,
    current: Arc<Mutex<Option<Observation>>>,
    health_calls: Arc<AtomicUsize>,
}

impl MockSearchClient {
    /// Create a new mock client with an empty script (every call fails)
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            script: Arc::new(Mutex::new(VecDeque::new())),
            current: Arc::new(Mutex::new(None)),
            health_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Append an observation to the script (for test setup)
    pub fn push(&self, health: Option<ClusterHealth>, nodes: Option<Vec<NodeInfo>>) {
        self.script
            .lock()
            .unwrap()
            .push_back(Observation { health, nodes });
    }

    /// Number of health polls issued so far
    pub fn polls(&self) -> usize {
        self.health_calls.load(Ordering::SeqCst)
    }

    fn unavailable(what: &str) -> SearchError {
        SearchError::Api(format!("{what} unavailable (mock)"))
    }
}

#[async_trait::async_trait]
impl SearchClientTrait for MockSearchClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    // A health call advances the script; the nodes call that follows reads the same step.
    async fn cluster_health(&self) -> Result<ClusterHealth, SearchError> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        let mut current = self.current.lock().unwrap();
        if let Some(next) = self.script.lock().unwrap().pop_front() {
            *current = Some(next);
        }
        current
            .as_ref()
            .and_then(|obs| obs.health.clone())
            .ok_or_else(|| Self::unavailable("health"))
    }

    async fn nodes(&self) -> Result<Vec<NodeInfo>, SearchError> {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|obs| obs.nodes.clone())
            .ok_or_else(|| Self::unavailable("nodes"))
    }
}
