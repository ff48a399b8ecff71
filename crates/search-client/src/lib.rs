//! Search Cluster Client
//!
//! A small client for the managed search cluster's health and node-topology
//! endpoints, plus the readiness gate built on top of it.
//!
//! # Example
//!
//! ```no_run
//! use search_client::{ReadinessGate, ReadinessTarget, SearchClient};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = SearchClient::new("http://logs-search.monitoring.svc:9200".to_string(), None)?;
//! let gate = ReadinessGate::new(&client);
//! let target = ReadinessTarget::new("7.5.0", 3);
//! gate.wait(&target, Duration::from_secs(600)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Health/topology queries**: `/_cluster/health` and `/_cat/nodes`
//! - **Readiness gate**: version, health and data-node quorum polling
//! - **Mocking**: `MockSearchClient` behind the `test-util` feature

pub mod client;
pub mod error;
pub mod models;
pub mod readiness;
#[path = "trait.rs"]
pub mod search_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::{BasicAuth, SearchClient};
pub use error::SearchError;
pub use models::*;
pub use readiness::{Insufficient, ReadinessGate, ReadinessRecord, ReadinessTarget, POLL_INTERVAL};
pub use search_trait::SearchClientTrait;
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockSearchClient;
