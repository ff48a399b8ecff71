//! readiness-check
//!
//! Blocks until the search cluster at `--url` runs `--version` on every node,
//! is not red, and has at least `--data-nodes` data nodes. Used as an init
//! container in front of workloads that must not start against a half-upgraded
//! cluster.
//!
//! Exit status is 0 once ready and 1 when the timeout elapses.

use clap::Parser;
use search_client::{BasicAuth, ReadinessGate, ReadinessTarget, SearchClient};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "readiness-check", about = "Wait for the search cluster to reach a version and data-node quorum")]
struct Args {
    /// Cluster base URL
    #[arg(long, env = "SEARCH_URL")]
    url: String,

    /// Version every node must report
    #[arg(long, env = "SEARCH_VERSION")]
    version: String,

    /// Minimum number of data nodes on the target version
    #[arg(long, env = "SEARCH_DATA_NODES", default_value_t = 1)]
    data_nodes: u32,

    /// Give up after this many seconds
    #[arg(long, env = "SEARCH_TIMEOUT_SECS", default_value_t = 600)]
    timeout_secs: u64,

    #[arg(long, env = "SEARCH_USERNAME", hide_env_values = true)]
    username: Option<String>,

    #[arg(long, env = "SEARCH_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

/// Basic auth needs both halves; one without the other is a configuration error.
fn credentials(username: Option<String>, password: Option<String>) -> anyhow::Result<Option<BasicAuth>> {
    match (username, password) {
        (Some(username), Some(password)) => Ok(Some(BasicAuth { username, password })),
        (None, None) => Ok(None),
        (Some(_), None) => anyhow::bail!("SEARCH_USERNAME is set but SEARCH_PASSWORD is not"),
        (None, Some(_)) => anyhow::bail!("SEARCH_PASSWORD is set but SEARCH_USERNAME is not"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let auth = credentials(args.username, args.password)?;

    info!(
        "Waiting for {} to run version {} with {} data node(s)",
        args.url, args.version, args.data_nodes
    );

    let client = SearchClient::new(args.url, auth)?;
    let target = ReadinessTarget::new(args.version, args.data_nodes);

    match ReadinessGate::new(&client)
        .wait(&target, Duration::from_secs(args.timeout_secs))
        .await
    {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            error!("{}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}
