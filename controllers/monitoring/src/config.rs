//! Process configuration.
//!
//! Read once from flags and environment at startup and never mutated.

use crate::error::ControllerError;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Default name of the operator settings ConfigMap.
pub const DEFAULT_SETTINGS_NAME: &str = "monitoring-operator-settings";

/// Default directory the webhook certificate is written to.
pub const DEFAULT_CERT_DIR: &str = "/tmp/k8s-webhook-server/serving-certs";

/// Per-pass readiness wait: two polls of the search cluster.
pub const DEFAULT_READINESS_TIMEOUT_SECS: u64 = 10;

/// Controller configuration
#[derive(Debug, Clone, Parser)]
#[command(name = "monitoring-controller", about = "Converges MonitoringInstance resources into a running observability stack")]
pub struct Config {
    /// Namespace the controller runs in (settings object and webhook service live here)
    #[arg(long, env = "POD_NAMESPACE")]
    pub namespace: String,

    /// Only watch instances in this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Only reconcile the instance with this name
    #[arg(long, env = "INSTANCE_NAME")]
    pub instance_name: Option<String>,

    /// Name of the operator settings ConfigMap
    #[arg(long, env = "SETTINGS_NAME", default_value = DEFAULT_SETTINGS_NAME)]
    pub settings_name: String,

    /// Directory for the webhook certificate
    #[arg(long, env = "CERT_DIR", default_value = DEFAULT_CERT_DIR)]
    pub cert_dir: PathBuf,

    /// Port for /health
    #[arg(long, env = "HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,

    /// Port for the admission webhook (TLS)
    #[arg(long, env = "WEBHOOK_PORT", default_value_t = 9443)]
    pub webhook_port: u16,

    /// Service name the webhook certificate is issued for
    #[arg(long, env = "WEBHOOK_SERVICE", default_value = "monitoring-operator-webhook")]
    pub webhook_service: String,

    /// ValidatingWebhookConfiguration whose `caBundle` is kept pointing at the webhook CA
    #[arg(long, env = "WEBHOOK_CONFIG_NAME", default_value = "monitoring-operator-webhook")]
    pub webhook_config_name: String,

    /// Number of reconcile workers. A pass waiting on a search cluster holds its
    /// worker for up to `--readiness-timeout-secs`, so scale this with the
    /// number of instances that roll out at the same time.
    #[arg(long, env = "WORKERS", default_value_t = 1)]
    pub workers: usize,

    /// Sustained Kubernetes API request rate
    #[arg(long, env = "KUBE_QPS", default_value_t = 20)]
    pub kube_qps: u32,

    /// Kubernetes API burst size
    #[arg(long, env = "KUBE_BURST", default_value_t = 30)]
    pub kube_burst: u32,

    /// How long one reconcile pass waits for the search cluster before requeueing
    #[arg(long, env = "READINESS_TIMEOUT_SECS", default_value_t = DEFAULT_READINESS_TIMEOUT_SECS)]
    pub readiness_timeout_secs: u64,

    /// How long in-flight reconciles may take to finish on shutdown
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = 30)]
    pub shutdown_grace_secs: u64,

    /// Log filter (overridden by RUST_LOG)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Rejects values that parse but cannot work.
    pub fn validate(&self) -> Result<(), ControllerError> {
        if self.namespace.trim().is_empty() {
            return Err(ControllerError::InvalidConfig("namespace must not be empty".to_string()));
        }
        if self.workers == 0 {
            return Err(ControllerError::InvalidConfig("workers must be at least 1".to_string()));
        }
        if self.kube_qps == 0 || self.kube_burst == 0 {
            return Err(ControllerError::InvalidConfig(
                "kube-qps and kube-burst must be at least 1".to_string(),
            ));
        }
        if self.webhook_service.trim().is_empty() {
            return Err(ControllerError::InvalidConfig("webhook-service must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Window over which `kube_burst` requests are allowed, giving `kube_qps` on average.
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs_f64(f64::from(self.kube_burst) / f64::from(self.kube_qps.max(1)))
    }
}
