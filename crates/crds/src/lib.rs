//! Monitoring Operator CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the monitoring controller.

pub mod error;
pub mod monitoring_instance;
pub mod status;
pub mod validation;

pub use error::*;
pub use monitoring_instance::*;
pub use status::*;
