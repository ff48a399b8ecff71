//! Prints the MonitoringInstance CRD as YAML.
//!
//! `cargo run -p crds --bin crdgen > deploy/crd.yaml`

use crds::MonitoringInstance;
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&MonitoringInstance::crd())?);
    Ok(())
}
