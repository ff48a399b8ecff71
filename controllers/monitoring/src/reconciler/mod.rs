//! Reconcile loop.
//!
//! Each dequeued key runs one pass: fetch the instance, build its desired
//! state, apply infrastructure groups, consult the dependency gate, apply the
//! gated groups, prune, then publish status. The queue guarantees a key is
//! never handled by two workers at once.

pub mod gate;
pub mod status;

use crate::applier::Applier;
use crate::builder::{build, Component, DesiredState};
use crate::cluster::ClusterClient;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::queue::{KeyHandler, Outcome};
use crate::settings::OperatorSettings;
use crate::watcher::split_key;
use crds::{InstancePhase, MonitoringInstance};
use gate::{DependencyGate, GateStatus};
use status::{next_status, ConditionUpdate, PassResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Delay before re-checking an instance whose dependencies are not ready.
pub const GATE_REQUEUE: Duration = Duration::from_secs(10);

/// In-memory bookkeeping for one instance. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileState {
    pub phase: InstancePhase,
    pub in_flight: bool,
    /// Consecutive failed passes.
    pub retries: u32,
    /// Earliest time a scheduled requeue fires.
    pub next_eligible: Option<Instant>,
}

/// Shared dependencies of every pass.
pub struct Context {
    pub client: Arc<dyn ClusterClient>,
    pub settings: OperatorSettings,
    pub metrics: Metrics,
    pub gate: Arc<dyn DependencyGate>,
}

enum Pass {
    Converged,
    Waiting(String),
    Failed(ControllerError),
}

struct PassReport {
    pass: Pass,
    conditions: Vec<ConditionUpdate>,
}

impl PassReport {
    /// The build failed; every enabled component carries the error.
    fn build_failed(components: &[Component], err: ControllerError) -> Self {
        let conditions = components
            .iter()
            .map(|c| ConditionUpdate::failed(*c, err.reason(), err.to_string()))
            .collect();
        Self {
            pass: Pass::Failed(err),
            conditions,
        }
    }

    /// Group `index` failed; earlier groups applied, later ones never ran.
    fn group_failed(desired: &DesiredState, index: usize, mut conditions: Vec<ConditionUpdate>, err: ControllerError) -> Self {
        let mut rest = desired.groups[index..].iter().map(|g| g.component);
        if let Some(failed) = rest.next() {
            conditions.push(ConditionUpdate::failed(failed, err.reason(), err.to_string()));
        }
        conditions.extend(rest.map(ConditionUpdate::pending));
        Self {
            pass: Pass::Failed(err),
            conditions,
        }
    }
}

pub struct Reconciler {
    ctx: Context,
    states: Mutex<HashMap<String, ReconcileState>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn states(&self) -> MutexGuard<'_, HashMap<String, ReconcileState>> {
        self.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Snapshot of an instance's bookkeeping.
    #[cfg(test)]
    pub fn state(&self, key: &str) -> Option<ReconcileState> {
        self.states().get(key).cloned()
    }

    fn begin(&self, key: &str) {
        self.states().entry(key.to_string()).or_default().in_flight = true;
    }

    fn finish(&self, key: &str, outcome: Outcome) -> Option<ReconcileState> {
        let mut states = self.states();
        let state = states.get_mut(key)?;
        state.in_flight = false;
        match outcome {
            Outcome::Done => {
                state.retries = 0;
                state.next_eligible = None;
            }
            Outcome::Requeue(delay) => state.next_eligible = Some(Instant::now() + delay),
            Outcome::Retry => {
                state.retries = state.retries.saturating_add(1);
                state.next_eligible = None;
            }
        }
        Some(state.clone())
    }

    fn set_phase(&self, key: &str, phase: InstancePhase) {
        if let Some(state) = self.states().get_mut(key) {
            state.phase = phase;
        }
    }

    /// One full pass for `namespace/name`. Returns the queue outcome and a metrics label.
    async fn reconcile(&self, key: &str, namespace: &str, name: &str) -> Result<(Outcome, &'static str), ControllerError> {
        let Some(instance) = self.ctx.client.get_instance(namespace, name).await? else {
            info!("MonitoringInstance deleted: {}", key);
            self.states().remove(key);
            return Ok((Outcome::Done, "deleted"));
        };

        if instance.metadata.deletion_timestamp.is_some() {
            let phase = self.publish(key, &instance, PassResult::Deleting, Vec::new()).await?;
            self.set_phase(key, phase);
            debug!(instance = %key, "Deletion requested, leaving owned objects to garbage collection");
            return Ok((Outcome::Done, "terminating"));
        }

        let report = self.run_pass(&instance, namespace, name).await;
        match report.pass {
            Pass::Failed(e) if e.is_conflict() => {
                debug!(instance = %key, error = %e, "Conflict, requeueing");
                Ok((Outcome::Requeue(Duration::ZERO), "conflict"))
            }
            Pass::Failed(e) if e.is_transient() => {
                warn!(instance = %key, error = %e, "Transient failure");
                Ok((Outcome::Retry, "error"))
            }
            Pass::Failed(e) => {
                error!(instance = %key, reason = e.reason(), "Reconcile failed: {}", e);
                let phase = self.publish(key, &instance, PassResult::Failed, report.conditions).await?;
                self.set_phase(key, phase);
                Ok((Outcome::Retry, "error"))
            }
            Pass::Waiting(reason) => {
                info!(instance = %key, reason = %reason, "Waiting for search cluster");
                let phase = self.publish(key, &instance, PassResult::Waiting, report.conditions).await?;
                self.set_phase(key, phase);
                Ok((Outcome::Requeue(GATE_REQUEUE), "waiting"))
            }
            Pass::Converged => {
                let phase = self.publish(key, &instance, PassResult::Converged, report.conditions).await?;
                self.set_phase(key, phase);
                Ok((Outcome::Done, "success"))
            }
        }
    }

    async fn run_pass(&self, instance: &MonitoringInstance, namespace: &str, name: &str) -> PassReport {
        let desired = match build(instance, &self.ctx.settings) {
            Ok(desired) => desired,
            Err(e) => return PassReport::build_failed(&Component::enabled_in(&instance.spec), e),
        };

        let applier = Applier::new(self.ctx.client.as_ref(), &self.ctx.metrics);
        let mut conditions = Vec::with_capacity(desired.groups.len());
        let mut gate_passed = false;
        for (index, group) in desired.groups.iter().enumerate() {
            if group.component.is_gated() && !gate_passed {
                match self.ctx.gate.check(instance).await {
                    Ok(GateStatus::Ready) => gate_passed = true,
                    Ok(GateStatus::Waiting(reason)) => {
                        conditions.extend(
                            desired.groups[index..]
                                .iter()
                                .map(|g| ConditionUpdate::waiting(g.component, &reason)),
                        );
                        return PassReport {
                            pass: Pass::Waiting(reason),
                            conditions,
                        };
                    }
                    Err(e) => return PassReport::group_failed(&desired, index, conditions, e),
                }
            }

            match applier.apply_group(group).await {
                Ok(summary) if summary.writes() > 0 => {
                    info!(
                        "{} applied for {}/{}: {} created, {} updated",
                        group.component, namespace, name, summary.created, summary.updated
                    );
                }
                Ok(_) => {}
                Err(e) => return PassReport::group_failed(&desired, index, conditions, e),
            }
            conditions.push(ConditionUpdate::applied(group.component));
        }

        let owner_uid = instance.metadata.uid.as_deref().unwrap_or_default();
        let pass = match applier.prune(namespace, name, owner_uid, &desired.keys()).await {
            Ok(0) => Pass::Converged,
            Ok(pruned) => {
                info!("Pruned {} object(s) no longer desired by {}/{}", pruned, namespace, name);
                Pass::Converged
            }
            Err(e) => Pass::Failed(e),
        };
        PassReport { pass, conditions }
    }

    /// Patches status unless it would not change. Returns the published phase.
    async fn publish(
        &self,
        key: &str,
        instance: &MonitoringInstance,
        result: PassResult,
        conditions: Vec<ConditionUpdate>,
    ) -> Result<InstancePhase, ControllerError> {
        let previous = instance.status.as_ref();
        let status = next_status(previous, instance.metadata.generation, result, conditions, chrono::Utc::now());
        if previous == Some(&status) {
            debug!(instance = %key, "Status unchanged");
            return Ok(status.phase);
        }

        let (namespace, name) = split_key(key)?;
        self.ctx.client.patch_instance_status(namespace, name, &status).await?;
        let before = previous.map(|s| s.phase).unwrap_or_default();
        if before != status.phase {
            info!(instance = %key, from = %before, to = %status.phase, "Phase changed");
        }
        Ok(status.phase)
    }
}

#[async_trait::async_trait]
impl KeyHandler for Reconciler {
    async fn handle(&self, key: &str) -> Outcome {
        let started = Instant::now();
        let (namespace, name) = match split_key(key) {
            Ok(parts) => parts,
            Err(e) => {
                error!("Dropping key: {}", e);
                return Outcome::Done;
            }
        };

        self.begin(key);
        let (outcome, result) = match self.reconcile(key, namespace, name).await {
            Ok(done) => done,
            Err(e) if e.is_conflict() => {
                debug!(instance = %key, error = %e, "Conflict, requeueing");
                (Outcome::Requeue(Duration::ZERO), "conflict")
            }
            Err(e) => {
                warn!(instance = %key, error = %e, "Reconcile error");
                (Outcome::Retry, "error")
            }
        };
        if let Some(state) = self.finish(key, outcome) {
            debug!(
                instance = %key,
                phase = %state.phase,
                in_flight = state.in_flight,
                retries = state.retries,
                next_eligible = ?state.next_eligible,
                "Reconcile finished"
            );
        }
        self.ctx.metrics.observe_reconcile(result, started.elapsed());
        outcome
    }
}
