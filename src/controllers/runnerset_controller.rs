/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/runnerset_controller.rs
*
* This file implements the reconciliation logic for the RunnerSet custom
* resource: the control loop that drives the actual number of ephemeral
* runner pods toward the demand observed on the external job source's
* workflow queue, within the configured minimum/maximum bounds.
*
* Architecture:
* The controller follows the standard Kubernetes operator pattern, driven by
* a reconcile loop that seeks to bring the cluster's actual state in line
* with the desired state defined by the RunnerSet resource and the observed
* queue depth.
*
* Core Logic:
* - `reconcile`: the entry point. It wraps the pass in the kube-rs finalizer
*   helper so that deleting a RunnerSet triggers a full drain of its pods
*   before the object is released.
* - One pass per group: the poller observes the queue, the calculator maps
*   the observation to a desired replica count, and the pod manager creates
*   or removes runners to match. Groups reconcile independently and
*   concurrently; passes for a single group are serialized by the controller
*   runtime, which never runs two reconciliations for the same object key at
*   once.
* - The group's control-loop phase {Idle, Scaling, Draining, Error} is
*   derived from the pass outcome and persisted in the status subresource
*   via a server-side apply patch, alongside replica accounting, the last
*   reconcile timestamp, and the last error.
* - Failure handling: errors inside a pass never bubble into the controller
*   runtime. A failed pass records the Error phase with a condition naming
*   the failure class and requeues with an exponential backoff that doubles
*   per consecutive failure up to a configured ceiling, resetting on the
*   first success. Permanent failures (revoked credential, malformed
*   template) keep the group in Error until the operator intervenes, without
*   affecting other groups.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::config::OperatorConfig;
use crate::controllers::pod_manager::{
    replica_counts, runner_phase, scale_down_candidates, validate_spec, PodError, PodManager,
    ReplicaCounts, RunnerPhase,
};
use crate::controllers::queue_poller::{PollError, QueuePoller};
use crate::controllers::scaling::desired_replicas;
use crate::controllers::token_broker::{TokenBroker, TokenError};
use crate::crds::{RunnerSet, RunnerSetPhase, RunnerSetStatus, StatusCondition};
use crate::metrics;
use chrono::Utc;
use kube::{
    api::{Api, Patch, PatchParams},
    client::Client,
    runtime::{
        controller::Action,
        finalizer::{finalizer, Event as FinalizerEvent},
    },
    ResourceExt,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

// The unique identifier for our controller's finalizer.
pub const RUNNER_SET_FINALIZER: &str = "runners.forgeci.io/finalizer";

const STATUS_MANAGER: &str = "runnerset-operator";

// --- Custom Error Types ---

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Finalizer error: {0}")]
    Finalizer(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    Pod(#[from] PodError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Poll(#[from] PollError),

    #[error("missing object key '{0}' in resource")]
    MissingObjectKey(&'static str),
}

impl Error {
    /// Permanent failures require operator intervention; retrying cannot fix
    /// them. Everything else is transient or resource pressure and is
    /// retried with backoff.
    fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::Pod(PodError::InvalidSpec(_)) | Error::Token(TokenError::Auth(_))
        )
    }

    /// The condition type surfaced in the status subresource.
    fn condition_type(&self) -> &'static str {
        match self {
            Error::Token(TokenError::Auth(_)) => "AuthError",
            Error::Token(TokenError::RateLimited { .. }) => "RateLimited",
            Error::Pod(PodError::InvalidSpec(_)) => "InvalidSpec",
            Error::Pod(PodError::QuotaExceeded(_)) => "QuotaExceeded",
            Error::Poll(_) => "QueueUnavailable",
            _ => "ReconcileError",
        }
    }
}

// --- Controller Context ---

/// The context shared by every reconciliation pass.
pub struct Context {
    pub client: Client,
    pub config: OperatorConfig,
    pub poller: QueuePoller,
    pub broker: TokenBroker,
    pub pods: PodManager,
    /// Consecutive failed passes per RunnerSet, feeding the backoff.
    failures: RwLock<HashMap<String, u32>>,
}

impl Context {
    pub fn new(
        client: Client,
        config: OperatorConfig,
        poller: QueuePoller,
        broker: TokenBroker,
        pods: PodManager,
    ) -> Self {
        Self {
            client,
            config,
            poller,
            broker,
            pods,
            failures: RwLock::new(HashMap::new()),
        }
    }
}

fn set_key(set: &RunnerSet) -> String {
    format!("{}/{}", set.namespace().unwrap_or_default(), set.name_any())
}

// --- Reconciler Implementation ---

/// Main reconciliation function for the RunnerSet resource.
#[instrument(skip(set, ctx), fields(runner_set = %set.name_any()))]
pub async fn reconcile(set: Arc<RunnerSet>, ctx: Arc<Context>) -> Result<Action, Error> {
    let timer = metrics::RECONCILE_DURATION_SECONDS.start_timer();
    let ns = set.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
    let api: Api<RunnerSet> = Api::namespaced(ctx.client.clone(), &ns);

    let result = finalizer(&api, RUNNER_SET_FINALIZER, set, |event| async {
        match event {
            FinalizerEvent::Apply(set) => apply(set, ctx.clone()).await,
            FinalizerEvent::Cleanup(set) => cleanup(set, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)));

    timer.observe_duration();
    result
}

/// Defines the action to take when reconciliation fails outside the pass
/// itself (finalizer plumbing, status writes). Pass-level failures carry
/// their own backoff and never reach here.
pub fn error_policy(set: Arc<RunnerSet>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(runner_set = %set.name_any(), error = %error, "Reconciliation failed");
    Action::requeue(Duration::from_secs(15))
}

/// One full scaling pass plus status bookkeeping. A failed pass records the
/// Error phase and requeues with backoff rather than surfacing the error to
/// the controller runtime.
async fn apply(set: Arc<RunnerSet>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = set_key(&set);

    match run_scaling_pass(&set, &ctx).await {
        Ok(outcome) => {
            ctx.failures.write().await.remove(&key);
            publish_status(&set, &ctx, &outcome).await?;

            info!(
                desired = outcome.desired,
                current = outcome.counts.current,
                busy = outcome.counts.busy,
                phase = ?outcome.phase,
                "Reconciled runner set"
            );
            Ok(Action::requeue(poll_interval_for(&set, &ctx)))
        }
        Err(e) => {
            let failures = {
                let mut failures = ctx.failures.write().await;
                let entry = failures.entry(key).or_insert(0);
                *entry = entry.saturating_add(1);
                *entry
            };

            let delay = backoff_delay(failures, ctx.config.backoff_base, ctx.config.backoff_cap);
            warn!(
                error = %e,
                permanent = e.is_permanent(),
                failures,
                retry_in_secs = delay.as_secs(),
                "Scaling pass failed"
            );

            if let Err(status_err) = publish_error_status(&set, &ctx, &e).await {
                warn!(error = %status_err, "Failed to record error status");
            }

            Ok(Action::requeue(delay))
        }
    }
}

/// Tears the group down when its RunnerSet is deleted. Every pod deletion
/// is driven to completion before the finalizer releases the object, so no
/// deletion is left half-issued.
async fn cleanup(set: Arc<RunnerSet>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = set.name_any();
    info!(runner_set = %name, "RunnerSet deleted; draining runner pods");

    let namespace = set.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
    let pods = ctx.pods.list_for(&set).await?;
    for pod in &pods {
        ctx.pods.delete(&namespace, &pod.name_any(), "set_deleted").await?;
    }

    ctx.failures.write().await.remove(&set_key(&set));
    let _ = metrics::RUNNER_SET_DESIRED_REPLICAS.remove_label_values(&[name.as_str()]);
    let _ = metrics::RUNNER_SET_CURRENT_REPLICAS.remove_label_values(&[name.as_str()]);

    Ok(Action::await_change())
}

// --- The scaling pass ---

struct PassOutcome {
    desired: i32,
    counts: ReplicaCounts,
    queue_degraded: bool,
    queue_stale: bool,
    phase: RunnerSetPhase,
}

/// Derives the control-loop phase from the replica accounting after a pass.
fn next_phase(desired: i32, counts: &ReplicaCounts) -> RunnerSetPhase {
    if counts.terminating > 0 || counts.current > desired {
        RunnerSetPhase::Draining
    } else if counts.current < desired || counts.registering > 0 {
        RunnerSetPhase::Scaling
    } else {
        RunnerSetPhase::Idle
    }
}

async fn run_scaling_pass(set: &RunnerSet, ctx: &Context) -> Result<PassOutcome, Error> {
    validate_spec(set)?;

    let identity = set.spec.identity();
    let snapshot = ctx.poller.observe(&identity).await?;
    if snapshot.is_stale() {
        warn!(
            group = %identity,
            stale_for = ?snapshot.stale_for,
            "Scaling from a stale queue observation"
        );
    }

    let desired = desired_replicas(
        snapshot.queued,
        snapshot.in_progress,
        set.spec.min_replicas,
        set.spec.max_replicas,
    );

    let pods = ctx.pods.list_for(set).await?;
    let counts = replica_counts(&pods);
    let namespace = set.namespace().ok_or(Error::MissingObjectKey("namespace"))?;

    if counts.current < desired {
        // Scale up: one freshly minted single-use token per new pod, so no
        // two live pods ever share a registration token.
        let missing = desired - counts.current;
        info!(missing, desired, current = counts.current, "Scaling up");
        for _ in 0..missing {
            let minted = ctx.broker.mint(&identity).await?;
            ctx.pods.create(set, &minted).await?;
        }
    } else if counts.current > desired {
        let excess = (counts.current - desired) as usize;
        let policy = set.spec.scale_down_policy.unwrap_or_default();
        let candidates = scale_down_candidates(&pods, policy, excess);
        info!(
            excess,
            selected = candidates.len(),
            ?policy,
            "Scaling down"
        );
        for pod in candidates {
            let pod_name = pod.name_any();
            ctx.pods.mark_draining(&namespace, &pod_name).await?;
            ctx.pods.delete(&namespace, &pod_name, "scale_down").await?;
        }
    }

    // Completed runners (one job each) are cleared out so the set converges
    // back to live pods only.
    for pod in &pods {
        if matches!(runner_phase(pod), RunnerPhase::Terminated | RunnerPhase::Failed) {
            ctx.pods.delete(&namespace, &pod.name_any(), "completed").await?;
        }
    }

    // Re-list so the published status reflects the pass's own actions.
    let pods = ctx.pods.list_for(set).await?;
    let counts = replica_counts(&pods);

    Ok(PassOutcome {
        desired,
        counts,
        queue_degraded: snapshot.degraded,
        queue_stale: snapshot.is_stale(),
        phase: next_phase(desired, &counts),
    })
}

fn poll_interval_for(set: &RunnerSet, ctx: &Context) -> Duration {
    set.spec
        .poll_interval_seconds
        .map(Duration::from_secs)
        .unwrap_or(ctx.config.poll_interval)
}

/// Doubles per consecutive failure, capped at the configured ceiling.
fn backoff_delay(consecutive_failures: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(16);
    base.saturating_mul(2u32.saturating_pow(exponent)).min(cap)
}

// --- Status updates ---

/// Patches the status subresource via server-side apply, retrying once on a
/// write conflict.
async fn patch_status(set: &RunnerSet, ctx: &Context, status: RunnerSetStatus) -> Result<(), Error> {
    let namespace = set.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
    let api: Api<RunnerSet> = Api::namespaced(ctx.client.clone(), &namespace);

    let patch = Patch::Apply(serde_json::json!({
        "apiVersion": "runners.forgeci.io/v1alpha1",
        "kind": "RunnerSet",
        "status": status,
    }));
    let ps = PatchParams::apply(STATUS_MANAGER).force();

    for attempt in 0..2 {
        match api.patch_status(&set.name_any(), &ps, &patch).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 && attempt == 0 => {
                warn!(runner_set = %set.name_any(), "Status write conflict; retrying");
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

async fn publish_status(set: &RunnerSet, ctx: &Context, outcome: &PassOutcome) -> Result<(), Error> {
    let name = set.name_any();

    metrics::RUNNER_SET_DESIRED_REPLICAS
        .with_label_values(&[name.as_str()])
        .set(outcome.desired as i64);
    metrics::RUNNER_SET_CURRENT_REPLICAS
        .with_label_values(&[name.as_str()])
        .set(outcome.counts.current as i64);

    let mut conditions = vec![StatusCondition::new(
        format!("{:?}", outcome.phase),
        "Reconciliation succeeded".to_string(),
    )];
    if outcome.queue_stale {
        conditions.push(StatusCondition::new(
            "QueueStale".to_string(),
            "Queue observation served from cache; job source unreachable".to_string(),
        ));
    }

    let status = RunnerSetStatus {
        phase: Some(outcome.phase),
        current_replicas: outcome.counts.current,
        desired_replicas: outcome.desired,
        busy_replicas: outcome.counts.busy,
        idle_replicas: outcome.counts.idle,
        last_reconcile_time: Some(Utc::now().to_rfc3339()),
        last_error: None,
        queue_degraded: outcome.queue_degraded,
        observed_generation: set.metadata.generation,
        conditions,
    };

    patch_status(set, ctx, status).await
}

/// Status always reflects last-known-good replica accounting plus an
/// explicit error condition; degradation is never silently hidden.
async fn publish_error_status(set: &RunnerSet, ctx: &Context, error: &Error) -> Result<(), Error> {
    let previous = set.status.clone().unwrap_or_default();

    let status = RunnerSetStatus {
        phase: Some(RunnerSetPhase::Error),
        last_reconcile_time: Some(Utc::now().to_rfc3339()),
        last_error: Some(error.to_string()),
        observed_generation: set.metadata.generation,
        conditions: vec![StatusCondition::new(
            error.condition_type().to_string(),
            error.to_string(),
        )],
        ..previous
    };

    patch_status(set, ctx, status).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_secs(5);
        let cap = Duration::from_secs(300);

        assert_eq!(backoff_delay(1, base, cap), Duration::from_secs(5));
        assert_eq!(backoff_delay(2, base, cap), Duration::from_secs(10));
        assert_eq!(backoff_delay(3, base, cap), Duration::from_secs(20));
        assert_eq!(backoff_delay(4, base, cap), Duration::from_secs(40));
        // Growth stops at the ceiling.
        assert_eq!(backoff_delay(8, base, cap), cap);
        assert_eq!(backoff_delay(30, base, cap), cap);
    }

    #[test]
    fn test_backoff_zero_failures_is_base() {
        let base = Duration::from_secs(5);
        assert_eq!(backoff_delay(0, base, Duration::from_secs(300)), base);
    }

    #[test]
    fn test_error_classification() {
        let auth = Error::Token(TokenError::Auth(401));
        assert!(auth.is_permanent());
        assert_eq!(auth.condition_type(), "AuthError");

        let invalid = Error::Pod(PodError::InvalidSpec("bad".to_string()));
        assert!(invalid.is_permanent());
        assert_eq!(invalid.condition_type(), "InvalidSpec");

        let rate_limited = Error::Token(TokenError::RateLimited { retry_after: None });
        assert!(!rate_limited.is_permanent());
        assert_eq!(rate_limited.condition_type(), "RateLimited");

        let quota = Error::Pod(PodError::QuotaExceeded("limit".to_string()));
        assert!(!quota.is_permanent());
        assert_eq!(quota.condition_type(), "QuotaExceeded");

        let poll = Error::Poll(PollError::NoSnapshot("orgs/acme/default".to_string()));
        assert!(!poll.is_permanent());
        assert_eq!(poll.condition_type(), "QueueUnavailable");
    }

    #[test]
    fn test_next_phase_transitions() {
        let settled = ReplicaCounts {
            current: 3,
            busy: 1,
            idle: 2,
            registering: 0,
            terminating: 0,
        };
        assert_eq!(next_phase(3, &settled), RunnerSetPhase::Idle);

        // desired != current -> Scaling
        assert_eq!(next_phase(5, &settled), RunnerSetPhase::Scaling);

        // new pods still registering keep the set in Scaling
        let registering = ReplicaCounts {
            current: 3,
            busy: 0,
            idle: 1,
            registering: 2,
            terminating: 0,
        };
        assert_eq!(next_phase(3, &registering), RunnerSetPhase::Scaling);

        // scale-down in progress -> Draining
        assert_eq!(next_phase(2, &settled), RunnerSetPhase::Draining);
        let draining = ReplicaCounts {
            current: 2,
            busy: 1,
            idle: 1,
            registering: 0,
            terminating: 1,
        };
        assert_eq!(next_phase(2, &draining), RunnerSetPhase::Draining);
    }
}
