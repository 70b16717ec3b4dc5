/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/pod_manager.rs
*
* This module owns the lifecycle of ephemeral runner pods: building their
* specifications from the RunnerSet template, creating and deleting them, and
* garbage-collecting orphans. Each runner pod executes exactly one job and
* then terminates (restartPolicy Never, ephemeral agent mode), so the pod is
* the unit of scaling.
*
* Architecture:
* - `build_runner_pod` translates the structurally-validated template into a
*   full Pod: the runner agent container, an optional privileged isolation
*   sidecar sharing the work volume, the single-use registration token as an
*   environment variable, and the labels/annotations the reconciler and the
*   reaper navigate by.
* - Runner lifecycle phases are not stored anywhere; they are derived on
*   demand from the pod's Kubernetes status plus the annotations the runner
*   agent maintains (`registered`, `busy`, `last-busy-at`).
* - Scale-down candidate selection is a pure function: unregistered pods go
*   first (they have never held a job), then idle pods ordered by the set's
*   policy. Busy pods are never candidates; their removal waits until they
*   finish, which permits transient overshoot during a drain.
* - `reap_orphans` runs on its own interval, independent of reconciliation,
*   and removes pods whose owning RunnerSet no longer exists as well as pods
*   whose registration token expired before the runner ever registered.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::controllers::token_broker::MintedToken;
use crate::crds::{RunnerSet, ScaleDownPolicy};
use crate::metrics;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, Pod, PodSpec, SecurityContext, Toleration, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams},
    Client, Resource, ResourceExt,
};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

// Label and annotation vocabulary shared with the reconciler and the runner
// agent image.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "runnerset-operator";
pub const RUNNER_SET_LABEL: &str = "runners.forgeci.io/runner-set";
pub const TOKEN_EXPIRES_ANNOTATION: &str = "runners.forgeci.io/token-expires-at";
pub const REGISTERED_ANNOTATION: &str = "runners.forgeci.io/registered";
pub const BUSY_ANNOTATION: &str = "runners.forgeci.io/busy";
pub const LAST_BUSY_ANNOTATION: &str = "runners.forgeci.io/last-busy-at";
pub const DRAIN_ANNOTATION: &str = "runners.forgeci.io/drain";

const WORK_VOLUME: &str = "work";
const WORK_MOUNT_PATH: &str = "/home/runner/_work";

#[derive(Debug, Error)]
pub enum PodError {
    #[error("cluster rejected pod scheduling due to resource quota: {0}")]
    QuotaExceeded(String),

    #[error("invalid runner template: {0}")]
    InvalidSpec(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// The lifecycle phase of one ephemeral runner pod, derived from Kubernetes
/// pod status plus the annotations the runner agent maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerPhase {
    /// Scheduled but containers not yet running.
    Pending,
    /// Running, but the agent has not completed registration yet.
    Registering,
    /// Registered and waiting for a job.
    Idle,
    /// Executing a job. Never deleted by scale-down.
    Busy,
    /// Deletion requested, containers shutting down.
    Terminating,
    /// Ran its one job and exited.
    Terminated,
    /// The pod failed before or during its job.
    Failed,
}

impl RunnerPhase {
    /// Whether this pod counts toward the set's current replicas.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            RunnerPhase::Pending | RunnerPhase::Registering | RunnerPhase::Idle | RunnerPhase::Busy
        )
    }
}

/// Derives the runner phase from the pod object.
pub fn runner_phase(pod: &Pod) -> RunnerPhase {
    if pod.metadata.deletion_timestamp.is_some() {
        return RunnerPhase::Terminating;
    }

    match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Succeeded") => RunnerPhase::Terminated,
        Some("Failed") => RunnerPhase::Failed,
        Some("Running") => {
            let annotations = pod.annotations();
            if annotations.get(BUSY_ANNOTATION).map(String::as_str) == Some("true") {
                RunnerPhase::Busy
            } else if annotations.get(REGISTERED_ANNOTATION).map(String::as_str) == Some("true") {
                RunnerPhase::Idle
            } else {
                RunnerPhase::Registering
            }
        }
        _ => RunnerPhase::Pending,
    }
}

/// Replica accounting over a set's pods, consumed by status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicaCounts {
    pub current: i32,
    pub busy: i32,
    pub idle: i32,
    pub registering: i32,
    pub terminating: i32,
}

pub fn replica_counts(pods: &[Pod]) -> ReplicaCounts {
    let mut counts = ReplicaCounts::default();
    for pod in pods {
        let phase = runner_phase(pod);
        if phase.is_live() {
            counts.current += 1;
        }
        match phase {
            RunnerPhase::Busy => counts.busy += 1,
            RunnerPhase::Idle => counts.idle += 1,
            RunnerPhase::Pending | RunnerPhase::Registering => counts.registering += 1,
            RunnerPhase::Terminating => counts.terminating += 1,
            _ => {}
        }
    }
    counts
}

/// Validates the user-supplied spec before any pods are built from it.
pub fn validate_spec(set: &RunnerSet) -> Result<(), PodError> {
    let spec = &set.spec;

    if spec.template.image.trim().is_empty() {
        return Err(PodError::InvalidSpec("runner image must not be empty".to_string()));
    }
    if let Some(sidecar) = &spec.template.sidecar {
        if sidecar.image.trim().is_empty() {
            return Err(PodError::InvalidSpec("sidecar image must not be empty".to_string()));
        }
    }
    if spec.min_replicas < 0 {
        return Err(PodError::InvalidSpec("minReplicas must not be negative".to_string()));
    }
    if spec.max_replicas < spec.min_replicas {
        return Err(PodError::InvalidSpec(format!(
            "maxReplicas ({}) must be >= minReplicas ({})",
            spec.max_replicas, spec.min_replicas
        )));
    }
    if spec.target.trim().is_empty() || spec.group.trim().is_empty() {
        return Err(PodError::InvalidSpec("target and group must not be empty".to_string()));
    }

    Ok(())
}

fn quantities(map: &BTreeMap<String, String>) -> BTreeMap<String, Quantity> {
    map.iter()
        .map(|(k, v)| (k.clone(), Quantity(v.clone())))
        .collect()
}

/// Builds the Pod object for one new runner, carrying its single-use
/// registration token. The token goes only into the pod environment.
pub fn build_runner_pod(set: &RunnerSet, minted: &MintedToken) -> Result<Pod, PodError> {
    let name = set.name_any();
    let namespace = set
        .namespace()
        .ok_or_else(|| PodError::InvalidSpec("RunnerSet has no namespace".to_string()))?;
    let owner_ref = set
        .controller_owner_ref(&())
        .ok_or_else(|| PodError::InvalidSpec("RunnerSet has no uid yet".to_string()))?;

    let template = &set.spec.template;
    let identity = set.spec.identity();

    let mut env = vec![
        EnvVar {
            name: "RUNNER_TOKEN".to_string(),
            value: Some(minted.token.expose().to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "RUNNER_SCOPE".to_string(),
            value: Some(identity.api_path()),
            ..Default::default()
        },
        EnvVar {
            name: "RUNNER_GROUP".to_string(),
            value: Some(identity.group.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "RUNNER_EPHEMERAL".to_string(),
            value: Some("true".to_string()),
            ..Default::default()
        },
    ];
    for (key, value) in &template.env {
        env.push(EnvVar {
            name: key.clone(),
            value: Some(value.clone()),
            ..Default::default()
        });
    }

    let work_mount = VolumeMount {
        name: WORK_VOLUME.to_string(),
        mount_path: WORK_MOUNT_PATH.to_string(),
        ..Default::default()
    };

    let mut containers = vec![Container {
        name: "runner".to_string(),
        image: Some(template.image.clone()),
        env: Some(env),
        volume_mounts: Some(vec![work_mount.clone()]),
        resources: Some(k8s_openapi::api::core::v1::ResourceRequirements {
            requests: (!template.requests.is_empty()).then(|| quantities(&template.requests)),
            limits: (!template.limits.is_empty()).then(|| quantities(&template.limits)),
            ..Default::default()
        }),
        ..Default::default()
    }];

    if let Some(sidecar) = &template.sidecar {
        containers.push(Container {
            name: "isolation".to_string(),
            image: Some(sidecar.image.clone()),
            security_context: sidecar.privileged.then(|| SecurityContext {
                privileged: Some(true),
                ..Default::default()
            }),
            volume_mounts: Some(vec![work_mount]),
            ..Default::default()
        });
    }

    let mut volumes = vec![Volume {
        name: WORK_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }];
    for raw in &template.volumes {
        let volume: Volume = serde_json::from_value(raw.clone())
            .map_err(|e| PodError::InvalidSpec(format!("malformed volume: {}", e)))?;
        volumes.push(volume);
    }

    // Tolerations pass through opaquely; only their structure is checked.
    let tolerations = template
        .tolerations
        .iter()
        .map(|raw| {
            serde_json::from_value::<Toleration>(raw.clone())
                .map_err(|e| PodError::InvalidSpec(format!("malformed toleration: {}", e)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let pod = Pod {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-runner-", name)),
            namespace: Some(namespace),
            owner_references: Some(vec![owner_ref]),
            labels: Some(BTreeMap::from([
                (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
                (RUNNER_SET_LABEL.to_string(), name),
            ])),
            annotations: Some(BTreeMap::from([(
                TOKEN_EXPIRES_ANNOTATION.to_string(),
                minted.expires_at.to_rfc3339(),
            )])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers,
            volumes: Some(volumes),
            restart_policy: Some("Never".to_string()),
            service_account_name: template.service_account.clone(),
            node_selector: (!template.node_selector.is_empty())
                .then(|| template.node_selector.clone()),
            tolerations: (!tolerations.is_empty()).then_some(tolerations),
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok(pod)
}

fn creation_time(pod: &Pod) -> DateTime<Utc> {
    pod.metadata
        .creation_timestamp
        .as_ref()
        .map(|t| t.0)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn last_busy_time(pod: &Pod) -> DateTime<Utc> {
    pod.annotations()
        .get(LAST_BUSY_ANNOTATION)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Selects up to `excess` pods to remove when scaling down.
///
/// Unregistered pods (Pending/Registering) are removed first: they have
/// never held a job, so deleting them only wastes a token. Idle pods follow,
/// ordered by the set's policy. Busy pods are never selected; if demand
/// drops below the busy count, the surplus drains after those jobs finish.
pub fn scale_down_candidates(
    pods: &[Pod],
    policy: ScaleDownPolicy,
    excess: usize,
) -> Vec<&Pod> {
    let mut unregistered: Vec<&Pod> = Vec::new();
    let mut idle: Vec<&Pod> = Vec::new();

    for pod in pods {
        match runner_phase(pod) {
            RunnerPhase::Pending | RunnerPhase::Registering => unregistered.push(pod),
            RunnerPhase::Idle => idle.push(pod),
            _ => {}
        }
    }

    unregistered.sort_by_key(|p| creation_time(p));
    match policy {
        ScaleDownPolicy::OldestIdleFirst => idle.sort_by_key(|p| creation_time(p)),
        ScaleDownPolicy::LeastRecentlyBusyFirst => idle.sort_by_key(|p| last_busy_time(p)),
    }

    unregistered
        .into_iter()
        .chain(idle)
        .take(excess)
        .collect()
}

/// Creates, deletes, lists, and garbage-collects runner pods.
#[derive(Clone)]
pub struct PodManager {
    client: Client,
}

impl PodManager {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods_in(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Creates one runner pod from the set's template. A quota rejection
    /// from the API server maps to `QuotaExceeded` so the reconciler can
    /// retry it at a reduced rate instead of treating it as fatal.
    pub async fn create(&self, set: &RunnerSet, minted: &MintedToken) -> Result<Pod, PodError> {
        validate_spec(set)?;
        let pod = build_runner_pod(set, minted)?;
        let namespace = set
            .namespace()
            .ok_or_else(|| PodError::InvalidSpec("RunnerSet has no namespace".to_string()))?;

        match self.pods_in(&namespace).create(&PostParams::default(), &pod).await {
            Ok(created) => {
                metrics::RUNNER_PODS_CREATED_TOTAL
                    .with_label_values(&[set.name_any().as_str()])
                    .inc();
                info!(
                    runner_set = %set.name_any(),
                    pod = %created.name_any(),
                    "Created runner pod"
                );
                Ok(created)
            }
            Err(kube::Error::Api(ae)) if ae.code == 403 && ae.message.contains("quota") => {
                Err(PodError::QuotaExceeded(ae.message))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes a runner pod. Idempotent: deleting an already-gone pod
    /// succeeds silently.
    pub async fn delete(&self, namespace: &str, name: &str, reason: &str) -> Result<(), PodError> {
        match self.pods_in(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                metrics::RUNNER_PODS_DELETED_TOTAL
                    .with_label_values(&[reason])
                    .inc();
                debug!(pod = %name, reason = %reason, "Deleted runner pod");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(pod = %name, "Runner pod already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Marks a pod as draining before deletion so an in-flight registration
    /// can abort instead of picking up a job.
    pub async fn mark_draining(&self, namespace: &str, name: &str) -> Result<(), PodError> {
        let patch = serde_json::json!({
            "metadata": { "annotations": { DRAIN_ANNOTATION: "true" } }
        });
        match self
            .pods_in(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists the pods belonging to one RunnerSet.
    pub async fn list_for(&self, set: &RunnerSet) -> Result<Vec<Pod>, PodError> {
        let namespace = set
            .namespace()
            .ok_or_else(|| PodError::InvalidSpec("RunnerSet has no namespace".to_string()))?;
        let selector = format!(
            "{}={},{}={}",
            MANAGED_BY_LABEL,
            MANAGED_BY_VALUE,
            RUNNER_SET_LABEL,
            set.name_any()
        );
        let pods = self
            .pods_in(&namespace)
            .list(&ListParams::default().labels(&selector))
            .await?;
        Ok(pods.items)
    }

    /// Garbage-collects pods whose owning RunnerSet no longer exists and
    /// pods whose registration token expired before the runner registered.
    /// Runs on a fixed interval, independent of reconciliation.
    pub async fn reap_orphans(&self) -> Result<u32, PodError> {
        let all_pods: Api<Pod> = Api::all(self.client.clone());
        let selector = format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE);
        let pods = all_pods.list(&ListParams::default().labels(&selector)).await?;

        let now = Utc::now();
        let mut reaped = 0u32;

        for pod in pods.items {
            let Some(namespace) = pod.namespace() else { continue };
            let name = pod.name_any();

            if self.owner_is_gone(&pod, &namespace).await? {
                warn!(pod = %name, "Reaping pod whose RunnerSet is gone");
                self.delete(&namespace, &name, "orphaned").await?;
                reaped += 1;
                continue;
            }

            if token_expired_unregistered(&pod, now) {
                warn!(pod = %name, "Reaping pod whose registration token expired unused");
                self.delete(&namespace, &name, "token_expired").await?;
                reaped += 1;
            }
        }

        Ok(reaped)
    }

    async fn owner_is_gone(&self, pod: &Pod, namespace: &str) -> Result<bool, PodError> {
        let Some(set_name) = pod.labels().get(RUNNER_SET_LABEL) else {
            // Not one of ours after all; leave it alone.
            return Ok(false);
        };
        let sets: Api<RunnerSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(sets.get_opt(set_name).await?.is_none())
    }
}

/// True for a pod that never completed registration and whose token has
/// already expired: it can never become a runner.
fn token_expired_unregistered(pod: &Pod, now: DateTime<Utc>) -> bool {
    let phase = runner_phase(pod);
    if !matches!(phase, RunnerPhase::Pending | RunnerPhase::Registering) {
        return false;
    }
    pod.annotations()
        .get(TOKEN_EXPIRES_ANNOTATION)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|expires| expires.with_timezone(&Utc) < now)
        .unwrap_or(false)
}

/// Background loop driving `reap_orphans` on a fixed interval.
pub async fn run_orphan_reaper(manager: PodManager, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match manager.reap_orphans().await {
            Ok(0) => debug!("Orphan reaper pass found nothing to do"),
            Ok(reaped) => info!(reaped, "Orphan reaper removed pods"),
            Err(e) => warn!(error = %e, "Orphan reaper pass failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::token_broker::{MintedToken, RegistrationToken};
    use crate::crds::{RunnerPodTemplate, RunnerScope, RunnerSetSpec, SidecarSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn create_test_template() -> RunnerPodTemplate {
        RunnerPodTemplate {
            image: "forgeci/runner:2.317.0".to_string(),
            sidecar: Some(SidecarSpec {
                image: "docker:27-dind".to_string(),
                privileged: true,
            }),
            requests: BTreeMap::from([("cpu".to_string(), "500m".to_string())]),
            limits: BTreeMap::from([("memory".to_string(), "2Gi".to_string())]),
            env: BTreeMap::from([("RUNNER_LABELS".to_string(), "linux,x64".to_string())]),
            node_selector: BTreeMap::new(),
            tolerations: vec![],
            volumes: vec![],
            service_account: None,
        }
    }

    fn create_test_set() -> RunnerSet {
        let mut set = RunnerSet::new(
            "ci-pool",
            RunnerSetSpec {
                scope: RunnerScope::Organization,
                target: "acme".to_string(),
                group: "default".to_string(),
                min_replicas: 1,
                max_replicas: 10,
                template: create_test_template(),
                scale_down_policy: None,
                poll_interval_seconds: None,
            },
        );
        set.metadata.namespace = Some("ci".to_string());
        set.metadata.uid = Some("11111111-2222-3333-4444-555555555555".to_string());
        set
    }

    fn create_test_token() -> MintedToken {
        MintedToken {
            token: RegistrationToken::new("REG123".to_string()),
            expires_at: Utc::now() + chrono::Duration::minutes(60),
        }
    }

    fn create_test_pod(
        name: &str,
        created_secs_ago: i64,
        phase: &str,
        annotations: &[(&str, &str)],
    ) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.namespace = Some("ci".to_string());
        pod.metadata.creation_timestamp =
            Some(Time(Utc::now() - chrono::Duration::seconds(created_secs_ago)));
        pod.metadata.annotations = Some(
            annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        pod.status = Some(k8s_openapi::api::core::v1::PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        });
        pod
    }

    fn idle_pod(name: &str, created_secs_ago: i64) -> Pod {
        create_test_pod(name, created_secs_ago, "Running", &[(REGISTERED_ANNOTATION, "true")])
    }

    fn busy_pod(name: &str, created_secs_ago: i64) -> Pod {
        create_test_pod(
            name,
            created_secs_ago,
            "Running",
            &[(REGISTERED_ANNOTATION, "true"), (BUSY_ANNOTATION, "true")],
        )
    }

    #[test]
    fn test_build_runner_pod() {
        let set = create_test_set();
        let pod = build_runner_pod(&set, &create_test_token()).unwrap();

        assert_eq!(pod.metadata.generate_name, Some("ci-pool-runner-".to_string()));
        assert_eq!(pod.metadata.namespace, Some("ci".to_string()));

        let labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(MANAGED_BY_LABEL), Some(&MANAGED_BY_VALUE.to_string()));
        assert_eq!(labels.get(RUNNER_SET_LABEL), Some(&"ci-pool".to_string()));
        assert!(pod
            .metadata
            .annotations
            .as_ref()
            .unwrap()
            .contains_key(TOKEN_EXPIRES_ANNOTATION));

        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.restart_policy, Some("Never".to_string()));
        assert_eq!(spec.containers.len(), 2);

        let runner = &spec.containers[0];
        assert_eq!(runner.name, "runner");
        let env = runner.env.as_ref().unwrap();
        let token_var = env.iter().find(|e| e.name == "RUNNER_TOKEN").unwrap();
        assert_eq!(token_var.value, Some("REG123".to_string()));
        assert!(env.iter().any(|e| e.name == "RUNNER_EPHEMERAL"));
        assert!(env.iter().any(|e| e.name == "RUNNER_LABELS"));

        let sidecar = &spec.containers[1];
        assert_eq!(sidecar.name, "isolation");
        assert_eq!(
            sidecar.security_context.as_ref().unwrap().privileged,
            Some(true)
        );
    }

    #[test]
    fn test_build_rejects_missing_uid() {
        let mut set = create_test_set();
        set.metadata.uid = None;
        assert!(matches!(
            build_runner_pod(&set, &create_test_token()),
            Err(PodError::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_validate_rejects_empty_image() {
        let mut set = create_test_set();
        set.spec.template.image = " ".to_string();
        assert!(matches!(validate_spec(&set), Err(PodError::InvalidSpec(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let mut set = create_test_set();
        set.spec.min_replicas = 5;
        set.spec.max_replicas = 2;
        assert!(matches!(validate_spec(&set), Err(PodError::InvalidSpec(_))));
    }

    #[test]
    fn test_malformed_toleration_is_invalid_spec() {
        let mut set = create_test_set();
        set.spec.template.tolerations = vec![serde_json::json!({"operator": 42})];
        assert!(matches!(
            build_runner_pod(&set, &create_test_token()),
            Err(PodError::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_phase_derivation() {
        assert_eq!(
            runner_phase(&create_test_pod("p", 0, "Pending", &[])),
            RunnerPhase::Pending
        );
        assert_eq!(
            runner_phase(&create_test_pod("p", 0, "Running", &[])),
            RunnerPhase::Registering
        );
        assert_eq!(runner_phase(&idle_pod("p", 0)), RunnerPhase::Idle);
        assert_eq!(runner_phase(&busy_pod("p", 0)), RunnerPhase::Busy);
        assert_eq!(
            runner_phase(&create_test_pod("p", 0, "Succeeded", &[])),
            RunnerPhase::Terminated
        );
        assert_eq!(
            runner_phase(&create_test_pod("p", 0, "Failed", &[])),
            RunnerPhase::Failed
        );

        let mut terminating = idle_pod("p", 0);
        terminating.metadata.deletion_timestamp = Some(Time(Utc::now()));
        assert_eq!(runner_phase(&terminating), RunnerPhase::Terminating);
    }

    #[test]
    fn test_replica_counts() {
        let pods = vec![
            idle_pod("a", 10),
            busy_pod("b", 20),
            create_test_pod("c", 5, "Running", &[]),
            create_test_pod("d", 5, "Succeeded", &[]),
        ];
        let counts = replica_counts(&pods);
        assert_eq!(counts.current, 3);
        assert_eq!(counts.busy, 1);
        assert_eq!(counts.idle, 1);
        assert_eq!(counts.registering, 1);
        assert_eq!(counts.terminating, 0);

        let mut draining = idle_pod("e", 10);
        draining.metadata.deletion_timestamp = Some(Time(Utc::now()));
        let counts = replica_counts(&[draining]);
        assert_eq!(counts.current, 0);
        assert_eq!(counts.terminating, 1);
    }

    #[test]
    fn test_scale_down_never_selects_busy_while_idle_exists() {
        let pods = vec![busy_pod("busy", 100), idle_pod("idle", 50)];
        let candidates = scale_down_candidates(&pods, ScaleDownPolicy::OldestIdleFirst, 2);
        let names: Vec<_> = candidates.iter().map(|p| p.name_any()).collect();
        assert_eq!(names, vec!["idle"]);
    }

    #[test]
    fn test_scale_down_oldest_idle_first() {
        let pods = vec![idle_pod("young", 10), idle_pod("old", 500), idle_pod("middle", 100)];
        let candidates = scale_down_candidates(&pods, ScaleDownPolicy::OldestIdleFirst, 2);
        let names: Vec<_> = candidates.iter().map(|p| p.name_any()).collect();
        assert_eq!(names, vec!["old", "middle"]);
    }

    #[test]
    fn test_scale_down_prefers_unregistered_over_idle() {
        let pods = vec![idle_pod("idle", 500), create_test_pod("fresh", 5, "Running", &[])];
        let candidates = scale_down_candidates(&pods, ScaleDownPolicy::OldestIdleFirst, 1);
        let names: Vec<_> = candidates.iter().map(|p| p.name_any()).collect();
        assert_eq!(names, vec!["fresh"]);
    }

    #[test]
    fn test_scale_down_least_recently_busy() {
        let now = Utc::now();
        let mut recently_busy = idle_pod("recent", 300);
        recently_busy
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(
                LAST_BUSY_ANNOTATION.to_string(),
                (now - chrono::Duration::seconds(30)).to_rfc3339(),
            );
        let mut long_idle = idle_pod("stale", 100);
        long_idle
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(
                LAST_BUSY_ANNOTATION.to_string(),
                (now - chrono::Duration::hours(6)).to_rfc3339(),
            );

        let pods = vec![recently_busy, long_idle];
        let candidates = scale_down_candidates(&pods, ScaleDownPolicy::LeastRecentlyBusyFirst, 1);
        let names: Vec<_> = candidates.iter().map(|p| p.name_any()).collect();
        assert_eq!(names, vec!["stale"]);
    }

    #[test]
    fn test_token_expiry_detection() {
        let now = Utc::now();
        let expired = (now - chrono::Duration::minutes(5)).to_rfc3339();
        let valid = (now + chrono::Duration::minutes(55)).to_rfc3339();

        let unregistered_expired = create_test_pod(
            "p",
            600,
            "Running",
            &[(TOKEN_EXPIRES_ANNOTATION, expired.as_str())],
        );
        assert!(token_expired_unregistered(&unregistered_expired, now));

        let unregistered_valid =
            create_test_pod("p", 60, "Running", &[(TOKEN_EXPIRES_ANNOTATION, valid.as_str())]);
        assert!(!token_expired_unregistered(&unregistered_valid, now));

        // A registered runner keeps running even after its token TTL: the
        // token was already consumed.
        let registered = create_test_pod(
            "p",
            600,
            "Running",
            &[(TOKEN_EXPIRES_ANNOTATION, expired.as_str()), (REGISTERED_ANNOTATION, "true")],
        );
        assert!(!token_expired_unregistered(&registered, now));
    }
}
