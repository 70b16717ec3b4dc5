/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/crds.rs
*
* This file defines the Rust data structures that correspond to our Custom
* Resource Definitions (CRDs). By using the `kube::CustomResource` derive macro,
* we create a strongly-typed representation of our custom APIs, enabling safe
* and idiomatic interaction with the Kubernetes API server.
*
* Architecture:
* - The `RunnerSet` resource is the single API Kind this operator manages. It
*   represents a named group of ephemeral CI job-executor pods scoped to a
*   repository, organization, or enterprise on the external job source.
* - The `#[kube(...)]` attribute provides the necessary metadata to map the Rust
*   struct to its corresponding CRD in the cluster (group, version, kind). This
*   metadata MUST exactly match the definitions in the YAML CRD files.
* - The standard Kubernetes object structure is followed by separating the user's
*   desired state (`spec`) from the operator's observed state (`status`). The
*   spec carries the scaling bounds and the runner pod template; the status is
*   mutated only by the reconciler and records replica counts, the control-loop
*   phase, and the last error, if any.
* - The pod template is a structurally-validated configuration record: the
*   recognized keys are typed, while tolerations and extra volumes pass through
*   as opaque JSON that is only checked for structural validity when the pod is
*   built.
* - `serde` attributes are used to map between idiomatic Rust `snake_case` and
*   idiomatic Kubernetes `camelCase`.
* - `schemars` is leveraged to automatically generate an OpenAPI v3 schema from
*   the Rust types, which is embedded into the CRD manifest for server-side
*   validation.
*
* SPDX-License-Identifier: Apache-2.0
*/

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// --- RunnerSet Custom Resource Definition ---

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "runners.forgeci.io",
    version = "v1alpha1",
    kind = "RunnerSet",
    namespaced,
    status = "RunnerSetStatus",
    printcolumn = r#"{"name":"Desired", "type":"integer", "jsonPath":".status.desiredReplicas"}"#,
    printcolumn = r#"{"name":"Current", "type":"integer", "jsonPath":".status.currentReplicas"}"#,
    printcolumn = r#"{"name":"Busy", "type":"integer", "jsonPath":".status.busyReplicas"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#,
    shortname = "rset"
)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSetSpec {
    /// The level at which the runner group is registered with the job source.
    pub scope: RunnerScope,

    /// The repository ("owner/name"), organization, or enterprise slug the
    /// scope refers to.
    pub target: String,

    /// The runner group label used when querying queue depth and registering
    /// new runners.
    pub group: String,

    /// The floor for the number of runner pods kept alive even when the queue
    /// is empty.
    #[serde(default)]
    pub min_replicas: i32,

    /// The ceiling for the number of runner pods. Excess queued jobs stay
    /// queued on the job source until capacity frees up.
    #[serde(default = "default_max_replicas")]
    pub max_replicas: i32,

    /// The template every runner pod in this set is built from.
    pub template: RunnerPodTemplate,

    /// Which runners are removed first when scaling down. Defaults to
    /// `OldestIdleFirst`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down_policy: Option<ScaleDownPolicy>,

    /// Optional per-set override for the queue polling interval, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_seconds: Option<u64>,
}

fn default_max_replicas() -> i32 {
    10
}

/// The registration scope of a runner group on the external job source.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum RunnerScope {
    Repository,
    Organization,
    Enterprise,
}

impl RunnerScope {
    /// The URL path segment the job source uses for this scope.
    pub fn api_segment(&self) -> &'static str {
        match self {
            RunnerScope::Repository => "repos",
            RunnerScope::Organization => "orgs",
            RunnerScope::Enterprise => "enterprises",
        }
    }
}

/// Identifies one runner group on the job source. Derived from the spec and
/// used by the queue poller and the token broker to scope their API calls.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GroupIdentity {
    pub scope: RunnerScope,
    pub target: String,
    pub group: String,
}

impl GroupIdentity {
    /// The path prefix for job-source API calls, e.g. "repos/acme/widgets".
    pub fn api_path(&self) -> String {
        format!("{}/{}", self.scope.api_segment(), self.target)
    }
}

impl std::fmt::Display for GroupIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.api_path(), self.group)
    }
}

impl RunnerSetSpec {
    pub fn identity(&self) -> GroupIdentity {
        GroupIdentity {
            scope: self.scope,
            target: self.target.clone(),
            group: self.group.clone(),
        }
    }
}

// --- Runner pod template ---

/// The consumer-supplied shape of a runner pod. Recognized keys are typed;
/// tolerations and extra volumes are opaque JSON validated structurally when
/// the pod is built.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunnerPodTemplate {
    /// The container image of the runner agent.
    pub image: String,

    /// Optional sidecar providing an isolated execution environment for jobs
    /// (e.g. a docker:dind container sharing the work volume).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecar: Option<SidecarSpec>,

    /// Resource requests for the runner container, as Kubernetes quantity
    /// strings keyed by resource name ("cpu", "memory", ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,

    /// Resource limits for the runner container.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,

    /// Extra environment variables injected into the runner container.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Node selection constraints, passed through to the pod spec.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Tolerations, passed through opaquely to the scheduler layer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<serde_json::Value>,

    /// Additional volumes, passed through opaquely.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<serde_json::Value>,

    /// Service account the runner pod runs under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
}

/// A sidecar container granting runner jobs an isolated execution environment.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SidecarSpec {
    /// The sidecar container image, e.g. "docker:dind".
    pub image: String,

    /// Whether the sidecar requires a privileged security context.
    #[serde(default)]
    pub privileged: bool,
}

/// Which idle runners are removed first on scale-down.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum ScaleDownPolicy {
    /// Delete the longest-lived idle runner first. Deterministic.
    #[default]
    OldestIdleFirst,
    /// Delete the idle runner that has gone longest without running a job.
    LeastRecentlyBusyFirst,
}

// --- RunnerSet status ---

/// The control-loop state of a RunnerSet, as driven by the reconciler.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum RunnerSetPhase {
    /// Actual replica count matches desired; nothing to do.
    Idle,
    /// Pods are being created or are still registering.
    Scaling,
    /// Excess pods are being drained and deleted.
    Draining,
    /// An unrecoverable failure occurred; retried after backoff.
    Error,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub message: String,
}

impl StatusCondition {
    pub fn new(type_: String, message: String) -> Self {
        Self { type_, message }
    }
}

/// The observed state of the RunnerSet resource. Mutated only by the
/// reconciler; read-only to external observers.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSetStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<RunnerSetPhase>,

    /// Runner pods currently alive (not terminated or failed).
    #[serde(default)]
    pub current_replicas: i32,

    /// The replica count the last reconciliation computed from queue depth.
    #[serde(default)]
    pub desired_replicas: i32,

    /// Runners currently executing a job.
    #[serde(default)]
    pub busy_replicas: i32,

    /// Runners registered and waiting for work.
    #[serde(default)]
    pub idle_replicas: i32,

    /// Timestamp of the last reconciliation pass, RFC 3339.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<String>,

    /// The most recent reconciliation error, cleared on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Set when queue observations are being served from a stale cache
    /// because the job source has been unreachable.
    #[serde(default)]
    pub queue_degraded: bool,

    /// The spec generation the status reflects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Human-readable status conditions for the resource.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<StatusCondition>,
}
