/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/metrics.rs
*
* This module defines and registers the custom Prometheus metrics that the
* runnerset-operator exposes. These metrics provide insights into the
* operator's behavior and the lifecycle of the runner pods it manages.
*
* Using `lazy_static`, we ensure that the metrics are created only once and are
* available globally and safely across all concurrent reconciliation loops and
* web server threads.
*
* SPDX-License-Identifier: Apache-2.0
*/

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter_vec, register_int_gauge_vec, Histogram,
    IntCounterVec, IntGaugeVec, Registry,
};

// --- Metric Definitions ---

lazy_static! {
    /// The replica count each RunnerSet's last reconciliation computed from queue depth.
    pub static ref RUNNER_SET_DESIRED_REPLICAS: IntGaugeVec =
        register_int_gauge_vec!(
            "runnerset_desired_replicas",
            "Desired runner replicas per RunnerSet.",
            &["runner_set"]
        ).unwrap();

    /// The live runner pod count per RunnerSet.
    pub static ref RUNNER_SET_CURRENT_REPLICAS: IntGaugeVec =
        register_int_gauge_vec!(
            "runnerset_current_replicas",
            "Current runner replicas per RunnerSet.",
            &["runner_set"]
        ).unwrap();

    /// Total runner pods created, labeled by RunnerSet.
    pub static ref RUNNER_PODS_CREATED_TOTAL: IntCounterVec =
        register_int_counter_vec!(
            "runnerset_pods_created_total",
            "Total number of runner pods created.",
            &["runner_set"]
        ).unwrap();

    /// Total runner pods deleted, labeled by reason.
    pub static ref RUNNER_PODS_DELETED_TOTAL: IntCounterVec =
        register_int_counter_vec!(
            "runnerset_pods_deleted_total",
            "Total number of runner pods deleted.",
            &["reason"]
        ).unwrap();

    /// Total failed queue-depth observations, labeled by runner group.
    pub static ref QUEUE_POLL_FAILURES_TOTAL: IntCounterVec =
        register_int_counter_vec!(
            "runnerset_queue_poll_failures_total",
            "Total number of failed job queue observations.",
            &["group"]
        ).unwrap();

    /// Set to 1 while a runner group's queue observations are degraded
    /// (served stale after consecutive upstream failures).
    pub static ref QUEUE_DEGRADED: IntGaugeVec =
        register_int_gauge_vec!(
            "runnerset_queue_degraded",
            "Whether queue observations for a runner group are degraded.",
            &["group"]
        ).unwrap();

    /// Total registration-token exchanges, labeled by outcome.
    pub static ref TOKEN_MINTS_TOTAL: IntCounterVec =
        register_int_counter_vec!(
            "runnerset_token_mints_total",
            "Total number of registration token exchanges.",
            &["outcome"]
        ).unwrap();

    /// A histogram that measures the duration of each reconciliation pass.
    /// The buckets are defined in seconds.
    pub static ref RECONCILE_DURATION_SECONDS: Histogram =
        register_histogram!(
            "runnerset_reconcile_duration_seconds",
            "Duration of each RunnerSet reconciliation pass.",
            vec![0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0]
        ).unwrap();
}

/// Creates a new Prometheus registry and registers all custom metrics.
///
/// This function is intended to be called once at operator startup.
pub fn create_and_register_metrics() -> Result<Registry, prometheus::Error> {
    let r = Registry::new();
    r.register(Box::new(RUNNER_SET_DESIRED_REPLICAS.clone()))?;
    r.register(Box::new(RUNNER_SET_CURRENT_REPLICAS.clone()))?;
    r.register(Box::new(RUNNER_PODS_CREATED_TOTAL.clone()))?;
    r.register(Box::new(RUNNER_PODS_DELETED_TOTAL.clone()))?;
    r.register(Box::new(QUEUE_POLL_FAILURES_TOTAL.clone()))?;
    r.register(Box::new(QUEUE_DEGRADED.clone()))?;
    r.register(Box::new(TOKEN_MINTS_TOTAL.clone()))?;
    r.register(Box::new(RECONCILE_DURATION_SECONDS.clone()))?;
    Ok(r)
}
