/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/queue_poller.rs
*
* This module observes the external job source's workflow queue. The
* reconciler asks it for a `JobQueueSnapshot` (queued and in-progress job
* counts) for a runner group, and the poller answers from the network or,
* when the job source is unreachable, from its last good observation.
*
* Architecture:
* - One `GroupPollState` per runner group, held behind a per-group async
*   mutex. Taking the mutex before fetching coalesces overlapping observe
*   calls: at most one upstream request is in flight per group, and callers
*   that were waiting on the lock are served the observation that just
*   landed via the freshness short-circuit.
* - Failures never propagate to the caller while a previous observation
*   exists: the cached snapshot is returned annotated with how stale it is.
*   Only a group that has never been observed successfully surfaces an error.
* - After a configurable number of consecutive failures (default 3) the
*   group is marked degraded, both on the returned snapshot and on the
*   `runnerset_queue_degraded` gauge, so status reporting never silently
*   hides the condition.
* - The state-transition logic lives in pure methods on `GroupPollState`,
*   keeping it testable without a live job source.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::config::{OperatorConfig, SecretString};
use crate::crds::GroupIdentity;
use crate::metrics;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PollError {
    #[error("job source request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("no queue observation available for group '{0}'")]
    NoSnapshot(String),
}

/// A point-in-time observation of a runner group's workflow queue. Produced
/// here, consumed once by the reconciler, then discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobQueueSnapshot {
    pub queued: u32,
    pub in_progress: u32,
    pub observed_at: DateTime<Utc>,

    /// `None` for a live observation; otherwise how long ago the underlying
    /// observation was made.
    pub stale_for: Option<Duration>,

    /// Set once the group has crossed the consecutive-failure threshold.
    pub degraded: bool,
}

impl JobQueueSnapshot {
    pub fn is_stale(&self) -> bool {
        self.stale_for.is_some()
    }
}

/// The wire shape of the job source's queue-depth endpoint.
#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "camelCase")]
struct QueueCounts {
    queued: u32,
    in_progress: u32,
}

/// Per-group polling state. All transitions are pure functions of the
/// current state and the clock, so they are unit-testable in isolation.
struct GroupPollState {
    last_good: Option<(QueueCounts, DateTime<Utc>)>,
    consecutive_failures: u32,
}

impl GroupPollState {
    fn new() -> Self {
        Self {
            last_good: None,
            consecutive_failures: 0,
        }
    }

    fn is_degraded(&self, threshold: u32) -> bool {
        self.consecutive_failures >= threshold
    }

    /// Returns the cached observation if it is younger than the poll
    /// interval. Callers that queued up behind an in-flight fetch land here.
    fn fresh_snapshot(&self, max_age: Duration, now: DateTime<Utc>) -> Option<JobQueueSnapshot> {
        let (counts, observed_at) = self.last_good.as_ref()?;
        if now - *observed_at < max_age {
            Some(JobQueueSnapshot {
                queued: counts.queued,
                in_progress: counts.in_progress,
                observed_at: *observed_at,
                stale_for: None,
                degraded: false,
            })
        } else {
            None
        }
    }

    fn note_success(&mut self, counts: QueueCounts, now: DateTime<Utc>) -> JobQueueSnapshot {
        self.last_good = Some((counts, now));
        self.consecutive_failures = 0;
        JobQueueSnapshot {
            queued: counts.queued,
            in_progress: counts.in_progress,
            observed_at: now,
            stale_for: None,
            degraded: false,
        }
    }

    /// Records a failed observation. Returns the last good snapshot
    /// annotated as stale, or `None` if the group has never been observed.
    fn note_failure(&mut self, threshold: u32, now: DateTime<Utc>) -> Option<JobQueueSnapshot> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let degraded = self.is_degraded(threshold);

        self.last_good.as_ref().map(|(counts, observed_at)| JobQueueSnapshot {
            queued: counts.queued,
            in_progress: counts.in_progress,
            observed_at: *observed_at,
            stale_for: Some(now - *observed_at),
            degraded,
        })
    }
}

/// Observes workflow queue depth for runner groups, caching and coalescing
/// per group.
pub struct QueuePoller {
    client: reqwest::Client,
    endpoint: String,
    credential: SecretString,
    poll_interval: Duration,
    degraded_threshold: u32,
    groups: RwLock<HashMap<GroupIdentity, Arc<Mutex<GroupPollState>>>>,
}

impl QueuePoller {
    pub fn new(config: &OperatorConfig) -> Result<Self, PollError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: config.job_source_endpoint.clone(),
            credential: config.credential.clone(),
            poll_interval: Duration::from_std(config.poll_interval)
                .unwrap_or_else(|_| Duration::seconds(30)),
            degraded_threshold: config.degraded_threshold,
            groups: RwLock::new(HashMap::new()),
        })
    }

    /// Observes the queue for one runner group. Tolerates upstream failure
    /// by serving the last good observation annotated as stale; only a group
    /// with no history at all returns an error.
    pub async fn observe(&self, identity: &GroupIdentity) -> Result<JobQueueSnapshot, PollError> {
        let state = self.group_state(identity).await;

        // Holding the lock across the fetch is what coalesces overlapping
        // observe calls for the same group.
        let mut state = state.lock().await;

        let now = Utc::now();
        if let Some(snapshot) = state.fresh_snapshot(self.poll_interval, now) {
            debug!(group = %identity, "Serving queue observation from cache");
            return Ok(snapshot);
        }

        let group_label = identity.to_string();
        match self.fetch(identity).await {
            Ok(counts) => {
                metrics::QUEUE_DEGRADED
                    .with_label_values(&[group_label.as_str()])
                    .set(0);
                Ok(state.note_success(counts, Utc::now()))
            }
            Err(e) => {
                metrics::QUEUE_POLL_FAILURES_TOTAL
                    .with_label_values(&[group_label.as_str()])
                    .inc();
                warn!(
                    group = %identity,
                    failures = state.consecutive_failures + 1,
                    error = %e,
                    "Queue observation failed"
                );

                let snapshot = state.note_failure(self.degraded_threshold, Utc::now());
                if state.is_degraded(self.degraded_threshold) {
                    metrics::QUEUE_DEGRADED
                        .with_label_values(&[group_label.as_str()])
                        .set(1);
                    warn!(group = %identity, "Queue observations degraded");
                }

                snapshot.ok_or_else(|| PollError::NoSnapshot(identity.to_string()))
            }
        }
    }

    async fn group_state(&self, identity: &GroupIdentity) -> Arc<Mutex<GroupPollState>> {
        if let Some(state) = self.groups.read().await.get(identity) {
            return state.clone();
        }
        let mut groups = self.groups.write().await;
        groups
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(Mutex::new(GroupPollState::new())))
            .clone()
    }

    async fn fetch(&self, identity: &GroupIdentity) -> Result<QueueCounts, PollError> {
        let url = format!(
            "{}/{}/actions/runner-groups/{}/queue",
            self.endpoint,
            identity.api_path(),
            identity.group
        );

        let response = self
            .client
            .get(&url)
            .bearer_auth(self.credential.expose())
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json::<QueueCounts>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(queued: u32, in_progress: u32) -> QueueCounts {
        QueueCounts { queued, in_progress }
    }

    #[test]
    fn test_success_resets_failures() {
        let mut state = GroupPollState::new();
        state.consecutive_failures = 5;

        let snapshot = state.note_success(counts(4, 2), Utc::now());
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(snapshot.queued, 4);
        assert_eq!(snapshot.in_progress, 2);
        assert!(!snapshot.is_stale());
        assert!(!snapshot.degraded);
    }

    #[test]
    fn test_failure_serves_stale_snapshot() {
        let mut state = GroupPollState::new();
        let observed = Utc::now() - Duration::seconds(90);
        state.last_good = Some((counts(3, 1), observed));

        let now = Utc::now();
        let snapshot = state.note_failure(3, now).expect("stale snapshot expected");
        assert_eq!(snapshot.queued, 3);
        assert!(snapshot.is_stale());
        let staleness = snapshot.stale_for.unwrap();
        assert!(staleness >= Duration::seconds(89));
        assert!(!snapshot.degraded);
    }

    #[test]
    fn test_failure_without_history_yields_none() {
        let mut state = GroupPollState::new();
        assert!(state.note_failure(3, Utc::now()).is_none());
        assert_eq!(state.consecutive_failures, 1);
    }

    #[test]
    fn test_degraded_after_threshold() {
        let mut state = GroupPollState::new();
        state.last_good = Some((counts(1, 0), Utc::now()));

        let now = Utc::now();
        assert!(!state.note_failure(3, now).unwrap().degraded);
        assert!(!state.note_failure(3, now).unwrap().degraded);
        // Third consecutive failure crosses the default threshold.
        assert!(state.note_failure(3, now).unwrap().degraded);
        assert!(state.is_degraded(3));
    }

    #[test]
    fn test_fresh_snapshot_short_circuit() {
        let mut state = GroupPollState::new();
        let now = Utc::now();
        state.note_success(counts(2, 2), now);

        let fresh = state.fresh_snapshot(Duration::seconds(30), now + Duration::seconds(5));
        assert!(fresh.is_some());

        let expired = state.fresh_snapshot(Duration::seconds(30), now + Duration::seconds(31));
        assert!(expired.is_none());
    }

    #[test]
    fn test_counts_deserialize_camel_case() {
        let parsed: QueueCounts =
            serde_json::from_str(r#"{"queued": 7, "inProgress": 2}"#).unwrap();
        assert_eq!(parsed.queued, 7);
        assert_eq!(parsed.in_progress, 2);
    }
}
