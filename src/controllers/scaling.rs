/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/scaling.rs
*
* This module computes how many runner pods a RunnerSet should have. It is a
* pure function of the observed queue and the configured bounds: no I/O, no
* side effects, so the reconciler can call it on every pass and tests can
* exercise it exhaustively.
*
* The rule: every in-progress job still occupies a runner, every queued job
* needs a new one, and the result is clamped to [minReplicas, maxReplicas].
* When demand exceeds the ceiling, the excess jobs simply remain queued on
* the job source until capacity frees up.
*
* SPDX-License-Identifier: Apache-2.0
*/

/// Maps observed demand to a desired replica count.
///
/// Bounds are validated at admission time (`min <= max`); the guard below
/// keeps the clamp total if a malformed spec slips through.
pub fn desired_replicas(queued: u32, in_progress: u32, min_replicas: i32, max_replicas: i32) -> i32 {
    let demand = queued
        .saturating_add(in_progress)
        .min(i32::MAX as u32) as i32;

    let floor = min_replicas.max(0);
    let ceiling = max_replicas.max(floor);

    demand.clamp(floor, ceiling)
}
