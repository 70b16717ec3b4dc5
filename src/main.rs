/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* Archive: src/main.rs
*
* This file is the main entry point for the RunnerSet Kubernetes Operator. It
* is responsible for setting up and running the controller manager, which in
* turn hosts and executes the reconciliation loop for the RunnerSet custom
* resource.
*
* Architecture:
* The program follows the standard `kube-rs` operator structure.
* 1.  **Initialization**: It begins by initializing `tracing` for structured
* logging, loading the operator configuration from the environment (failing
* fast on a missing job-source credential), and creating a Kubernetes client.
* 2.  **Shared Context**: A shared `Context` object is created for the
* controller, wiring together the queue poller, the token broker, and the
* pod lifecycle manager around the Kubernetes client.
* 3.  **Controller Manager**: A `Controller` from `kube-rs` is instantiated to
* manage the watch and reconcile loop for RunnerSet resources. It also owns
* the runner pods the operator creates, so pod completion events flow back
* into the reconciler without waiting for the next poll.
* 4.  **Concurrent Execution**: The controller, the Prometheus metrics server,
* and the orphaned-pod reaper are run concurrently using `tokio::join!`. This
* allows the operator to reconcile groups, serve metrics, and garbage-collect
* in parallel, making the system highly responsive and scalable.
*
* SPDX-License-Identifier: Apache-2.0 */

use futures::stream::StreamExt;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client};
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use warp::Filter;

mod config;
mod crds;
mod metrics;
mod controllers {
    pub mod pod_manager;
    pub mod queue_poller;
    pub mod runnerset_controller;
    pub mod scaling;
    pub mod token_broker;
}

use config::OperatorConfig;
use controllers::pod_manager::{self, PodManager};
use controllers::queue_poller::QueuePoller;
use controllers::runnerset_controller::{self, Context};
use controllers::token_broker::TokenBroker;
use crds::RunnerSet;
use k8s_openapi::api::core::v1::Pod;

/// Initializes structured logging: level filtering from RUST_LOG, JSON output.
fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().json();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}

/// Renders the metrics into the Prometheus text format.
async fn metrics_handler(registry: Arc<Registry>) -> Result<impl warp::Reply, warp::Rejection> {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder
        .encode(&registry.gather(), &mut buffer)
        .expect("Failed to encode metrics");

    let response = String::from_utf8(buffer.clone()).expect("Failed to convert metrics to string");
    Ok(warp::reply::with_header(
        response,
        "Content-Type",
        encoder.format_type(),
    ))
}

/// Runs the HTTP server to expose the /metrics endpoint.
async fn run_metrics_server(registry: Arc<Registry>, port: u16) {
    let metrics_route = warp::path("metrics")
        .and(warp::get())
        .and(warp::any().map(move || Arc::clone(&registry)))
        .and_then(metrics_handler);

    info!("Starting metrics server on 0.0.0.0:{}", port);
    warp::serve(metrics_route).run(([0, 0, 0, 0], port)).await;
}

/// The main entry point of the operator.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize Logging
    init_logging().map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    // 2. Load configuration; a missing credential or endpoint aborts startup.
    let config = OperatorConfig::from_env()?;
    info!("Configuration loaded.");

    // 3. Initialize Kubernetes Client
    let client = Client::try_default().await?;

    // 4. Create the shared context wiring all collaborators together.
    let poller = QueuePoller::new(&config)?;
    let broker = TokenBroker::new(&config)?;
    let pods = PodManager::new(client.clone());
    let reaper = pod_manager::run_orphan_reaper(pods.clone(), config.reap_interval);

    let context = Arc::new(Context::new(
        client.clone(),
        config.clone(),
        poller,
        broker,
        pods,
    ));

    // 5. Initialize metrics registry
    let registry = Arc::new(metrics::create_and_register_metrics()?);
    info!("Custom metrics registered.");

    info!("RunnerSet Operator starting...");

    // 6. Set up the controller: watch RunnerSets, own the runner pods they
    // create so completion events trigger reconciliation promptly.
    let runner_sets = Api::<RunnerSet>::all(client.clone());
    let owned_pods = Api::<Pod>::all(client.clone());
    let pod_watch = watcher::Config::default().labels(&format!(
        "{}={}",
        pod_manager::MANAGED_BY_LABEL,
        pod_manager::MANAGED_BY_VALUE
    ));

    // 7. Run the controller, the metrics server, and the orphan reaper
    // concurrently.
    tokio::join!(
        // --- Metrics Server ---
        run_metrics_server(registry.clone(), config.metrics_port),
        // --- Orphaned Pod Reaper ---
        reaper,
        // --- RunnerSet Controller ---
        Controller::new(runner_sets, watcher::Config::default())
            .owns(owned_pods, pod_watch)
            .run(
                runnerset_controller::reconcile,
                runnerset_controller::error_policy,
                context.clone(),
            )
            .for_each(|res| async move {
                match res {
                    Ok(o) => info!("Reconciled RunnerSet: {:?}", o),
                    Err(e) => tracing::error!("RunnerSet reconcile error: {}", e),
                }
            }),
    );

    info!("RunnerSet Operator shutting down.");
    Ok(())
}
