//! Controller runner - starts the WindowsMachineConfig controller
//!
//! Wires the reconcile loop into the kube runtime with a generation-based
//! watch predicate: spec changes trigger reconciles, status updates do not.
//! Without the predicate every status publish would immediately requeue the
//! resource and the controller would loop on its own writes.

use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::reflector;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{predicates, watcher, Controller, WatchStreamExt};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;

use windrose_common::crd::WindowsMachineConfig;
use windrose_machines::{error_policy, reconcile, Context};

/// Run the controller until shutdown
pub async fn run_controller(client: Client, cluster_service_cidr: String) {
    // The shutdown token lets the reconcile loop stop starting new scale
    // actions while in-flight cloud operations finish and the registry is
    // flushed. The kube runtime's own signal handling stops the watch.
    let shutdown = CancellationToken::new();
    {
        let token = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                token.cancel();
            }
        });
    }

    let ctx = Arc::new(
        Context::builder(client.clone())
            .cluster_service_cidr(cluster_service_cidr)
            .shutdown(shutdown)
            .build(),
    );

    let configs: Api<WindowsMachineConfig> = Api::all(client);
    let (reader, writer) = reflector::store();
    let stream = watcher(configs, WatcherConfig::default())
        .default_backoff()
        .reflect(writer)
        .applied_objects()
        .predicate_filter(predicates::generation);

    tracing::info!("Starting WindowsMachineConfig controller");
    Controller::for_stream(stream, reader)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "reconciliation error"),
            }
        })
        .await;
}
