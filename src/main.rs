//! Breakwater cloud controller manager
//!
//! Watches LoadBalancer Services and converges Breakwater VPC load
//! balancers against them. A resync queue fed by the endpoint-slice watcher
//! re-runs reconciliation when backend topology changes for Services with
//! local traffic policy.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use breakwater::config::CloudConfig;
use breakwater::provider::{
    controller, ApiEndpointSliceLister, BreakwaterCloud, EndpointSliceWatcher, ResyncQueue,
    ResyncWorker,
};

/// Breakwater Cloud controller manager for Kubernetes
#[derive(Parser, Debug)]
#[command(name = "breakwater-cloud-controller", version, about, long_about = None)]
struct Cli {
    /// Path to the cloud configuration file (YAML)
    #[arg(long = "cloud-config", env = "BREAKWATER_CLOUD_CONFIG")]
    cloud_config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = CloudConfig::from_file(&cli.cloud_config)?;
    info!(
        endpoint = %config.endpoint,
        vpc = %config.vpc_identity,
        cluster = %config.cluster,
        "loaded cloud config"
    );

    let cloud = BreakwaterCloud::new(config).await?;
    if !cloud.has_cluster_id() {
        warn!("no cluster identifier configured; cloud objects will not carry a cluster label");
    }

    let client = Client::try_default().await?;
    let endpoint_slices = Arc::new(ApiEndpointSliceLister::new(client.clone()));
    let Some(load_balancers) = cloud.load_balancers(endpoint_slices) else {
        info!("load balancer interface is disabled, exiting");
        return Ok(());
    };
    let load_balancers = Arc::new(load_balancers);

    let cancel = CancellationToken::new();
    let (queue, receiver) = ResyncQueue::new();
    let watcher = EndpointSliceWatcher::new(queue.clone());
    let worker = ResyncWorker::new(
        client.clone(),
        load_balancers.clone(),
        queue,
        receiver,
    );

    let watcher_task = tokio::spawn(watcher.run(client.clone(), cancel.child_token()));
    let worker_task = tokio::spawn(worker.run(cancel.child_token()));

    let context = Arc::new(controller::Context {
        client: client.clone(),
        load_balancers,
    });
    let services: Api<Service> = Api::all(client);

    info!("starting service controller");
    Controller::new(services, WatcherConfig::default())
        .shutdown_on_signal()
        .run(controller::reconcile, controller::error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((service, _action)) => {
                    debug!(service = %service.name, "reconciled service");
                }
                Err(e) => {
                    warn!(error = %e, "service reconciliation failed");
                }
            }
        })
        .await;

    info!("controller stopped, shutting down background tasks");
    cancel.cancel();
    let _ = watcher_task.await;
    let _ = worker_task.await;
    Ok(())
}
