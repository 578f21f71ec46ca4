//! Service controller
//!
//! Thin controller loop translating Service events into engine calls:
//! ensure on apply, delete on cleanup, with a finalizer guarding cloud
//! resources against orphaning. The engine itself does all the work; this
//! module only owns the orchestrator plumbing around it.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Node, Service};
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::provider::is_load_balancer_service;
use crate::provider::loadbalancer::LoadBalancers;
use crate::provider::queue::filter_ready_nodes;
use crate::{Error, Result};

/// Finalizer guarding cloud resources of a Service
pub const SERVICE_FINALIZER: &str = "loadbalancer.breakwater.cloud/finalizer";

/// Field manager used for status patches
const FIELD_MANAGER: &str = "breakwater-cloud-controller";

/// Interval between periodic re-reconciles of a healthy Service
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Shared controller state
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Load balancer engine
    pub load_balancers: Arc<LoadBalancers>,
}

/// Reconcile one Service
pub async fn reconcile(service: Arc<Service>, ctx: Arc<Context>) -> Result<Action> {
    let Some(namespace) = service.namespace() else {
        return Err(Error::internal("service has no namespace"));
    };

    let has_finalizer = service
        .finalizers()
        .iter()
        .any(|f| f == SERVICE_FINALIZER);
    if !is_load_balancer_service(&service) && !has_finalizer {
        debug!(service = %service.name_any(), "not a LoadBalancer service, nothing to do");
        return Ok(Action::await_change());
    }

    let services: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);
    finalizer(&services, SERVICE_FINALIZER, service, |event| async {
        match event {
            Event::Apply(service) => apply(&services, &service, &ctx).await,
            Event::Cleanup(service) => cleanup(&service, &ctx).await,
        }
    })
    .await
    .map_err(|e| Error::internal(format!("finalizer handling failed: {e}")))
}

async fn apply(api: &Api<Service>, service: &Service, ctx: &Context) -> Result<Action> {
    let name = service.name_any();

    if !is_load_balancer_service(service) {
        // the Service type moved away from LoadBalancer; release the cloud
        // objects and wait for the next change
        info!(service = %name, "service is no longer of type LoadBalancer, deleting cloud objects");
        ctx.load_balancers
            .ensure_load_balancer_deleted(service)
            .await?;
        return Ok(Action::await_change());
    }

    let nodes = Api::<Node>::all(ctx.client.clone())
        .list(&Default::default())
        .await?
        .items;
    let ready_nodes = filter_ready_nodes(nodes);

    let status = ctx
        .load_balancers
        .ensure_load_balancer(service, &ready_nodes)
        .await?;

    let patch = serde_json::json!({ "status": { "loadBalancer": status } });
    api.patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;

    Ok(Action::requeue(RESYNC_INTERVAL))
}

async fn cleanup(service: &Service, ctx: &Context) -> Result<Action> {
    info!(service = %service.name_any(), "service deleted, removing cloud objects");
    ctx.load_balancers
        .ensure_load_balancer_deleted(service)
        .await?;
    Ok(Action::await_change())
}

/// Error policy for the service controller
///
/// Retryable errors (API failures, timeouts) requeue with a fixed delay;
/// non-retryable errors (invalid annotations, configuration) wait for the
/// next spec change instead of re-running an identical failing reconcile.
pub fn error_policy(service: Arc<Service>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(
        service = %service.name_any(),
        error = %error,
        retryable = error.is_retryable(),
        "reconcile failed"
    );

    if error.is_retryable() {
        Action::requeue(Duration::from_secs(30))
    } else {
        // requires a spec change to fix
        Action::await_change()
    }
}
