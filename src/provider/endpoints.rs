//! Endpoint-slice and Service watcher
//!
//! For Services with `externalTrafficPolicy: Local` the set of backend nodes
//! follows endpoint placement, so the controller watches endpoint slices and
//! enqueues a resync when the ready-node membership of a Service changes.
//! Condition flips that keep the same node set (a pod restarting on the same
//! node) are deliberately ignored to avoid churning the load balancer.
//!
//! The watcher keeps the last observed ready-node set per slice because the
//! watch stream hands over only the new object revision; the cached set
//! stands in for the old one when diffing.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::provider::node_filter::{has_local_traffic_policy, SERVICE_NAME_LABEL};
use crate::provider::queue::ResyncQueue;

/// Watches Services and EndpointSlices, enqueueing resyncs for Services in
/// local-traffic mode whose backend node set changed
pub struct EndpointSliceWatcher {
    /// Last observed traffic policy per Service key (true = Local)
    policies: DashMap<String, bool>,
    /// Last observed ready-node set per slice key
    slice_nodes: DashMap<String, BTreeSet<String>>,
    queue: ResyncQueue,
}

/// Node names contributing ready endpoints in a slice
///
/// Only endpoints explicitly reporting `ready: true` count here; this is the
/// membership set used to decide whether a slice update changed anything.
pub fn slice_ready_nodes(slice: &EndpointSlice) -> BTreeSet<String> {
    slice
        .endpoints
        .iter()
        .filter(|endpoint| {
            endpoint
                .conditions
                .as_ref()
                .is_some_and(|conditions| conditions.ready == Some(true))
        })
        .filter_map(|endpoint| endpoint.node_name.clone())
        .collect()
}

/// `namespace/name` key of the Service owning a slice, from its well-known
/// label
pub fn service_key_of_slice(slice: &EndpointSlice) -> Option<String> {
    let service_name = slice.labels().get(SERVICE_NAME_LABEL)?;
    let namespace = slice.metadata.namespace.as_deref()?;
    Some(format!("{namespace}/{service_name}"))
}

fn service_key(service: &Service) -> Option<String> {
    let name = service.metadata.name.as_deref()?;
    let namespace = service.metadata.namespace.as_deref()?;
    Some(format!("{namespace}/{name}"))
}

fn slice_key(slice: &EndpointSlice) -> Option<String> {
    let name = slice.metadata.name.as_deref()?;
    let namespace = slice.metadata.namespace.as_deref()?;
    Some(format!("{namespace}/{name}"))
}

impl EndpointSliceWatcher {
    /// Create a watcher feeding the given resync queue
    pub fn new(queue: ResyncQueue) -> Arc<Self> {
        Arc::new(Self {
            policies: DashMap::new(),
            slice_nodes: DashMap::new(),
            queue,
        })
    }

    /// Whether the Service key is tracked as local-traffic
    pub fn is_tracked(&self, key: &str) -> bool {
        self.policies.get(key).map(|local| *local).unwrap_or(false)
    }

    /// Record a Service revision; enqueues on policy transitions
    ///
    /// `initial` suppresses enqueueing while the watch replays pre-existing
    /// objects.
    fn observe_service(&self, service: &Service, initial: bool) {
        let Some(key) = service_key(service) else {
            return;
        };
        let local = has_local_traffic_policy(service);
        let previous = self.policies.insert(key.clone(), local);

        if initial {
            return;
        }
        match previous {
            Some(was_local) if was_local != local => {
                info!(service = %key, %local, "external traffic policy changed, enqueueing resync");
                self.queue.enqueue(&key);
            }
            _ => {}
        }
    }

    fn forget_service(&self, service: &Service) {
        if let Some(key) = service_key(service) {
            self.policies.remove(&key);
            debug!(service = %key, "service deleted, no longer tracked");
        }
    }

    /// Record a slice revision; enqueues when the ready-node set changed
    fn observe_slice(&self, slice: &EndpointSlice, initial: bool) {
        let Some(service) = service_key_of_slice(slice) else {
            return;
        };
        let Some(slice_key) = slice_key(slice) else {
            return;
        };

        let nodes = slice_ready_nodes(slice);
        let previous = self.slice_nodes.insert(slice_key.clone(), nodes.clone());

        if initial || !self.is_tracked(&service) {
            return;
        }
        match previous {
            None => {
                info!(%service, slice = %slice_key, "endpoint slice added, enqueueing resync");
                self.queue.enqueue(&service);
            }
            Some(previous) if previous != nodes => {
                info!(
                    %service,
                    slice = %slice_key,
                    nodes = nodes.len(),
                    "ready-node set changed, enqueueing resync"
                );
                self.queue.enqueue(&service);
            }
            Some(_) => {
                debug!(%service, slice = %slice_key, "slice updated without node membership change");
            }
        }
    }

    fn forget_slice(&self, slice: &EndpointSlice) {
        let Some(service) = service_key_of_slice(slice) else {
            return;
        };
        if let Some(key) = slice_key(slice) {
            self.slice_nodes.remove(&key);
        }
        if self.is_tracked(&service) {
            info!(%service, "endpoint slice deleted, enqueueing resync");
            self.queue.enqueue(&service);
        }
    }

    /// Run both watch streams until cancelled
    pub async fn run(self: Arc<Self>, client: Client, cancel: CancellationToken) {
        let services: Api<Service> = Api::all(client.clone());
        let slices: Api<EndpointSlice> = Api::all(client);

        let service_watcher = watcher::watcher(services, watcher::Config::default());
        let slice_watcher = watcher::watcher(slices, watcher::Config::default());
        let mut service_watcher = std::pin::pin!(service_watcher);
        let mut slice_watcher = std::pin::pin!(slice_watcher);

        info!("endpoint slice watcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("endpoint slice watcher shutting down");
                    return;
                }
                Some(event) = service_watcher.next() => {
                    match event {
                        Ok(Event::Apply(service)) => self.observe_service(&service, false),
                        Ok(Event::InitApply(service)) => self.observe_service(&service, true),
                        Ok(Event::Delete(service)) => self.forget_service(&service),
                        Ok(Event::Init) | Ok(Event::InitDone) => {}
                        Err(e) => {
                            warn!(error = %e, "service watch error, retrying");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
                Some(event) = slice_watcher.next() => {
                    match event {
                        Ok(Event::Apply(slice)) => self.observe_slice(&slice, false),
                        Ok(Event::InitApply(slice)) => self.observe_slice(&slice, true),
                        Ok(Event::Delete(slice)) => self.forget_slice(&slice),
                        Ok(Event::Init) | Ok(Event::InitDone) => {}
                        Err(e) => {
                            warn!(error = %e, "endpoint slice watch error, retrying");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ServiceSpec;
    use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn service(name: &str, policy: Option<&str>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                external_traffic_policy: policy.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn slice(name: &str, service: &str, endpoints: Vec<(&str, Option<bool>)>) -> EndpointSlice {
        EndpointSlice {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                labels: Some(
                    [(SERVICE_NAME_LABEL.to_string(), service.to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            endpoints: endpoints
                .into_iter()
                .map(|(node, ready)| Endpoint {
                    node_name: Some(node.to_string()),
                    conditions: Some(EndpointConditions {
                        ready,
                        ..Default::default()
                    }),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    fn watcher_with_queue() -> (Arc<EndpointSliceWatcher>, UnboundedReceiver<String>) {
        let (queue, rx) = ResyncQueue::new();
        (EndpointSliceWatcher::new(queue), rx)
    }

    #[test]
    fn ready_nodes_require_explicit_ready_condition() {
        let slice = slice(
            "web-abc",
            "web",
            vec![
                ("node-1", Some(true)),
                ("node-2", Some(false)),
                ("node-3", None),
            ],
        );
        let nodes = slice_ready_nodes(&slice);
        assert_eq!(nodes.into_iter().collect::<Vec<_>>(), vec!["node-1"]);
    }

    #[tokio::test]
    async fn service_add_tracks_without_enqueueing() {
        let (watcher, mut rx) = watcher_with_queue();
        watcher.observe_service(&service("web", Some("Local")), false);

        assert!(watcher.is_tracked("default/web"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn policy_transitions_enqueue_in_both_directions() {
        let (watcher, mut rx) = watcher_with_queue();
        watcher.observe_service(&service("web", Some("Cluster")), false);
        assert!(rx.try_recv().is_err());

        watcher.observe_service(&service("web", Some("Local")), false);
        assert_eq!(rx.try_recv().unwrap(), "default/web");
        assert!(watcher.is_tracked("default/web"));

        // key was handed to the worker; simulate pickup so it can requeue
        watcher.queue.mark_in_flight("default/web");

        watcher.observe_service(&service("web", Some("Cluster")), false);
        assert_eq!(rx.try_recv().unwrap(), "default/web");
        assert!(!watcher.is_tracked("default/web"));
    }

    #[tokio::test]
    async fn service_delete_stops_tracking() {
        let (watcher, _rx) = watcher_with_queue();
        watcher.observe_service(&service("web", Some("Local")), false);
        watcher.forget_service(&service("web", Some("Local")));
        assert!(!watcher.is_tracked("default/web"));
    }

    #[tokio::test]
    async fn slice_events_for_untracked_services_are_ignored() {
        let (watcher, mut rx) = watcher_with_queue();
        watcher.observe_slice(&slice("web-abc", "web", vec![("node-1", Some(true))]), false);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn node_membership_change_enqueues() {
        let (watcher, mut rx) = watcher_with_queue();
        watcher.observe_service(&service("web", Some("Local")), false);

        // first sighting of the slice
        watcher.observe_slice(&slice("web-abc", "web", vec![("node-1", Some(true))]), false);
        assert_eq!(rx.try_recv().unwrap(), "default/web");
        watcher.queue.mark_in_flight("default/web");

        // endpoints move from node-1 to node-2
        watcher.observe_slice(&slice("web-abc", "web", vec![("node-2", Some(true))]), false);
        assert_eq!(rx.try_recv().unwrap(), "default/web");
    }

    #[tokio::test]
    async fn condition_flip_without_membership_change_does_not_enqueue() {
        let (watcher, mut rx) = watcher_with_queue();
        watcher.observe_service(&service("web", Some("Local")), false);

        watcher.observe_slice(
            &slice(
                "web-abc",
                "web",
                vec![("node-1", Some(true)), ("node-1", Some(false))],
            ),
            false,
        );
        assert_eq!(rx.try_recv().unwrap(), "default/web");
        watcher.queue.mark_in_flight("default/web");

        // a pod restarted on the same node: the other endpoint flips ready,
        // the contributing node set is still {node-1}
        watcher.observe_slice(
            &slice(
                "web-abc",
                "web",
                vec![("node-1", Some(false)), ("node-1", Some(true))],
            ),
            false,
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn initial_sync_populates_cache_without_enqueueing() {
        let (watcher, mut rx) = watcher_with_queue();
        watcher.observe_service(&service("web", Some("Local")), true);
        watcher.observe_slice(&slice("web-abc", "web", vec![("node-1", Some(true))]), true);
        assert!(rx.try_recv().is_err());

        // a later real change still fires
        watcher.observe_slice(&slice("web-abc", "web", vec![("node-2", Some(true))]), false);
        assert_eq!(rx.try_recv().unwrap(), "default/web");
    }

    #[tokio::test]
    async fn slice_delete_enqueues_for_tracked_service() {
        let (watcher, mut rx) = watcher_with_queue();
        watcher.observe_service(&service("web", Some("Local")), false);
        watcher.observe_slice(&slice("web-abc", "web", vec![("node-1", Some(true))]), false);
        let _ = rx.try_recv();
        watcher.queue.mark_in_flight("default/web");

        watcher.forget_slice(&slice("web-abc", "web", vec![]));
        assert_eq!(rx.try_recv().unwrap(), "default/web");
        assert!(watcher.slice_nodes.get("default/web-abc").is_none());
    }
}
