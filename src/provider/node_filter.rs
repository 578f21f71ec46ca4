//! Node filtering for Services with `externalTrafficPolicy: Local`
//!
//! Under the Local policy only nodes that host a ready endpoint of the
//! Service should receive traffic. The filter fails open: when no endpoint
//! slices exist, or no endpoint is ready, the input node list is returned
//! unchanged rather than draining the load balancer.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::ListParams;
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info};

use crate::Result;

/// Well-known label tying an EndpointSlice to its Service
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// External traffic policy value under which node filtering applies
pub const TRAFFIC_POLICY_LOCAL: &str = "Local";

/// Source of EndpointSlices for a Service
///
/// Abstracted so tests can feed slices directly while production lists them
/// from the API server by label selector.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EndpointSliceLister: Send + Sync {
    /// List the endpoint slices labeled for the given Service
    async fn list_for_service(&self, namespace: &str, name: &str) -> Result<Vec<EndpointSlice>>;
}

/// [`EndpointSliceLister`] backed by the Kubernetes API
pub struct ApiEndpointSliceLister {
    client: Client,
}

impl ApiEndpointSliceLister {
    /// Create a lister using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EndpointSliceLister for ApiEndpointSliceLister {
    async fn list_for_service(&self, namespace: &str, name: &str) -> Result<Vec<EndpointSlice>> {
        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&format!("{SERVICE_NAME_LABEL}={name}"));
        Ok(api.list(&params).await?.items)
    }
}

/// Whether the Service routes external traffic to local endpoints only
pub fn has_local_traffic_policy(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.external_traffic_policy.as_deref())
        == Some(TRAFFIC_POLICY_LOCAL)
}

/// Node names hosting at least one usable endpoint
///
/// An endpoint counts unless it reports `ready: false` or
/// `terminating: true`; an absent condition is treated as ready.
pub fn ready_endpoint_nodes(slices: &[EndpointSlice]) -> BTreeSet<String> {
    let mut nodes = BTreeSet::new();
    for slice in slices {
        for endpoint in &slice.endpoints {
            let Some(node_name) = endpoint.node_name.as_deref() else {
                continue;
            };
            if let Some(conditions) = &endpoint.conditions {
                if conditions.ready == Some(false) {
                    continue;
                }
                if conditions.terminating == Some(true) {
                    continue;
                }
            }
            nodes.insert(node_name.to_string());
        }
    }
    nodes
}

/// Reduces a node set to the nodes hosting ready endpoints of a Service
pub struct NodeFilter {
    slices: Arc<dyn EndpointSliceLister>,
}

impl NodeFilter {
    /// Create a filter reading endpoint slices from the given source
    pub fn new(slices: Arc<dyn EndpointSliceLister>) -> Self {
        Self { slices }
    }

    /// Apply the Service's external traffic policy to the node list
    ///
    /// Cluster policy returns the input unchanged. Local policy keeps only
    /// nodes hosting a ready, non-terminating endpoint, falling back to the
    /// full list when there is no endpoint information to act on.
    pub async fn filter(&self, service: &Service, nodes: &[Node]) -> Result<Vec<Node>> {
        if !has_local_traffic_policy(service) {
            return Ok(nodes.to_vec());
        }

        let namespace = service.metadata.namespace.as_deref().unwrap_or_default();
        let name = service.metadata.name.as_deref().unwrap_or_default();
        debug!(service = %name, %namespace, "filtering nodes for local traffic policy");

        let slices = self.slices.list_for_service(namespace, name).await?;
        if slices.is_empty() {
            info!(service = %name, %namespace, "no endpoint slices found, keeping all nodes");
            return Ok(nodes.to_vec());
        }

        let ready_nodes = ready_endpoint_nodes(&slices);
        if ready_nodes.is_empty() {
            info!(service = %name, %namespace, "no ready endpoints found, keeping all nodes");
            return Ok(nodes.to_vec());
        }

        let filtered: Vec<Node> = nodes
            .iter()
            .filter(|node| {
                node.metadata
                    .name
                    .as_deref()
                    .is_some_and(|n| ready_nodes.contains(n))
            })
            .cloned()
            .collect();
        debug!(
            service = %name,
            %namespace,
            kept = filtered.len(),
            total = nodes.len(),
            "filtered nodes hosting ready endpoints"
        );
        Ok(filtered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ServiceSpec;
    use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn local_service() -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                external_traffic_policy: Some(TRAFFIC_POLICY_LOCAL.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn endpoint(node: &str, ready: Option<bool>, terminating: Option<bool>) -> Endpoint {
        Endpoint {
            node_name: Some(node.to_string()),
            conditions: Some(EndpointConditions {
                ready,
                terminating,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn slice(endpoints: Vec<Endpoint>) -> EndpointSlice {
        EndpointSlice {
            endpoints,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn cluster_policy_keeps_all_nodes() {
        let mut lister = MockEndpointSliceLister::new();
        lister.expect_list_for_service().never();

        let filter = NodeFilter::new(Arc::new(lister));
        let service = Service {
            spec: Some(ServiceSpec::default()),
            ..local_service()
        };
        let nodes = vec![node("node-1"), node("node-2")];
        let filtered = filter.filter(&service, &nodes).await.unwrap();
        assert_eq!(filtered.len(), 2);
    }

    #[tokio::test]
    async fn local_policy_keeps_nodes_with_ready_endpoints() {
        let mut lister = MockEndpointSliceLister::new();
        lister
            .expect_list_for_service()
            .withf(|ns, name| ns == "default" && name == "web")
            .returning(|_, _| {
                Ok(vec![slice(vec![
                    endpoint("node-1", Some(true), Some(false)),
                    endpoint("node-3", Some(false), None),
                ])])
            });

        let filter = NodeFilter::new(Arc::new(lister));
        let nodes = vec![node("node-1"), node("node-2"), node("node-3")];
        let filtered = filter.filter(&local_service(), &nodes).await.unwrap();
        let names: Vec<_> = filtered
            .iter()
            .map(|n| n.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["node-1"]);
    }

    #[tokio::test]
    async fn no_slices_keeps_all_nodes() {
        let mut lister = MockEndpointSliceLister::new();
        lister.expect_list_for_service().returning(|_, _| Ok(vec![]));

        let filter = NodeFilter::new(Arc::new(lister));
        let nodes = vec![node("node-1"), node("node-2")];
        let filtered = filter.filter(&local_service(), &nodes).await.unwrap();
        assert_eq!(filtered.len(), 2);
    }

    #[tokio::test]
    async fn no_ready_endpoints_keeps_all_nodes() {
        let mut lister = MockEndpointSliceLister::new();
        lister.expect_list_for_service().returning(|_, _| {
            Ok(vec![slice(vec![
                endpoint("node-1", Some(false), None),
                endpoint("node-2", Some(true), Some(true)),
            ])])
        });

        let filter = NodeFilter::new(Arc::new(lister));
        let nodes = vec![node("node-1"), node("node-2")];
        let filtered = filter.filter(&local_service(), &nodes).await.unwrap();
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn absent_conditions_count_as_ready() {
        let slices = vec![slice(vec![Endpoint {
            node_name: Some("node-1".to_string()),
            conditions: None,
            ..Default::default()
        }])];
        assert!(ready_endpoint_nodes(&slices).contains("node-1"));
    }

    #[test]
    fn endpoints_without_node_are_skipped() {
        let slices = vec![slice(vec![Endpoint {
            node_name: None,
            conditions: Some(EndpointConditions {
                ready: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }])];
        assert!(ready_endpoint_nodes(&slices).is_empty());
    }
}
