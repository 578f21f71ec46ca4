//! The Breakwater cloud provider
//!
//! Wires the cloud config and IaaS client into the load-balancer
//! reconciliation engine and its supporting subsystems (node filter,
//! endpoint-slice watcher, resync queue, Service controller).

pub mod annotations;
pub mod controller;
pub mod endpoints;
pub mod labels;
pub mod listeners;
pub mod loadbalancer;
pub mod node_filter;
pub mod queue;
pub mod target_groups;

use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use tracing::info;

use crate::config::{CloudConfig, SUBNET_ROLE_LABEL};
use crate::iaas::{http::HttpIaasClient, IaasApi, Vpc};
use crate::{Error, Result};

pub use endpoints::EndpointSliceWatcher;
pub use loadbalancer::LoadBalancers;
pub use node_filter::{ApiEndpointSliceLister, EndpointSliceLister, NodeFilter};
pub use queue::{ResyncQueue, ResyncWorker};

/// Whether the Service asks for an external load balancer
pub fn is_load_balancer_service(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.type_.as_deref())
        == Some("LoadBalancer")
}

/// The provider: validated configuration plus a cloud API client
pub struct BreakwaterCloud {
    config: CloudConfig,
    iaas: Arc<dyn IaasApi>,
}

impl std::fmt::Debug for BreakwaterCloud {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakwaterCloud")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BreakwaterCloud {
    /// Build the provider from config, talking HTTP to the cloud
    pub async fn new(config: CloudConfig) -> Result<Self> {
        let iaas = Arc::new(HttpIaasClient::new(&config)?);
        Self::with_client(config, iaas).await
    }

    /// Build the provider with an explicit cloud API client
    ///
    /// Verifies access by fetching the configured VPC and discovers the
    /// default subnet when none is configured.
    pub async fn with_client(mut config: CloudConfig, iaas: Arc<dyn IaasApi>) -> Result<Self> {
        let vpc = iaas.get_vpc(&config.vpc_identity).await.map_err(|e| {
            if e.is_not_found() {
                Error::config(format!("vpc {} not found", config.vpc_identity))
            } else {
                e
            }
        })?;

        if config.default_subnet.is_empty() {
            config.default_subnet = discover_default_subnet(&vpc)?;
            info!(
                subnet = %config.default_subnet,
                vpc = %config.vpc_identity,
                "discovered default load balancer subnet"
            );
        }

        Ok(Self { config, iaas })
    }

    /// The effective configuration (with the discovered default subnet)
    pub fn config(&self) -> &CloudConfig {
        &self.config
    }

    /// Whether a cluster identifier is configured
    pub fn has_cluster_id(&self) -> bool {
        !self.config.cluster.is_empty()
    }

    /// The load balancer engine, or None when the interface is disabled
    pub fn load_balancers(
        &self,
        endpoint_slices: Arc<dyn EndpointSliceLister>,
    ) -> Option<LoadBalancers> {
        if !self.config.load_balancer.enabled {
            return None;
        }
        Some(LoadBalancers::new(
            self.iaas.clone(),
            self.config.load_balancer.clone(),
            self.config.additional_labels.clone(),
            self.config.vpc_identity.clone(),
            self.config.default_subnet.clone(),
            self.config.cluster.clone(),
            NodeFilter::new(endpoint_slices),
        ))
    }
}

/// Pick the default subnet of a VPC
///
/// A single-subnet VPC uses that subnet; with more than one, exactly the
/// subnet labeled for load balancers is eligible.
fn discover_default_subnet(vpc: &Vpc) -> Result<String> {
    match vpc.subnets.as_slice() {
        [] => Err(Error::config(format!(
            "no subnets found for vpc {} to discover the default subnet",
            vpc.identity
        ))),
        [subnet] => Ok(subnet.identity.clone()),
        subnets => subnets
            .iter()
            .find(|subnet| {
                subnet
                    .labels
                    .get(SUBNET_ROLE_LABEL)
                    .map(|role| matches!(role.to_lowercase().as_str(), "true" | "1" | "yes"))
                    .unwrap_or(false)
            })
            .map(|subnet| subnet.identity.clone())
            .ok_or_else(|| {
                Error::config(format!(
                    "no subnet found with the label '{SUBNET_ROLE_LABEL}'"
                ))
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iaas::{MockIaasApi, Subnet};
    use k8s_openapi::api::core::v1::ServiceSpec;

    fn subnet(identity: &str, role: Option<&str>) -> Subnet {
        Subnet {
            identity: identity.to_string(),
            labels: role
                .map(|r| {
                    [(SUBNET_ROLE_LABEL.to_string(), r.to_string())]
                        .into_iter()
                        .collect()
                })
                .unwrap_or_default(),
            ..Default::default()
        }
    }

    fn typed_service(type_: &str) -> Service {
        Service {
            spec: Some(ServiceSpec {
                type_: Some(type_.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn load_balancer_service_detection() {
        assert!(is_load_balancer_service(&typed_service("LoadBalancer")));
        assert!(!is_load_balancer_service(&typed_service("ClusterIP")));
        assert!(!is_load_balancer_service(&Service::default()));
    }

    #[test]
    fn single_subnet_is_the_default() {
        let vpc = Vpc {
            identity: "vpc-1".to_string(),
            subnets: vec![subnet("subnet-1", None)],
            ..Default::default()
        };
        assert_eq!(discover_default_subnet(&vpc).unwrap(), "subnet-1");
    }

    #[test]
    fn labeled_subnet_wins_among_many() {
        let vpc = Vpc {
            identity: "vpc-1".to_string(),
            subnets: vec![
                subnet("subnet-1", None),
                subnet("subnet-2", Some("yes")),
                subnet("subnet-3", Some("false")),
            ],
            ..Default::default()
        };
        assert_eq!(discover_default_subnet(&vpc).unwrap(), "subnet-2");
    }

    #[test]
    fn unlabeled_multi_subnet_vpc_is_an_error() {
        let vpc = Vpc {
            identity: "vpc-1".to_string(),
            subnets: vec![subnet("subnet-1", None), subnet("subnet-2", None)],
            ..Default::default()
        };
        let err = discover_default_subnet(&vpc).unwrap_err();
        assert!(err.to_string().contains(SUBNET_ROLE_LABEL));
    }

    #[tokio::test]
    async fn missing_vpc_is_a_config_error() {
        let mut iaas = MockIaasApi::new();
        iaas.expect_get_vpc()
            .returning(|_| Err(Error::cloud_api_status(404, "no such vpc")));

        let config = CloudConfig {
            vpc_identity: "vpc-missing".to_string(),
            ..Default::default()
        };
        let err = BreakwaterCloud::with_client(config, Arc::new(iaas))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("vpc-missing"));
    }

    #[tokio::test]
    async fn disabled_interface_yields_no_engine() {
        let mut iaas = MockIaasApi::new();
        iaas.expect_get_vpc().returning(|_| {
            Ok(Vpc {
                identity: "vpc-1".to_string(),
                subnets: vec![subnet("subnet-1", None)],
                ..Default::default()
            })
        });

        let mut config = CloudConfig {
            vpc_identity: "vpc-1".to_string(),
            ..Default::default()
        };
        config.load_balancer.enabled = false;
        let cloud = BreakwaterCloud::with_client(config, Arc::new(iaas))
            .await
            .unwrap();

        let lister = Arc::new(crate::provider::node_filter::MockEndpointSliceLister::new());
        assert!(cloud.load_balancers(lister).is_none());
        assert_eq!(cloud.config().default_subnet, "subnet-1");
    }
}
