//! Target group reconciliation
//!
//! One target group exists per (protocol, backend node port) of the Service.
//! Target groups are keyed by that pair when diffing desired against
//! observed state, so identities stay stable across reconciles; attachments
//! are replaced wholesale to match the filtered node set.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use k8s_openapi::api::core::v1::{Node, Service};
use tracing::{debug, info, warn};

use crate::iaas::{
    AttachTarget, CreateTargetGroup, HealthCheck, HealthCheckProtocol, ListFilter,
    LoadbalancingPolicy, Protocol, TargetGroup, UpdateTargetGroup,
};
use crate::provider::annotations::ServiceAnnotations;
use crate::provider::labels;
use crate::Result;

use super::loadbalancer::LoadBalancers;

/// A target group as it should exist for one Service port
#[derive(Debug, Clone, PartialEq)]
pub struct TargetGroupSpec {
    /// Name derived from the load balancer name and port
    pub name: String,
    /// Description
    pub description: String,
    /// Canonical labels plus port/protocol labels
    pub labels: BTreeMap<String, String>,
    /// Annotations
    pub annotations: BTreeMap<String, String>,
    /// Protocol forwarded to the backends
    pub protocol: Protocol,
    /// Backend node port
    pub target_port: u16,
    /// Prepend PROXY protocol v1 headers
    pub enable_proxy_protocol: bool,
    /// Backend selection policy
    pub loadbalancing_policy: LoadbalancingPolicy,
    /// Health check, if configured
    pub health_check: Option<HealthCheck>,
}

impl TargetGroupSpec {
    /// Diff key: protocol and backend port identify a target group
    pub fn key(&self) -> (Protocol, u16) {
        (self.protocol, self.target_port)
    }
}

fn observed_key(tg: &TargetGroup) -> (Protocol, u16) {
    (tg.protocol.unwrap_or(Protocol::Tcp), tg.target_port)
}

/// Whether the observed target group deviates from its spec
fn needs_update(existing: &TargetGroup, spec: &TargetGroupSpec) -> bool {
    existing.name != spec.name
        || existing.protocol != Some(spec.protocol)
        || existing.target_port != spec.target_port
        || existing.enable_proxy_protocol.unwrap_or(false) != spec.enable_proxy_protocol
        || existing.loadbalancing_policy.unwrap_or_default() != spec.loadbalancing_policy
        || existing.health_check != spec.health_check
        || !labels::matches_labels(&spec.labels, &existing.labels)
}

/// Build the attachment list from the nodes' cloud provider IDs
///
/// Provider IDs have the form `<provider>://<server-id>`; nodes with a
/// missing or malformed ID are skipped.
pub fn node_attachments(nodes: &[Node]) -> Vec<AttachTarget> {
    let mut attachments = Vec::with_capacity(nodes.len());
    for node in nodes {
        let name = node.metadata.name.as_deref().unwrap_or_default();
        let provider_id = node
            .spec
            .as_ref()
            .and_then(|spec| spec.provider_id.as_deref())
            .unwrap_or_default();
        if provider_id.is_empty() {
            continue;
        }
        let Some((_, server_identity)) = provider_id.split_once("://") else {
            info!(node = %name, %provider_id, "skipping node with malformed provider ID");
            continue;
        };
        if server_identity.is_empty() {
            info!(node = %name, %provider_id, "skipping node with malformed provider ID");
            continue;
        }
        attachments.push(AttachTarget {
            server_identity: server_identity.to_string(),
        });
    }
    attachments
}

impl LoadBalancers {
    /// Desired target groups for the Service, one per port
    pub(crate) fn desired_target_groups(
        &self,
        service: &Service,
        annotations: &ServiceAnnotations,
    ) -> Vec<TargetGroupSpec> {
        let lb_name = labels::load_balancer_name(service);
        let service_name = service.metadata.name.as_deref().unwrap_or_default();
        let hc = &annotations.health_check;
        let hc_node_port = service
            .spec
            .as_ref()
            .and_then(|spec| spec.health_check_node_port)
            .unwrap_or(0);

        let ports = service
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_ref())
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut specs = Vec::with_capacity(ports.len());
        for port in ports {
            let protocol = Protocol::from_kubernetes(port.protocol.as_deref().unwrap_or("TCP"));

            // The health-check node port is assigned by Kubernetes for Local
            // traffic policy and always probes over HTTP; an explicit port
            // annotation overrides the port but not the protocol.
            let health_check = if hc_node_port > 0 {
                Some(HealthCheck {
                    port: hc.port.unwrap_or(hc_node_port as u16),
                    protocol: HealthCheckProtocol::Http,
                    path: hc.path.clone(),
                    period_seconds: hc.period_seconds,
                    timeout_seconds: hc.timeout_seconds,
                    healthy_threshold: hc.healthy_threshold,
                    unhealthy_threshold: hc.unhealthy_threshold,
                })
            } else if hc.enabled {
                hc.port.map(|probe_port| HealthCheck {
                    port: probe_port,
                    protocol: hc.protocol,
                    path: hc.path.clone(),
                    period_seconds: hc.period_seconds,
                    timeout_seconds: hc.timeout_seconds,
                    healthy_threshold: hc.healthy_threshold,
                    unhealthy_threshold: hc.unhealthy_threshold,
                })
            } else {
                None
            };

            specs.push(TargetGroupSpec {
                name: labels::port_name(&lb_name, port),
                description: format!("Target group for Kubernetes service {service_name}"),
                labels: self.target_group_labels(service, port.port, port.protocol.as_deref()),
                annotations: BTreeMap::new(),
                protocol,
                target_port: port.node_port.unwrap_or(0).max(0) as u16,
                enable_proxy_protocol: annotations.enable_proxy_protocol,
                loadbalancing_policy: annotations.loadbalancing_policy,
                health_check,
            });
        }
        specs
    }

    /// Converge cloud target groups onto the desired set
    ///
    /// Missing target groups are created, existing ones updated in place
    /// (preserving identity), and the attachment set of each is replaced to
    /// match the filtered nodes. Target groups no longer desired are left for
    /// [`Self::cleanup_unused_target_groups`] so no listener reference is
    /// broken here.
    pub(crate) async fn reconcile_target_groups(
        &self,
        service: &Service,
        desired: &[TargetGroupSpec],
        nodes: &[Node],
    ) -> Result<Vec<TargetGroup>> {
        let existing = self
            .iaas
            .list_target_groups(&ListFilter::vpc_and_labels(
                self.vpc.clone(),
                self.service_labels(service),
            ))
            .await?;
        let existing_by_key: HashMap<(Protocol, u16), TargetGroup> = existing
            .into_iter()
            .map(|tg| (observed_key(&tg), tg))
            .collect();
        debug!(
            existing = existing_by_key.len(),
            desired = desired.len(),
            "reconciling target groups"
        );

        let mut reconciled = Vec::with_capacity(desired.len());
        for spec in desired {
            let target_group = match existing_by_key.get(&spec.key()) {
                None => {
                    info!(name = %spec.name, "creating target group");
                    self.iaas
                        .create_target_group(CreateTargetGroup {
                            vpc: self.vpc.clone(),
                            name: spec.name.clone(),
                            description: spec.description.clone(),
                            labels: spec.labels.clone(),
                            annotations: spec.annotations.clone(),
                            protocol: spec.protocol,
                            target_port: spec.target_port,
                            enable_proxy_protocol: spec.enable_proxy_protocol,
                            loadbalancing_policy: spec.loadbalancing_policy,
                            health_check: spec.health_check.clone(),
                        })
                        .await?
                }
                Some(existing) if existing.identity.is_empty() => {
                    warn!(name = %existing.name, "existing target group has no identity, skipping");
                    continue;
                }
                Some(existing) if needs_update(existing, spec) => {
                    info!(identity = %existing.identity, name = %spec.name, "updating target group");
                    self.iaas
                        .update_target_group(
                            &existing.identity,
                            UpdateTargetGroup {
                                name: spec.name.clone(),
                                description: spec.description.clone(),
                                labels: spec.labels.clone(),
                                annotations: spec.annotations.clone(),
                                protocol: spec.protocol,
                                target_port: spec.target_port,
                                enable_proxy_protocol: spec.enable_proxy_protocol,
                                loadbalancing_policy: spec.loadbalancing_policy,
                                health_check: spec.health_check.clone(),
                            },
                        )
                        .await?
                }
                Some(existing) => existing.clone(),
            };

            self.sync_attachments(&target_group, nodes).await?;
            reconciled.push(target_group);
        }
        Ok(reconciled)
    }

    /// Replace the attachment set of a target group with the given nodes
    ///
    /// Skipped when the observed attachments already match.
    pub(crate) async fn sync_attachments(
        &self,
        target_group: &TargetGroup,
        nodes: &[Node],
    ) -> Result<()> {
        let attachments = node_attachments(nodes);

        let current: BTreeSet<&str> = target_group
            .attachments
            .iter()
            .map(|a| a.server_identity.as_str())
            .collect();
        let wanted: BTreeSet<&str> = attachments
            .iter()
            .map(|a| a.server_identity.as_str())
            .collect();
        if current == wanted {
            debug!(target_group = %target_group.identity, "attachments already in sync");
            return Ok(());
        }

        info!(
            target_group = %target_group.identity,
            servers = attachments.len(),
            "replacing target group attachments"
        );
        self.iaas
            .set_target_group_attachments(&target_group.identity, attachments)
            .await
    }

    /// Delete label-owned target groups that no desired listener references
    ///
    /// A target group that still has listeners attached is never deleted
    /// here; it is picked up once the listener reconciliation has released
    /// it.
    pub(crate) async fn cleanup_unused_target_groups(
        &self,
        service: &Service,
        desired: &[TargetGroupSpec],
    ) -> Result<()> {
        let existing = self
            .iaas
            .list_target_groups(&ListFilter::vpc_and_labels(
                self.vpc.clone(),
                self.service_labels(service),
            ))
            .await?;

        let desired_keys: HashSet<(Protocol, u16)> =
            desired.iter().map(TargetGroupSpec::key).collect();

        for target_group in existing {
            if !target_group.listeners.is_empty() {
                info!(
                    identity = %target_group.identity,
                    "target group still has listeners, skipping"
                );
                continue;
            }
            if desired_keys.contains(&observed_key(&target_group)) {
                continue;
            }
            info!(identity = %target_group.identity, "deleting unused target group");
            match self.iaas.delete_target_group(&target_group.identity).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
