//! Listener reconciliation
//!
//! One listener exists per Service port, keyed by the front-end port. A
//! listener always forwards to the target group whose labels carry the same
//! Service port and protocol; the reference is resolved at apply time by
//! label match, never cached across reconciles, so out-of-band deletions
//! heal on the next pass.

use std::collections::{BTreeMap, HashMap, HashSet};

use k8s_openapi::api::core::v1::Service;
use tracing::{debug, info, warn};

use crate::iaas::{CreateListener, Listener, LoadBalancer, Protocol, TargetGroup, UpdateListener};
use crate::provider::annotations::ServiceAnnotations;
use crate::provider::labels;
use crate::Result;

use super::loadbalancer::LoadBalancers;

/// A listener as it should exist for one Service port
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerSpec {
    /// Name derived from the load balancer name and port
    pub name: String,
    /// Description
    pub description: String,
    /// Target-group labels (Service port and protocol) used for resolution
    pub labels: BTreeMap<String, String>,
    /// Annotations
    pub annotations: BTreeMap<String, String>,
    /// Front-end port (the Service port)
    pub port: u16,
    /// Front-end protocol
    pub protocol: Protocol,
    /// Effective allowed sources: global ∪ per-port ACL, deduplicated
    pub allowed_sources: Vec<String>,
    /// Seconds an idle connection is kept open
    pub connection_idle_timeout: u32,
    /// Concurrent connection cap
    pub max_connections: u32,
}

/// Whether the observed listener set already matches the desired one
///
/// Compared semantically: port membership, protocol, allowed sources (in
/// order), timeouts, names and the resolved target-group reference.
/// Server-assigned identities are ignored.
fn listener_set_matches(
    desired: &[ListenerSpec],
    existing: &[Listener],
    resolved: &HashMap<u16, String>,
) -> bool {
    if desired.len() != existing.len() {
        return false;
    }
    let existing_by_port: HashMap<u16, &Listener> =
        existing.iter().map(|l| (l.port, l)).collect();

    desired.iter().all(|spec| {
        let Some(listener) = existing_by_port.get(&spec.port) else {
            return false;
        };
        listener.name == spec.name
            && listener.protocol == Some(spec.protocol)
            && listener.allowed_sources == spec.allowed_sources
            && listener.connection_idle_timeout == Some(spec.connection_idle_timeout)
            && listener.max_connections == Some(spec.max_connections)
            && listener.target_group.as_deref() == resolved.get(&spec.port).map(String::as_str)
    })
}

impl LoadBalancers {
    /// Desired listeners for the Service, one per port
    pub(crate) fn desired_listeners(
        &self,
        service: &Service,
        annotations: &ServiceAnnotations,
    ) -> Vec<ListenerSpec> {
        let lb_name = labels::load_balancer_name(service);
        let service_name = service.metadata.name.as_deref().unwrap_or_default();

        let ports = service
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_ref())
            .map(Vec::as_slice)
            .unwrap_or_default();

        ports
            .iter()
            .map(|port| ListenerSpec {
                name: labels::port_name(&lb_name, port),
                description: format!("Listener for Kubernetes service {service_name}"),
                labels: self.target_group_labels(service, port.port, port.protocol.as_deref()),
                annotations: BTreeMap::new(),
                port: port.port.max(0) as u16,
                protocol: Protocol::from_kubernetes(port.protocol.as_deref().unwrap_or("TCP")),
                allowed_sources: annotations.allowed_sources_for_port(service, port),
                connection_idle_timeout: annotations.idle_connection_timeout,
                max_connections: annotations.max_connections,
            })
            .collect()
    }

    /// Resolve the target group a desired listener forwards to
    ///
    /// Matched by the Service-port and protocol labels of the target group.
    /// Returns None (with a warning) when no owned target group matches; the
    /// next reconcile re-derives the set and typically succeeds.
    pub(crate) fn resolve_target_group(
        &self,
        spec: &ListenerSpec,
        target_groups: &[TargetGroup],
    ) -> Option<String> {
        for target_group in target_groups {
            if labels::matches_labels(&spec.labels, &target_group.labels) {
                debug!(
                    listener = %spec.name,
                    target_group = %target_group.identity,
                    "resolved target group for listener"
                );
                return Some(target_group.identity.clone());
            }
        }
        None
    }

    /// Converge the listeners of a load balancer onto the desired set
    ///
    /// When the sets differ semantically, listeners for removed ports are
    /// deleted and every remaining listener is updated in place; missing
    /// ports are then created. A listener whose target group cannot be
    /// resolved is skipped with a warning.
    pub(crate) async fn reconcile_listeners(
        &self,
        load_balancer: &LoadBalancer,
        desired: &[ListenerSpec],
        target_groups: &[TargetGroup],
    ) -> Result<()> {
        let existing = self.iaas.list_listeners(&load_balancer.identity).await?;

        let desired_by_port: HashMap<u16, &ListenerSpec> =
            desired.iter().map(|spec| (spec.port, spec)).collect();
        let existing_ports: HashSet<u16> = existing.iter().map(|l| l.port).collect();
        let resolved: HashMap<u16, String> = desired
            .iter()
            .filter_map(|spec| {
                self.resolve_target_group(spec, target_groups)
                    .map(|identity| (spec.port, identity))
            })
            .collect();

        if listener_set_matches(desired, &existing, &resolved) {
            debug!(
                load_balancer = %load_balancer.identity,
                "listeners already converged"
            );
        } else {
            for listener in &existing {
                let Some(spec) = desired_by_port.get(&listener.port) else {
                    info!(
                        listener = %listener.name,
                        load_balancer = %load_balancer.name,
                        "deleting listener for removed port"
                    );
                    self.iaas
                        .delete_listener(&load_balancer.identity, &listener.identity)
                        .await?;
                    continue;
                };

                let Some(target_group) = resolved.get(&listener.port) else {
                    warn!(
                        listener = %spec.name,
                        "no target group resolved for listener, skipping update"
                    );
                    continue;
                };
                info!(
                    listener = %spec.name,
                    load_balancer = %load_balancer.name,
                    target_group = %target_group,
                    "updating listener"
                );
                self.iaas
                    .update_listener(
                        &load_balancer.identity,
                        &listener.identity,
                        listener_request(spec, target_group),
                    )
                    .await?;
            }
        }

        for spec in desired {
            if existing_ports.contains(&spec.port) {
                continue;
            }
            let Some(target_group) = resolved.get(&spec.port) else {
                warn!(
                    listener = %spec.name,
                    "no target group resolved for listener, skipping create"
                );
                continue;
            };
            info!(
                listener = %spec.name,
                load_balancer = %load_balancer.name,
                target_group = %target_group,
                "creating listener"
            );
            self.iaas
                .create_listener(&load_balancer.identity, listener_request(spec, target_group))
                .await?;
        }
        Ok(())
    }
}

fn listener_request(spec: &ListenerSpec, target_group: &str) -> UpdateListener {
    CreateListener {
        name: spec.name.clone(),
        description: spec.description.clone(),
        labels: spec.labels.clone(),
        annotations: spec.annotations.clone(),
        port: spec.port,
        protocol: spec.protocol,
        target_group: target_group.to_string(),
        allowed_sources: spec.allowed_sources.clone(),
        connection_idle_timeout: Some(spec.connection_idle_timeout),
        max_connections: Some(spec.max_connections),
    }
}
