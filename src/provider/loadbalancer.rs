//! Load balancer reconciliation engine
//!
//! The engine converges the cloud objects of a `LoadBalancer` Service in a
//! fixed order: target groups first, then listeners, then unused target
//! groups, then the load balancer's own attributes, and finally a poll until
//! the load balancer reports ready with external addresses. The ordering
//! keeps listener-to-target-group references intact at every step.
//!
//! Discovery is label-based: the canonical Service labels are the only
//! durable handle on cloud objects. A read-only fallback by computed name
//! adopts load balancers created before labeling was in place.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    LoadBalancerIngress, LoadBalancerStatus, Node, Service,
};
use tracing::{debug, info, warn};

use crate::config::{
    LoadBalancerConfig, DEFAULT_CREATION_POLL_INTERVAL_SECONDS,
    DEFAULT_CREATION_POLL_TIMEOUT_SECONDS,
};
use crate::iaas::{
    CreateLoadBalancer, CreateSecurityGroup, IaasApi, IpVersion, ListFilter, LoadBalancer,
    Protocol, RulePolicy, RuleProtocol, SecurityGroup, SecurityGroupRule, UpdateLoadBalancer,
    UpdateSecurityGroup,
};
use crate::provider::annotations::ServiceAnnotations;
use crate::provider::labels;
use crate::provider::listeners::ListenerSpec;
use crate::provider::node_filter::NodeFilter;
use crate::{Error, Result};

/// IP mode reported in the Service ingress status
const INGRESS_IP_MODE: &str = "Proxy";

/// Maximum length of a security group name accepted by the API
const SECURITY_GROUP_NAME_MAX: usize = 16;

/// Reconciles Breakwater load balancers against LoadBalancer Services
pub struct LoadBalancers {
    pub(crate) iaas: Arc<dyn IaasApi>,
    pub(crate) config: LoadBalancerConfig,
    pub(crate) additional_labels: BTreeMap<String, String>,
    pub(crate) vpc: String,
    pub(crate) default_subnet: String,
    pub(crate) cluster: String,
    pub(crate) node_filter: NodeFilter,
}

impl LoadBalancers {
    /// Create the engine
    pub fn new(
        iaas: Arc<dyn IaasApi>,
        config: LoadBalancerConfig,
        additional_labels: BTreeMap<String, String>,
        vpc: impl Into<String>,
        default_subnet: impl Into<String>,
        cluster: impl Into<String>,
        node_filter: NodeFilter,
    ) -> Self {
        Self {
            iaas,
            config,
            additional_labels,
            vpc: vpc.into(),
            default_subnet: default_subnet.into(),
            cluster: cluster.into(),
            node_filter,
        }
    }

    pub(crate) fn service_labels(&self, service: &Service) -> BTreeMap<String, String> {
        labels::service_labels(&self.cluster, &self.additional_labels, service)
    }

    pub(crate) fn target_group_labels(
        &self,
        service: &Service,
        port: i32,
        protocol: Option<&str>,
    ) -> BTreeMap<String, String> {
        labels::target_group_labels(
            &self.cluster,
            &self.additional_labels,
            service,
            port,
            protocol.unwrap_or("TCP"),
        )
    }

    /// Current ingress status of the Service's load balancer
    ///
    /// Returns None when no load balancer exists for the Service.
    pub async fn get_load_balancer_status(
        &self,
        service: &Service,
    ) -> Result<Option<LoadBalancerStatus>> {
        let load_balancer = self.find_load_balancer(service).await?;
        Ok(load_balancer.as_ref().map(ingress_status))
    }

    /// Create or converge the load balancer for a Service
    ///
    /// Waits until the load balancer reports ready with at least one
    /// external address and returns the resulting ingress status.
    pub async fn ensure_load_balancer(
        &self,
        service: &Service,
        nodes: &[Node],
    ) -> Result<LoadBalancerStatus> {
        let service_name = service.metadata.name.as_deref().unwrap_or_default();
        info!(service = %service_name, "ensuring load balancer");

        let annotations = ServiceAnnotations::decode(service)?;
        let nodes = self.node_filter.filter(service, nodes).await?;

        let load_balancer = match self.find_load_balancer(service).await? {
            Some(lb) => {
                info!(
                    service = %service_name,
                    load_balancer = %lb.identity,
                    "load balancer exists, converging listeners and target groups"
                );
                lb
            }
            None => {
                info!(service = %service_name, "load balancer does not exist, creating");
                let created = self.create_load_balancer(service, &annotations).await?;
                info!(
                    service = %service_name,
                    load_balancer = %created.identity,
                    "load balancer created"
                );
                created
            }
        };

        self.reconcile(service, &annotations, &nodes, &load_balancer)
            .await?;

        let ready = self.wait_until_ready(service, &load_balancer).await?;
        info!(
            service = %service_name,
            load_balancer = %ready.identity,
            "load balancer is ready"
        );
        Ok(ingress_status(&ready))
    }

    /// Converge an existing load balancer; fails when it does not exist
    pub async fn update_load_balancer(&self, service: &Service, nodes: &[Node]) -> Result<()> {
        let service_name = service.metadata.name.as_deref().unwrap_or_default();
        info!(service = %service_name, "updating load balancer");

        let annotations = ServiceAnnotations::decode(service)?;
        let nodes = self.node_filter.filter(service, nodes).await?;

        let Some(load_balancer) = self.find_load_balancer(service).await? else {
            return Err(Error::precondition(format!(
                "load balancer not found in cloud for service {service_name}"
            )));
        };
        self.reconcile(service, &annotations, &nodes, &load_balancer)
            .await
    }

    /// Delete the Service's load balancer and every object owned with it
    ///
    /// Idempotent: absence at any step counts as success.
    pub async fn ensure_load_balancer_deleted(&self, service: &Service) -> Result<()> {
        let service_name = service.metadata.name.as_deref().unwrap_or_default();
        info!(service = %service_name, "ensuring load balancer is deleted");

        let Some(load_balancer) = self.find_load_balancer(service).await? else {
            return Ok(());
        };

        // detach all backends, and release target groups that no listener
        // holds, before the load balancer (and with it the listeners) goes
        // away
        let owned = self
            .iaas
            .list_target_groups(&ListFilter::vpc_and_labels(
                self.vpc.clone(),
                self.service_labels(service),
            ))
            .await?;
        for target_group in &owned {
            if !target_group.attachments.is_empty() {
                info!(identity = %target_group.identity, "clearing target group attachments");
                self.iaas
                    .set_target_group_attachments(&target_group.identity, Vec::new())
                    .await?;
            }
            if !target_group.listeners.is_empty() {
                info!(
                    identity = %target_group.identity,
                    "target group still has listeners, skipping"
                );
                continue;
            }
            match self.iaas.delete_target_group(&target_group.identity).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        match self.iaas.delete_load_balancer(&load_balancer.identity).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.wait_until_deleted(service).await?;

        let remaining = self
            .iaas
            .list_target_groups(&ListFilter::vpc_and_labels(
                self.vpc.clone(),
                self.service_labels(service),
            ))
            .await?;
        for target_group in remaining {
            if !target_group.listeners.is_empty() {
                info!(
                    identity = %target_group.identity,
                    "target group still has listeners, skipping"
                );
                continue;
            }
            match self.iaas.delete_target_group(&target_group.identity).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        self.delete_managed_security_group(service).await;
        Ok(())
    }

    /// One full convergence pass over an existing load balancer
    async fn reconcile(
        &self,
        service: &Service,
        annotations: &ServiceAnnotations,
        nodes: &[Node],
        load_balancer: &LoadBalancer,
    ) -> Result<()> {
        let desired_listeners = self.desired_listeners(service, annotations);
        let desired_target_groups = self.desired_target_groups(service, annotations);

        let target_groups = self
            .reconcile_target_groups(service, &desired_target_groups, nodes)
            .await?;
        self.reconcile_listeners(load_balancer, &desired_listeners, &target_groups)
            .await?;
        self.cleanup_unused_target_groups(service, &desired_target_groups)
            .await?;
        self.update_load_balancer_attributes(service, annotations, load_balancer, &desired_listeners)
            .await
    }

    /// Locate the Service's load balancer by canonical labels
    ///
    /// Falls back to the computed name, read-only, when no label match
    /// exists; duplicates are an anomaly and logged.
    pub(crate) async fn find_load_balancer(
        &self,
        service: &Service,
    ) -> Result<Option<LoadBalancer>> {
        let in_vpc = self
            .iaas
            .list_load_balancers(&ListFilter::vpc(self.vpc.clone()))
            .await?;
        if in_vpc.is_empty() {
            debug!(vpc = %self.vpc, "no load balancers in vpc");
            return Ok(None);
        }

        let expected = self.service_labels(service);
        let mut matches = in_vpc
            .iter()
            .filter(|lb| labels::matches_labels(&expected, &lb.labels));
        if let Some(found) = matches.next() {
            let extra = matches.count();
            if extra > 0 {
                warn!(
                    load_balancer = %found.identity,
                    duplicates = extra,
                    "multiple load balancers match canonical labels, using the first"
                );
            }
            return Ok(Some(found.clone()));
        }

        let name = labels::load_balancer_name(service);
        for lb in &in_vpc {
            if lb.name == name {
                info!(
                    load_balancer = %lb.identity,
                    %name,
                    "no label match, adopting load balancer by name"
                );
                return Ok(Some(lb.clone()));
            }
        }
        Ok(None)
    }

    async fn create_load_balancer(
        &self,
        service: &Service,
        annotations: &ServiceAnnotations,
    ) -> Result<LoadBalancer> {
        let service_name = service.metadata.name.as_deref().unwrap_or_default();

        let vpc = self.iaas.get_vpc(&self.vpc).await?;
        if vpc.subnets.is_empty() {
            return Err(Error::precondition(format!(
                "vpc {} has no subnets",
                self.vpc
            )));
        }

        let requested = annotations
            .subnet
            .clone()
            .unwrap_or_else(|| self.default_subnet.clone());
        let subnet = if requested.is_empty() {
            &vpc.subnets[0]
        } else {
            vpc.subnets
                .iter()
                .find(|subnet| subnet.identity == requested || subnet.slug == requested)
                .ok_or_else(|| {
                    Error::precondition(format!(
                        "no subnet found for deploying load balancer for service {service_name}"
                    ))
                })?
        };

        let mut security_groups = annotations.security_groups.clone();
        self.verify_security_groups_exist(&security_groups).await?;

        if annotations.create_security_group {
            let listeners = self.desired_listeners(service, annotations);
            let managed = self
                .ensure_managed_security_group(service, &listeners)
                .await?;
            security_groups.push(managed.identity);
        }

        self.iaas
            .create_load_balancer(CreateLoadBalancer {
                name: labels::load_balancer_name(service),
                description: format!("Loadbalancer for Kubernetes service {service_name}"),
                labels: self.service_labels(service),
                annotations: BTreeMap::new(),
                subnet: subnet.identity.clone(),
                internal: annotations.internal,
                security_group_attachments: security_groups,
            })
            .await
    }

    /// Fail when any of the referenced security groups is absent in the VPC
    async fn verify_security_groups_exist(&self, security_groups: &[String]) -> Result<()> {
        if security_groups.is_empty() {
            return Ok(());
        }
        let in_vpc = self
            .iaas
            .list_security_groups(&ListFilter::vpc(self.vpc.clone()))
            .await?;
        for wanted in security_groups {
            if !in_vpc.iter().any(|sg| &sg.identity == wanted) {
                return Err(Error::precondition(format!(
                    "security group {wanted} does not exist in vpc {}",
                    self.vpc
                )));
            }
        }
        Ok(())
    }

    /// Update the load balancer's own attributes when they drift
    ///
    /// Only the security group attachment list (order-sensitive) and the
    /// subnet are reconciled; name, description, labels and annotations are
    /// preserved, and the internal flag is never part of an update.
    async fn update_load_balancer_attributes(
        &self,
        service: &Service,
        annotations: &ServiceAnnotations,
        load_balancer: &LoadBalancer,
        desired_listeners: &[ListenerSpec],
    ) -> Result<()> {
        let mut desired_groups = annotations.security_groups.clone();
        self.verify_security_groups_exist(&desired_groups).await?;

        if annotations.create_security_group {
            let managed = self
                .ensure_managed_security_group(service, desired_listeners)
                .await?;
            desired_groups.push(managed.identity);
        }

        let current_groups: Vec<String> = load_balancer
            .security_groups
            .iter()
            .map(|sg| sg.identity.clone())
            .collect();

        let preferred_subnet = annotations
            .subnet
            .clone()
            .unwrap_or_else(|| self.default_subnet.clone());
        let preferred_subnet = if preferred_subnet.is_empty() {
            load_balancer.subnet.identity.clone()
        } else {
            preferred_subnet
        };

        if desired_groups == current_groups && load_balancer.subnet.identity == preferred_subnet {
            return Ok(());
        }

        info!(
            load_balancer = %load_balancer.identity,
            "load balancer attributes drifted, updating"
        );
        self.iaas
            .update_load_balancer(
                &load_balancer.identity,
                UpdateLoadBalancer {
                    name: load_balancer.name.clone(),
                    description: load_balancer.description.clone(),
                    labels: load_balancer.labels.clone(),
                    annotations: load_balancer.annotations.clone(),
                    subnet: Some(preferred_subnet),
                    delete_protection: load_balancer.delete_protection,
                    security_group_attachments: desired_groups,
                },
            )
            .await?;
        Ok(())
    }

    /// Create or converge the managed security group of a Service
    pub(crate) async fn ensure_managed_security_group(
        &self,
        service: &Service,
        desired_listeners: &[ListenerSpec],
    ) -> Result<SecurityGroup> {
        let service_name = service.metadata.name.as_deref().unwrap_or_default();
        let labels = self.service_labels(service);
        let ingress = ingress_rules_from_listeners(desired_listeners);
        let egress = egress_allow_all();

        let existing = self.find_managed_security_group(service).await?;
        let Some(existing) = existing else {
            let name = managed_security_group_name(&labels::load_balancer_name(service));
            info!(%name, service = %service_name, "creating managed security group");
            return self
                .iaas
                .create_security_group(CreateSecurityGroup {
                    name,
                    description: format!("Security group for Kubernetes service {service_name}"),
                    labels,
                    annotations: BTreeMap::new(),
                    vpc_identity: self.vpc.clone(),
                    allow_same_group_traffic: true,
                    ingress_rules: ingress,
                    egress_rules: egress,
                })
                .await;
        };

        if existing.ingress_rules == ingress
            && existing.egress_rules == egress
            && labels::matches_labels(&labels, &existing.labels)
        {
            debug!(identity = %existing.identity, "managed security group already converged");
            return Ok(existing);
        }

        info!(identity = %existing.identity, "updating managed security group rules");
        self.iaas
            .update_security_group(
                &existing.identity,
                UpdateSecurityGroup {
                    name: existing.name.clone(),
                    description: existing.description.clone(),
                    labels,
                    annotations: existing.annotations.clone(),
                    object_version: existing.object_version,
                    allow_same_group_traffic: true,
                    ingress_rules: ingress,
                    egress_rules: egress,
                },
            )
            .await
    }

    /// Locate the Service's managed security group by canonical labels
    async fn find_managed_security_group(
        &self,
        service: &Service,
    ) -> Result<Option<SecurityGroup>> {
        let expected = self.service_labels(service);
        let in_vpc = self
            .iaas
            .list_security_groups(&ListFilter::vpc_and_labels(
                self.vpc.clone(),
                expected.clone(),
            ))
            .await?;
        Ok(in_vpc
            .into_iter()
            .find(|sg| labels::matches_labels(&expected, &sg.labels)))
    }

    /// Best-effort removal of the managed security group
    async fn delete_managed_security_group(&self, service: &Service) {
        let security_group = match self.find_managed_security_group(service).await {
            Ok(Some(sg)) => sg,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "failed to look up managed security group for deletion");
                return;
            }
        };
        if let Err(e) = self
            .iaas
            .delete_security_group(&security_group.identity)
            .await
        {
            if !e.is_not_found() {
                warn!(
                    identity = %security_group.identity,
                    error = %e,
                    "failed to delete managed security group"
                );
            }
        }
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        coerce_poll_setting(
            self.config.creation_poll_interval,
            Duration::from_secs(DEFAULT_CREATION_POLL_INTERVAL_SECONDS as u64),
            "interval",
        )
    }

    pub(crate) fn poll_timeout(&self) -> Duration {
        coerce_poll_setting(
            self.config.creation_poll_timeout,
            Duration::from_secs(DEFAULT_CREATION_POLL_TIMEOUT_SECONDS as u64),
            "timeout",
        )
    }

    /// Poll until the load balancer reports ready with external addresses
    async fn wait_until_ready(
        &self,
        service: &Service,
        load_balancer: &LoadBalancer,
    ) -> Result<LoadBalancer> {
        if is_ready(load_balancer) {
            return Ok(load_balancer.clone());
        }
        let service_name = service.metadata.name.as_deref().unwrap_or_default();
        let timeout = self.poll_timeout();

        let poll = async {
            loop {
                if let Some(current) = self.find_load_balancer(service).await? {
                    if is_ready(&current) {
                        return Ok(current);
                    }
                    debug!(
                        load_balancer = %current.identity,
                        status = %current.status,
                        "load balancer not ready yet"
                    );
                }
                tokio::time::sleep(self.poll_interval()).await;
            }
        };
        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "load balancer for service {service_name} did not become ready within {timeout:?}"
            ))),
        }
    }

    /// Poll until the load balancer disappears from the cloud
    ///
    /// Fetch errors while polling count as "still present" and keep the
    /// wait going.
    async fn wait_until_deleted(&self, service: &Service) -> Result<()> {
        let service_name = service.metadata.name.as_deref().unwrap_or_default();
        let timeout = self.poll_timeout();

        let poll = async {
            loop {
                match self.find_load_balancer(service).await {
                    Ok(None) => return,
                    Ok(Some(_)) => {}
                    Err(e) => {
                        debug!(error = %e, "fetch failed while waiting for deletion, retrying")
                    }
                }
                tokio::time::sleep(self.poll_interval()).await;
            }
        };
        match tokio::time::timeout(timeout, poll).await {
            Ok(()) => Ok(()),
            Err(_) => Err(Error::timeout(format!(
                "load balancer for service {service_name} was not deleted within {timeout:?}"
            ))),
        }
    }
}

/// Whether the load balancer is ready to serve traffic
fn is_ready(load_balancer: &LoadBalancer) -> bool {
    load_balancer.status == "ready" && !load_balancer.external_ip_addresses.is_empty()
}

/// Ingress status reported back to the orchestrator: one entry per external
/// address, with the hostname and proxy IP mode
pub(crate) fn ingress_status(load_balancer: &LoadBalancer) -> LoadBalancerStatus {
    let ingress = load_balancer
        .external_ip_addresses
        .iter()
        .filter(|ip| !ip.is_empty())
        .map(|ip| LoadBalancerIngress {
            ip: Some(ip.clone()),
            hostname: (!load_balancer.hostname.is_empty())
                .then(|| load_balancer.hostname.clone()),
            ip_mode: Some(INGRESS_IP_MODE.to_string()),
            ports: None,
        })
        .collect();
    LoadBalancerStatus {
        ingress: Some(ingress),
    }
}

/// Coerce a poll setting to a positive duration, warning on nonsense values
fn coerce_poll_setting(value: Option<i64>, default: Duration, name: &str) -> Duration {
    match value {
        None => default,
        Some(seconds) if seconds <= 0 => {
            warn!(
                %name,
                value = seconds,
                default = default.as_secs(),
                "creation poll setting must be positive, using default"
            );
            default
        }
        Some(seconds) => Duration::from_secs(seconds as u64),
    }
}

/// Security group name within the API's length constraint
fn managed_security_group_name(lb_name: &str) -> String {
    let base = format!("sg-{lb_name}");
    match base.char_indices().nth(SECURITY_GROUP_NAME_MAX) {
        Some((idx, _)) => base[..idx].to_string(),
        None => base,
    }
}

/// Ingress rules admitting each listener's allowed sources
///
/// One rule per (listener, source); the IP version is inferred from the
/// CIDR, and rules are prioritized in emission order starting at 100.
fn ingress_rules_from_listeners(listeners: &[ListenerSpec]) -> Vec<SecurityGroupRule> {
    let mut rules = Vec::new();
    let mut priority = 100;
    for listener in listeners {
        for source in &listener.allowed_sources {
            let ip_version = match source.parse::<ipnet::IpNet>() {
                Ok(ipnet::IpNet::V6(_)) => IpVersion::V6,
                _ => IpVersion::V4,
            };
            let protocol = match listener.protocol {
                Protocol::Udp => RuleProtocol::Udp,
                Protocol::Tcp => RuleProtocol::Tcp,
            };
            rules.push(SecurityGroupRule {
                name: format!("{}-{}", listener.protocol, listener.port),
                ip_version,
                protocol,
                priority,
                remote_address: Some(source.clone()),
                port_range_min: Some(listener.port),
                port_range_max: Some(listener.port),
                policy: RulePolicy::Allow,
            });
            priority += 1;
        }
    }
    rules
}

/// Fixed allow-all egress for both IP versions
fn egress_allow_all() -> Vec<SecurityGroupRule> {
    vec![
        SecurityGroupRule {
            name: "allow-all-outbound".to_string(),
            ip_version: IpVersion::V4,
            protocol: RuleProtocol::All,
            priority: 100,
            remote_address: Some("0.0.0.0/0".to_string()),
            port_range_min: None,
            port_range_max: None,
            policy: RulePolicy::Allow,
        },
        SecurityGroupRule {
            name: "allow-all-outbound".to_string(),
            ip_version: IpVersion::V6,
            protocol: RuleProtocol::All,
            priority: 110,
            remote_address: Some("::/0".to_string()),
            port_range_min: None,
            port_range_max: None,
            policy: RulePolicy::Allow,
        },
    ]
}
