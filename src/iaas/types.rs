//! Data model of the Breakwater VPC load-balancing API

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// L4 protocol of a listener or target group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP
    #[default]
    Tcp,
    /// UDP
    Udp,
}

impl Protocol {
    /// Map a Kubernetes Service port protocol onto the cloud protocol.
    ///
    /// The cloud is L4-only; anything that is not UDP forwards as TCP.
    pub fn from_kubernetes(protocol: &str) -> Self {
        if protocol.eq_ignore_ascii_case("udp") {
            Protocol::Udp
        } else {
            Protocol::Tcp
        }
    }

    /// Lowercase wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend selection policy of a target group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadbalancingPolicy {
    /// Rotate across attached servers
    #[default]
    #[serde(rename = "ROUND_ROBIN")]
    RoundRobin,
    /// Pick a random attached server
    #[serde(rename = "RANDOM")]
    Random,
    /// Maglev consistent hashing
    #[serde(rename = "MAGLEV")]
    Maglev,
}

/// Health check probe protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckProtocol {
    /// HTTP GET against a path
    #[default]
    Http,
    /// TCP connect only
    Tcp,
}

impl HealthCheckProtocol {
    /// Parse the annotation value. Unknown values fall back to HTTP.
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("tcp") {
            HealthCheckProtocol::Tcp
        } else {
            HealthCheckProtocol::Http
        }
    }
}

/// Health check configuration of a target group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    /// Port the probe connects to
    pub port: u16,
    /// Probe protocol
    pub protocol: HealthCheckProtocol,
    /// HTTP path probed (ignored for TCP probes)
    pub path: String,
    /// Seconds between probes
    pub period_seconds: i64,
    /// Seconds before a probe attempt is abandoned
    pub timeout_seconds: i64,
    /// Consecutive successes before a backend counts as up
    pub healthy_threshold: i64,
    /// Consecutive failures before a backend counts as down
    pub unhealthy_threshold: i64,
}

/// IP version of a security group rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpVersion {
    /// IPv4
    #[serde(rename = "ipv4")]
    V4,
    /// IPv6
    #[serde(rename = "ipv6")]
    V6,
}

/// Protocol matched by a security group rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleProtocol {
    /// Any protocol
    All,
    /// TCP only
    Tcp,
    /// UDP only
    Udp,
}

/// Verdict of a security group rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RulePolicy {
    /// Admit matching traffic
    Allow,
    /// Discard matching traffic
    Drop,
}

/// One ingress or egress rule of a security group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityGroupRule {
    /// Rule name (not unique)
    pub name: String,
    /// IP version the rule applies to
    pub ip_version: IpVersion,
    /// Matched protocol
    pub protocol: RuleProtocol,
    /// Evaluation priority; lower fires first
    pub priority: i32,
    /// Remote CIDR the rule matches
    pub remote_address: Option<String>,
    /// Lower bound of the matched port range
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_range_min: Option<u16>,
    /// Upper bound of the matched port range
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_range_max: Option<u16>,
    /// Verdict
    pub policy: RulePolicy,
}

/// A security group as observed in the cloud
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityGroup {
    /// Server-assigned identity
    pub identity: String,
    /// Name
    pub name: String,
    /// Description
    pub description: String,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Annotations
    pub annotations: BTreeMap<String, String>,
    /// Optimistic-concurrency version, echoed back on update
    pub object_version: i64,
    /// Whether members of the group may talk to each other freely
    pub allow_same_group_traffic: bool,
    /// Ingress rules
    pub ingress_rules: Vec<SecurityGroupRule>,
    /// Egress rules
    pub egress_rules: Vec<SecurityGroupRule>,
}

/// Reference to a security group attached to a load balancer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityGroupRef {
    /// Server-assigned identity
    pub identity: String,
    /// Name
    pub name: String,
}

/// A subnet of a VPC
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Subnet {
    /// Server-assigned identity
    pub identity: String,
    /// Human-readable slug, unique within the VPC
    pub slug: String,
    /// Labels
    pub labels: BTreeMap<String, String>,
}

/// A VPC with its subnets
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Vpc {
    /// Server-assigned identity
    pub identity: String,
    /// Name
    pub name: String,
    /// Subnets of the VPC
    pub subnets: Vec<Subnet>,
}

/// Reference to the subnet a load balancer is deployed in
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubnetRef {
    /// Server-assigned identity
    pub identity: String,
}

/// A VPC load balancer as observed in the cloud
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoadBalancer {
    /// Server-assigned identity
    pub identity: String,
    /// Name
    pub name: String,
    /// Description
    pub description: String,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Annotations
    pub annotations: BTreeMap<String, String>,
    /// Subnet the load balancer is deployed in
    pub subnet: SubnetRef,
    /// Whether the load balancer is internal-only. Set at creation, immutable.
    pub internal: bool,
    /// Attached security groups, in attachment order
    pub security_groups: Vec<SecurityGroupRef>,
    /// Whether the cloud refuses deletion
    pub delete_protection: bool,
    /// Lifecycle status ("provisioning", "ready", ...)
    pub status: String,
    /// External IPs assigned to the load balancer
    pub external_ip_addresses: Vec<String>,
    /// DNS hostname assigned to the load balancer
    pub hostname: String,
}

/// A listener as observed in the cloud
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Listener {
    /// Server-assigned identity
    pub identity: String,
    /// Name
    pub name: String,
    /// Description
    pub description: String,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Annotations
    pub annotations: BTreeMap<String, String>,
    /// Front-end port
    pub port: u16,
    /// Front-end protocol
    pub protocol: Option<Protocol>,
    /// Identity of the target group the listener forwards to
    pub target_group: Option<String>,
    /// CIDR ranges allowed to connect; empty admits any source
    pub allowed_sources: Vec<String>,
    /// Seconds an idle connection is kept open
    pub connection_idle_timeout: Option<u32>,
    /// Concurrent connection cap
    pub max_connections: Option<u32>,
}

/// A target group as observed in the cloud
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TargetGroup {
    /// Server-assigned identity
    pub identity: String,
    /// Name
    pub name: String,
    /// Description
    pub description: String,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Annotations
    pub annotations: BTreeMap<String, String>,
    /// Protocol forwarded to the backends
    pub protocol: Option<Protocol>,
    /// Backend node port traffic is forwarded to
    pub target_port: u16,
    /// Whether PROXY protocol v1 headers are prepended
    pub enable_proxy_protocol: Option<bool>,
    /// Backend selection policy
    pub loadbalancing_policy: Option<LoadbalancingPolicy>,
    /// Health check, if configured
    pub health_check: Option<HealthCheck>,
    /// Identities of listeners currently referencing this target group
    pub listeners: Vec<String>,
    /// Servers currently attached to this target group
    pub attachments: Vec<AttachTarget>,
}

/// One server attached to a target group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachTarget {
    /// Identity of the attached server
    pub server_identity: String,
}

/// Server-side list filter: VPC scope plus label subset match
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Restrict results to this VPC
    pub vpc: Option<String>,
    /// Only return objects carrying all of these labels
    pub labels: BTreeMap<String, String>,
}

impl ListFilter {
    /// Filter by VPC only
    pub fn vpc(vpc: impl Into<String>) -> Self {
        Self {
            vpc: Some(vpc.into()),
            labels: BTreeMap::new(),
        }
    }

    /// Filter by VPC and a label subset
    pub fn vpc_and_labels(vpc: impl Into<String>, labels: BTreeMap<String, String>) -> Self {
        Self {
            vpc: Some(vpc.into()),
            labels,
        }
    }
}

/// Request to create a load balancer
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLoadBalancer {
    /// Name
    pub name: String,
    /// Description
    pub description: String,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Annotations
    pub annotations: BTreeMap<String, String>,
    /// Identity of the subnet to deploy into
    pub subnet: String,
    /// Create as internal-only; cannot be changed afterwards
    pub internal: bool,
    /// Identities of security groups to attach, in order
    pub security_group_attachments: Vec<String>,
}

/// Request to update a load balancer
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateLoadBalancer {
    /// Name
    pub name: String,
    /// Description
    pub description: String,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Annotations
    pub annotations: BTreeMap<String, String>,
    /// Identity of the subnet to deploy into
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    /// Whether the cloud refuses deletion
    pub delete_protection: bool,
    /// Identities of security groups to attach, in order
    pub security_group_attachments: Vec<String>,
}

/// Request to create a listener on a load balancer
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateListener {
    /// Name
    pub name: String,
    /// Description
    pub description: String,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Annotations
    pub annotations: BTreeMap<String, String>,
    /// Front-end port
    pub port: u16,
    /// Front-end protocol
    pub protocol: Protocol,
    /// Identity of the target group to forward to
    pub target_group: String,
    /// CIDR ranges allowed to connect
    pub allowed_sources: Vec<String>,
    /// Seconds an idle connection is kept open
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_idle_timeout: Option<u32>,
    /// Concurrent connection cap
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

/// Request to update a listener in place
pub type UpdateListener = CreateListener;

/// Request to create a target group
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTargetGroup {
    /// VPC the target group lives in
    pub vpc: String,
    /// Name
    pub name: String,
    /// Description
    pub description: String,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Annotations
    pub annotations: BTreeMap<String, String>,
    /// Protocol forwarded to the backends
    pub protocol: Protocol,
    /// Backend node port traffic is forwarded to
    pub target_port: u16,
    /// Whether PROXY protocol v1 headers are prepended
    pub enable_proxy_protocol: bool,
    /// Backend selection policy
    pub loadbalancing_policy: LoadbalancingPolicy,
    /// Health check, if configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
}

/// Request to update a target group in place
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTargetGroup {
    /// Name
    pub name: String,
    /// Description
    pub description: String,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Annotations
    pub annotations: BTreeMap<String, String>,
    /// Protocol forwarded to the backends
    pub protocol: Protocol,
    /// Backend node port traffic is forwarded to
    pub target_port: u16,
    /// Whether PROXY protocol v1 headers are prepended
    pub enable_proxy_protocol: bool,
    /// Backend selection policy
    pub loadbalancing_policy: LoadbalancingPolicy,
    /// Health check, if configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
}

/// Request to create a security group
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSecurityGroup {
    /// Name
    pub name: String,
    /// Description
    pub description: String,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Annotations
    pub annotations: BTreeMap<String, String>,
    /// VPC the security group lives in
    pub vpc_identity: String,
    /// Whether members of the group may talk to each other freely
    pub allow_same_group_traffic: bool,
    /// Ingress rules
    pub ingress_rules: Vec<SecurityGroupRule>,
    /// Egress rules
    pub egress_rules: Vec<SecurityGroupRule>,
}

/// Request to update a security group in place
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSecurityGroup {
    /// Name
    pub name: String,
    /// Description
    pub description: String,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Annotations
    pub annotations: BTreeMap<String, String>,
    /// Version observed before the update, for optimistic concurrency
    pub object_version: i64,
    /// Whether members of the group may talk to each other freely
    pub allow_same_group_traffic: bool,
    /// Ingress rules
    pub ingress_rules: Vec<SecurityGroupRule>,
    /// Egress rules
    pub egress_rules: Vec<SecurityGroupRule>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_from_kubernetes_lowercases() {
        assert_eq!(Protocol::from_kubernetes("TCP"), Protocol::Tcp);
        assert_eq!(Protocol::from_kubernetes("UDP"), Protocol::Udp);
        assert_eq!(Protocol::from_kubernetes("udp"), Protocol::Udp);
        assert_eq!(Protocol::from_kubernetes("SCTP"), Protocol::Tcp);
        assert_eq!(Protocol::Tcp.to_string(), "tcp");
    }

    #[test]
    fn loadbalancing_policy_serializes_screaming_case() {
        assert_eq!(
            serde_json::to_value(LoadbalancingPolicy::RoundRobin).unwrap(),
            "ROUND_ROBIN"
        );
        assert_eq!(
            serde_json::to_value(LoadbalancingPolicy::Maglev).unwrap(),
            "MAGLEV"
        );
    }

    #[test]
    fn health_check_protocol_falls_back_to_http() {
        assert_eq!(HealthCheckProtocol::parse("tcp"), HealthCheckProtocol::Tcp);
        assert_eq!(HealthCheckProtocol::parse("TCP"), HealthCheckProtocol::Tcp);
        assert_eq!(
            HealthCheckProtocol::parse("grpc"),
            HealthCheckProtocol::Http
        );
    }

    #[test]
    fn listener_serializes_camel_case() {
        let listener = Listener {
            port: 443,
            protocol: Some(Protocol::Tcp),
            allowed_sources: vec!["10.0.0.0/8".to_string()],
            connection_idle_timeout: Some(6000),
            ..Default::default()
        };
        let value = serde_json::to_value(&listener).unwrap();
        assert_eq!(value["connectionIdleTimeout"], 6000);
        assert_eq!(value["allowedSources"][0], "10.0.0.0/8");
        assert_eq!(value["protocol"], "tcp");
    }
}
