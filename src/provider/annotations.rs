//! Service annotation surface
//!
//! All recognized options live under the `loadbalancer.breakwater.cloud/`
//! prefix. Unknown keys are ignored; missing keys fall back to documented
//! defaults. Boolean and integer parses are tolerant (the caller logs and
//! proceeds with the default) except for the load-balancing policy, which is
//! strict and fails the reconcile.

use k8s_openapi::api::core::v1::{Service, ServicePort};
use tracing::warn;

use crate::iaas::{HealthCheckProtocol, LoadbalancingPolicy};
use crate::{Error, Result};

/// Subnet the load balancer is deployed in. Default is the configured (or
/// discovered) default subnet of the VPC.
pub const ANNOTATION_SUBNET: &str = "loadbalancer.breakwater.cloud/subnet";
/// Type of load balancer to create. Default is "public".
pub const ANNOTATION_TYPE: &str = "loadbalancer.breakwater.cloud/type";
/// Create the load balancer as internal-only. Default is false.
/// Only honored at creation time; the flag is immutable afterwards.
pub const ANNOTATION_INTERNAL: &str = "loadbalancer.breakwater.cloud/internal";
/// Comma-separated identities of user-supplied security groups to attach.
pub const ANNOTATION_SECURITY_GROUPS: &str = "loadbalancer.breakwater.cloud/security-groups";
/// Create and manage a security group for the load balancer. Default false.
pub const ANNOTATION_CREATE_SECURITY_GROUP: &str =
    "loadbalancer.breakwater.cloud/create-security-group";
/// Comma-separated CIDR ranges allowed to reach every listener.
/// Default is no ACL (any source).
pub const ANNOTATION_ACL_ALLOWED_SOURCES: &str =
    "loadbalancer.breakwater.cloud/acl-allowed-sources";
/// Prefix for per-port ACLs; suffixed with the port name or number.
pub const ANNOTATION_ACL_PORT_PREFIX: &str = "loadbalancer.breakwater.cloud/acl-port";
/// Backend selection policy of the target groups. Default ROUND_ROBIN.
pub const ANNOTATION_LOADBALANCING_POLICY: &str =
    "loadbalancer.breakwater.cloud/loadbalancing-policy";
/// Enable target group health checks. Default false.
pub const ANNOTATION_HEALTH_CHECK_ENABLED: &str =
    "loadbalancer.breakwater.cloud/health-check-enabled";
/// Port probed by the health check. Required when health checks are enabled.
pub const ANNOTATION_HEALTH_CHECK_PORT: &str = "loadbalancer.breakwater.cloud/health-check-port";
/// HTTP path probed by the health check. Default "/healthz".
pub const ANNOTATION_HEALTH_CHECK_PATH: &str = "loadbalancer.breakwater.cloud/health-check-path";
/// Health check protocol, "http" or "tcp". Default "http".
pub const ANNOTATION_HEALTH_CHECK_PROTOCOL: &str =
    "loadbalancer.breakwater.cloud/health-check-protocol";
/// Seconds between health check probes. Default 10.
pub const ANNOTATION_HEALTH_CHECK_INTERVAL: &str =
    "loadbalancer.breakwater.cloud/health-check-interval";
/// Seconds before a probe attempt is abandoned. Default 5.
pub const ANNOTATION_HEALTH_CHECK_TIMEOUT: &str =
    "loadbalancer.breakwater.cloud/health-check-timeout";
/// Consecutive successes before a backend counts as up. Default 2.
pub const ANNOTATION_HEALTH_CHECK_UP_THRESHOLD: &str =
    "loadbalancer.breakwater.cloud/health-check-up-threshold";
/// Consecutive failures before a backend counts as down. Default 3.
pub const ANNOTATION_HEALTH_CHECK_DOWN_THRESHOLD: &str =
    "loadbalancer.breakwater.cloud/health-check-down-threshold";
/// Seconds an idle connection is kept open on a listener. Default 6000.
pub const ANNOTATION_IDLE_CONNECTION_TIMEOUT: &str =
    "loadbalancer.breakwater.cloud/idle-connection-timeout";
/// Concurrent connection cap of a listener. Default 10000.
pub const ANNOTATION_MAX_CONNECTIONS: &str = "loadbalancer.breakwater.cloud/max-connections";
/// Prepend PROXY protocol v1 headers to backend connections. Default false.
pub const ANNOTATION_ENABLE_PROXY_PROTOCOL: &str =
    "loadbalancer.breakwater.cloud/enable-proxy-protocol";

/// Default load balancer type
pub const DEFAULT_LOADBALANCER_TYPE: &str = "public";
/// Default listener idle-connection timeout, seconds
pub const DEFAULT_IDLE_CONNECTION_TIMEOUT: i64 = 6000;
/// Default listener connection cap
pub const DEFAULT_MAX_CONNECTIONS: i64 = 10000;
/// Default health check path
pub const DEFAULT_HEALTH_CHECK_PATH: &str = "/healthz";
/// Default seconds between health check probes
pub const DEFAULT_HEALTH_CHECK_PERIOD_SECONDS: i64 = 10;
/// Default seconds before a probe attempt is abandoned
pub const DEFAULT_HEALTH_CHECK_TIMEOUT_SECONDS: i64 = 5;
/// Default consecutive successes before a backend counts as up
pub const DEFAULT_HEALTH_CHECK_HEALTHY_THRESHOLD: i64 = 2;
/// Default consecutive failures before a backend counts as down
pub const DEFAULT_HEALTH_CHECK_UNHEALTHY_THRESHOLD: i64 = 3;

fn annotation<'a>(service: &'a Service, key: &str) -> Option<&'a str> {
    service
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
}

/// Read a string annotation, falling back to the default when absent
pub fn string_annotation(service: &Service, key: &str, default: &str) -> String {
    annotation(service, key)
        .map(str::to_string)
        .unwrap_or_else(|| default.to_string())
}

/// Read an integer annotation
///
/// Absent keys yield the default. Present-but-unparseable values are an
/// error, and so are negative values: every recognized integer option is a
/// count, port or duration, so a negative never means anything and must not
/// silently stand in for one. Callers of tolerant fields log the error and
/// proceed with the default via [`int_annotation_or`].
pub fn int_annotation(service: &Service, key: &str, default: i64) -> Result<i64> {
    let Some(value) = annotation(service, key) else {
        return Ok(default);
    };
    let parsed: i64 = value
        .parse()
        .map_err(|e| Error::invalid_annotation(key, format!("failed to parse {value:?}: {e}")))?;
    if parsed < 0 {
        return Err(Error::invalid_annotation(
            key,
            format!("negative value {parsed} is not allowed"),
        ));
    }
    Ok(parsed)
}

/// Read a boolean annotation; same contract as [`int_annotation`]
pub fn bool_annotation(service: &Service, key: &str, default: bool) -> Result<bool> {
    match annotation(service, key) {
        Some(value) => value
            .parse()
            .map_err(|e| Error::invalid_annotation(key, format!("failed to parse {value:?}: {e}"))),
        None => Ok(default),
    }
}

/// Tolerant integer read: log parse failures and keep the default
pub fn int_annotation_or(service: &Service, key: &str, default: i64) -> i64 {
    int_annotation(service, key, default).unwrap_or_else(|e| {
        warn!(error = %e, %default, "ignoring unparseable annotation");
        default
    })
}

/// Tolerant boolean read: log parse failures and keep the default
pub fn bool_annotation_or(service: &Service, key: &str, default: bool) -> bool {
    bool_annotation(service, key, default).unwrap_or_else(|e| {
        warn!(error = %e, %default, "ignoring unparseable annotation");
        default
    })
}

/// Parse the load-balancing policy annotation value
///
/// Strict: an unrecognized value fails the reconcile instead of falling
/// back to a default.
pub fn parse_loadbalancing_policy(value: &str) -> Result<LoadbalancingPolicy> {
    match value {
        "ROUND_ROBIN" => Ok(LoadbalancingPolicy::RoundRobin),
        "RANDOM" => Ok(LoadbalancingPolicy::Random),
        "MAGLEV" => Ok(LoadbalancingPolicy::Maglev),
        other => Err(Error::invalid_annotation(
            ANNOTATION_LOADBALANCING_POLICY,
            format!(
                "invalid loadbalancing policy: {other}, must be one of: ROUND_ROBIN, RANDOM, MAGLEV"
            ),
        )),
    }
}

/// Parse a comma-separated ACL annotation into validated CIDR ranges
///
/// Entries are trimmed; empty entries are dropped; entries that do not parse
/// as an IPv4 or IPv6 CIDR are logged and skipped, never fatal.
pub fn parse_acl_sources(value: &str) -> Vec<String> {
    let mut sources = Vec::new();
    for entry in value.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if entry.parse::<ipnet::IpNet>().is_err() {
            warn!(source = %entry, "skipping invalid CIDR in ACL annotation");
            continue;
        }
        sources.push(entry.to_string());
    }
    sources
}

/// Remove duplicate entries while preserving first-seen order
pub fn dedup_preserving_order(input: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    input
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

/// Per-port ACL: union of the name-keyed and number-keyed annotations
///
/// `acl-port-<name>` (when the port is named) is read first, then
/// `acl-port-<number>`; the concatenation is deduplicated preserving order.
pub fn per_port_acl_sources(service: &Service, port: &ServicePort) -> Vec<String> {
    let mut sources = Vec::new();

    if let Some(name) = port.name.as_deref().filter(|n| !n.is_empty()) {
        if let Some(value) = annotation(service, &format!("{ANNOTATION_ACL_PORT_PREFIX}-{name}")) {
            sources.extend(parse_acl_sources(value));
        }
    }
    if let Some(value) = annotation(service, &format!("{ANNOTATION_ACL_PORT_PREFIX}-{}", port.port))
    {
        sources.extend(parse_acl_sources(value));
    }

    dedup_preserving_order(sources)
}

/// Typed view of the recognized annotations, defaults applied
///
/// Decoding is tolerant for every field except the load-balancing policy.
#[derive(Debug, Clone)]
pub struct ServiceAnnotations {
    /// Requested subnet identity or slug, if any
    pub subnet: Option<String>,
    /// Load balancer type
    pub lb_type: String,
    /// Create as internal-only
    pub internal: bool,
    /// User-supplied security group identities
    pub security_groups: Vec<String>,
    /// Manage a security group for this load balancer
    pub create_security_group: bool,
    /// Global ACL applied to every listener
    pub global_allowed_sources: Vec<String>,
    /// Target group backend selection policy
    pub loadbalancing_policy: LoadbalancingPolicy,
    /// Prepend PROXY protocol v1 headers
    pub enable_proxy_protocol: bool,
    /// Listener idle-connection timeout, seconds
    pub idle_connection_timeout: u32,
    /// Listener connection cap
    pub max_connections: u32,
    /// Health check options
    pub health_check: HealthCheckAnnotations,
}

/// Health check options decoded from annotations
#[derive(Debug, Clone)]
pub struct HealthCheckAnnotations {
    /// Health checks requested
    pub enabled: bool,
    /// Probe port, when one in [1, 65535] is configured
    pub port: Option<u16>,
    /// Probe path
    pub path: String,
    /// Probe protocol
    pub protocol: HealthCheckProtocol,
    /// Seconds between probes
    pub period_seconds: i64,
    /// Seconds before a probe attempt is abandoned
    pub timeout_seconds: i64,
    /// Consecutive successes before a backend counts as up
    pub healthy_threshold: i64,
    /// Consecutive failures before a backend counts as down
    pub unhealthy_threshold: i64,
}

impl ServiceAnnotations {
    /// Decode the annotations of a Service
    ///
    /// Fails only on an invalid load-balancing policy; every other parse
    /// error is logged and replaced by the default.
    pub fn decode(service: &Service) -> Result<Self> {
        let policy = string_annotation(
            service,
            ANNOTATION_LOADBALANCING_POLICY,
            "ROUND_ROBIN",
        );
        let loadbalancing_policy = parse_loadbalancing_policy(&policy)?;

        let subnet = annotation(service, ANNOTATION_SUBNET)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        let security_groups = annotation(service, ANNOTATION_SECURITY_GROUPS)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let global_allowed_sources = annotation(service, ANNOTATION_ACL_ALLOWED_SOURCES)
            .map(parse_acl_sources)
            .unwrap_or_default();

        let health_check = HealthCheckAnnotations::decode(service);

        Ok(Self {
            subnet,
            lb_type: string_annotation(service, ANNOTATION_TYPE, DEFAULT_LOADBALANCER_TYPE),
            internal: bool_annotation_or(service, ANNOTATION_INTERNAL, false),
            security_groups,
            create_security_group: bool_annotation_or(
                service,
                ANNOTATION_CREATE_SECURITY_GROUP,
                false,
            ),
            global_allowed_sources,
            loadbalancing_policy,
            enable_proxy_protocol: bool_annotation_or(
                service,
                ANNOTATION_ENABLE_PROXY_PROTOCOL,
                false,
            ),
            idle_connection_timeout: int_annotation_or(
                service,
                ANNOTATION_IDLE_CONNECTION_TIMEOUT,
                DEFAULT_IDLE_CONNECTION_TIMEOUT,
            ) as u32,
            max_connections: int_annotation_or(
                service,
                ANNOTATION_MAX_CONNECTIONS,
                DEFAULT_MAX_CONNECTIONS,
            ) as u32,
            health_check,
        })
    }

    /// Effective allowed-sources for a port: global ∪ per-port, deduplicated
    /// preserving first-occurrence order
    pub fn allowed_sources_for_port(&self, service: &Service, port: &ServicePort) -> Vec<String> {
        let mut combined = self.global_allowed_sources.clone();
        combined.extend(per_port_acl_sources(service, port));
        dedup_preserving_order(combined)
    }
}

impl HealthCheckAnnotations {
    fn decode(service: &Service) -> Self {
        let enabled = bool_annotation_or(service, ANNOTATION_HEALTH_CHECK_ENABLED, false);

        let port = match int_annotation_or(service, ANNOTATION_HEALTH_CHECK_PORT, -1) {
            port @ 1..=65535 => Some(port as u16),
            -1 => None,
            port => {
                warn!(%port, "health-check port out of range, ignoring");
                None
            }
        };
        if enabled && port.is_none() {
            warn!("health checks enabled without a valid health-check port; no probe configured");
        }

        Self {
            enabled,
            port,
            path: string_annotation(service, ANNOTATION_HEALTH_CHECK_PATH, DEFAULT_HEALTH_CHECK_PATH),
            protocol: HealthCheckProtocol::parse(&string_annotation(
                service,
                ANNOTATION_HEALTH_CHECK_PROTOCOL,
                "http",
            )),
            period_seconds: int_annotation_or(
                service,
                ANNOTATION_HEALTH_CHECK_INTERVAL,
                DEFAULT_HEALTH_CHECK_PERIOD_SECONDS,
            ),
            timeout_seconds: int_annotation_or(
                service,
                ANNOTATION_HEALTH_CHECK_TIMEOUT,
                DEFAULT_HEALTH_CHECK_TIMEOUT_SECONDS,
            ),
            healthy_threshold: int_annotation_or(
                service,
                ANNOTATION_HEALTH_CHECK_UP_THRESHOLD,
                DEFAULT_HEALTH_CHECK_HEALTHY_THRESHOLD,
            ),
            unhealthy_threshold: int_annotation_or(
                service,
                ANNOTATION_HEALTH_CHECK_DOWN_THRESHOLD,
                DEFAULT_HEALTH_CHECK_UNHEALTHY_THRESHOLD,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn service_with_annotations(annotations: &[(&str, &str)]) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("test-service".to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn port(name: Option<&str>, number: i32) -> ServicePort {
        ServicePort {
            name: name.map(str::to_string),
            port: number,
            ..Default::default()
        }
    }

    #[test]
    fn missing_annotations_yield_defaults() {
        let service = service_with_annotations(&[]);
        let decoded = ServiceAnnotations::decode(&service).unwrap();

        assert_eq!(decoded.subnet, None);
        assert_eq!(decoded.lb_type, "public");
        assert!(!decoded.internal);
        assert!(decoded.security_groups.is_empty());
        assert!(!decoded.create_security_group);
        assert!(decoded.global_allowed_sources.is_empty());
        assert_eq!(decoded.loadbalancing_policy, LoadbalancingPolicy::RoundRobin);
        assert!(!decoded.enable_proxy_protocol);
        assert_eq!(decoded.idle_connection_timeout, 6000);
        assert_eq!(decoded.max_connections, 10000);
        assert!(!decoded.health_check.enabled);
        assert_eq!(decoded.health_check.port, None);
        assert_eq!(decoded.health_check.path, "/healthz");
        assert_eq!(decoded.health_check.period_seconds, 10);
        assert_eq!(decoded.health_check.timeout_seconds, 5);
        assert_eq!(decoded.health_check.healthy_threshold, 2);
        assert_eq!(decoded.health_check.unhealthy_threshold, 3);
    }

    #[test]
    fn unparseable_tolerant_field_errors_and_defaults() {
        let service = service_with_annotations(&[(ANNOTATION_MAX_CONNECTIONS, "not-a-number")]);

        let err = int_annotation(&service, ANNOTATION_MAX_CONNECTIONS, DEFAULT_MAX_CONNECTIONS)
            .unwrap_err();
        assert!(err.to_string().contains("max-connections"));

        assert_eq!(
            int_annotation_or(&service, ANNOTATION_MAX_CONNECTIONS, DEFAULT_MAX_CONNECTIONS),
            DEFAULT_MAX_CONNECTIONS
        );

        // the bundle survives the bad value
        let decoded = ServiceAnnotations::decode(&service).unwrap();
        assert_eq!(decoded.max_connections, 10000);
    }

    #[test]
    fn negative_tolerant_field_errors_and_defaults() {
        // a sign-flip typo must not zero out the connection cap; it falls
        // back to the documented default like any other bad value
        let service = service_with_annotations(&[
            (ANNOTATION_MAX_CONNECTIONS, "-1"),
            (ANNOTATION_IDLE_CONNECTION_TIMEOUT, "-16000"),
        ]);

        let err = int_annotation(&service, ANNOTATION_MAX_CONNECTIONS, DEFAULT_MAX_CONNECTIONS)
            .unwrap_err();
        assert!(err.to_string().contains("negative value"));
        assert_eq!(
            int_annotation_or(&service, ANNOTATION_MAX_CONNECTIONS, DEFAULT_MAX_CONNECTIONS),
            DEFAULT_MAX_CONNECTIONS
        );

        let decoded = ServiceAnnotations::decode(&service).unwrap();
        assert_eq!(decoded.max_connections, 10000);
        assert_eq!(decoded.idle_connection_timeout, 6000);
    }

    #[test]
    fn unparseable_bool_errors_and_defaults() {
        let service = service_with_annotations(&[(ANNOTATION_INTERNAL, "not-a-bool")]);
        assert!(bool_annotation(&service, ANNOTATION_INTERNAL, false).is_err());
        assert!(!bool_annotation_or(&service, ANNOTATION_INTERNAL, false));
    }

    #[test]
    fn invalid_policy_is_fatal() {
        let service =
            service_with_annotations(&[(ANNOTATION_LOADBALANCING_POLICY, "INVALID_POLICY")]);
        let err = ServiceAnnotations::decode(&service).unwrap_err();
        assert!(err.to_string().contains("invalid loadbalancing policy"));
    }

    #[test]
    fn valid_policy_values() {
        for (value, expected) in [
            ("ROUND_ROBIN", LoadbalancingPolicy::RoundRobin),
            ("RANDOM", LoadbalancingPolicy::Random),
            ("MAGLEV", LoadbalancingPolicy::Maglev),
        ] {
            let service = service_with_annotations(&[(ANNOTATION_LOADBALANCING_POLICY, value)]);
            let decoded = ServiceAnnotations::decode(&service).unwrap();
            assert_eq!(decoded.loadbalancing_policy, expected);
        }
    }

    #[test]
    fn acl_parsing_trims_and_skips_invalid() {
        assert_eq!(
            parse_acl_sources(" 10.0.0.0/8 , 192.168.1.0/24 "),
            vec!["10.0.0.0/8", "192.168.1.0/24"]
        );
        assert_eq!(
            parse_acl_sources("10.0.0.0/8,invalid-cidr,192.168.1.0/24,another-invalid"),
            vec!["10.0.0.0/8", "192.168.1.0/24"]
        );
        assert!(parse_acl_sources("").is_empty());
        assert!(parse_acl_sources("   ,  ,  ").is_empty());
        assert_eq!(parse_acl_sources("::/0"), vec!["::/0"]);
    }

    #[test]
    fn dedup_preserves_first_seen_order() {
        let input = vec![
            "10.0.0.0/8".to_string(),
            "192.168.1.0/24".to_string(),
            "10.0.0.0/8".to_string(),
            "172.16.0.0/12".to_string(),
            "192.168.1.0/24".to_string(),
        ];
        assert_eq!(
            dedup_preserving_order(input),
            vec!["10.0.0.0/8", "192.168.1.0/24", "172.16.0.0/12"]
        );
    }

    #[test]
    fn per_port_acl_by_name() {
        let service = service_with_annotations(&[(
            "loadbalancer.breakwater.cloud/acl-port-http",
            "10.0.0.0/8,192.168.1.0/24",
        )]);
        assert_eq!(
            per_port_acl_sources(&service, &port(Some("http"), 80)),
            vec!["10.0.0.0/8", "192.168.1.0/24"]
        );
    }

    #[test]
    fn per_port_acl_by_number() {
        let service = service_with_annotations(&[(
            "loadbalancer.breakwater.cloud/acl-port-443",
            "172.16.0.0/12",
        )]);
        assert_eq!(
            per_port_acl_sources(&service, &port(Some("https"), 443)),
            vec!["172.16.0.0/12"]
        );
    }

    #[test]
    fn per_port_acl_unions_name_and_number() {
        let service = service_with_annotations(&[
            ("loadbalancer.breakwater.cloud/acl-port-http", "10.0.0.0/8"),
            ("loadbalancer.breakwater.cloud/acl-port-80", "192.168.1.0/24"),
        ]);
        assert_eq!(
            per_port_acl_sources(&service, &port(Some("http"), 80)),
            vec!["10.0.0.0/8", "192.168.1.0/24"]
        );
    }

    #[test]
    fn per_port_acl_empty_without_annotations() {
        let service = service_with_annotations(&[]);
        assert!(per_port_acl_sources(&service, &port(Some("http"), 80)).is_empty());
    }

    #[test]
    fn combined_acl_union_preserves_order() {
        let service = service_with_annotations(&[
            (
                ANNOTATION_ACL_ALLOWED_SOURCES,
                "10.0.0.0/8,192.168.1.0/24",
            ),
            ("loadbalancer.breakwater.cloud/acl-port-http", "172.16.0.0/12"),
            ("loadbalancer.breakwater.cloud/acl-port-443", "10.10.0.0/16"),
        ]);
        let decoded = ServiceAnnotations::decode(&service).unwrap();

        assert_eq!(
            decoded.allowed_sources_for_port(&service, &port(Some("http"), 80)),
            vec!["10.0.0.0/8", "192.168.1.0/24", "172.16.0.0/12"]
        );
        assert_eq!(
            decoded.allowed_sources_for_port(&service, &port(Some("https"), 443)),
            vec!["10.0.0.0/8", "192.168.1.0/24", "10.10.0.0/16"]
        );
    }

    #[test]
    fn health_check_port_out_of_range_ignored() {
        let service = service_with_annotations(&[
            (ANNOTATION_HEALTH_CHECK_ENABLED, "true"),
            (ANNOTATION_HEALTH_CHECK_PORT, "70000"),
        ]);
        let decoded = ServiceAnnotations::decode(&service).unwrap();
        assert!(decoded.health_check.enabled);
        assert_eq!(decoded.health_check.port, None);
    }

    #[test]
    fn security_groups_split_and_trimmed() {
        let service =
            service_with_annotations(&[(ANNOTATION_SECURITY_GROUPS, "sg-1, sg-2 ,,sg-3")]);
        let decoded = ServiceAnnotations::decode(&service).unwrap();
        assert_eq!(decoded.security_groups, vec!["sg-1", "sg-2", "sg-3"]);
    }
}
