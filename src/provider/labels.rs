//! Canonical labels and names of managed cloud objects
//!
//! Labels are the sole durable handle on cloud objects: reconciliation
//! re-discovers a Service's load balancer, target groups and security group
//! by matching this label set, so the canonical subset of an existing
//! object's labels must never be mutated. The Service UID gives per-instance
//! identity and survives renames.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort};

/// Cluster identifier label
pub const LABEL_CLUSTER: &str = "breakwater.cloud/kubernetes-cluster";
/// Marker label identifying objects managed by this controller
pub const LABEL_MANAGED: &str = "breakwater.cloud/cloud-provider-managed";
/// Name of the owning Service
pub const LABEL_SERVICE_NAME: &str = "breakwater.cloud/kubernetes-service-name";
/// Namespace of the owning Service
pub const LABEL_SERVICE_NAMESPACE: &str = "breakwater.cloud/kubernetes-service-namespace";
/// UID of the owning Service
pub const LABEL_SERVICE_UID: &str = "breakwater.cloud/kubernetes-service-uid";
/// Service port a target group belongs to
pub const LABEL_SERVICE_PORT: &str = "breakwater.cloud/kubernetes-service-port";
/// Lowercased protocol of the Service port a target group belongs to
pub const LABEL_SERVICE_PROTOCOL: &str = "breakwater.cloud/kubernetes-service-protocol";

/// Canonical label set linking a cloud object to its Service
///
/// Operator-supplied labels are merged in without overriding the canonical
/// keys.
pub fn service_labels(
    cluster: &str,
    additional: &BTreeMap<String, String>,
    service: &Service,
) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_CLUSTER.to_string(), cluster.to_string());
    labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
    labels.insert(
        LABEL_SERVICE_NAME.to_string(),
        service.metadata.name.clone().unwrap_or_default(),
    );
    labels.insert(
        LABEL_SERVICE_NAMESPACE.to_string(),
        service.metadata.namespace.clone().unwrap_or_default(),
    );
    labels.insert(
        LABEL_SERVICE_UID.to_string(),
        service.metadata.uid.clone().unwrap_or_default(),
    );

    for (key, value) in additional {
        labels.entry(key.clone()).or_insert_with(|| value.clone());
    }
    labels
}

/// Label set of a target group: the canonical Service labels plus the
/// Service port and lowercased protocol
pub fn target_group_labels(
    cluster: &str,
    additional: &BTreeMap<String, String>,
    service: &Service,
    port: i32,
    protocol: &str,
) -> BTreeMap<String, String> {
    let mut labels = service_labels(cluster, additional, service);
    labels
        .entry(LABEL_SERVICE_PORT.to_string())
        .or_insert_with(|| port.to_string());
    labels
        .entry(LABEL_SERVICE_PROTOCOL.to_string())
        .or_insert_with(|| protocol.to_lowercase());
    labels
}

/// Whether `actual` carries every label of `expected` with equal values
pub fn matches_labels(
    expected: &BTreeMap<String, String>,
    actual: &BTreeMap<String, String>,
) -> bool {
    expected
        .iter()
        .all(|(key, value)| actual.get(key) == Some(value))
}

/// Deterministic load balancer name for a Service
///
/// `"a"` followed by the Service UID with dashes stripped; stable across
/// Service renames.
pub fn load_balancer_name(service: &Service) -> String {
    let uid = service.metadata.uid.as_deref().unwrap_or_default();
    format!("a{}", uid.replace('-', ""))
}

/// Name of the listener / target group belonging to a Service port
///
/// `<lbName>-<portName>`, or `<lbName>-<proto>-p<port>` when the port is
/// unnamed.
pub fn port_name(lb_name: &str, port: &ServicePort) -> String {
    match port.name.as_deref().filter(|n| !n.is_empty()) {
        Some(name) => format!("{lb_name}-{name}"),
        None => {
            let protocol = port.protocol.as_deref().unwrap_or("TCP").to_lowercase();
            format!("{lb_name}-{protocol}-p{}", port.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn sample_service() -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("test-uid-1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn canonical_labels_present() {
        let labels = service_labels("prod", &BTreeMap::new(), &sample_service());
        assert_eq!(labels.get(LABEL_CLUSTER).unwrap(), "prod");
        assert_eq!(labels.get(LABEL_MANAGED).unwrap(), "true");
        assert_eq!(labels.get(LABEL_SERVICE_NAME).unwrap(), "web");
        assert_eq!(labels.get(LABEL_SERVICE_NAMESPACE).unwrap(), "default");
        assert_eq!(labels.get(LABEL_SERVICE_UID).unwrap(), "test-uid-1");
    }

    #[test]
    fn additional_labels_never_override_canonical() {
        let mut additional = BTreeMap::new();
        additional.insert(LABEL_MANAGED.to_string(), "false".to_string());
        additional.insert("team".to_string(), "platform".to_string());

        let labels = service_labels("prod", &additional, &sample_service());
        assert_eq!(labels.get(LABEL_MANAGED).unwrap(), "true");
        assert_eq!(labels.get("team").unwrap(), "platform");
    }

    #[test]
    fn target_group_labels_add_port_and_protocol() {
        let labels =
            target_group_labels("prod", &BTreeMap::new(), &sample_service(), 80, "TCP");
        assert_eq!(labels.get(LABEL_SERVICE_PORT).unwrap(), "80");
        assert_eq!(labels.get(LABEL_SERVICE_PROTOCOL).unwrap(), "tcp");
        // canonical subset still intact
        assert_eq!(labels.get(LABEL_SERVICE_UID).unwrap(), "test-uid-1");
    }

    #[test]
    fn matches_labels_is_subset_match() {
        let expected = service_labels("prod", &BTreeMap::new(), &sample_service());
        let mut actual = expected.clone();
        actual.insert("extra".to_string(), "value".to_string());
        assert!(matches_labels(&expected, &actual));

        actual.insert(LABEL_SERVICE_UID.to_string(), "other-uid".to_string());
        assert!(!matches_labels(&expected, &actual));
    }

    #[test]
    fn load_balancer_name_strips_dashes() {
        assert_eq!(load_balancer_name(&sample_service()), "atestuid1");
    }

    #[test]
    fn port_name_uses_name_or_protocol_and_number() {
        let named = ServicePort {
            name: Some("http".to_string()),
            port: 80,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        };
        assert_eq!(port_name("atestuid1", &named), "atestuid1-http");

        let unnamed = ServicePort {
            name: None,
            port: 9000,
            protocol: Some("UDP".to_string()),
            ..Default::default()
        };
        assert_eq!(port_name("atestuid1", &unnamed), "atestuid1-udp-p9000");
    }
}
