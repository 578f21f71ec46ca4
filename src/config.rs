//! Cloud-config file model
//!
//! The controller is configured through a single YAML file passed on the
//! command line. Defaults are applied before the file is parsed, so absent
//! sections keep their documented values.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default interval between polls while waiting on load balancer convergence
pub const DEFAULT_CREATION_POLL_INTERVAL_SECONDS: i64 = 5;

/// Default overall timeout while waiting on load balancer convergence
pub const DEFAULT_CREATION_POLL_TIMEOUT_SECONDS: i64 = 300;

/// Subnet label that marks the default load balancer subnet of a VPC
pub const SUBNET_ROLE_LABEL: &str = "kubernetes.io/role/lb";

/// Top-level cloud configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudConfig {
    /// Instances interface configuration
    pub instances_v2: InstancesV2Config,
    /// Load balancer interface configuration
    pub load_balancer: LoadBalancerConfig,

    /// Organisation the configured project belongs to
    pub organisation: String,
    /// Project all cloud objects are created in
    pub project: String,
    /// Base URL of the Breakwater API
    pub endpoint: String,
    /// Skip TLS verification when talking to the API
    pub insecure: bool,
    /// API credentials
    pub cloud_credentials: CloudCredentials,

    /// Identity of the VPC this cluster lives in
    pub vpc_identity: String,
    /// Subnet used for load balancers when the Service does not name one.
    /// Discovered from the VPC when empty.
    pub default_subnet: String,
    /// Cluster identifier stamped into every object label set
    pub cluster: String,
    /// Operator-supplied labels merged into every created object
    pub additional_labels: std::collections::BTreeMap<String, String>,
}

/// API credentials: a personal access token or a client-id/secret pair
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudCredentials {
    /// Personal access token
    #[serde(skip_serializing_if = "String::is_empty")]
    pub personal_access_token: String,
    /// OAuth client id
    #[serde(rename = "clientID", skip_serializing_if = "String::is_empty")]
    pub client_id: String,
    /// OAuth client secret
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_secret: String,
}

/// Load balancer interface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoadBalancerConfig {
    /// Activates the load balancer interface of the controller
    pub enabled: bool,

    /// Seconds between polls while waiting for load balancer convergence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_poll_interval: Option<i64>,

    /// Seconds to wait overall for load balancer convergence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_poll_timeout: Option<i64>,
}

/// Instances interface configuration
///
/// The instances subsystem itself lives outside this controller; the section
/// is parsed so a shared cloud-config file round-trips without loss.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstancesV2Config {
    /// Activates the instances interface
    pub enabled: bool,
    /// Fetch region and zone labels from the cloud
    pub zone_and_region_enabled: bool,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            instances_v2: InstancesV2Config::default(),
            load_balancer: LoadBalancerConfig::default(),
            organisation: String::new(),
            project: String::new(),
            endpoint: String::new(),
            insecure: false,
            cloud_credentials: CloudCredentials::default(),
            vpc_identity: String::new(),
            default_subnet: String::new(),
            cluster: String::new(),
            additional_labels: Default::default(),
        }
    }
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            creation_poll_interval: Some(DEFAULT_CREATION_POLL_INTERVAL_SECONDS),
            creation_poll_timeout: Some(DEFAULT_CREATION_POLL_TIMEOUT_SECONDS),
        }
    }
}

impl Default for InstancesV2Config {
    fn default() -> Self {
        Self {
            enabled: true,
            zone_and_region_enabled: true,
        }
    }
}

impl CloudConfig {
    /// Parse a cloud config from YAML bytes, on top of defaults
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let config: CloudConfig = serde_yaml::from_slice(bytes)
            .map_err(|e| Error::config(format!("failed to parse cloud config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a cloud config from a file path
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "failed to read cloud config {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_bytes(&bytes)
    }

    fn validate(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            return Err(Error::config("endpoint must be set"));
        }
        if self.vpc_identity.is_empty() {
            return Err(Error::config("vpcIdentity must be set"));
        }
        let creds = &self.cloud_credentials;
        let has_token = !creds.personal_access_token.is_empty();
        let has_pair = !creds.client_id.is_empty() && !creds.client_secret.is_empty();
        if !has_token && !has_pair {
            return Err(Error::config(
                "cloudCredentials requires a personalAccessToken or a clientID/clientSecret pair",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
endpoint: https://api.breakwater.cloud
organisation: acme
project: prod
vpcIdentity: vpc-1
cluster: prod-cluster
cloudCredentials:
  personalAccessToken: tok-123
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = CloudConfig::from_bytes(MINIMAL.as_bytes()).unwrap();
        assert!(config.load_balancer.enabled);
        assert_eq!(
            config.load_balancer.creation_poll_interval,
            Some(DEFAULT_CREATION_POLL_INTERVAL_SECONDS)
        );
        assert_eq!(
            config.load_balancer.creation_poll_timeout,
            Some(DEFAULT_CREATION_POLL_TIMEOUT_SECONDS)
        );
        assert!(config.instances_v2.enabled);
        assert_eq!(config.default_subnet, "");
        assert_eq!(config.cluster, "prod-cluster");
    }

    #[test]
    fn explicit_poll_settings_survive() {
        let yaml = format!(
            "{MINIMAL}loadBalancer:\n  enabled: false\n  creationPollInterval: 10\n  creationPollTimeout: 120\n"
        );
        let config = CloudConfig::from_bytes(yaml.as_bytes()).unwrap();
        assert!(!config.load_balancer.enabled);
        assert_eq!(config.load_balancer.creation_poll_interval, Some(10));
        assert_eq!(config.load_balancer.creation_poll_timeout, Some(120));
    }

    #[test]
    fn missing_credentials_rejected() {
        let yaml = "endpoint: https://api.breakwater.cloud\nvpcIdentity: vpc-1\n";
        let err = CloudConfig::from_bytes(yaml.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("cloudCredentials"));
    }

    #[test]
    fn client_pair_accepted() {
        let yaml = r#"
endpoint: https://api.breakwater.cloud
vpcIdentity: vpc-1
cloudCredentials:
  clientID: svc-account
  clientSecret: hunter2
"#;
        let config = CloudConfig::from_bytes(yaml.as_bytes()).unwrap();
        assert_eq!(config.cloud_credentials.client_id, "svc-account");
    }

    #[test]
    fn additional_labels_parse() {
        let yaml = format!("{MINIMAL}additionalLabels:\n  team: platform\n  env: prod\n");
        let config = CloudConfig::from_bytes(yaml.as_bytes()).unwrap();
        assert_eq!(
            config.additional_labels.get("team").map(String::as_str),
            Some("platform")
        );
    }
}
