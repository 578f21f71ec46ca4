//! Breakwater - cloud controller manager for the Breakwater Cloud VPC platform
//!
//! Breakwater watches Kubernetes `Service` objects of type `LoadBalancer` and
//! converges a set of cloud objects against them: a VPC load balancer, its
//! listeners, the target groups the listeners forward to, the node attachments
//! of each target group, and an optional managed security group.
//!
//! Ownership of cloud objects is label-based: every created object carries a
//! canonical label set derived from the Service (cluster, namespace, name,
//! UID), and reconciliation re-discovers objects from those labels alone.
//!
//! # Modules
//!
//! - [`config`] - cloud-config file model (YAML)
//! - [`iaas`] - typed Breakwater IaaS API surface and HTTP client
//! - [`provider`] - the load-balancer reconciliation engine, node filter,
//!   endpoint-slice watcher and resync queue
//! - [`error`] - error types for the controller

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod iaas;
pub mod provider;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// The cloud provider name, as reported to the orchestrator
pub const PROVIDER_NAME: &str = "breakwater";

/// User agent reported to the Breakwater API
pub const USER_AGENT: &str = concat!("breakwater-cloud-controller/", env!("CARGO_PKG_VERSION"));
