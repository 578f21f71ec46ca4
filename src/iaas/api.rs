//! Cloud API trait
//!
//! Every call the reconcile engine makes against the cloud goes through
//! [`IaasApi`]. The trait exists so tests can mock the cloud while production
//! uses the HTTP client; the same pattern the rest of the codebase uses for
//! Kubernetes access.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::Result;

use super::types::{
    AttachTarget, CreateListener, CreateLoadBalancer, CreateSecurityGroup, CreateTargetGroup,
    ListFilter, Listener, LoadBalancer, SecurityGroup, TargetGroup, UpdateListener,
    UpdateLoadBalancer, UpdateSecurityGroup, UpdateTargetGroup, Vpc,
};

/// Typed operations of the Breakwater IaaS API
///
/// Not-found responses surface as [`crate::Error::CloudApi`] with status 404
/// and are classified through [`crate::Error::is_not_found`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IaasApi: Send + Sync {
    /// Fetch a VPC with its subnets
    async fn get_vpc(&self, identity: &str) -> Result<Vpc>;

    /// List load balancers matching the filter
    async fn list_load_balancers(&self, filter: &ListFilter) -> Result<Vec<LoadBalancer>>;

    /// Create a load balancer
    async fn create_load_balancer(&self, req: CreateLoadBalancer) -> Result<LoadBalancer>;

    /// Update a load balancer in place
    async fn update_load_balancer(
        &self,
        identity: &str,
        req: UpdateLoadBalancer,
    ) -> Result<LoadBalancer>;

    /// Delete a load balancer
    async fn delete_load_balancer(&self, identity: &str) -> Result<()>;

    /// List the listeners of a load balancer
    async fn list_listeners(&self, load_balancer: &str) -> Result<Vec<Listener>>;

    /// Create a listener on a load balancer
    async fn create_listener(&self, load_balancer: &str, req: CreateListener) -> Result<Listener>;

    /// Update a listener in place
    async fn update_listener(
        &self,
        load_balancer: &str,
        listener: &str,
        req: UpdateListener,
    ) -> Result<Listener>;

    /// Delete a listener
    async fn delete_listener(&self, load_balancer: &str, listener: &str) -> Result<()>;

    /// List target groups matching the filter
    async fn list_target_groups(&self, filter: &ListFilter) -> Result<Vec<TargetGroup>>;

    /// Create a target group
    async fn create_target_group(&self, req: CreateTargetGroup) -> Result<TargetGroup>;

    /// Update a target group in place
    async fn update_target_group(
        &self,
        identity: &str,
        req: UpdateTargetGroup,
    ) -> Result<TargetGroup>;

    /// Delete a target group
    async fn delete_target_group(&self, identity: &str) -> Result<()>;

    /// Replace the full attachment set of a target group
    async fn set_target_group_attachments(
        &self,
        target_group: &str,
        attachments: Vec<AttachTarget>,
    ) -> Result<()>;

    /// List security groups matching the filter
    async fn list_security_groups(&self, filter: &ListFilter) -> Result<Vec<SecurityGroup>>;

    /// Create a security group
    async fn create_security_group(&self, req: CreateSecurityGroup) -> Result<SecurityGroup>;

    /// Update a security group in place
    async fn update_security_group(
        &self,
        identity: &str,
        req: UpdateSecurityGroup,
    ) -> Result<SecurityGroup>;

    /// Delete a security group
    async fn delete_security_group(&self, identity: &str) -> Result<()>;
}
