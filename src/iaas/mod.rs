//! Typed surface of the Breakwater IaaS API
//!
//! The reconcile engine talks to the cloud exclusively through the
//! [`IaasApi`] trait so tests can substitute a mock; [`http::HttpIaasClient`]
//! is the production implementation.

mod api;
pub mod http;
mod types;

pub use api::IaasApi;
#[cfg(test)]
pub use api::MockIaasApi;
pub use types::*;
