//! HTTP implementation of the Breakwater IaaS API
//!
//! A thin JSON-over-HTTPS client. Authentication uses either a personal
//! access token or an OAuth client-credentials exchange against the
//! platform's token endpoint; the organisation and project scope every
//! request via headers.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::{CloudConfig, CloudCredentials};
use crate::{Error, Result, USER_AGENT};

use super::api::IaasApi;
use super::types::*;

const ORGANISATION_HEADER: &str = "x-breakwater-organisation";
const PROJECT_HEADER: &str = "x-breakwater-project";

/// Margin subtracted from a token lifetime before it counts as expired
const TOKEN_EXPIRY_SLACK: Duration = Duration::from_secs(30);

#[derive(Debug, serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// reqwest-backed [`IaasApi`] implementation
pub struct HttpIaasClient {
    http: reqwest::Client,
    base_url: String,
    organisation: String,
    project: String,
    credentials: CloudCredentials,
    token: RwLock<Option<CachedToken>>,
}

impl HttpIaasClient {
    /// Build a client from the cloud config
    pub fn new(config: &CloudConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30));
        if config.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            organisation: config.organisation.clone(),
            project: config.project.clone(),
            credentials: config.cloud_credentials.clone(),
            token: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1{path}", self.base_url)
    }

    async fn bearer(&self) -> Result<String> {
        if !self.credentials.personal_access_token.is_empty() {
            return Ok(self.credentials.personal_access_token.clone());
        }

        if let Some(cached) = self.token.read().await.as_ref() {
            if cached.expires_at > Instant::now() {
                return Ok(cached.token.clone());
            }
        }

        debug!("exchanging client credentials for an access token");
        let response = self
            .http
            .post(format!("{}/oidc/token", self.base_url))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::cloud_api(format!("token exchange failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::cloud_api_status(
                status.as_u16(),
                format!("token exchange failed: {body}"),
            ));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::cloud_api(format!("invalid token response: {e}")))?;
        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(300));
        *self.token.write().await = Some(CachedToken {
            token: token.access_token.clone(),
            expires_at: Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_SLACK),
        });
        Ok(token.access_token)
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(String, String)],
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let mut req = self
            .http
            .request(method, self.url(path))
            .bearer_auth(self.bearer().await?)
            .header(ORGANISATION_HEADER, &self.organisation)
            .query(query);
        if !self.project.is_empty() {
            req = req.header(PROJECT_HEADER, &self.project);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }

        let response = req
            .send()
            .await
            .map_err(|e| Error::cloud_api(format!("request to {path} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::cloud_api_status(
                status.as_u16(),
                format!("{path}: {message}"),
            ));
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<T> {
        self.request(reqwest::Method::GET, path, query, None)
            .await?
            .json()
            .await
            .map_err(|e| Error::cloud_api(format!("invalid response from {path}: {e}")))
    }

    async fn send_json<B: Serialize, T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let body = serde_json::to_value(body)
            .map_err(|e| Error::internal(format!("failed to encode request body: {e}")))?;
        self.request(method, path, &[], Some(body))
            .await?
            .json()
            .await
            .map_err(|e| Error::cloud_api(format!("invalid response from {path}: {e}")))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.request(reqwest::Method::DELETE, path, &[], None)
            .await
            .map(|_| ())
    }

    fn filter_query(filter: &ListFilter) -> Vec<(String, String)> {
        let mut query = Vec::new();
        if let Some(vpc) = &filter.vpc {
            query.push(("vpc".to_string(), vpc.clone()));
        }
        if !filter.labels.is_empty() {
            let selector = filter
                .labels
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",");
            query.push(("labelSelector".to_string(), selector));
        }
        query
    }
}

#[async_trait]
impl IaasApi for HttpIaasClient {
    async fn get_vpc(&self, identity: &str) -> Result<Vpc> {
        self.get_json(&format!("/vpcs/{identity}"), &[]).await
    }

    async fn list_load_balancers(&self, filter: &ListFilter) -> Result<Vec<LoadBalancer>> {
        self.get_json("/loadbalancers", &Self::filter_query(filter))
            .await
    }

    async fn create_load_balancer(&self, req: CreateLoadBalancer) -> Result<LoadBalancer> {
        self.send_json(reqwest::Method::POST, "/loadbalancers", &req)
            .await
    }

    async fn update_load_balancer(
        &self,
        identity: &str,
        req: UpdateLoadBalancer,
    ) -> Result<LoadBalancer> {
        self.send_json(reqwest::Method::PUT, &format!("/loadbalancers/{identity}"), &req)
            .await
    }

    async fn delete_load_balancer(&self, identity: &str) -> Result<()> {
        self.delete(&format!("/loadbalancers/{identity}")).await
    }

    async fn list_listeners(&self, load_balancer: &str) -> Result<Vec<Listener>> {
        self.get_json(&format!("/loadbalancers/{load_balancer}/listeners"), &[])
            .await
    }

    async fn create_listener(&self, load_balancer: &str, req: CreateListener) -> Result<Listener> {
        self.send_json(
            reqwest::Method::POST,
            &format!("/loadbalancers/{load_balancer}/listeners"),
            &req,
        )
        .await
    }

    async fn update_listener(
        &self,
        load_balancer: &str,
        listener: &str,
        req: UpdateListener,
    ) -> Result<Listener> {
        self.send_json(
            reqwest::Method::PUT,
            &format!("/loadbalancers/{load_balancer}/listeners/{listener}"),
            &req,
        )
        .await
    }

    async fn delete_listener(&self, load_balancer: &str, listener: &str) -> Result<()> {
        self.delete(&format!("/loadbalancers/{load_balancer}/listeners/{listener}"))
            .await
    }

    async fn list_target_groups(&self, filter: &ListFilter) -> Result<Vec<TargetGroup>> {
        self.get_json("/targetgroups", &Self::filter_query(filter))
            .await
    }

    async fn create_target_group(&self, req: CreateTargetGroup) -> Result<TargetGroup> {
        self.send_json(reqwest::Method::POST, "/targetgroups", &req)
            .await
    }

    async fn update_target_group(
        &self,
        identity: &str,
        req: UpdateTargetGroup,
    ) -> Result<TargetGroup> {
        self.send_json(reqwest::Method::PUT, &format!("/targetgroups/{identity}"), &req)
            .await
    }

    async fn delete_target_group(&self, identity: &str) -> Result<()> {
        self.delete(&format!("/targetgroups/{identity}")).await
    }

    async fn set_target_group_attachments(
        &self,
        target_group: &str,
        attachments: Vec<AttachTarget>,
    ) -> Result<()> {
        let body = serde_json::json!({ "attachments": attachments });
        self.request(
            reqwest::Method::PUT,
            &format!("/targetgroups/{target_group}/attachments"),
            &[],
            Some(body),
        )
        .await
        .map(|_| ())
    }

    async fn list_security_groups(&self, filter: &ListFilter) -> Result<Vec<SecurityGroup>> {
        self.get_json("/securitygroups", &Self::filter_query(filter))
            .await
    }

    async fn create_security_group(&self, req: CreateSecurityGroup) -> Result<SecurityGroup> {
        self.send_json(reqwest::Method::POST, "/securitygroups", &req)
            .await
    }

    async fn update_security_group(
        &self,
        identity: &str,
        req: UpdateSecurityGroup,
    ) -> Result<SecurityGroup> {
        self.send_json(reqwest::Method::PUT, &format!("/securitygroups/{identity}"), &req)
            .await
    }

    async fn delete_security_group(&self, identity: &str) -> Result<()> {
        self.delete(&format!("/securitygroups/{identity}")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn filter_query_includes_vpc_and_selector() {
        let mut labels = BTreeMap::new();
        labels.insert("breakwater.cloud/service-uid".to_string(), "uid-1".to_string());
        labels.insert("breakwater.cloud/cluster".to_string(), "prod".to_string());
        let filter = ListFilter::vpc_and_labels("vpc-1", labels);

        let query = HttpIaasClient::filter_query(&filter);
        assert!(query.contains(&("vpc".to_string(), "vpc-1".to_string())));
        let selector = &query.iter().find(|(k, _)| k == "labelSelector").unwrap().1;
        assert!(selector.contains("breakwater.cloud/service-uid=uid-1"));
        assert!(selector.contains("breakwater.cloud/cluster=prod"));
    }

    #[test]
    fn filter_query_empty_for_default_filter() {
        assert!(HttpIaasClient::filter_query(&ListFilter::default()).is_empty());
    }
}
