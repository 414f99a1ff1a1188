//! HTTP client for a remote Hub's portal API.
//!
//! Every call carries the bearer token of the trust relationship and a
//! request timeout; transport failures surface as `connection_problem` so
//! retry policies can distinguish them from application errors.

use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::{
    AcceptRemoteClusterRequest, ClusterCopyRequest, ErrorResponse, LogEntryRequest,
    PackageDocument, RegisterAgentRequest, RegisterAgentResponse, RemoveRemoteClusterRequest,
    StatusResponse, UpdateInfo,
};
use crate::errors::{EngineError, Result};
use crate::model::{Endpoints, Operation, OperationKey, ProgressEntry, ProvisioningToken, Site};
use crate::pack::Locator;
use crate::plan::AgentCredentials;

#[derive(Clone)]
pub struct HubClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl HubClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| EngineError::bad_parameter(format!("building http client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn site_url(&self, account_id: &str, domain: &str, suffix: &str) -> String {
        format!(
            "{}/portal/v1/accounts/{account_id}/sites/{domain}{suffix}",
            self.base_url
        )
    }

    fn operation_url(&self, key: &OperationKey, suffix: &str) -> String {
        self.site_url(
            &key.account_id,
            &key.site_domain,
            &format!("/operations/common/{}{suffix}", key.operation_id),
        )
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&impl Serialize>,
    ) -> Result<T> {
        let mut builder = self.http.request(method, url).bearer_auth(&self.token);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let message = response
            .json::<ErrorResponse>()
            .await
            .map(|e| e.error)
            .unwrap_or_else(|_| status.to_string());
        Err(match status {
            StatusCode::NOT_FOUND => EngineError::not_found(message),
            StatusCode::CONFLICT => EngineError::already_exists(message),
            StatusCode::BAD_REQUEST => EngineError::bad_parameter(message),
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => EngineError::access_denied(message),
            StatusCode::TOO_MANY_REQUESTS => EngineError::limit_exceeded(message),
            s if s.is_server_error() => EngineError::retry(message),
            _ => EngineError::connection_problem(message),
        })
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.request(reqwest::Method::GET, url, None::<&()>).await
    }

    // ── Sites & operations ────────────────────────────────────────────

    pub async fn get_site_by_domain(&self, account_id: &str, domain: &str) -> Result<Site> {
        self.get(&self.site_url(account_id, domain, "")).await
    }

    pub async fn get_site_operations(&self, account_id: &str, domain: &str) -> Result<Vec<Operation>> {
        self.get(&self.site_url(account_id, domain, "/operations")).await
    }

    pub async fn get_site_operation(&self, key: &OperationKey) -> Result<Operation> {
        self.get(&self.operation_url(key, "")).await
    }

    pub async fn get_site_operation_progress(&self, key: &OperationKey) -> Result<Option<ProgressEntry>> {
        self.get(&self.operation_url(key, "/progress")).await
    }

    /// Refresh the operation's provisioning state (server list) from the
    /// provisioner before polling for readiness.
    pub async fn update_operation_state(&self, key: &OperationKey) -> Result<Operation> {
        self.request(reqwest::Method::PUT, &self.operation_url(key, "/state"), None::<&()>)
            .await
    }

    pub async fn start_operation(&self, key: &OperationKey) -> Result<StatusResponse> {
        self.request(reqwest::Method::POST, &self.operation_url(key, "/start"), None::<&()>)
            .await
    }

    pub async fn create_progress_entry(&self, entry: &ProgressEntry) -> Result<ProgressEntry> {
        self.request(
            reqwest::Method::POST,
            &self.operation_url(&entry.key(), "/progress"),
            Some(entry),
        )
        .await
    }

    pub async fn create_log_entry(&self, key: &OperationKey, message: &str) -> Result<StatusResponse> {
        self.request(
            reqwest::Method::POST,
            &self.operation_url(key, "/logs"),
            Some(&LogEntryRequest {
                message: message.to_string(),
            }),
        )
        .await
    }

    // ── Agents & tokens ───────────────────────────────────────────────

    pub async fn register_agent(&self, request: &RegisterAgentRequest) -> Result<RegisterAgentResponse> {
        self.request(
            reqwest::Method::PUT,
            &self.operation_url(&request.key(), "/register"),
            Some(request),
        )
        .await
    }

    pub async fn get_cluster_agent(&self, account_id: &str, domain: &str) -> Result<AgentCredentials> {
        self.get(&self.site_url(account_id, domain, "/agent")).await
    }

    pub async fn get_expand_token(&self, account_id: &str, domain: &str) -> Result<ProvisioningToken> {
        self.get(&self.site_url(account_id, domain, "/expand-token")).await
    }

    // ── Cluster copy & remote-cluster handshake ───────────────────────

    pub async fn request_cluster_copy(&self, request: &ClusterCopyRequest) -> Result<StatusResponse> {
        let url = self.site_url(
            &request.account_id,
            &request.cluster_name,
            &format!("/operations/install/{}/copy-cluster", request.operation_id),
        );
        self.request(reqwest::Method::POST, &url, Some(request)).await
    }

    pub async fn accept_remote_cluster(&self, request: &AcceptRemoteClusterRequest) -> Result<StatusResponse> {
        let url = self.site_url(&request.account_id, &request.site.domain, "/accept");
        self.request(reqwest::Method::PUT, &url, Some(request)).await
    }

    pub async fn remove_remote_cluster(&self, request: &RemoveRemoteClusterRequest) -> Result<StatusResponse> {
        let url = self.site_url(&request.account_id, &request.site_domain, "/remove");
        self.request(reqwest::Method::PUT, &url, Some(request)).await
    }

    // ── Endpoints ─────────────────────────────────────────────────────

    pub async fn get_cluster_endpoints(&self, account_id: &str, domain: &str) -> Result<Endpoints> {
        self.get(&self.site_url(account_id, domain, "/cluster-endpoints")).await
    }

    pub async fn put_cluster_endpoints(
        &self,
        account_id: &str,
        domain: &str,
        endpoints: &Endpoints,
    ) -> Result<StatusResponse> {
        self.request(
            reqwest::Method::PUT,
            &self.site_url(account_id, domain, "/cluster-endpoints"),
            Some(endpoints),
        )
        .await
    }

    // ── Updates ───────────────────────────────────────────────────────

    /// The latest application version the Hub offers for this cluster.
    pub async fn check_for_update(&self, account_id: &str, domain: &str) -> Result<Option<Locator>> {
        let info: UpdateInfo = self.get(&self.site_url(account_id, domain, "/updates")).await?;
        Ok(info.locator)
    }

    // ── Packages ──────────────────────────────────────────────────────

    pub async fn get_package(&self, locator: &Locator) -> Result<PackageDocument> {
        let url = format!(
            "{}/portal/v1/packages/{}/{}/{}",
            self.base_url, locator.repository, locator.name, locator.version
        );
        self.get(&url).await
    }

    // ── Licensing ─────────────────────────────────────────────────────

    /// The CA material licenses are verified against.
    pub async fn get_license_ca(&self) -> Result<Vec<u8>> {
        let url = format!("{}/portal/v1/license/ca", self.base_url);
        self.get(&url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_hub_is_a_connection_problem() {
        // nothing listens on this port
        let client = HubClient::new("http://127.0.0.1:1", "token").unwrap();
        let err = client
            .get_site_by_domain("acc", "example.com")
            .await
            .unwrap_err();
        assert!(err.is_transient(), "expected transient error, got {err}");
    }

    #[test]
    fn urls_are_rooted_at_the_portal() {
        let client = HubClient::new("https://hub.example.com/", "token").unwrap();
        assert_eq!(client.base_url(), "https://hub.example.com");
        let key = OperationKey {
            account_id: "acc".into(),
            site_domain: "example.com".into(),
            operation_id: "op-1".into(),
        };
        assert_eq!(
            client.operation_url(&key, "/register"),
            "https://hub.example.com/portal/v1/accounts/acc/sites/example.com/operations/common/op-1/register"
        );
    }
}
