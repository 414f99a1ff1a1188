//! Portal API route handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use tracing::info;

use crate::api::{
    AcceptRemoteClusterRequest, CheckLicenseRequest, ClusterCopyRequest, LicenseResponse,
    LogEntryRequest, NewLicenseRequest, PackageDocument, RegisterAgentRequest,
    RemoveRemoteClusterRequest, StatusResponse, UpdateInfo,
};
use crate::errors::EngineError;
use crate::hub::HubClient;
use crate::model::{
    Endpoints, License, LicensePayload, OperationKey, ProgressEntry, ProvisioningToken, SiteReason,
    TokenType, TrustedCluster,
};
use crate::pack::{ca_locator, Locator};
use crate::plan::AgentCredentials;
use crate::server::{parse_delay, ApiError, SharedPortal};

type ApiResult<T> = Result<T, ApiError>;

/// Keys withheld from auth-connector documents unless `?with_secrets=true`.
const SECRET_FIELDS: &[&str] = &["client_secret", "signing_key_pair", "private_key", "secret"];

fn operation_key(account_id: String, site_domain: String, operation_id: String) -> OperationKey {
    OperationKey {
        account_id,
        site_domain,
        operation_id,
    }
}

// ── Sites & operations ────────────────────────────────────────────────

pub async fn get_site(
    State(state): State<SharedPortal>,
    Path((account_id, site_domain)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.operator.get_site(&account_id, &site_domain).await?))
}

pub async fn list_operations(
    State(state): State<SharedPortal>,
    Path((account_id, site_domain)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.operator.list_operations(&account_id, &site_domain).await?))
}

pub async fn get_operation(
    State(state): State<SharedPortal>,
    Path((account_id, site_domain, operation_id)): Path<(String, String, String)>,
) -> ApiResult<impl IntoResponse> {
    let key = operation_key(account_id, site_domain, operation_id);
    Ok(Json(state.operator.get_operation(&key).await?))
}

/// Refresh provisioning state from the provisioner. The local operator has
/// no provisioner of its own, so this returns the stored record.
pub async fn update_operation_state(
    State(state): State<SharedPortal>,
    Path((account_id, site_domain, operation_id)): Path<(String, String, String)>,
) -> ApiResult<impl IntoResponse> {
    let key = operation_key(account_id, site_domain, operation_id);
    Ok(Json(state.operator.get_operation(&key).await?))
}

pub async fn start_operation(
    State(state): State<SharedPortal>,
    Path((account_id, site_domain, operation_id)): Path<(String, String, String)>,
) -> ApiResult<impl IntoResponse> {
    let key = operation_key(account_id, site_domain, operation_id);
    state.operator.start_operation(&key).await?;
    Ok(Json(StatusResponse::ok()))
}

pub async fn get_progress(
    State(state): State<SharedPortal>,
    Path((account_id, site_domain, operation_id)): Path<(String, String, String)>,
) -> ApiResult<impl IntoResponse> {
    let key = operation_key(account_id, site_domain, operation_id);
    Ok(Json(state.operator.last_progress_entry(&key).await?))
}

pub async fn create_progress(
    State(state): State<SharedPortal>,
    Path((_account_id, _site_domain, _operation_id)): Path<(String, String, String)>,
    Json(entry): Json<ProgressEntry>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.operator.create_progress_entry(&entry).await?))
}

pub async fn create_log_entry(
    State(state): State<SharedPortal>,
    Path((account_id, site_domain, operation_id)): Path<(String, String, String)>,
    Json(request): Json<LogEntryRequest>,
) -> ApiResult<impl IntoResponse> {
    let key = operation_key(account_id, site_domain, operation_id);
    state.operator.create_log_entry(&key, &request.message).await?;
    Ok(Json(StatusResponse::ok()))
}

pub async fn register_agent(
    State(state): State<SharedPortal>,
    Path((_account_id, _site_domain, _operation_id)): Path<(String, String, String)>,
    Json(request): Json<RegisterAgentRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.operator.register_agent(&request).await?))
}

/// Hub-initiated install: replicate this cluster's records from the Hub
/// named in the request.
pub async fn copy_cluster(
    State(state): State<SharedPortal>,
    Path((_account_id, _site_domain, _operation_id)): Path<(String, String, String)>,
    Json(request): Json<ClusterCopyRequest>,
) -> ApiResult<impl IntoResponse> {
    let hub = HubClient::new(&request.ops_url, &request.ops_token)?;
    crate::install::replicate_cluster(&state.backend, &state.packages, &hub, &request).await?;
    Ok(Json(StatusResponse::ok()))
}

// ── Endpoints ─────────────────────────────────────────────────────────

pub async fn get_endpoints(
    State(state): State<SharedPortal>,
    Path((_account_id, site_domain)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.backend.get_endpoints(&site_domain)?))
}

pub async fn put_endpoints(
    State(state): State<SharedPortal>,
    Path((_account_id, site_domain)): Path<(String, String)>,
    Json(endpoints): Json<Endpoints>,
) -> ApiResult<impl IntoResponse> {
    state.backend.put_endpoints(&site_domain, &endpoints)?;
    Ok(Json(StatusResponse::ok()))
}

// ── Agents & tokens ───────────────────────────────────────────────────

pub async fn get_cluster_agent(
    State(state): State<SharedPortal>,
    Path((_account_id, site_domain)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let doc = state.backend.get_resource("agent-credentials", &site_domain)?;
    let agent: AgentCredentials = serde_json::from_value(doc)
        .map_err(|e| EngineError::bad_parameter(format!("malformed agent credentials: {e}")))?;
    Ok(Json(agent))
}

/// Return the cluster's expand token, creating one on first use.
pub async fn get_expand_token(
    State(state): State<SharedPortal>,
    Path((account_id, site_domain)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    if let Some(token) = state.backend.find_token(&site_domain, TokenType::Expand)? {
        return Ok(Json(token));
    }
    let token = ProvisioningToken::new(
        TokenType::Expand,
        &account_id,
        &site_domain,
        "",
        &format!("agent@{site_domain}"),
        None,
    );
    state.backend.create_token(&token)?;
    Ok(Json(token))
}

// ── Updates ───────────────────────────────────────────────────────────

pub async fn check_updates(
    State(state): State<SharedPortal>,
    Path((_account_id, site_domain)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let site = state.backend.get_site(&site_domain)?;
    let latest = state
        .packages
        .list_repository(&site.app_package.repository)?
        .into_iter()
        .map(|envelope| envelope.locator)
        .filter(|locator| locator.newer_than(&site.app_package))
        .max_by(|a, b| {
            if a.newer_than(b) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Less
            }
        });
    Ok(Json(UpdateInfo { locator: latest }))
}

pub async fn download_updates(
    State(state): State<SharedPortal>,
    Path((_account_id, site_domain)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let downloaded = state.updates.run_once(&site_domain).await?;
    Ok(Json(UpdateInfo { locator: downloaded }))
}

#[derive(Deserialize)]
pub struct EnableUpdatesRequest {
    pub interval_secs: u64,
}

pub async fn periodic_updates_status(
    State(state): State<SharedPortal>,
    Path((_account_id, site_domain)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let site = state.backend.get_site(&site_domain)?;
    Ok(Json(serde_json::json!({
        "enabled": site.update_interval_secs > 0,
        "running": state.updates.is_running(&site_domain),
        "interval_secs": site.update_interval_secs,
        "next_update_check": site.next_update_check,
    })))
}

pub async fn enable_periodic_updates(
    State(state): State<SharedPortal>,
    Path((_account_id, site_domain)): Path<(String, String)>,
    Json(request): Json<EnableUpdatesRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.interval_secs == 0 {
        return Err(EngineError::bad_parameter("interval_secs must be positive").into());
    }
    state
        .updates
        .enable(&site_domain, std::time::Duration::from_secs(request.interval_secs))?;
    Ok(Json(StatusResponse::ok()))
}

pub async fn disable_periodic_updates(
    State(state): State<SharedPortal>,
    Path((_account_id, site_domain)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    state.updates.disable(&site_domain)?;
    Ok(Json(StatusResponse::ok()))
}

pub async fn start_periodic_updates(
    State(state): State<SharedPortal>,
    Path((_account_id, site_domain)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    state.updates.start(&site_domain);
    Ok(Json(StatusResponse::ok()))
}

pub async fn stop_periodic_updates(
    State(state): State<SharedPortal>,
    Path((_account_id, site_domain)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    state.updates.stop(&site_domain);
    Ok(Json(StatusResponse::ok()))
}

// ── Roles & auth connectors ───────────────────────────────────────────

fn named(doc: &serde_json::Value) -> Result<String, EngineError> {
    doc.get("name")
        .and_then(|name| name.as_str())
        .map(|name| name.to_string())
        .ok_or_else(|| EngineError::bad_parameter("resource is missing a name"))
}

fn withhold_secrets(mut doc: serde_json::Value, with_secrets: bool) -> serde_json::Value {
    if with_secrets {
        return doc;
    }
    if let Some(object) = doc.as_object_mut() {
        for field in SECRET_FIELDS {
            object.remove(*field);
        }
    }
    doc
}

#[derive(Deserialize)]
pub struct SecretsQuery {
    #[serde(default)]
    pub with_secrets: bool,
}

macro_rules! resource_handlers {
    ($kind:literal, $list:ident, $get:ident, $upsert:ident, $delete:ident) => {
        pub async fn $list(
            State(state): State<SharedPortal>,
            Path((_account_id, _site_domain)): Path<(String, String)>,
            Query(query): Query<SecretsQuery>,
        ) -> ApiResult<impl IntoResponse> {
            let docs: Vec<serde_json::Value> = state
                .backend
                .list_resources($kind)?
                .into_iter()
                .map(|doc| withhold_secrets(doc, query.with_secrets))
                .collect();
            Ok(Json(docs))
        }

        pub async fn $get(
            State(state): State<SharedPortal>,
            Path((_account_id, _site_domain, name)): Path<(String, String, String)>,
            Query(query): Query<SecretsQuery>,
        ) -> ApiResult<impl IntoResponse> {
            let doc = state.backend.get_resource($kind, &name)?;
            Ok(Json(withhold_secrets(doc, query.with_secrets)))
        }

        pub async fn $upsert(
            State(state): State<SharedPortal>,
            Path((_account_id, _site_domain)): Path<(String, String)>,
            Json(doc): Json<serde_json::Value>,
        ) -> ApiResult<impl IntoResponse> {
            let name = named(&doc)?;
            state.backend.upsert_resource($kind, &name, &doc)?;
            Ok(Json(StatusResponse::ok()))
        }

        pub async fn $delete(
            State(state): State<SharedPortal>,
            Path((_account_id, _site_domain, name)): Path<(String, String, String)>,
        ) -> ApiResult<impl IntoResponse> {
            state.backend.delete_resource($kind, &name)?;
            Ok(Json(StatusResponse::ok()))
        }
    };
}

resource_handlers!("role", list_roles, get_role, upsert_role, delete_role);
resource_handlers!(
    "oidc_connector",
    list_oidc_connectors,
    get_oidc_connector,
    upsert_oidc_connector,
    delete_oidc_connector
);
resource_handlers!(
    "saml_connector",
    list_saml_connectors,
    get_saml_connector,
    upsert_saml_connector,
    delete_saml_connector
);

// ── Trusted clusters ──────────────────────────────────────────────────

pub async fn list_trusted_clusters(
    State(state): State<SharedPortal>,
    Path((_account_id, _site_domain)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.backend.list_trusted_clusters()?))
}

pub async fn get_trusted_cluster(
    State(state): State<SharedPortal>,
    Path((_account_id, _site_domain, name)): Path<(String, String, String)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.backend.get_trusted_cluster(&name)?))
}

pub async fn upsert_trusted_cluster(
    State(state): State<SharedPortal>,
    Path((_account_id, _site_domain)): Path<(String, String)>,
    Json(cluster): Json<TrustedCluster>,
) -> ApiResult<impl IntoResponse> {
    state.trust.upsert(cluster).await?;
    Ok(Json(StatusResponse::ok()))
}

#[derive(Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub delay: Option<String>,
}

pub async fn delete_trusted_cluster(
    State(state): State<SharedPortal>,
    Path((_account_id, _site_domain, name)): Path<(String, String, String)>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult<impl IntoResponse> {
    let delay = query.delay.as_deref().map(parse_delay).transpose()?;
    state.trust.delete(&name, delay).await?;
    Ok(Json(StatusResponse::ok()))
}

// ── Remote-cluster handshake (Hub side) ───────────────────────────────

/// Create the mirror entry for a connecting cluster: site record, agent
/// credentials, CA package and a copy of its install operation.
/// Replays converge instead of failing.
pub async fn accept_remote_cluster(
    State(state): State<SharedPortal>,
    Path((_account_id, _site_domain)): Path<(String, String)>,
    Json(request): Json<AcceptRemoteClusterRequest>,
) -> ApiResult<impl IntoResponse> {
    let mut site = request.site.clone();
    site.local = false;
    state.backend.upsert_site(&site)?;
    state.backend.upsert_resource(
        "agent-credentials",
        &site.domain,
        &serde_json::to_value(&request.agent).map_err(EngineError::from)?,
    )?;
    if !request.ca_package.is_empty() {
        state
            .packages
            .upsert_package(&ca_locator(&site.domain), &request.ca_package, false)?;
    }
    if let Some(operation) = &request.install_operation {
        state.backend.upsert_operation(operation)?;
    }
    info!(cluster = %site.domain, "remote cluster accepted");
    Ok(Json(StatusResponse::ok()))
}

pub async fn remove_remote_cluster(
    State(state): State<SharedPortal>,
    Path((_account_id, _site_domain)): Path<(String, String)>,
    Json(request): Json<RemoveRemoteClusterRequest>,
) -> ApiResult<impl IntoResponse> {
    match state.backend.get_site(&request.site_domain) {
        Ok(mut site) => {
            site.state = crate::model::SiteState::Deactivated;
            state.backend.update_site(&site)?;
            info!(cluster = %request.site_domain, "remote cluster removed");
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }
    Ok(Json(StatusResponse::ok()))
}

// ── Licensing ─────────────────────────────────────────────────────────

pub async fn new_license(
    State(state): State<SharedPortal>,
    Json(request): Json<NewLicenseRequest>,
) -> ApiResult<impl IntoResponse> {
    let payload = LicensePayload {
        expiration: request.expiration,
        max_nodes: request.max_nodes,
        encryption_key: None,
        stop_app: request.stop_app,
    };
    let license = License::issue(&payload, &state.ca_secret)?;
    Ok(Json(LicenseResponse { license }))
}

pub async fn license_ca(State(state): State<SharedPortal>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.ca_secret.clone()))
}

pub async fn install_license(
    State(state): State<SharedPortal>,
    Path((_account_id, site_domain)): Path<(String, String)>,
    Json(request): Json<CheckLicenseRequest>,
) -> ApiResult<impl IntoResponse> {
    License::parse(&request.license)?;
    let mut site = state.backend.get_site(&site_domain)?;
    site.license = Some(request.license);
    state.backend.update_site(&site)?;
    Ok(Json(StatusResponse::ok()))
}

/// Verify the site's license against the CA; flips the site between
/// `active` and `degraded(license_invalid)` accordingly.
pub async fn check_license(
    State(state): State<SharedPortal>,
    Path((_account_id, site_domain)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let mut site = state.backend.get_site(&site_domain)?;
    let verdict = site
        .license
        .as_deref()
        .ok_or_else(|| EngineError::not_found("site has no license"))
        .and_then(License::parse)
        .and_then(|license| license.verify(&state.ca_secret, Utc::now()));
    match verdict {
        Ok(()) => {
            site.set_reason(None);
            state.backend.update_site(&site)?;
            Ok(Json(StatusResponse::ok()))
        }
        Err(e) => {
            site.set_reason(Some(SiteReason::LicenseInvalid));
            state.backend.update_site(&site)?;
            Err(e.into())
        }
    }
}

// ── Packages ──────────────────────────────────────────────────────────

pub async fn get_package(
    State(state): State<SharedPortal>,
    Path((repository, name, version)): Path<(String, String, String)>,
) -> ApiResult<impl IntoResponse> {
    let locator = Locator::new(&repository, &name, &version);
    let (envelope, data) = state.packages.read_package(&locator)?;
    Ok(Json(PackageDocument { envelope, data }))
}

pub async fn put_package(
    State(state): State<SharedPortal>,
    Path((repository, name, version)): Path<(String, String, String)>,
    Json(document): Json<PackageDocument>,
) -> ApiResult<impl IntoResponse> {
    let locator = Locator::new(&repository, &name, &version);
    state
        .packages
        .upsert_package(&locator, &document.data, document.envelope.encrypted)?;
    Ok((StatusCode::OK, Json(StatusResponse::ok())))
}
