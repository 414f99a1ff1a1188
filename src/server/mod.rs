//! The operator portal API.
//!
//! HTTP+JSON under `/portal/v1/...`, served by clusters, Hubs and
//! installers alike; in production it rides a reverse-tunnelled mTLS
//! channel owned by the transport layer. Handlers are thin: they
//! authorise, translate payloads, and delegate to the operator, trust
//! manager and updates loop.

mod handlers;

use std::sync::Arc;

use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::api::ErrorResponse;
use crate::backend::Backend;
use crate::errors::EngineError;
use crate::hub::{TrustManager, UpdateLoop};
use crate::ops::Operator;
use crate::pack::PackageService;

/// Shared portal state.
pub struct PortalState {
    pub backend: Backend,
    pub packages: PackageService,
    pub operator: Arc<Operator>,
    pub trust: Arc<TrustManager>,
    pub updates: UpdateLoop,
    /// Secret the license CA signs with; also served to clusters for
    /// verification.
    pub ca_secret: Vec<u8>,
    /// Static bearer token; when set, requests must carry it or a valid
    /// provisioning token.
    pub auth_token: Option<String>,
}

pub type SharedPortal = Arc<PortalState>;

/// Translate engine errors into portal responses.
pub struct ApiError(pub EngineError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::AlreadyExists(_) | EngineError::CompareFailed(_) => StatusCode::CONFLICT,
            EngineError::BadParameter(_) => StatusCode::BAD_REQUEST,
            EngineError::AccessDenied(_) => StatusCode::FORBIDDEN,
            EngineError::LimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            EngineError::Retry(_) | EngineError::ConnectionProblem(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

async fn authorize(
    axum::extract::State(state): axum::extract::State<SharedPortal>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(expected) = &state.auth_token else {
        return next.run(request).await;
    };
    let presented = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let authorized = match presented {
        Some(token) => token == expected || state.backend.get_token(token).is_ok(),
        None => false,
    };
    if !authorized {
        return ApiError(EngineError::access_denied("missing or invalid bearer token")).into_response();
    }
    next.run(request).await
}

/// Build the portal router.
pub fn portal_router(state: SharedPortal) -> Router {
    let sites = Router::new()
        .route("/", get(handlers::get_site))
        .route("/operations", get(handlers::list_operations))
        .route("/operations/common/{operation_id}", get(handlers::get_operation))
        .route("/operations/common/{operation_id}/state", put(handlers::update_operation_state))
        .route("/operations/common/{operation_id}/start", post(handlers::start_operation))
        .route(
            "/operations/common/{operation_id}/progress",
            get(handlers::get_progress).post(handlers::create_progress),
        )
        .route("/operations/common/{operation_id}/logs", post(handlers::create_log_entry))
        .route("/operations/common/{operation_id}/register", put(handlers::register_agent))
        .route(
            "/operations/install/{operation_id}/copy-cluster",
            post(handlers::copy_cluster),
        )
        .route(
            "/cluster-endpoints",
            get(handlers::get_endpoints).put(handlers::put_endpoints),
        )
        .route("/agent", get(handlers::get_cluster_agent))
        .route("/expand-token", get(handlers::get_expand_token))
        .route("/updates", get(handlers::check_updates).post(handlers::download_updates))
        .route("/periodicupdates", get(handlers::periodic_updates_status))
        .route("/periodicupdates/enable", post(handlers::enable_periodic_updates))
        .route("/periodicupdates/disable", post(handlers::disable_periodic_updates))
        .route("/periodicupdates/start", post(handlers::start_periodic_updates))
        .route("/periodicupdates/stop", post(handlers::stop_periodic_updates))
        .route("/roles", get(handlers::list_roles).put(handlers::upsert_role))
        .route("/roles/{name}", get(handlers::get_role).delete(handlers::delete_role))
        .route(
            "/oidc/connectors",
            get(handlers::list_oidc_connectors).put(handlers::upsert_oidc_connector),
        )
        .route(
            "/oidc/connectors/{name}",
            get(handlers::get_oidc_connector).delete(handlers::delete_oidc_connector),
        )
        .route(
            "/saml/connectors",
            get(handlers::list_saml_connectors).put(handlers::upsert_saml_connector),
        )
        .route(
            "/saml/connectors/{name}",
            get(handlers::get_saml_connector).delete(handlers::delete_saml_connector),
        )
        .route(
            "/trustedclusters",
            get(handlers::list_trusted_clusters).put(handlers::upsert_trusted_cluster),
        )
        .route(
            "/trustedclusters/{name}",
            get(handlers::get_trusted_cluster).delete(handlers::delete_trusted_cluster),
        )
        .route("/accept", put(handlers::accept_remote_cluster))
        .route("/remove", put(handlers::remove_remote_cluster))
        .route("/license", post(handlers::install_license))
        .route("/license/check", post(handlers::check_license));

    Router::new()
        .nest("/portal/v1/accounts/{account_id}/sites/{site_domain}", sites)
        .route("/portal/v1/license/new", post(handlers::new_license))
        .route("/portal/v1/license/ca", get(handlers::license_ca))
        .route(
            "/portal/v1/packages/{repository}/{name}/{version}",
            get(handlers::get_package).put(handlers::put_package),
        )
        .layer(middleware::from_fn_with_state(state.clone(), authorize))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Parse a `?delay=` value: plain seconds or `30s`/`5m`/`2h`.
pub(crate) fn parse_delay(raw: &str) -> Result<std::time::Duration, EngineError> {
    let raw = raw.trim();
    let (digits, unit) = match raw.chars().last() {
        Some(c) if c.is_ascii_digit() => (raw, 1u64),
        Some('s') => (&raw[..raw.len() - 1], 1),
        Some('m') => (&raw[..raw.len() - 1], 60),
        Some('h') => (&raw[..raw.len() - 1], 3600),
        _ => return Err(EngineError::bad_parameter(format!("bad delay {raw:?}"))),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| EngineError::bad_parameter(format!("bad delay {raw:?}")))?;
    Ok(std::time::Duration::from_secs(value * unit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_parsing() {
        assert_eq!(parse_delay("30").unwrap().as_secs(), 30);
        assert_eq!(parse_delay("30s").unwrap().as_secs(), 30);
        assert_eq!(parse_delay("5m").unwrap().as_secs(), 300);
        assert_eq!(parse_delay("2h").unwrap().as_secs(), 7200);
        assert!(parse_delay("soon").is_err());
        assert!(parse_delay("").is_err());
    }
}
