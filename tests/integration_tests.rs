//! Integration tests for Anchorage.
//!
//! These cover the CLI surface and the portal API end to end: agent
//! elections over HTTP, license lifecycle, trusted-cluster CRUD, package
//! transfer, and cluster replication from a served Hub.

use std::sync::Arc;

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use predicates::prelude::*;
use tempfile::TempDir;
use tower::ServiceExt;

use anchorage::api::{ClusterCopyRequest, RegisterAgentResponse};
use anchorage::backend::{Backend, Db};
use anchorage::election::InstallGroups;
use anchorage::hub::updates::{LoggingSync, NoRemote};
use anchorage::hub::{HubClient, LoggingTunnel, PortalHandshake, TrustManager, UpdateLoop};
use anchorage::model::{
    Operation, OperationType, ProvisioningToken, Site, SiteState, TokenType, TrustedCluster,
};
use anchorage::ops::{LocalOperator, Operator};
use anchorage::pack::{Locator, PackageService};
use anchorage::plan::AgentCredentials;
use anchorage::server::{portal_router, PortalState};

/// Helper to create an anchorage Command
fn anchorage() -> Command {
    cargo_bin_cmd!("anchorage")
}

fn create_temp_state() -> TempDir {
    TempDir::new().unwrap()
}

/// A portal over an in-memory backend, plus handles to its internals.
struct Portal {
    router: axum::Router,
    backend: Backend,
    state: Arc<PortalState>,
}

fn portal(ca_secret: &[u8]) -> Portal {
    let db = Db::in_memory().unwrap();
    let backend = Backend::new(db.clone());
    let packages = PackageService::new(db);
    let local = LocalOperator::new(
        backend.clone(),
        packages.clone(),
        Arc::new(InstallGroups::default()),
    );
    let updates = UpdateLoop::new(
        backend.clone(),
        packages.clone(),
        Arc::new(NoRemote),
        Arc::new(LoggingSync),
    );
    let handshake = Arc::new(PortalHandshake::new(
        backend.clone(),
        packages.clone(),
        "acc",
        "hub.example.io",
    ));
    let trust = Arc::new(TrustManager::new(
        backend.clone(),
        Arc::new(LoggingTunnel),
        updates.clone(),
        handshake,
        "hub.example.io",
    ));
    let state = Arc::new(PortalState {
        backend: backend.clone(),
        packages,
        operator: Arc::new(Operator::Local(local)),
        trust,
        updates,
        ca_secret: ca_secret.to_vec(),
        auth_token: None,
    });
    Portal {
        router: portal_router(state.clone()),
        backend,
        state,
    }
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// =============================================================================
// CLI basics
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        anchorage().arg("--help").assert().success();
    }

    #[test]
    fn test_version() {
        anchorage().arg("--version").assert().success();
    }

    #[test]
    fn test_status_uninitialized() {
        let dir = create_temp_state();
        anchorage()
            .args(["--state-dir"])
            .arg(dir.path())
            .args(["status", "--cluster-name", "example.com"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Not initialized"));
    }

    #[test]
    fn test_plan_without_operations_fails() {
        let dir = create_temp_state();
        anchorage()
            .args(["--state-dir"])
            .arg(dir.path())
            .args(["plan", "--cluster-name", "example.com"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("no operations"));
    }

    #[test]
    fn test_install_rejects_malformed_app_locator() {
        let dir = create_temp_state();
        anchorage()
            .args(["--state-dir"])
            .arg(dir.path())
            .args([
                "install",
                "--cluster-name",
                "example.com",
                "--app",
                "not-a-locator",
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("locator"));
    }
}

// =============================================================================
// Agent registration over the portal API
// =============================================================================

mod registration {
    use super::*;

    #[tokio::test]
    async fn concurrent_registrations_elect_one_installer() {
        let portal = portal(b"ca");
        let op = Operation::new("acc", "example.com", OperationType::Install, "onprem");
        portal.backend.create_operation(&op).unwrap();

        let uri = format!(
            "/portal/v1/accounts/acc/sites/example.com/operations/common/{}/register",
            op.id
        );
        let mut tasks = Vec::new();
        for i in 1..=3 {
            let router = portal.router.clone();
            let uri = uri.clone();
            let body = serde_json::json!({
                "account_id": "acc",
                "cluster_name": "example.com",
                "operation_id": op.id,
                "agent_id": format!("a{i}"),
                "advertise_ip": format!("10.0.0.{i}"),
            });
            tasks.push(tokio::spawn(async move {
                let response = router.oneshot(json_request("PUT", &uri, body)).await.unwrap();
                assert_eq!(response.status(), StatusCode::OK);
                serde_json::from_value::<RegisterAgentResponse>(body_json(response).await).unwrap()
            }));
        }

        let mut installers = std::collections::HashSet::new();
        for task in tasks {
            let response = task.await.unwrap();
            installers.insert((response.installer_id, response.installer_ip));
        }
        assert_eq!(installers.len(), 1, "racing agents saw different installers");

        // once the operation starts, registration closes
        let local = match portal.state.operator.as_ref() {
            Operator::Local(local) => local.clone(),
            _ => unreachable!(),
        };
        local.start_operation(&op.key()).unwrap();
        let body = serde_json::json!({
            "account_id": "acc",
            "cluster_name": "example.com",
            "operation_id": op.id,
            "agent_id": "late",
            "advertise_ip": "10.0.0.9",
        });
        let response = portal
            .router
            .clone()
            .oneshot(json_request("PUT", &uri, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}

// =============================================================================
// License lifecycle
// =============================================================================

mod licensing {
    use super::*;

    #[tokio::test]
    async fn invalid_license_degrades_the_site_until_replaced() {
        let ca = b"hub-ca-secret";
        let portal = portal(ca);
        let mut site = Site::new(
            "acc",
            "example.com",
            Locator::new("example.io", "app", "1.0.0"),
            "onprem",
        );
        site.license = Some("{\"max_nodes\":1}.deadbeef".to_string()); // bad signature
        portal.backend.create_site(&site).unwrap();

        // check fails and flips the site to degraded/license_invalid
        let response = portal
            .router
            .clone()
            .oneshot(json_request(
                "POST",
                "/portal/v1/accounts/acc/sites/example.com/license/check",
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let site = portal.backend.get_site("example.com").unwrap();
        assert_eq!(site.state, SiteState::Degraded);

        // issue a fresh license through the portal and install it
        let response = portal
            .router
            .clone()
            .oneshot(json_request(
                "POST",
                "/portal/v1/license/new",
                serde_json::json!({ "max_nodes": 3 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let license = body_json(response).await["license"].as_str().unwrap().to_string();

        let response = portal
            .router
            .clone()
            .oneshot(json_request(
                "POST",
                "/portal/v1/accounts/acc/sites/example.com/license",
                serde_json::json!({ "license": license }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // verification now passes and the site recovers
        let response = portal
            .router
            .clone()
            .oneshot(json_request(
                "POST",
                "/portal/v1/accounts/acc/sites/example.com/license/check",
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let site = portal.backend.get_site("example.com").unwrap();
        assert_eq!(site.state, SiteState::Active);
        assert!(site.reason.is_none());
    }
}

// =============================================================================
// Trusted clusters over the API
// =============================================================================

mod trusted_clusters {
    use super::*;

    fn cluster_body() -> serde_json::Value {
        serde_json::to_value(TrustedCluster {
            system: true, // system: skip the Hub-side handshake in tests
            ..TrustedCluster::new("hub.remote.io", "tok", "hub.remote.io:3024", "hub.remote.io:3023")
        })
        .unwrap()
    }

    #[tokio::test]
    async fn upsert_is_idempotent_and_delete_honours_delay() {
        let portal = portal(b"ca");
        let base = "/portal/v1/accounts/acc/sites/hub.example.io/trustedclusters";

        for _ in 0..2 {
            let response = portal
                .router
                .clone()
                .oneshot(json_request("PUT", base, cluster_body()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        // idempotent: stored once, no audit events for system clusters
        assert_eq!(portal.backend.list_trusted_clusters().unwrap().len(), 1);
        assert!(portal.backend.list_audit_events().unwrap().is_empty());

        // delayed delete keeps the record alive
        let response = portal
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("{base}/hub.remote.io?delay=1h"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(portal.backend.get_trusted_cluster("hub.remote.io").is_ok());

        // immediate delete removes it
        let response = portal
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("{base}/hub.remote.io"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(portal
            .backend
            .get_trusted_cluster("hub.remote.io")
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn connector_secrets_are_withheld_by_default() {
        let portal = portal(b"ca");
        let base = "/portal/v1/accounts/acc/sites/hub.example.io/oidc/connectors";
        let connector = serde_json::json!({
            "name": "google",
            "issuer_url": "https://accounts.google.com",
            "client_secret": "super-secret",
        });
        let response = portal
            .router
            .clone()
            .oneshot(json_request("PUT", base, connector))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = portal
            .router
            .clone()
            .oneshot(Request::builder().uri(format!("{base}/google")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let doc = body_json(response).await;
        assert!(doc.get("client_secret").is_none());

        let response = portal
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("{base}/google?with_secrets=true"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let doc = body_json(response).await;
        assert_eq!(doc["client_secret"], "super-secret");
    }
}

// =============================================================================
// Cluster replication from a served Hub
// =============================================================================

mod cluster_copy {
    use super::*;

    /// Seed a Hub portal with a cluster mid-install, serve it over HTTP,
    /// and replicate it into a fresh local backend.
    #[tokio::test]
    async fn replicates_site_operations_and_tokens() {
        let hub_portal = portal(b"hub-ca");
        let site = Site::new(
            "acc",
            "cluster.example.com",
            Locator::new("example.io", "app", "1.0.0"),
            "onprem",
        );
        hub_portal.backend.create_site(&site).unwrap();
        let operation = Operation::new("acc", "cluster.example.com", OperationType::Install, "onprem");
        hub_portal.backend.create_operation(&operation).unwrap();
        hub_portal
            .backend
            .upsert_resource(
                "agent-credentials",
                "cluster.example.com",
                &serde_json::to_value(AgentCredentials {
                    url: "agent://10.0.0.1:61009/node".into(),
                    token: "agent-token".into(),
                })
                .unwrap(),
            )
            .unwrap();
        hub_portal
            .backend
            .create_token(&ProvisioningToken::new(
                TokenType::Expand,
                "acc",
                "cluster.example.com",
                &operation.id,
                "agent@cluster.example.com",
                None,
            ))
            .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = hub_portal.router.clone();
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });

        let local_db = Db::in_memory().unwrap();
        let local_backend = Backend::new(local_db.clone());
        let local_packages = PackageService::new(local_db);
        let hub = HubClient::new(&format!("http://{addr}"), "tunnel-token").unwrap();
        let request = ClusterCopyRequest {
            account_id: "acc".into(),
            cluster_name: "cluster.example.com".into(),
            operation_id: operation.id.clone(),
            ops_url: format!("http://{addr}"),
            ops_token: "tunnel-token".into(),
        };

        let install_op =
            anchorage::install::replicate_cluster(&local_backend, &local_packages, &hub, &request)
                .await
                .unwrap();
        assert_eq!(install_op.id, operation.id);
        assert!(local_backend.get_site("cluster.example.com").is_ok());
        assert_eq!(local_backend.list_operations("cluster.example.com").unwrap().len(), 1);
        assert!(local_backend
            .find_token("cluster.example.com", TokenType::Expand)
            .unwrap()
            .is_some());

        // replication is idempotent: a second pass converges
        anchorage::install::replicate_cluster(&local_backend, &local_packages, &hub, &request)
            .await
            .unwrap();
        assert_eq!(local_backend.list_operations("cluster.example.com").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_operations_is_a_hard_error() {
        let hub_portal = portal(b"hub-ca");
        let site = Site::new(
            "acc",
            "cluster.example.com",
            Locator::new("example.io", "app", "1.0.0"),
            "onprem",
        );
        hub_portal.backend.create_site(&site).unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = hub_portal.router.clone();
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });

        let local_db = Db::in_memory().unwrap();
        let hub = HubClient::new(&format!("http://{addr}"), "tunnel-token").unwrap();
        let request = ClusterCopyRequest {
            account_id: "acc".into(),
            cluster_name: "cluster.example.com".into(),
            operation_id: "missing".into(),
            ops_url: format!("http://{addr}"),
            ops_token: "tunnel-token".into(),
        };
        let err = anchorage::install::replicate_cluster(
            &Backend::new(local_db.clone()),
            &PackageService::new(local_db),
            &hub,
            &request,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("no operations"));
    }
}

// =============================================================================
// Packages over the API
// =============================================================================

mod packages {
    use super::*;

    #[tokio::test]
    async fn package_upload_download_roundtrip() {
        let portal = portal(b"ca");
        let envelope = serde_json::json!({
            "envelope": {
                "locator": { "repository": "example.io", "name": "app", "version": "2.0.0" },
                "digest": "ignored-on-upload",
                "size": 4,
                "encrypted": false,
                "created": chrono::Utc::now(),
            },
            "data": [1, 2, 3, 4],
        });
        let uri = "/portal/v1/packages/example.io/app/2.0.0";
        let response = portal
            .router
            .clone()
            .oneshot(json_request("PUT", uri, envelope))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = portal
            .router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let doc = body_json(response).await;
        assert_eq!(doc["data"], serde_json::json!([1, 2, 3, 4]));
        assert_eq!(doc["envelope"]["locator"]["name"], "app");

        // unknown packages are 404
        let response = portal
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/portal/v1/packages/example.io/app/9.9.9")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
