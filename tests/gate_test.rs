mod helpers;

use std::fs;
use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use portcullis::gate::config::{parse_directives, ChainConfig};
use portcullis::gate::enforcer::PolicyGate;
use portcullis::gate::errors::SetupError;
use portcullis::gate::input::IdentityStrategy;
use portcullis::policy::errors::{BindError, LoadError};
use portcullis::policy::types::PolicyReference;
use portcullis::remote_addr::RemoteAddrLogger;
use portcullis::web::{self, HandlerChain};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::task::JoinSet;
use tower::ServiceExt;
use tower_http::services::ServeDir;

use helpers::builders::GET_ONLY;
use helpers::{BundleBuilder, GateBuilder, Upstream};

const BEARER_ABC: &str = r#"
package "system.authz"
rule "allow" {
    condition "input.identity == \"abc123\""
}
"#;

fn gated(gate: PolicyGate, upstream: &Upstream) -> Router {
    let chain = HandlerChain {
        remote_addr: None,
        gate: Some(gate),
    };
    web::router(&chain, upstream.router())
}

fn request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn request_with(method: &str, uri: &str, header: (&str, &str)) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header.0, header.1)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_get_admitted_post_rejected() {
    let upstream = Upstream::default();
    let app = gated(GateBuilder::inline(GET_ONLY).provision(), &upstream);

    let response = app.clone().oneshot(request("GET", "/a/b/c")).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(upstream.hits(), 1);

    let response = app.oneshot(request("POST", "/a/b/c")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await, serde_json::json!({"error": "unauthorized"}));
    assert_eq!(upstream.hits(), 1, "rejected request must not reach upstream");
}

#[tokio::test]
async fn test_admitted_response_is_unchanged() {
    let upstream = Upstream::default();
    let app = gated(GateBuilder::inline(GET_ONLY).provision(), &upstream);

    let response = app.oneshot(request("GET", "/anything")).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers()["x-upstream"], "yes");
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"upstream body");
}

#[tokio::test]
async fn test_encoded_path_cannot_bypass_policy() {
    let site = BundleBuilder::new()
        .file("admin/secret.txt", "secret")
        .file("public/index.html", "hello");
    let deny_admin = r#"
package "system.authz"
rule "allow" {
    condition "input.path[0] != \"admin\""
}
"#;
    let chain = HandlerChain {
        remote_addr: None,
        gate: Some(GateBuilder::inline(deny_admin).provision()),
    };
    let upstream = Router::new().fallback_service(ServeDir::new(site.path()));
    let app = web::router(&chain, upstream);

    for uri in ["/admin/secret.txt", "/%61dmin/secret.txt", "/%61%64%6D%69%6E/secret.txt"] {
        let response = app.clone().oneshot(request("GET", uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri} reached the file");
    }

    let response = app.clone().oneshot(request("GET", "/public/index.html")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Undecodable paths are rejected without consulting the policy
    let response = app.oneshot(request("GET", "/%FF/secret.txt")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_bearer_identity() {
    let upstream = Upstream::default();
    let app = gated(GateBuilder::inline(BEARER_ABC).provision(), &upstream);

    let response = app
        .clone()
        .oneshot(request_with("GET", "/", ("authorization", "Bearer abc123")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = app
        .clone()
        .oneshot(request_with("GET", "/", ("authorization", "Basic xyz")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.oneshot(request("GET", "/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(upstream.hits(), 1);
}

#[tokio::test]
async fn test_raw_header_identity() {
    let upstream = Upstream::default();
    let gate = GateBuilder::inline(BEARER_ABC)
        .with_identity(IdentityStrategy::header("X-Auth-Bearer"))
        .provision();
    let app = gated(gate, &upstream);

    let response = app
        .clone()
        .oneshot(request_with("GET", "/", ("x-auth-bearer", "abc123")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    // Authorization is not consulted under the raw header strategy
    let response = app
        .oneshot(request_with("GET", "/", ("authorization", "Bearer abc123")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_false_undefined_and_fault_all_reject() {
    let policies = [
        // Undefined: no body holds and no default
        GET_ONLY.to_string(),
        // False: default applies
        format!("{GET_ONLY}\ndefault \"allow\"\n"),
        // Fault: comparison on a string
        r#"
package "system.authz"
rule "allow" {
    condition "input.method > 1"
}
"#
        .to_string(),
    ];

    for policy in policies {
        let upstream = Upstream::default();
        let app = gated(GateBuilder::inline(&policy).provision(), &upstream);
        let response = app.oneshot(request("POST", "/x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "policy: {policy}");
        assert_eq!(body_json(response).await, serde_json::json!({"error": "unauthorized"}));
        assert_eq!(upstream.hits(), 0);
    }
}

#[tokio::test]
async fn test_path_segments_reach_policy() {
    let src = r#"
package "system.authz"
rule "allow" {
    condition "input.path[0] == \"public\""
}
"#;
    let upstream = Upstream::default();
    let app = gated(GateBuilder::inline(src).provision(), &upstream);

    let response = app.clone().oneshot(request("DELETE", "/public/x")).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let response = app.oneshot(request("GET", "/private/public")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_bundle_with_data() {
    let bundle = BundleBuilder::new()
        .file(
            "authz/policy.kdl",
            r#"
package "system.authz"
rule "allow" {
    condition "input.identity in data.users.admins"
}
rule "allow" {
    condition "input.method == \"GET\""
    condition "input.path[0] == \"public\""
}
"#,
        )
        .file("users/data.json", r#"{"admins": ["root"]}"#);

    let upstream = Upstream::default();
    let app = gated(GateBuilder::reference(bundle.reference()).provision(), &upstream);

    let admin = app
        .clone()
        .oneshot(request_with("POST", "/private", ("authorization", "Bearer root")))
        .await
        .unwrap();
    assert_eq!(admin.status(), StatusCode::ACCEPTED);

    let public = app.clone().oneshot(request("GET", "/public/index.html")).await.unwrap();
    assert_eq!(public.status(), StatusCode::ACCEPTED);

    let other = app
        .oneshot(request_with("POST", "/private", ("authorization", "Bearer guest")))
        .await
        .unwrap();
    assert_eq!(other.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(upstream.hits(), 2);
}

#[test]
fn test_missing_sources_fail_provisioning() {
    let missing_file = GateBuilder::reference(PolicyReference::File("/nonexistent/authz.kdl".into()))
        .config();
    assert!(matches!(
        PolicyGate::provision(&missing_file),
        Err(SetupError::Load(LoadError::Read { .. }))
    ));

    let missing_bundle = GateBuilder::reference(PolicyReference::Bundle("/nonexistent/bundle".into()))
        .config();
    assert!(matches!(
        PolicyGate::provision(&missing_bundle),
        Err(SetupError::Load(LoadError::BundleNotFound(_)))
    ));

    let unknown_rule = GateBuilder::inline(GET_ONLY)
        .with_query("data.system.authz.deny")
        .config();
    assert!(matches!(
        PolicyGate::provision(&unknown_rule),
        Err(SetupError::Bind(BindError::UndefinedRule { .. }))
    ));
}

#[tokio::test]
async fn test_concurrent_requests_share_one_gate() {
    let upstream = Upstream::default();
    let app = gated(GateBuilder::inline(GET_ONLY).provision(), &upstream);

    let mut set = JoinSet::new();
    for i in 0..100 {
        let app = app.clone();
        let method = if i % 2 == 0 { "GET" } else { "POST" };
        set.spawn(async move {
            let response = app.oneshot(request(method, "/a")).await.unwrap();
            (method, response.status())
        });
    }

    while let Some(result) = set.join_next().await {
        let (method, status) = result.unwrap();
        let expected = if method == "GET" {
            StatusCode::ACCEPTED
        } else {
            StatusCode::UNAUTHORIZED
        };
        assert_eq!(status, expected);
    }
    assert_eq!(upstream.hits(), 50);
}

#[tokio::test]
async fn test_healthz_bypasses_gate() {
    let deny_all = "package \"system.authz\"\ndefault \"allow\"\n";
    let upstream = Upstream::default();
    let app = gated(GateBuilder::inline(deny_all).provision(), &upstream);

    let response = app.clone().oneshot(request("GET", "/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(request("GET", "/index.html")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_remote_addr_written_and_forwarded() {
    let (writer, mut sink) = tokio::io::duplex(256);
    let upstream = Upstream::default();
    let chain = HandlerChain {
        remote_addr: Some(RemoteAddrLogger::with_writer(writer)),
        gate: None,
    };
    let peer: SocketAddr = "192.0.2.7:40123".parse().unwrap();
    let app = web::router(&chain, upstream.router()).layer(MockConnectInfo(peer));

    let response = app.oneshot(request("POST", "/x")).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let mut written = vec![0; "192.0.2.7:40123".len()];
    sink.read_exact(&mut written).await.unwrap();
    assert_eq!(written, b"192.0.2.7:40123");
}

#[tokio::test]
async fn test_remote_addr_runs_before_rejection() {
    let (writer, mut sink) = tokio::io::duplex(256);
    let upstream = Upstream::default();
    let chain = HandlerChain {
        remote_addr: Some(RemoteAddrLogger::with_writer(writer)),
        gate: Some(GateBuilder::inline(GET_ONLY).provision()),
    };
    let peer: SocketAddr = "[2001:db8::1]:8443".parse().unwrap();
    let app = web::router(&chain, upstream.router()).layer(MockConnectInfo(peer));

    let response = app.oneshot(request("POST", "/x")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let mut written = vec![0; "[2001:db8::1]:8443".len()];
    sink.read_exact(&mut written).await.unwrap();
    assert_eq!(written, b"[2001:db8::1]:8443");
}

#[tokio::test]
async fn test_directive_and_structured_forms_agree() {
    let bundle = BundleBuilder::new().file("policy.kdl", GET_ONLY);
    let gatefile = format!(
        "policy {{\n    bundle \"{}\"\n    identity header \"X-Auth-Bearer\"\n}}\n",
        bundle.path().display()
    );
    let from_directives = parse_directives(&gatefile).unwrap();

    let from_settings = ChainConfig {
        remote_addr: None,
        gate: Some(
            GateBuilder::reference(bundle.reference())
                .with_identity(IdentityStrategy::header("X-Auth-Bearer"))
                .config(),
        ),
    };
    assert_eq!(from_directives, from_settings);

    let upstream = Upstream::default();
    let chain = HandlerChain::provision(&from_directives).unwrap();
    let app = web::router(&chain, upstream.router());
    let response = app.oneshot(request("GET", "/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[test]
fn test_chain_with_bad_policy_is_never_built() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("broken.kdl");
    fs::write(&path, "package \"system.authz\"\nrule \"allow\" {\n    condition \"input.method ==\"\n}\n")
        .unwrap();

    let chain = parse_directives(&format!("policy \"{}\"\n", path.display())).unwrap();
    assert!(matches!(
        HandlerChain::provision(&chain),
        Err(SetupError::Load(LoadError::Condition { .. }))
    ));
}
