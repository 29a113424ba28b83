//! Discovery integration tests using wiremock
//!
//! Verifies `AuthorizationService::discover_for_issuer` against a mock
//! provider over the real HTTP transport.

mod common;

use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use oauthkit::OAuthError;

#[tokio::test]
async fn test_discover_for_issuer_builds_configuration() {
    let server = MockServer::start().await;
    let base_url = server.uri();

    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::discovery_body(&base_url)))
        .expect(1)
        .mount(&server)
        .await;

    let issuer = Url::parse(&base_url).unwrap();
    let configuration = common::http_service()
        .discover_for_issuer(&issuer)
        .await
        .expect("discovery must succeed");

    assert_eq!(
        configuration.token_endpoint().as_str(),
        format!("{}/token", base_url)
    );
    assert_eq!(configuration.issuer(), Some(&issuer));
    assert!(configuration.registration_endpoint().is_some());
    assert!(configuration.end_session_endpoint().is_some());

    let discovery = configuration.discovery().expect("discovery document kept");
    assert_eq!(
        discovery.code_challenge_methods_supported.as_deref(),
        Some(&["S256".to_string()][..])
    );
    assert!(oauthkit::pkce::verify_s256_support(discovery).is_ok());
}

#[tokio::test]
async fn test_discover_for_issuer_with_path_appends_well_known() {
    let server = MockServer::start().await;
    let tenant = format!("{}/tenant-a", server.uri());

    Mock::given(method("GET"))
        .and(path("/tenant-a/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::discovery_body(&tenant)))
        .expect(1)
        .mount(&server)
        .await;

    let issuer = Url::parse(&format!("{}/", tenant)).unwrap();
    let result = common::http_service().discover_for_issuer(&issuer).await;
    assert!(result.is_ok(), "got: {:?}", result.err());
}

#[tokio::test]
async fn test_discovery_missing_token_endpoint_is_invalid_document() {
    let server = MockServer::start().await;
    let mut body = common::discovery_body(&server.uri());
    body.as_object_mut().unwrap().remove("token_endpoint");

    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(&server)
        .await;

    let issuer = Url::parse(&server.uri()).unwrap();
    let err = common::http_service()
        .discover_for_issuer(&issuer)
        .await
        .unwrap_err();

    assert!(
        matches!(err, OAuthError::InvalidDiscoveryDocument(_)),
        "expected InvalidDiscoveryDocument, got {err:?}"
    );
}

#[tokio::test]
async fn test_discovery_not_json_is_invalid_document() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>hello</html>"))
        .mount(&server)
        .await;

    let issuer = Url::parse(&server.uri()).unwrap();
    let err = common::http_service()
        .discover_for_issuer(&issuer)
        .await
        .unwrap_err();
    assert!(matches!(err, OAuthError::InvalidDiscoveryDocument(_)));
}

#[tokio::test]
async fn test_discovery_http_failure_is_server_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
        .mount(&server)
        .await;

    let issuer = Url::parse(&server.uri()).unwrap();
    let err = common::http_service()
        .discover_for_issuer(&issuer)
        .await
        .unwrap_err();

    match err {
        OAuthError::Server { status, body } => {
            assert_eq!(status, 404);
            assert_eq!(body, "not found");
        }
        other => panic!("expected Server error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_discovery_unreachable_is_network_error() {
    // Bind and drop a listener to get a port nothing listens on.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let issuer = Url::parse(&format!("http://127.0.0.1:{port}")).unwrap();

    let err = common::http_service()
        .discover_for_issuer(&issuer)
        .await
        .unwrap_err();
    assert!(matches!(err, OAuthError::Network(_)), "got {err:?}");
    assert!(!err.is_terminal());
}
