use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use oauthkit::codec::base64url_encode;
use oauthkit::transport::ReqwestTransport;
use oauthkit::AuthorizationService;
use tempfile::TempDir;

/// A discovery document whose endpoints live under `base_url`.
#[allow(dead_code)]
pub fn discovery_body(base_url: &str) -> serde_json::Value {
    serde_json::json!({
        "issuer": base_url,
        "authorization_endpoint": format!("{}/authorize", base_url),
        "token_endpoint": format!("{}/token", base_url),
        "registration_endpoint": format!("{}/register", base_url),
        "end_session_endpoint": format!("{}/logout", base_url),
        "jwks_uri": format!("{}/jwks", base_url),
        "response_types_supported": ["code"],
        "subject_types_supported": ["public"],
        "id_token_signing_alg_values_supported": ["RS256"],
        "scopes_supported": ["openid", "profile", "offline_access"],
        "code_challenge_methods_supported": ["S256"]
    })
}

/// An ID token with a placeholder signature.
#[allow(dead_code)]
pub fn unsigned_jwt(claims: &serde_json::Value) -> String {
    format!(
        "{}.{}.signature",
        base64url_encode(br#"{"alg":"none","typ":"JWT"}"#),
        base64url_encode(claims.to_string())
    )
}

/// A service over the real HTTP transport.
#[allow(dead_code)]
pub fn http_service() -> AuthorizationService {
    AuthorizationService::new(Arc::new(ReqwestTransport::new()))
}

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("oauthkit.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}
