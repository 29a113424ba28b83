//! Token requests and responses (RFC 6749 sections 4.1.3, 5, and 6)
//!
//! A [`TokenRequest`] encodes to a form-urlencoded POST against the token
//! endpoint.  Client authentication uses HTTP Basic (`client_secret_basic`)
//! when a secret is present; public clients send `client_id` in the body.
//!
//! A [`TokenResponse`] is only built from a successful (2xx) response.  A
//! body that is not JSON, or that lacks `access_token` or `token_type`, is a
//! [`OAuthError::TokenResponseConstruction`], never an OAuth error.

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::codec::{self, JsonMap};
use crate::discovery::ServiceConfiguration;
use crate::error::{OAuthError, Result};
use crate::id_token::IdToken;
use crate::transport::HttpRequest;

/// Body parameters written by the request itself.
const RESERVED_PARAMETERS: &[&str] = &[
    "grant_type",
    "code",
    "refresh_token",
    "redirect_uri",
    "client_id",
    "client_secret",
    "scope",
    "code_verifier",
];

// ---------------------------------------------------------------------------
// GrantType
// ---------------------------------------------------------------------------

/// The `grant_type` of a token request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum GrantType {
    /// `authorization_code`
    AuthorizationCode,
    /// `refresh_token`
    RefreshToken,
    /// `client_credentials`
    ClientCredentials,
    /// `password`
    Password,
    /// Any other grant, by its URI or name.
    Extension(String),
}

impl GrantType {
    /// Wire value.
    pub fn as_str(&self) -> &str {
        match self {
            Self::AuthorizationCode => "authorization_code",
            Self::RefreshToken => "refresh_token",
            Self::ClientCredentials => "client_credentials",
            Self::Password => "password",
            Self::Extension(grant) => grant,
        }
    }
}

impl From<String> for GrantType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "authorization_code" => Self::AuthorizationCode,
            "refresh_token" => Self::RefreshToken,
            "client_credentials" => Self::ClientCredentials,
            "password" => Self::Password,
            _ => Self::Extension(value),
        }
    }
}

impl From<GrantType> for String {
    fn from(grant: GrantType) -> Self {
        grant.as_str().to_string()
    }
}

impl fmt::Display for GrantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TokenRequest
// ---------------------------------------------------------------------------

/// An immutable token endpoint request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRequest {
    configuration: ServiceConfiguration,
    grant_type: GrantType,
    client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    authorization_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    redirect_uri: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code_verifier: Option<String>,
    #[serde(default)]
    additional_parameters: BTreeMap<String, String>,
}

impl TokenRequest {
    /// Starts a token request.
    pub fn builder(
        configuration: ServiceConfiguration,
        grant_type: GrantType,
        client_id: impl Into<String>,
    ) -> TokenRequestBuilder {
        TokenRequestBuilder {
            request: TokenRequest {
                configuration,
                grant_type,
                client_id: client_id.into(),
                client_secret: None,
                authorization_code: None,
                refresh_token: None,
                redirect_uri: None,
                scope: None,
                code_verifier: None,
                additional_parameters: BTreeMap::new(),
            },
        }
    }

    /// Form body parameters, in a stable order.
    ///
    /// `client_id` is included only for public clients; confidential clients
    /// authenticate through [`Self::authorization_header`].
    pub fn body_parameters(&self) -> Vec<(&str, &str)> {
        let mut params = vec![("grant_type", self.grant_type.as_str())];
        if let Some(code) = &self.authorization_code {
            params.push(("code", code.as_str()));
        }
        if let Some(refresh_token) = &self.refresh_token {
            params.push(("refresh_token", refresh_token.as_str()));
        }
        if let Some(redirect_uri) = &self.redirect_uri {
            params.push(("redirect_uri", redirect_uri.as_str()));
        }
        if let Some(scope) = &self.scope {
            params.push(("scope", scope.as_str()));
        }
        if let Some(verifier) = &self.code_verifier {
            params.push(("code_verifier", verifier.as_str()));
        }
        if self.client_secret.is_none() {
            params.push(("client_id", self.client_id.as_str()));
        }
        for (key, value) in &self.additional_parameters {
            params.push((key.as_str(), value.as_str()));
        }
        params
    }

    /// `Authorization` header value for `client_secret_basic`.
    ///
    /// Both credentials are form-urlencoded before joining, as RFC 6749
    /// section 2.3.1 requires.
    pub fn authorization_header(&self) -> Option<String> {
        let secret = self.client_secret.as_deref()?;
        let encode = |s: &str| url::form_urlencoded::byte_serialize(s.as_bytes()).collect::<String>();
        let credentials = format!("{}:{}", encode(&self.client_id), encode(secret));
        Some(format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(credentials)
        ))
    }

    /// The HTTP request that performs this token request.
    pub fn http_request(&self) -> HttpRequest {
        let mut request = HttpRequest::post_form(
            self.configuration.token_endpoint().clone(),
            codec::form_encode(self.body_parameters()),
        );
        if let Some(header) = self.authorization_header() {
            request = request.with_header("Authorization", header);
        }
        request
    }

    /// Provider configuration.
    pub fn configuration(&self) -> &ServiceConfiguration {
        &self.configuration
    }

    /// Grant type.
    pub fn grant_type(&self) -> &GrantType {
        &self.grant_type
    }

    /// Client identifier.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Client secret.
    pub fn client_secret(&self) -> Option<&str> {
        self.client_secret.as_deref()
    }

    /// Authorization code being exchanged.
    pub fn authorization_code(&self) -> Option<&str> {
        self.authorization_code.as_deref()
    }

    /// Refresh token being exchanged.
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    /// Redirect URI of the original authorization request.
    pub fn redirect_uri(&self) -> Option<&Url> {
        self.redirect_uri.as_ref()
    }

    /// Requested scope.
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// PKCE verifier.
    pub fn code_verifier(&self) -> Option<&str> {
        self.code_verifier.as_deref()
    }

    /// Extra body parameters.
    pub fn additional_parameters(&self) -> &BTreeMap<String, String> {
        &self.additional_parameters
    }
}

/// Builder for [`TokenRequest`].
#[derive(Debug, Clone)]
pub struct TokenRequestBuilder {
    request: TokenRequest,
}

impl TokenRequestBuilder {
    /// Sets the client secret.
    pub fn client_secret(mut self, secret: impl Into<String>) -> Self {
        self.request.client_secret = Some(secret.into());
        self
    }

    /// Sets the authorization code.
    pub fn authorization_code(mut self, code: impl Into<String>) -> Self {
        self.request.authorization_code = Some(code.into());
        self
    }

    /// Sets the refresh token.
    pub fn refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.request.refresh_token = Some(refresh_token.into());
        self
    }

    /// Sets the redirect URI.
    pub fn redirect_uri(mut self, redirect_uri: Url) -> Self {
        self.request.redirect_uri = Some(redirect_uri);
        self
    }

    /// Sets the scope.
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.request.scope = Some(scope.into());
        self
    }

    /// Sets the PKCE verifier.
    pub fn code_verifier(mut self, verifier: impl Into<String>) -> Self {
        self.request.code_verifier = Some(verifier.into());
        self
    }

    /// Adds an extra body parameter.
    pub fn additional_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request
            .additional_parameters
            .insert(key.into(), value.into());
        self
    }

    /// Validates and builds the request.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::Configuration`] when:
    /// - an `authorization_code` grant lacks the code or the redirect URI,
    /// - a `refresh_token` grant lacks the refresh token,
    /// - an additional parameter uses a reserved name.
    pub fn build(self) -> Result<TokenRequest> {
        let request = self.request;

        match request.grant_type {
            GrantType::AuthorizationCode => {
                if request.authorization_code.is_none() {
                    return Err(OAuthError::Configuration(
                        "authorization_code grant requires a code".to_string(),
                    ));
                }
                if request.redirect_uri.is_none() {
                    return Err(OAuthError::Configuration(
                        "authorization_code grant requires a redirect_uri".to_string(),
                    ));
                }
            }
            GrantType::RefreshToken if request.refresh_token.is_none() => {
                return Err(OAuthError::Configuration(
                    "refresh_token grant requires a refresh token".to_string(),
                ));
            }
            _ => {}
        }

        if let Some(key) = request
            .additional_parameters
            .keys()
            .find(|key| RESERVED_PARAMETERS.contains(&key.as_str()))
        {
            return Err(OAuthError::Configuration(format!(
                "additional parameter '{key}' collides with a request parameter"
            )));
        }

        tracing::debug!(grant_type = %request.grant_type, "built token request");
        Ok(request)
    }
}

// ---------------------------------------------------------------------------
// TokenResponse
// ---------------------------------------------------------------------------

/// A successful token endpoint response (RFC 6749 section 5.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenResponse {
    request: TokenRequest,
    access_token: String,
    token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
    #[serde(default)]
    raw: JsonMap,
}

impl TokenResponse {
    /// Decodes a 2xx token endpoint body.
    ///
    /// `expires_in` is converted to an absolute instant relative to
    /// `received_at`.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::TokenResponseConstruction`] for a body that is
    /// not a JSON object or lacks `access_token` or `token_type`.
    pub fn from_json(request: TokenRequest, body: &[u8], received_at: DateTime<Utc>) -> Result<Self> {
        let raw = codec::decode_json_object(body)
            .map_err(|e| OAuthError::TokenResponseConstruction(e.to_string()))?;
        Self::from_map(request, raw, received_at)
    }

    /// Builds a response from an already decoded mapping.
    pub fn from_map(request: TokenRequest, raw: JsonMap, received_at: DateTime<Utc>) -> Result<Self> {
        let string_field = |key: &str| raw.get(key).and_then(|v| v.as_str()).map(str::to_string);

        let access_token = string_field("access_token").ok_or_else(|| {
            OAuthError::TokenResponseConstruction("missing access_token".to_string())
        })?;
        let token_type = string_field("token_type").ok_or_else(|| {
            OAuthError::TokenResponseConstruction("missing token_type".to_string())
        })?;

        let expires_in = match raw.get("expires_in") {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::Number(n)) => n.as_i64(),
            Some(serde_json::Value::String(s)) => s.parse::<i64>().ok(),
            Some(_) => None,
        };
        let expires_at = expires_in
            .map(|secs| {
                Duration::try_seconds(secs)
                    .and_then(|lifetime| received_at.checked_add_signed(lifetime))
                    .ok_or_else(|| {
                        OAuthError::TokenResponseConstruction(format!(
                            "expires_in out of range: {secs}"
                        ))
                    })
            })
            .transpose()?;

        Ok(Self {
            access_token,
            token_type,
            expires_at,
            refresh_token: string_field("refresh_token"),
            id_token: string_field("id_token"),
            scope: string_field("scope"),
            request,
            raw,
        })
    }

    /// Returns `true` when the access token expires within `min_validity`
    /// of `now`.  A token without an expiry is never considered expiring;
    /// a window reaching past the representable range always is.
    pub fn expires_within(&self, now: DateTime<Utc>, min_validity: Duration) -> bool {
        self.expires_at.is_some_and(|expires_at| {
            now.checked_add_signed(min_validity)
                .map_or(true, |horizon| expires_at <= horizon)
        })
    }

    /// Decodes the ID token, if one was issued.
    pub fn decoded_id_token(&self) -> Result<Option<IdToken>> {
        self.id_token.as_deref().map(IdToken::parse).transpose()
    }

    /// Keeps a previously issued ID token when a refresh response omits it.
    pub(crate) fn carry_forward_id_token(&mut self, previous: Option<&str>) {
        if self.id_token.is_none() {
            self.id_token = previous.map(str::to_string);
        }
    }

    /// The request this response answers.
    pub fn request(&self) -> &TokenRequest {
        &self.request
    }

    /// Access token.
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Token type, typically `Bearer`.
    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    /// Access token expiry.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Refresh token, when issued.
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    /// Raw ID token, when issued.
    pub fn id_token(&self) -> Option<&str> {
        self.id_token.as_deref()
    }

    /// Granted scope, when the server narrowed or widened it.
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Every field of the response body.
    pub fn raw(&self) -> &JsonMap {
        &self.raw
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::tests::{configuration, redirect_uri};
    use chrono::TimeZone;

    fn refresh_request() -> TokenRequest {
        TokenRequest::builder(configuration(), GrantType::RefreshToken, "client-123")
            .refresh_token("rt-1")
            .build()
            .unwrap()
    }

    fn received_at() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_grant_type_round_trip_through_strings() {
        for grant in ["authorization_code", "refresh_token", "urn:ietf:params:oauth:grant-type:device_code"] {
            assert_eq!(String::from(GrantType::from(grant.to_string())), grant);
        }
        assert_eq!(
            GrantType::from("urn:x".to_string()),
            GrantType::Extension("urn:x".to_string())
        );
    }

    #[test]
    fn test_authorization_code_grant_requires_redirect_uri() {
        let err = TokenRequest::builder(configuration(), GrantType::AuthorizationCode, "c")
            .authorization_code("abc")
            .build()
            .unwrap_err();
        assert!(matches!(err, OAuthError::Configuration(_)));
        assert!(err.to_string().contains("redirect_uri"));
    }

    #[test]
    fn test_refresh_grant_requires_refresh_token() {
        let err = TokenRequest::builder(configuration(), GrantType::RefreshToken, "c")
            .build()
            .unwrap_err();
        assert!(matches!(err, OAuthError::Configuration(_)));
    }

    #[test]
    fn test_reserved_additional_parameter_is_rejected() {
        let err = TokenRequest::builder(configuration(), GrantType::ClientCredentials, "c")
            .additional_parameter("client_id", "other")
            .build()
            .unwrap_err();
        assert!(matches!(err, OAuthError::Configuration(_)));
    }

    #[test]
    fn test_public_client_sends_client_id_in_body() {
        let request = TokenRequest::builder(configuration(), GrantType::AuthorizationCode, "c 1")
            .authorization_code("abc")
            .redirect_uri(redirect_uri())
            .code_verifier("v")
            .build()
            .unwrap();

        assert!(request.authorization_header().is_none());
        let http = request.http_request();
        let body = String::from_utf8(http.body.unwrap()).unwrap();
        assert_eq!(
            body,
            "grant_type=authorization_code&code=abc&redirect_uri=http%3A%2F%2F127.0.0.1%3A8080%2Fcallback&code_verifier=v&client_id=c+1"
        );
        assert_eq!(http.url.as_str(), "https://auth.example.com/token");
    }

    #[test]
    fn test_confidential_client_uses_basic_auth() {
        let request = TokenRequest::builder(configuration(), GrantType::ClientCredentials, "client")
            .client_secret("s3cr:t")
            .build()
            .unwrap();
        // base64("client:s3cr%3At")
        assert_eq!(
            request.authorization_header().as_deref(),
            Some("Basic Y2xpZW50OnMzY3IlM0F0")
        );
        assert!(!request
            .body_parameters()
            .iter()
            .any(|(k, _)| *k == "client_id" || *k == "client_secret"));
    }

    #[test]
    fn test_response_computes_absolute_expiry() {
        let body = br#"{"access_token":"at","token_type":"Bearer","expires_in":3600,"refresh_token":"rt-2","extra":true}"#;
        let response = TokenResponse::from_json(refresh_request(), body, received_at()).unwrap();
        assert_eq!(response.access_token(), "at");
        assert_eq!(
            response.expires_at().unwrap().timestamp(),
            1_700_003_600
        );
        assert_eq!(response.refresh_token(), Some("rt-2"));
        assert_eq!(response.raw()["extra"], true);
    }

    #[test]
    fn test_response_accepts_string_expires_in() {
        let body = br#"{"access_token":"at","token_type":"Bearer","expires_in":"60"}"#;
        let response = TokenResponse::from_json(refresh_request(), body, received_at()).unwrap();
        assert_eq!(response.expires_at().unwrap().timestamp(), 1_700_000_060);
    }

    #[test]
    fn test_response_missing_access_token_is_construction_error() {
        let body = br#"{"token_type":"Bearer"}"#;
        let err = TokenResponse::from_json(refresh_request(), body, received_at()).unwrap_err();
        assert!(matches!(err, OAuthError::TokenResponseConstruction(_)));
        assert!(!err.is_terminal());
    }

    #[test]
    fn test_response_missing_token_type_is_construction_error() {
        let body = br#"{"access_token":"at"}"#;
        let err = TokenResponse::from_json(refresh_request(), body, received_at()).unwrap_err();
        assert!(matches!(err, OAuthError::TokenResponseConstruction(_)));
    }

    #[test]
    fn test_response_invalid_json_is_construction_error() {
        let err = TokenResponse::from_json(refresh_request(), b"<html>", received_at()).unwrap_err();
        assert!(matches!(err, OAuthError::TokenResponseConstruction(_)));
    }

    #[test]
    fn test_expires_within() {
        let body = br#"{"access_token":"at","token_type":"Bearer","expires_in":10}"#;
        let response = TokenResponse::from_json(refresh_request(), body, received_at()).unwrap();
        assert!(response.expires_within(received_at(), Duration::seconds(60)));
        assert!(!response.expires_within(received_at(), Duration::seconds(5)));

        let no_expiry = br#"{"access_token":"at","token_type":"Bearer"}"#;
        let response = TokenResponse::from_json(refresh_request(), no_expiry, received_at()).unwrap();
        assert!(!response.expires_within(received_at(), Duration::seconds(60)));
    }

    #[test]
    fn test_response_huge_expires_in_is_construction_error() {
        let body = format!(
            r#"{{"access_token":"at","token_type":"Bearer","expires_in":{}}}"#,
            i64::MAX
        );
        let err = TokenResponse::from_json(refresh_request(), body.as_bytes(), received_at())
            .unwrap_err();
        assert!(matches!(err, OAuthError::TokenResponseConstruction(_)));

        let body = format!(
            r#"{{"access_token":"at","token_type":"Bearer","expires_in":{}}}"#,
            i64::MIN
        );
        let err = TokenResponse::from_json(refresh_request(), body.as_bytes(), received_at())
            .unwrap_err();
        assert!(matches!(err, OAuthError::TokenResponseConstruction(_)));
    }

    #[test]
    fn test_expires_within_unbounded_window_counts_as_expiring() {
        let body = br#"{"access_token":"at","token_type":"Bearer","expires_in":3600}"#;
        let response = TokenResponse::from_json(refresh_request(), body, received_at()).unwrap();
        assert!(response.expires_within(received_at(), Duration::MAX));
    }

    #[test]
    fn test_response_serde_round_trip() {
        let body = br#"{"access_token":"at","token_type":"Bearer","expires_in":3600}"#;
        let response = TokenResponse::from_json(refresh_request(), body, Utc::now()).unwrap();
        let json = serde_json::to_string(&response).unwrap();
        let back: TokenResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back, response);
    }
}
