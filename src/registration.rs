//! Dynamic client registration (RFC 7591)
//!
//! The client metadata is POSTed as a JSON document to the provider's
//! registration endpoint.  An initial access token, when the provider
//! requires one, travels as a bearer `Authorization` header.
//!
//! # References
//!
//! - RFC 7591 <https://www.rfc-editor.org/rfc/rfc7591>
//! - OpenID Connect Dynamic Client Registration 1.0

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::codec::{self, JsonMap};
use crate::discovery::ServiceConfiguration;
use crate::error::{OAuthError, Result};
use crate::transport::HttpRequest;

/// `application_type` sent with every registration.
pub const APPLICATION_TYPE_NATIVE: &str = "native";

const RESERVED_PARAMETERS: &[&str] = &[
    "application_type",
    "redirect_uris",
    "response_types",
    "grant_types",
    "subject_type",
    "token_endpoint_auth_method",
];

// ---------------------------------------------------------------------------
// RegistrationRequest
// ---------------------------------------------------------------------------

/// An immutable client registration request.
///
/// # Examples
///
/// ```
/// use url::Url;
/// use oauthkit::discovery::ServiceConfiguration;
/// use oauthkit::registration::RegistrationRequest;
///
/// let config = ServiceConfiguration::new(
///     Url::parse("https://auth.example.com/authorize").unwrap(),
///     Url::parse("https://auth.example.com/token").unwrap(),
/// )
/// .with_registration_endpoint(Url::parse("https://auth.example.com/register").unwrap());
///
/// let request = RegistrationRequest::builder(
///     config,
///     vec![Url::parse("http://127.0.0.1:8080/callback").unwrap()],
/// )
/// .token_endpoint_auth_method("none")
/// .build()
/// .unwrap();
///
/// let body = request.to_json();
/// assert_eq!(body["application_type"], "native");
/// assert_eq!(body["token_endpoint_auth_method"], "none");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    configuration: ServiceConfiguration,
    redirect_uris: Vec<Url>,
    #[serde(default)]
    response_types: Vec<String>,
    #[serde(default)]
    grant_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subject_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_endpoint_auth_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    initial_access_token: Option<String>,
    #[serde(default)]
    additional_parameters: JsonMap,
}

impl RegistrationRequest {
    /// Starts a registration request for the given redirect URIs.
    pub fn builder(configuration: ServiceConfiguration, redirect_uris: Vec<Url>) -> RegistrationRequestBuilder {
        RegistrationRequestBuilder {
            request: RegistrationRequest {
                configuration,
                redirect_uris,
                response_types: Vec::new(),
                grant_types: Vec::new(),
                subject_type: None,
                token_endpoint_auth_method: None,
                initial_access_token: None,
                additional_parameters: JsonMap::new(),
            },
        }
    }

    /// The client metadata document.
    pub fn to_json(&self) -> serde_json::Value {
        let mut body = JsonMap::new();
        body.insert(
            "application_type".to_string(),
            APPLICATION_TYPE_NATIVE.into(),
        );
        body.insert(
            "redirect_uris".to_string(),
            self.redirect_uris
                .iter()
                .map(|u| serde_json::Value::String(u.to_string()))
                .collect(),
        );
        if !self.response_types.is_empty() {
            body.insert("response_types".to_string(), self.response_types.clone().into());
        }
        if !self.grant_types.is_empty() {
            body.insert("grant_types".to_string(), self.grant_types.clone().into());
        }
        if let Some(subject_type) = &self.subject_type {
            body.insert("subject_type".to_string(), subject_type.clone().into());
        }
        if let Some(method) = &self.token_endpoint_auth_method {
            body.insert("token_endpoint_auth_method".to_string(), method.clone().into());
        }
        for (key, value) in &self.additional_parameters {
            body.insert(key.clone(), value.clone());
        }
        serde_json::Value::Object(body)
    }

    /// The HTTP request that performs this registration.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::Configuration`] when the configuration has no
    /// registration endpoint, or [`OAuthError::JsonSerialization`] when the
    /// body cannot be encoded.
    pub fn http_request(&self) -> Result<HttpRequest> {
        let endpoint = self.configuration.registration_endpoint().ok_or_else(|| {
            OAuthError::Configuration("provider has no registration endpoint".to_string())
        })?;
        let body = serde_json::to_vec(&self.to_json())
            .map_err(|e| OAuthError::JsonSerialization(e.to_string()))?;

        let mut request = HttpRequest::post_json(endpoint.clone(), body);
        if let Some(token) = &self.initial_access_token {
            request = request.with_header("Authorization", format!("Bearer {token}"));
        }
        Ok(request)
    }

    /// Provider configuration.
    pub fn configuration(&self) -> &ServiceConfiguration {
        &self.configuration
    }

    /// Redirect URIs being registered.
    pub fn redirect_uris(&self) -> &[Url] {
        &self.redirect_uris
    }

    /// Requested token endpoint authentication method.
    pub fn token_endpoint_auth_method(&self) -> Option<&str> {
        self.token_endpoint_auth_method.as_deref()
    }
}

/// Builder for [`RegistrationRequest`].
#[derive(Debug, Clone)]
pub struct RegistrationRequestBuilder {
    request: RegistrationRequest,
}

impl RegistrationRequestBuilder {
    /// Sets `response_types`.
    pub fn response_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.request.response_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Sets `grant_types`.
    pub fn grant_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.request.grant_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Sets `subject_type`.
    pub fn subject_type(mut self, subject_type: impl Into<String>) -> Self {
        self.request.subject_type = Some(subject_type.into());
        self
    }

    /// Sets `token_endpoint_auth_method`.
    pub fn token_endpoint_auth_method(mut self, method: impl Into<String>) -> Self {
        self.request.token_endpoint_auth_method = Some(method.into());
        self
    }

    /// Sets the initial access token.
    pub fn initial_access_token(mut self, token: impl Into<String>) -> Self {
        self.request.initial_access_token = Some(token.into());
        self
    }

    /// Adds an extra metadata field, such as `client_name`.
    pub fn additional_parameter(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.request
            .additional_parameters
            .insert(key.into(), value.into());
        self
    }

    /// Validates and builds the request.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::Configuration`] when no redirect URI is given or
    /// an additional parameter uses a reserved name.
    pub fn build(self) -> Result<RegistrationRequest> {
        if self.request.redirect_uris.is_empty() {
            return Err(OAuthError::Configuration(
                "registration requires at least one redirect URI".to_string(),
            ));
        }
        if let Some(key) = self
            .request
            .additional_parameters
            .keys()
            .find(|key| RESERVED_PARAMETERS.contains(&key.as_str()))
        {
            return Err(OAuthError::Configuration(format!(
                "additional parameter '{key}' collides with a request parameter"
            )));
        }
        Ok(self.request)
    }
}

// ---------------------------------------------------------------------------
// RegistrationResponse
// ---------------------------------------------------------------------------

/// A successful registration response (RFC 7591 section 3.2.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationResponse {
    request: RegistrationRequest,
    client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_id_issued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_secret_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    registration_access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    registration_client_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_endpoint_auth_method: Option<String>,
    #[serde(default)]
    raw: JsonMap,
}

impl RegistrationResponse {
    /// Decodes a 2xx registration endpoint body.
    ///
    /// A `client_secret_expires_at` of `0` means the secret never expires
    /// and is stored as `None`.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::RegistrationResponseConstruction`] when the
    /// body is not a JSON object or has no `client_id`.
    pub fn from_json(request: RegistrationRequest, body: &[u8]) -> Result<Self> {
        let raw = codec::decode_json_object(body)
            .map_err(|e| OAuthError::RegistrationResponseConstruction(e.to_string()))?;

        let string_field = |key: &str| raw.get(key).and_then(|v| v.as_str()).map(str::to_string);
        let instant_field = |key: &str| {
            raw.get(key)
                .and_then(|v| v.as_i64())
                .filter(|secs| *secs > 0)
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        };

        let client_id = string_field("client_id").ok_or_else(|| {
            OAuthError::RegistrationResponseConstruction("missing client_id".to_string())
        })?;

        Ok(Self {
            client_id,
            client_id_issued_at: instant_field("client_id_issued_at"),
            client_secret: string_field("client_secret"),
            client_secret_expires_at: instant_field("client_secret_expires_at"),
            registration_access_token: string_field("registration_access_token"),
            registration_client_uri: string_field("registration_client_uri"),
            token_endpoint_auth_method: string_field("token_endpoint_auth_method"),
            request,
            raw,
        })
    }

    /// The request this response answers.
    pub fn request(&self) -> &RegistrationRequest {
        &self.request
    }

    /// Issued client identifier.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// When the client id was issued.
    pub fn client_id_issued_at(&self) -> Option<DateTime<Utc>> {
        self.client_id_issued_at
    }

    /// Issued client secret.
    pub fn client_secret(&self) -> Option<&str> {
        self.client_secret.as_deref()
    }

    /// When the client secret expires; `None` when it never does.
    pub fn client_secret_expires_at(&self) -> Option<DateTime<Utc>> {
        self.client_secret_expires_at
    }

    /// Token for the client configuration endpoint.
    pub fn registration_access_token(&self) -> Option<&str> {
        self.registration_access_token.as_deref()
    }

    /// Client configuration endpoint.
    pub fn registration_client_uri(&self) -> Option<&str> {
        self.registration_client_uri.as_deref()
    }

    /// Authentication method the provider assigned.
    pub fn token_endpoint_auth_method(&self) -> Option<&str> {
        self.token_endpoint_auth_method.as_deref()
    }

    /// Every field of the response body.
    pub fn raw(&self) -> &JsonMap {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::tests::{configuration, redirect_uri};
    use crate::transport::HttpMethod;

    fn registration_configuration() -> ServiceConfiguration {
        configuration()
            .with_registration_endpoint(Url::parse("https://auth.example.com/register").unwrap())
    }

    fn request() -> RegistrationRequest {
        RegistrationRequest::builder(registration_configuration(), vec![redirect_uri()])
            .grant_types(["authorization_code", "refresh_token"])
            .response_types(["code"])
            .additional_parameter("client_name", "OAuthKit")
            .build()
            .unwrap()
    }

    #[test]
    fn test_registration_body_contains_metadata() {
        let body = request().to_json();
        assert_eq!(body["application_type"], "native");
        assert_eq!(body["redirect_uris"][0], "http://127.0.0.1:8080/callback");
        assert_eq!(body["grant_types"][1], "refresh_token");
        assert_eq!(body["client_name"], "OAuthKit");
        assert!(body.get("subject_type").is_none());
    }

    #[test]
    fn test_http_request_is_json_post_with_initial_token() {
        let request = RegistrationRequest::builder(registration_configuration(), vec![redirect_uri()])
            .initial_access_token("iat-1")
            .build()
            .unwrap();
        let http = request.http_request().unwrap();
        assert_eq!(http.method, HttpMethod::Post);
        assert_eq!(http.header("Content-Type"), Some("application/json"));
        assert_eq!(http.header("Authorization"), Some("Bearer iat-1"));
    }

    #[test]
    fn test_missing_registration_endpoint_is_configuration_error() {
        let request = RegistrationRequest::builder(configuration(), vec![redirect_uri()])
            .build()
            .unwrap();
        assert!(matches!(
            request.http_request().unwrap_err(),
            OAuthError::Configuration(_)
        ));
    }

    #[test]
    fn test_builder_rejects_empty_redirects_and_reserved_keys() {
        assert!(RegistrationRequest::builder(registration_configuration(), vec![])
            .build()
            .is_err());
        assert!(
            RegistrationRequest::builder(registration_configuration(), vec![redirect_uri()])
                .additional_parameter("redirect_uris", "x")
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_response_reads_client_credentials() {
        let body = br#"{"client_id":"new-client","client_secret":"s","client_secret_expires_at":0,"client_id_issued_at":1700000000}"#;
        let response = RegistrationResponse::from_json(request(), body).unwrap();
        assert_eq!(response.client_id(), "new-client");
        assert_eq!(response.client_secret(), Some("s"));
        assert!(response.client_secret_expires_at().is_none());
        assert_eq!(
            response.client_id_issued_at().unwrap().timestamp(),
            1_700_000_000
        );
    }

    #[test]
    fn test_response_without_client_id_is_construction_error() {
        let err = RegistrationResponse::from_json(request(), br#"{"client_secret":"s"}"#).unwrap_err();
        assert!(matches!(err, OAuthError::RegistrationResponseConstruction(_)));
    }
}
