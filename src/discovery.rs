//! OpenID Connect discovery and service configuration
//!
//! [`ServiceDiscovery`] is a validated view over a provider's discovery
//! document (OpenID Connect Discovery 1.0 / RFC 8414).  The full document is
//! kept alongside the typed fields so that provider-specific metadata
//! survives persistence.
//!
//! [`ServiceConfiguration`] is the immutable set of endpoints every request
//! type refers to.  It is built once, either manually or from a discovery
//! document, and never changes afterwards.
//!
//! # References
//!
//! - OpenID Connect Discovery 1.0 <https://openid.net/specs/openid-connect-discovery-1_0.html>
//! - RFC 8414 <https://www.rfc-editor.org/rfc/rfc8414>

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::codec::{self, JsonMap};
use crate::error::{OAuthError, Result};

/// Path appended to an issuer to locate its discovery document.
pub const WELL_KNOWN_PATH: &str = "/.well-known/openid-configuration";

// ---------------------------------------------------------------------------
// ServiceDiscovery
// ---------------------------------------------------------------------------

/// A validated OpenID Connect discovery document.
///
/// Construction fails unless `authorization_endpoint` and `token_endpoint`
/// are present and parse as URLs.  Every other field is optional; a
/// malformed optional field is logged and read as absent.
///
/// # Examples
///
/// ```
/// use oauthkit::discovery::ServiceDiscovery;
///
/// let json = br#"{
///     "issuer": "https://auth.example.com",
///     "authorization_endpoint": "https://auth.example.com/authorize",
///     "token_endpoint": "https://auth.example.com/token",
///     "custom_field": 42
/// }"#;
///
/// let discovery = ServiceDiscovery::from_slice(json).unwrap();
/// assert_eq!(discovery.token_endpoint.as_str(), "https://auth.example.com/token");
/// assert_eq!(discovery.raw()["custom_field"], 42);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "JsonMap", into = "JsonMap")]
pub struct ServiceDiscovery {
    /// Issuer identifier.
    pub issuer: Option<Url>,
    /// Authorization endpoint (RFC 6749 section 3.1).
    pub authorization_endpoint: Url,
    /// Token endpoint (RFC 6749 section 3.2).
    pub token_endpoint: Url,
    /// Dynamic client registration endpoint (RFC 7591).
    pub registration_endpoint: Option<Url>,
    /// RP-initiated logout endpoint.
    pub end_session_endpoint: Option<Url>,
    /// UserInfo endpoint.
    pub userinfo_endpoint: Option<Url>,
    /// Token revocation endpoint (RFC 7009).
    pub revocation_endpoint: Option<Url>,
    /// JSON Web Key Set location.
    pub jwks_uri: Option<Url>,
    /// Advertised scopes.
    pub scopes_supported: Option<Vec<String>>,
    /// Advertised `response_type` values.
    pub response_types_supported: Option<Vec<String>>,
    /// Advertised `grant_type` values.
    pub grant_types_supported: Option<Vec<String>>,
    /// Advertised PKCE challenge methods.
    pub code_challenge_methods_supported: Option<Vec<String>>,
    /// Advertised token endpoint client authentication methods.
    pub token_endpoint_auth_methods_supported: Option<Vec<String>>,
    raw: JsonMap,
}

impl ServiceDiscovery {
    /// Validates a decoded discovery document.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::InvalidDiscoveryDocument`] when
    /// `authorization_endpoint` or `token_endpoint` is missing or is not a
    /// URL.
    pub fn from_json(raw: JsonMap) -> Result<Self> {
        Ok(Self {
            issuer: optional_field(&raw, "issuer"),
            authorization_endpoint: required_endpoint(&raw, "authorization_endpoint")?,
            token_endpoint: required_endpoint(&raw, "token_endpoint")?,
            registration_endpoint: optional_field(&raw, "registration_endpoint"),
            end_session_endpoint: optional_field(&raw, "end_session_endpoint"),
            userinfo_endpoint: optional_field(&raw, "userinfo_endpoint"),
            revocation_endpoint: optional_field(&raw, "revocation_endpoint"),
            jwks_uri: optional_field(&raw, "jwks_uri"),
            scopes_supported: optional_field(&raw, "scopes_supported"),
            response_types_supported: optional_field(&raw, "response_types_supported"),
            grant_types_supported: optional_field(&raw, "grant_types_supported"),
            code_challenge_methods_supported: optional_field(
                &raw,
                "code_challenge_methods_supported",
            ),
            token_endpoint_auth_methods_supported: optional_field(
                &raw,
                "token_endpoint_auth_methods_supported",
            ),
            raw,
        })
    }

    /// Decodes and validates a discovery document body.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::InvalidDiscoveryDocument`] when the body is not
    /// a JSON object or fails validation.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        let raw = codec::decode_json_object(body)
            .map_err(|e| OAuthError::InvalidDiscoveryDocument(e.to_string()))?;
        Self::from_json(raw)
    }

    /// The complete document as received.
    pub fn raw(&self) -> &JsonMap {
        &self.raw
    }
}

impl TryFrom<JsonMap> for ServiceDiscovery {
    type Error = OAuthError;

    fn try_from(raw: JsonMap) -> Result<Self> {
        Self::from_json(raw)
    }
}

impl From<ServiceDiscovery> for JsonMap {
    fn from(discovery: ServiceDiscovery) -> Self {
        discovery.raw
    }
}

fn required_endpoint(raw: &JsonMap, key: &str) -> Result<Url> {
    let value = raw
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| OAuthError::InvalidDiscoveryDocument(format!("missing {key}")))?;
    Url::parse(value)
        .map_err(|e| OAuthError::InvalidDiscoveryDocument(format!("invalid {key}: {e}")))
}

fn optional_field<T: DeserializeOwned>(raw: &JsonMap, key: &str) -> Option<T> {
    match raw.get(key) {
        None | Some(serde_json::Value::Null) => None,
        Some(value) => match T::deserialize(value) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!(field = key, error = %e, "ignoring malformed discovery field");
                None
            }
        },
    }
}

/// Builds the discovery document URL for an issuer.
///
/// The well-known suffix is appended to the issuer's path, so an issuer with
/// a tenant path keeps it.
///
/// # Examples
///
/// ```
/// use url::Url;
/// use oauthkit::discovery::discovery_url_for_issuer;
///
/// let issuer = Url::parse("https://auth.example.com/tenant/").unwrap();
/// assert_eq!(
///     discovery_url_for_issuer(&issuer).as_str(),
///     "https://auth.example.com/tenant/.well-known/openid-configuration"
/// );
/// ```
pub fn discovery_url_for_issuer(issuer: &Url) -> Url {
    let mut url = issuer.clone();
    let path = format!("{}{}", issuer.path().trim_end_matches('/'), WELL_KNOWN_PATH);
    url.set_path(&path);
    url.set_query(None);
    url.set_fragment(None);
    url
}

// ---------------------------------------------------------------------------
// ServiceConfiguration
// ---------------------------------------------------------------------------

/// The endpoints of one OAuth / OpenID Connect provider.
///
/// # Examples
///
/// ```
/// use url::Url;
/// use oauthkit::discovery::ServiceConfiguration;
///
/// let config = ServiceConfiguration::new(
///     Url::parse("https://auth.example.com/authorize").unwrap(),
///     Url::parse("https://auth.example.com/token").unwrap(),
/// )
/// .with_issuer(Url::parse("https://auth.example.com").unwrap());
///
/// assert!(config.registration_endpoint().is_none());
/// assert_eq!(config.issuer().unwrap().as_str(), "https://auth.example.com/");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfiguration {
    authorization_endpoint: Url,
    token_endpoint: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    issuer: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    registration_endpoint: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end_session_endpoint: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    userinfo_endpoint: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    revocation_endpoint: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    discovery: Option<ServiceDiscovery>,
}

impl ServiceConfiguration {
    /// Creates a manual configuration with the two mandatory endpoints.
    pub fn new(authorization_endpoint: Url, token_endpoint: Url) -> Self {
        Self {
            authorization_endpoint,
            token_endpoint,
            issuer: None,
            registration_endpoint: None,
            end_session_endpoint: None,
            userinfo_endpoint: None,
            revocation_endpoint: None,
            discovery: None,
        }
    }

    /// Sets the issuer of a manual configuration.
    pub fn with_issuer(mut self, issuer: Url) -> Self {
        self.issuer = Some(issuer);
        self
    }

    /// Sets the registration endpoint of a manual configuration.
    pub fn with_registration_endpoint(mut self, endpoint: Url) -> Self {
        self.registration_endpoint = Some(endpoint);
        self
    }

    /// Sets the end-session endpoint of a manual configuration.
    pub fn with_end_session_endpoint(mut self, endpoint: Url) -> Self {
        self.end_session_endpoint = Some(endpoint);
        self
    }

    /// Sets the userinfo endpoint of a manual configuration.
    pub fn with_userinfo_endpoint(mut self, endpoint: Url) -> Self {
        self.userinfo_endpoint = Some(endpoint);
        self
    }

    /// Sets the revocation endpoint of a manual configuration.
    pub fn with_revocation_endpoint(mut self, endpoint: Url) -> Self {
        self.revocation_endpoint = Some(endpoint);
        self
    }

    /// Builds a configuration from a validated discovery document.
    pub fn from_discovery(discovery: ServiceDiscovery) -> Self {
        Self {
            authorization_endpoint: discovery.authorization_endpoint.clone(),
            token_endpoint: discovery.token_endpoint.clone(),
            issuer: discovery.issuer.clone(),
            registration_endpoint: discovery.registration_endpoint.clone(),
            end_session_endpoint: discovery.end_session_endpoint.clone(),
            userinfo_endpoint: discovery.userinfo_endpoint.clone(),
            revocation_endpoint: discovery.revocation_endpoint.clone(),
            discovery: Some(discovery),
        }
    }

    /// Authorization endpoint.
    pub fn authorization_endpoint(&self) -> &Url {
        &self.authorization_endpoint
    }

    /// Token endpoint.
    pub fn token_endpoint(&self) -> &Url {
        &self.token_endpoint
    }

    /// Issuer identifier, when known.
    pub fn issuer(&self) -> Option<&Url> {
        self.issuer.as_ref()
    }

    /// Dynamic client registration endpoint.
    pub fn registration_endpoint(&self) -> Option<&Url> {
        self.registration_endpoint.as_ref()
    }

    /// End-session endpoint.
    pub fn end_session_endpoint(&self) -> Option<&Url> {
        self.end_session_endpoint.as_ref()
    }

    /// UserInfo endpoint.
    pub fn userinfo_endpoint(&self) -> Option<&Url> {
        self.userinfo_endpoint.as_ref()
    }

    /// Revocation endpoint.
    pub fn revocation_endpoint(&self) -> Option<&Url> {
        self.revocation_endpoint.as_ref()
    }

    /// The discovery document this configuration was built from.
    pub fn discovery(&self) -> Option<&ServiceDiscovery> {
        self.discovery.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
