//! Error types for OAuthKit
//!
//! This module defines the error taxonomy shared by every protocol
//! operation, using `thiserror` for ergonomic error handling.
//!
//! Errors fall into two groups:
//!
//! - General errors raised by the client itself (network failures, malformed
//!   server responses, cancelled flows, ID token problems).
//! - OAuth protocol errors returned by an endpoint, carried by the single
//!   [`OAuthError::OAuth`] variant and tagged with the endpoint that produced
//!   them.
//!
//! [`OAuthError::is_terminal`] separates the errors that invalidate an
//! [`AuthState`](crate::auth_state::AuthState) from the transient ones.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::JsonMap;

/// Result type alias for OAuthKit operations
pub type Result<T, E = OAuthError> = std::result::Result<T, E>;

/// Field name of the OAuth error code in an error response.
pub const ERROR_FIELD: &str = "error";

/// Field name of the human-readable error description.
pub const ERROR_DESCRIPTION_FIELD: &str = "error_description";

/// Field name of the error documentation URI.
pub const ERROR_URI_FIELD: &str = "error_uri";

// ---------------------------------------------------------------------------
// OAuthEndpoint
// ---------------------------------------------------------------------------

/// The endpoint an OAuth error response was received from.
///
/// Each endpoint defines its own table of error codes; the same string may be
/// recognised by one endpoint and unknown to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthEndpoint {
    /// Authorization endpoint (RFC 6749 section 4.1.2.1).
    Authorization,
    /// Token endpoint (RFC 6749 section 5.2).
    Token,
    /// Dynamic client registration endpoint (RFC 7591 section 3.2.2).
    Registration,
}

impl fmt::Display for OAuthEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Authorization => "authorization",
            Self::Token => "token",
            Self::Registration => "registration",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// OAuthErrorCode
// ---------------------------------------------------------------------------

/// A recognised OAuth error code, or the raw string when unrecognised.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "code", content = "raw", rename_all = "snake_case")]
pub enum OAuthErrorCode {
    /// `invalid_request`
    InvalidRequest,
    /// `unauthorized_client`
    UnauthorizedClient,
    /// `access_denied`
    AccessDenied,
    /// `unsupported_response_type`
    UnsupportedResponseType,
    /// `invalid_scope`
    InvalidScope,
    /// `server_error`
    ServerError,
    /// `temporarily_unavailable`
    TemporarilyUnavailable,
    /// `invalid_client`
    InvalidClient,
    /// `invalid_grant`
    InvalidGrant,
    /// `unsupported_grant_type`
    UnsupportedGrantType,
    /// `invalid_redirect_uri`
    InvalidRedirectUri,
    /// `invalid_client_metadata`
    InvalidClientMetadata,
    /// A protocol violation detected by the client, such as a `state`
    /// mismatch.
    ClientError,
    /// A code the endpoint's table does not recognise.
    Other(String),
}

impl OAuthErrorCode {
    /// Maps an `error` string against the code table of `endpoint`.
    ///
    /// Strings outside the table yield [`OAuthErrorCode::Other`] carrying the
    /// raw value; this never fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use oauthkit::error::{OAuthEndpoint, OAuthErrorCode};
    ///
    /// assert_eq!(
    ///     OAuthErrorCode::for_endpoint(OAuthEndpoint::Token, "invalid_grant"),
    ///     OAuthErrorCode::InvalidGrant
    /// );
    /// assert_eq!(
    ///     OAuthErrorCode::for_endpoint(OAuthEndpoint::Authorization, "invalid_grant"),
    ///     OAuthErrorCode::Other("invalid_grant".to_string())
    /// );
    /// ```
    pub fn for_endpoint(endpoint: OAuthEndpoint, error: &str) -> Self {
        match (endpoint, error) {
            (_, "invalid_request") => Self::InvalidRequest,
            (OAuthEndpoint::Authorization | OAuthEndpoint::Token, "unauthorized_client") => {
                Self::UnauthorizedClient
            }
            (OAuthEndpoint::Authorization | OAuthEndpoint::Token, "invalid_scope") => {
                Self::InvalidScope
            }
            (OAuthEndpoint::Authorization, "access_denied") => Self::AccessDenied,
            (OAuthEndpoint::Authorization, "unsupported_response_type") => {
                Self::UnsupportedResponseType
            }
            (OAuthEndpoint::Authorization, "server_error") => Self::ServerError,
            (OAuthEndpoint::Authorization, "temporarily_unavailable") => {
                Self::TemporarilyUnavailable
            }
            (OAuthEndpoint::Token, "invalid_client") => Self::InvalidClient,
            (OAuthEndpoint::Token, "invalid_grant") => Self::InvalidGrant,
            (OAuthEndpoint::Token, "unsupported_grant_type") => Self::UnsupportedGrantType,
            (OAuthEndpoint::Registration, "invalid_redirect_uri") => Self::InvalidRedirectUri,
            (OAuthEndpoint::Registration, "invalid_client_metadata") => {
                Self::InvalidClientMetadata
            }
            (_, other) => Self::Other(other.to_string()),
        }
    }

    /// Returns the wire string for this code.
    pub fn as_str(&self) -> &str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::AccessDenied => "access_denied",
            Self::UnsupportedResponseType => "unsupported_response_type",
            Self::InvalidScope => "invalid_scope",
            Self::ServerError => "server_error",
            Self::TemporarilyUnavailable => "temporarily_unavailable",
            Self::InvalidClient => "invalid_client",
            Self::InvalidGrant => "invalid_grant",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::InvalidRedirectUri => "invalid_redirect_uri",
            Self::InvalidClientMetadata => "invalid_client_metadata",
            Self::ClientError => "client_error",
            Self::Other(raw) => raw,
        }
    }

    /// Stable numeric code, for callers that report errors as integers.
    pub fn numeric(&self) -> i64 {
        match self {
            Self::InvalidRequest => -2,
            Self::UnauthorizedClient => -3,
            Self::AccessDenied => -4,
            Self::UnsupportedResponseType => -5,
            Self::InvalidScope => -6,
            Self::ServerError => -7,
            Self::TemporarilyUnavailable => -8,
            Self::InvalidClient => -9,
            Self::InvalidGrant => -10,
            Self::UnsupportedGrantType => -11,
            Self::InvalidRedirectUri => -12,
            Self::InvalidClientMetadata => -13,
            Self::ClientError => -0xEFFF,
            Self::Other(_) => -0xF000,
        }
    }
}

impl fmt::Display for OAuthErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// OAuthErrorResponse
// ---------------------------------------------------------------------------

/// An OAuth error returned by (or detected against) one endpoint.
///
/// `raw` holds every parameter of the original error response so that
/// provider-specific fields survive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthErrorResponse {
    /// Endpoint that produced the error.
    pub endpoint: OAuthEndpoint,

    /// Recognised code or raw string.
    pub code: OAuthErrorCode,

    /// Value of `error_description`, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Value of `error_uri`, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,

    /// All parameters of the error response.
    #[serde(default)]
    pub raw: JsonMap,
}

impl OAuthErrorResponse {
    /// Reads an error response from a JSON body or parameter mapping.
    ///
    /// Returns `None` when the mapping has no string `error` field, meaning
    /// the body is not an OAuth error response.
    ///
    /// # Examples
    ///
    /// ```
    /// use oauthkit::error::{OAuthEndpoint, OAuthErrorCode, OAuthErrorResponse};
    ///
    /// let body = serde_json::json!({"error": "invalid_grant", "error_description": "expired"});
    /// let map = body.as_object().unwrap();
    /// let err = OAuthErrorResponse::from_json(OAuthEndpoint::Token, map).unwrap();
    /// assert_eq!(err.code, OAuthErrorCode::InvalidGrant);
    /// assert_eq!(err.description.as_deref(), Some("expired"));
    /// ```
    pub fn from_json(endpoint: OAuthEndpoint, map: &JsonMap) -> Option<Self> {
        let error = map.get(ERROR_FIELD)?.as_str()?;
        let string_field = |key: &str| map.get(key).and_then(|v| v.as_str()).map(str::to_string);

        Some(Self {
            endpoint,
            code: OAuthErrorCode::for_endpoint(endpoint, error),
            description: string_field(ERROR_DESCRIPTION_FIELD),
            uri: string_field(ERROR_URI_FIELD),
            raw: map.clone(),
        })
    }

    /// Builds a client-side error for `endpoint`.
    pub fn client_error(endpoint: OAuthEndpoint, description: impl Into<String>) -> Self {
        Self {
            endpoint,
            code: OAuthErrorCode::ClientError,
            description: Some(description.into()),
            uri: None,
            raw: JsonMap::new(),
        }
    }
}

impl fmt::Display for OAuthErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} endpoint returned {}", self.endpoint, self.code)?;
        if let Some(description) = &self.description {
            write!(f, ": {description}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// OAuthError
// ---------------------------------------------------------------------------

/// Main error type for OAuthKit operations
///
/// Every fallible protocol operation returns this type.  Variants carry
/// strings rather than source errors so that errors can be cloned, compared,
/// and persisted as part of an auth state.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum OAuthError {
    /// The discovery document was missing a required field or malformed.
    #[error("Invalid discovery document: {0}")]
    InvalidDiscoveryDocument(String),

    /// The user dismissed the external user agent.
    #[error("Authorization flow cancelled by the user")]
    UserCanceled,

    /// The embedding program cancelled the flow.
    #[error("Authorization flow cancelled by the program")]
    ProgramCanceled,

    /// The HTTP transport failed before a response was received.
    #[error("Network error: {0}")]
    Network(String),

    /// The server returned a non-OAuth HTTP failure.
    #[error("Server error: status={status}, {body}")]
    Server {
        /// HTTP status code
        status: u16,
        /// Response body, lossily decoded
        body: String,
    },

    /// JSON could not be decoded.
    #[error("JSON deserialization error: {0}")]
    JsonDeserialization(String),

    /// JSON could not be encoded.
    #[error("JSON serialization error: {0}")]
    JsonSerialization(String),

    /// The redirect did not carry a well-formed authorization response.
    #[error("Authorization response construction error: {0}")]
    AuthorizationResponseConstruction(String),

    /// A successful token endpoint response had a malformed body.
    #[error("Token response construction error: {0}")]
    TokenResponseConstruction(String),

    /// A successful registration endpoint response had a malformed body.
    #[error("Registration response construction error: {0}")]
    RegistrationResponseConstruction(String),

    /// The external user agent could not present the request.
    #[error("External user agent presentation failed: {0}")]
    AgentPresentation(String),

    /// Fresh tokens could not be obtained.
    #[error("Token refresh error: {0}")]
    TokenRefresh(String),

    /// The ID token could not be decoded.
    #[error("ID token parsing error: {0}")]
    IdTokenParsing(String),

    /// The ID token claims failed validation.
    #[error("ID token validation error: {0}")]
    IdTokenValidation(String),

    /// A request was constructed with invalid parameters.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A session operation was invoked outside its valid state.
    #[error("Session contract violation: {0}")]
    SessionContract(String),

    /// An OAuth protocol error returned by, or detected against, an endpoint.
    #[error("OAuth error: {0}")]
    OAuth(OAuthErrorResponse),
}

impl OAuthError {
    /// Returns `true` when the error invalidates the current grant.
    ///
    /// OAuth endpoint errors and ID token failures are terminal; network,
    /// server, and construction errors are transient and leave stored tokens
    /// untouched.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::OAuth(_) | Self::IdTokenParsing(_) | Self::IdTokenValidation(_)
        )
    }

    /// Returns the OAuth error response when this is a protocol error.
    pub fn oauth_response(&self) -> Option<&OAuthErrorResponse> {
        match self {
            Self::OAuth(response) => Some(response),
            _ => None,
        }
    }

    /// Returns `true` for an OAuth error from `endpoint` with `code`.
    pub fn is_oauth(&self, endpoint: OAuthEndpoint, code: &OAuthErrorCode) -> bool {
        self.oauth_response()
            .is_some_and(|r| r.endpoint == endpoint && &r.code == code)
    }

    /// Numeric code.  General errors use small negative values; OAuth
    /// errors use [`OAuthErrorCode::numeric`].
    pub fn code(&self) -> i64 {
        match self {
            Self::InvalidDiscoveryDocument(_) => -2,
            Self::UserCanceled => -3,
            Self::ProgramCanceled => -4,
            Self::Network(_) => -5,
            Self::Server { .. } => -6,
            Self::JsonDeserialization(_) => -7,
            Self::TokenResponseConstruction(_) => -8,
            Self::AgentPresentation(_) => -9,
            Self::TokenRefresh(_) => -11,
            Self::RegistrationResponseConstruction(_) => -12,
            Self::JsonSerialization(_) => -13,
            Self::IdTokenParsing(_) => -14,
            Self::IdTokenValidation(_) => -15,
            Self::AuthorizationResponseConstruction(_) => -16,
            Self::Configuration(_) => -17,
            Self::SessionContract(_) => -18,
            Self::OAuth(response) => response.code.numeric(),
        }
    }

    pub(crate) fn state_mismatch() -> Self {
        Self::OAuth(OAuthErrorResponse::client_error(
            OAuthEndpoint::Authorization,
            "state mismatch between request and response",
        ))
    }
}
