//! Authorization requests and responses
//!
//! An [`AuthorizationRequest`] is assembled with [`AuthorizationRequestBuilder`],
//! which generates `state`, the PKCE pair, and (for OpenID Connect requests)
//! the `nonce`.  The request is encoded into the URL handed to the external
//! user agent; the redirect that comes back is decoded into an
//! [`AuthorizationResponse`] or an authorization endpoint error.
//!
//! # Examples
//!
//! ```
//! use url::Url;
//! use oauthkit::authorization::AuthorizationRequest;
//! use oauthkit::discovery::ServiceConfiguration;
//!
//! let config = ServiceConfiguration::new(
//!     Url::parse("https://auth.example.com/authorize").unwrap(),
//!     Url::parse("https://auth.example.com/token").unwrap(),
//! );
//! let request = AuthorizationRequest::builder(
//!     config,
//!     "client-123",
//!     Url::parse("http://127.0.0.1:8080/callback").unwrap(),
//! )
//! .scopes(["openid", "profile"])
//! .build()
//! .unwrap();
//!
//! let url = request.authorization_request_url();
//! assert!(url.as_str().contains("code_challenge_method=S256"));
//! assert!(request.nonce().is_some());
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::codec::{self, JsonMap};
use crate::discovery::ServiceConfiguration;
use crate::error::{
    OAuthEndpoint, OAuthError, OAuthErrorResponse, Result, ERROR_FIELD,
};
use crate::pkce::PkceChallenge;
use crate::token::{GrantType, TokenRequest};
use crate::user_agent::UserAgentFlow;

/// The authorization code response type.
pub const RESPONSE_TYPE_CODE: &str = "code";

/// The scope that marks a request as an OpenID Connect request.
pub const SCOPE_OPENID: &str = "openid";

/// Query parameters written by the request itself.
const RESERVED_PARAMETERS: &[&str] = &[
    "response_type",
    "client_id",
    "redirect_uri",
    "scope",
    "state",
    "nonce",
    "code_challenge",
    "code_challenge_method",
];

// ---------------------------------------------------------------------------
// AuthorizationRequest
// ---------------------------------------------------------------------------

/// An immutable authorization request (RFC 6749 section 4.1.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    configuration: ServiceConfiguration,
    client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_secret: Option<String>,
    response_type: String,
    redirect_uri: Url,
    #[serde(default)]
    scopes: Vec<String>,
    state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pkce: Option<PkceChallenge>,
    #[serde(default)]
    additional_parameters: BTreeMap<String, String>,
}

impl AuthorizationRequest {
    /// Starts a request for the authorization code flow.
    pub fn builder(
        configuration: ServiceConfiguration,
        client_id: impl Into<String>,
        redirect_uri: Url,
    ) -> AuthorizationRequestBuilder {
        AuthorizationRequestBuilder {
            configuration,
            client_id: client_id.into(),
            redirect_uri,
            client_secret: None,
            response_type: RESPONSE_TYPE_CODE.to_string(),
            scopes: Vec::new(),
            state: None,
            nonce: NonceSetting::Automatic,
            pkce: PkceSetting::Generate,
            additional_parameters: BTreeMap::new(),
        }
    }

    /// Encodes the request as the URL presented to the user.
    ///
    /// Any query already on the authorization endpoint is kept; [`build`]
    /// rejects an endpoint query that would repeat a parameter.
    ///
    /// [`build`]: AuthorizationRequestBuilder::build
    pub fn authorization_request_url(&self) -> Url {
        let mut url = self.configuration.authorization_endpoint().clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("response_type", &self.response_type);
            query.append_pair("client_id", &self.client_id);
            query.append_pair("redirect_uri", self.redirect_uri.as_str());
            if let Some(scope) = self.scope() {
                query.append_pair("scope", &scope);
            }
            query.append_pair("state", &self.state);
            if let Some(nonce) = &self.nonce {
                query.append_pair("nonce", nonce);
            }
            if let Some(pkce) = &self.pkce {
                query.append_pair("code_challenge", &pkce.challenge);
                query.append_pair("code_challenge_method", &pkce.method);
            }
            for (key, value) in &self.additional_parameters {
                query.append_pair(key, value);
            }
        }
        url
    }

    /// Provider configuration.
    pub fn configuration(&self) -> &ServiceConfiguration {
        &self.configuration
    }

    /// Client identifier.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Client secret, for confidential clients.
    pub fn client_secret(&self) -> Option<&str> {
        self.client_secret.as_deref()
    }

    /// `response_type` value.
    pub fn response_type(&self) -> &str {
        &self.response_type
    }

    /// Redirect URI registered for the client.
    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    /// Requested scopes, in request order, without duplicates.
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// Space-joined scopes, or `None` when no scope was requested.
    pub fn scope(&self) -> Option<String> {
        (!self.scopes.is_empty()).then(|| self.scopes.join(" "))
    }

    /// `state` value.
    pub fn state(&self) -> &str {
        &self.state
    }

    /// OpenID Connect nonce.
    pub fn nonce(&self) -> Option<&str> {
        self.nonce.as_deref()
    }

    /// PKCE pair, when PKCE is in use.
    pub fn pkce(&self) -> Option<&PkceChallenge> {
        self.pkce.as_ref()
    }

    /// PKCE verifier kept for the token exchange.
    pub fn code_verifier(&self) -> Option<&str> {
        self.pkce.as_ref().map(|p| p.verifier.as_str())
    }

    /// Extra query parameters.
    pub fn additional_parameters(&self) -> &BTreeMap<String, String> {
        &self.additional_parameters
    }
}

impl UserAgentFlow for AuthorizationRequest {
    type Response = AuthorizationResponse;

    fn external_url(&self) -> Result<Url> {
        Ok(self.authorization_request_url())
    }

    fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    fn parse_redirect(&self, url: &Url) -> Result<AuthorizationResponse> {
        let response = AuthorizationResponse::from_redirect(self.clone(), url)?;
        response.validate_state()?;
        Ok(response)
    }
}

// ---------------------------------------------------------------------------
// AuthorizationRequestBuilder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum NonceSetting {
    Automatic,
    Fixed(String),
    Disabled,
}

#[derive(Debug, Clone)]
enum PkceSetting {
    Generate,
    Verifier(String),
    Disabled,
}

/// Builder for [`AuthorizationRequest`].
#[derive(Debug, Clone)]
pub struct AuthorizationRequestBuilder {
    configuration: ServiceConfiguration,
    client_id: String,
    redirect_uri: Url,
    client_secret: Option<String>,
    response_type: String,
    scopes: Vec<String>,
    state: Option<String>,
    nonce: NonceSetting,
    pkce: PkceSetting,
    additional_parameters: BTreeMap<String, String>,
}

impl AuthorizationRequestBuilder {
    /// Sets the client secret.
    pub fn client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    /// Overrides the `response_type`.
    pub fn response_type(mut self, response_type: impl Into<String>) -> Self {
        self.response_type = response_type.into();
        self
    }

    /// Adds scopes.  Repeated scopes are dropped, keeping first occurrence
    /// order.
    pub fn scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for scope in scopes {
            let scope = scope.into();
            if !scope.is_empty() && !self.scopes.contains(&scope) {
                self.scopes.push(scope);
            }
        }
        self
    }

    /// Uses a caller-supplied `state` instead of a random one.
    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    /// Uses a caller-supplied nonce.
    pub fn nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = NonceSetting::Fixed(nonce.into());
        self
    }

    /// Sends no nonce, even for OpenID Connect requests.
    pub fn without_nonce(mut self) -> Self {
        self.nonce = NonceSetting::Disabled;
        self
    }

    /// Uses a caller-supplied PKCE verifier.  It is validated by
    /// [`Self::build`].
    pub fn code_verifier(mut self, verifier: impl Into<String>) -> Self {
        self.pkce = PkceSetting::Verifier(verifier.into());
        self
    }

    /// Disables PKCE.
    pub fn without_pkce(mut self) -> Self {
        self.pkce = PkceSetting::Disabled;
        self
    }

    /// Adds an extra query parameter.
    pub fn additional_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_parameters.insert(key.into(), value.into());
        self
    }

    /// Validates and builds the request.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::Configuration`] when a supplied verifier is
    /// invalid, the supplied `state` is empty, or an additional parameter
    /// uses a name the request writes itself.
    pub fn build(self) -> Result<AuthorizationRequest> {
        check_reserved(&self.additional_parameters)?;
        check_endpoint_query(
            self.configuration.authorization_endpoint(),
            &self.additional_parameters,
        )?;

        let state = match self.state {
            Some(state) if state.is_empty() => {
                return Err(OAuthError::Configuration("state must not be empty".to_string()))
            }
            Some(state) => state,
            None => codec::random_url_safe_string(),
        };

        let pkce = match self.pkce {
            PkceSetting::Generate => Some(PkceChallenge::generate()),
            PkceSetting::Verifier(verifier) => Some(PkceChallenge::from_verifier(&verifier)?),
            PkceSetting::Disabled => None,
        };

        let is_openid = self.scopes.iter().any(|s| s == SCOPE_OPENID);
        let nonce = match self.nonce {
            NonceSetting::Automatic if is_openid => Some(codec::random_url_safe_string()),
            NonceSetting::Automatic | NonceSetting::Disabled => None,
            NonceSetting::Fixed(nonce) => Some(nonce),
        };

        tracing::debug!(
            client_id = %self.client_id,
            scopes = ?self.scopes,
            pkce = pkce.is_some(),
            "built authorization request"
        );

        Ok(AuthorizationRequest {
            configuration: self.configuration,
            client_id: self.client_id,
            client_secret: self.client_secret,
            response_type: self.response_type,
            redirect_uri: self.redirect_uri,
            scopes: self.scopes,
            state,
            nonce,
            pkce,
            additional_parameters: self.additional_parameters,
        })
    }
}

fn check_reserved(parameters: &BTreeMap<String, String>) -> Result<()> {
    match parameters
        .keys()
        .find(|key| RESERVED_PARAMETERS.contains(&key.as_str()))
    {
        Some(key) => Err(OAuthError::Configuration(format!(
            "additional parameter '{key}' collides with a request parameter"
        ))),
        None => Ok(()),
    }
}

/// Rejects an endpoint whose own query already carries a parameter the
/// request would write.
fn check_endpoint_query(endpoint: &Url, parameters: &BTreeMap<String, String>) -> Result<()> {
    match endpoint.query_pairs().find(|(key, _)| {
        RESERVED_PARAMETERS.contains(&key.as_ref()) || parameters.contains_key(key.as_ref())
    }) {
        Some((key, _)) => Err(OAuthError::Configuration(format!(
            "authorization endpoint query already sets '{key}'"
        ))),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// AuthorizationResponse
// ---------------------------------------------------------------------------

/// A successful authorization response (RFC 6749 section 4.1.2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationResponse {
    request: AuthorizationRequest,
    authorization_code: String,
    state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
    #[serde(default)]
    raw: BTreeMap<String, String>,
}

impl AuthorizationResponse {
    /// Decodes the redirect that ended an authorization request.
    ///
    /// An `error` parameter takes precedence over everything else, including
    /// a `code` in the same redirect.  The `state` is not compared here; see
    /// [`Self::validate_state`].
    ///
    /// # Errors
    ///
    /// - [`OAuthError::OAuth`] for an authorization endpoint error.
    /// - [`OAuthError::AuthorizationResponseConstruction`] when `code` or
    ///   `state` is missing.
    pub fn from_redirect(request: AuthorizationRequest, url: &Url) -> Result<Self> {
        let raw = codec::redirect_parameters(url);

        if raw.contains_key(ERROR_FIELD) {
            let map: JsonMap = raw
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect();
            if let Some(error) = OAuthErrorResponse::from_json(OAuthEndpoint::Authorization, &map)
            {
                return Err(OAuthError::OAuth(error));
            }
        }

        let authorization_code = raw.get("code").cloned().ok_or_else(|| {
            OAuthError::AuthorizationResponseConstruction("missing code parameter".to_string())
        })?;
        let state = raw.get("state").cloned().ok_or_else(|| {
            OAuthError::AuthorizationResponseConstruction("missing state parameter".to_string())
        })?;

        Ok(Self {
            request,
            authorization_code,
            state,
            scope: raw.get("scope").cloned(),
            raw,
        })
    }

    /// Checks the echoed `state` against the request's.
    ///
    /// # Errors
    ///
    /// Returns an authorization endpoint
    /// [`ClientError`](crate::error::OAuthErrorCode::ClientError) on mismatch.
    pub fn validate_state(&self) -> Result<()> {
        if self.state == self.request.state {
            Ok(())
        } else {
            tracing::warn!("authorization response state does not match request");
            Err(OAuthError::state_mismatch())
        }
    }

    /// Builds the code exchange request for this response.
    ///
    /// The request's redirect URI, PKCE verifier, and client credentials are
    /// carried forward.
    pub fn token_exchange_request(&self) -> Result<TokenRequest> {
        let request = &self.request;
        let mut builder = TokenRequest::builder(
            request.configuration.clone(),
            GrantType::AuthorizationCode,
            request.client_id.clone(),
        )
        .authorization_code(self.authorization_code.clone())
        .redirect_uri(request.redirect_uri.clone());

        if let Some(secret) = &request.client_secret {
            builder = builder.client_secret(secret.clone());
        }
        if let Some(verifier) = request.code_verifier() {
            builder = builder.code_verifier(verifier);
        }
        builder.build()
    }

    /// The originating request.
    pub fn request(&self) -> &AuthorizationRequest {
        &self.request
    }

    /// The authorization code.
    pub fn authorization_code(&self) -> &str {
        &self.authorization_code
    }

    /// Echoed `state`.
    pub fn state(&self) -> &str {
        &self.state
    }

    /// Granted scope, when the server narrowed it.
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Every redirect parameter.
    pub fn raw(&self) -> &BTreeMap<String, String> {
        &self.raw
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
