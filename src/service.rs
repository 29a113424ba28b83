//! Authorization service: discovery, flow presentation, and endpoint calls
//!
//! [`AuthorizationService`] turns requests into HTTP exchanges over an
//! injected [`HttpTransport`] and turns the outcomes into typed responses or
//! errors:
//!
//! - transport failures become [`OAuthError::Network`];
//! - a status of 400 or above with an OAuth `error` body becomes
//!   [`OAuthError::OAuth`] for the endpoint in question;
//! - any other non-2xx status becomes [`OAuthError::Server`];
//! - a 2xx with a malformed body becomes the endpoint's construction error.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use url::Url;
//! use oauthkit::service::AuthorizationService;
//! use oauthkit::transport::ReqwestTransport;
//!
//! # async fn example() -> oauthkit::error::Result<()> {
//! let service = AuthorizationService::new(Arc::new(ReqwestTransport::new()));
//! let issuer = Url::parse("https://accounts.example.com").unwrap();
//! let configuration = service.discover_for_issuer(&issuer).await?;
//! println!("token endpoint: {}", configuration.token_endpoint());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use chrono::Utc;
use url::Url;

use crate::authorization::{AuthorizationRequest, AuthorizationResponse};
use crate::codec;
use crate::discovery::{discovery_url_for_issuer, ServiceConfiguration, ServiceDiscovery};
use crate::end_session::EndSessionRequest;
use crate::error::{OAuthEndpoint, OAuthError, OAuthErrorResponse, Result};
use crate::id_token::IdToken;
use crate::registration::{RegistrationRequest, RegistrationResponse};
use crate::token::{TokenRequest, TokenResponse};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
use crate::user_agent::{
    ExternalUserAgent, ExternalUserAgentSession, SessionCompletion, UserAgentFlow,
};

/// A started interactive flow: the session, for resume and cancel, and the
/// future of its outcome.
pub type PresentedFlow<F> = (
    Arc<ExternalUserAgentSession<F>>,
    SessionCompletion<<F as UserAgentFlow>::Response>,
);

/// Orchestrates protocol exchanges with one transport.
#[derive(Debug, Clone)]
pub struct AuthorizationService {
    transport: Arc<dyn HttpTransport>,
}

impl Default for AuthorizationService {
    fn default() -> Self {
        Self::new(Arc::new(ReqwestTransport::new()))
    }
}

impl AuthorizationService {
    /// Creates a service over `transport`.
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    /// The injected transport.
    pub fn transport(&self) -> &Arc<dyn HttpTransport> {
        &self.transport
    }

    /// Fetches `{issuer}/.well-known/openid-configuration` and builds the
    /// configuration from it.
    ///
    /// # Errors
    ///
    /// See [`Self::discover`].
    pub async fn discover_for_issuer(&self, issuer: &Url) -> Result<ServiceConfiguration> {
        self.discover(&discovery_url_for_issuer(issuer)).await
    }

    /// Fetches a discovery document and builds the configuration from it.
    ///
    /// # Errors
    ///
    /// - [`OAuthError::Network`] when the document cannot be fetched.
    /// - [`OAuthError::Server`] for a non-2xx status.
    /// - [`OAuthError::InvalidDiscoveryDocument`] when the document lacks a
    ///   required endpoint or is not JSON.
    pub async fn discover(&self, discovery_url: &Url) -> Result<ServiceConfiguration> {
        tracing::debug!(url = %discovery_url, "fetching discovery document");
        let response = self
            .transport
            .execute(HttpRequest::get(discovery_url.clone()))
            .await?;

        if !response.is_success() {
            return Err(OAuthError::Server {
                status: response.status,
                body: response.text(),
            });
        }

        let discovery = ServiceDiscovery::from_slice(&response.body)?;
        tracing::info!(
            issuer = discovery.issuer.as_ref().map(Url::as_str).unwrap_or("<none>"),
            "discovered provider configuration"
        );
        Ok(ServiceConfiguration::from_discovery(discovery))
    }

    /// Starts an authorization request through `agent`.
    ///
    /// The returned completion resolves to the state-checked response, or to
    /// the authorization endpoint error, cancellation, or presentation
    /// failure that ended the flow.
    pub async fn present_authorization_request(
        &self,
        request: AuthorizationRequest,
        agent: Arc<dyn ExternalUserAgent>,
    ) -> Result<PresentedFlow<AuthorizationRequest>> {
        present(request, agent).await
    }

    /// Starts an end-session (logout) request through `agent`.
    pub async fn present_end_session_request(
        &self,
        request: EndSessionRequest,
        agent: Arc<dyn ExternalUserAgent>,
    ) -> Result<PresentedFlow<EndSessionRequest>> {
        present(request, agent).await
    }

    /// Performs a token request.
    ///
    /// When the response carries an ID token it is decoded and validated
    /// against the configuration's issuer, the request's client id, and the
    /// nonce of `authorization_response`'s request, if given.
    ///
    /// # Errors
    ///
    /// - [`OAuthError::Network`] / [`OAuthError::Server`] for HTTP failures.
    /// - [`OAuthError::OAuth`] for a token endpoint error.
    /// - [`OAuthError::TokenResponseConstruction`] for a malformed 2xx body.
    /// - [`OAuthError::IdTokenParsing`] / [`OAuthError::IdTokenValidation`]
    ///   for a bad ID token.
    pub async fn perform_token_request(
        &self,
        request: &TokenRequest,
        authorization_response: Option<&AuthorizationResponse>,
    ) -> Result<TokenResponse> {
        tracing::debug!(grant_type = %request.grant_type(), "performing token request");
        let response = self.transport.execute(request.http_request()).await?;
        let received_at = Utc::now();
        check_status(&response, OAuthEndpoint::Token)?;

        let token_response = TokenResponse::from_json(request.clone(), &response.body, received_at)?;

        if let Some(raw) = token_response.id_token() {
            let id_token = IdToken::parse(raw)?;
            let issuer = request.configuration().issuer().ok_or_else(|| {
                OAuthError::IdTokenValidation(
                    "configuration has no issuer to validate against".to_string(),
                )
            })?;
            let nonce = authorization_response.and_then(|r| r.request().nonce());
            id_token.validate(issuer, request.client_id(), nonce, Utc::now())?;
        }

        tracing::info!(grant_type = %request.grant_type(), "token request succeeded");
        Ok(token_response)
    }

    /// Performs a dynamic client registration.
    ///
    /// # Errors
    ///
    /// - [`OAuthError::Configuration`] when the provider has no registration
    ///   endpoint.
    /// - [`OAuthError::Network`] / [`OAuthError::Server`] for HTTP failures.
    /// - [`OAuthError::OAuth`] for a registration endpoint error.
    /// - [`OAuthError::RegistrationResponseConstruction`] for a malformed
    ///   2xx body.
    pub async fn perform_registration_request(
        &self,
        request: &RegistrationRequest,
    ) -> Result<RegistrationResponse> {
        let response = self.transport.execute(request.http_request()?).await?;
        check_status(&response, OAuthEndpoint::Registration)?;

        let registration = RegistrationResponse::from_json(request.clone(), &response.body)?;
        tracing::info!(client_id = registration.client_id(), "client registered");
        Ok(registration)
    }
}

async fn present<F: UserAgentFlow>(flow: F, agent: Arc<dyn ExternalUserAgent>) -> Result<PresentedFlow<F>> {
    let (session, completion) = ExternalUserAgentSession::new(flow);
    session.start(agent).await?;
    Ok((session, completion))
}

/// Maps a non-2xx response to an error.
fn check_status(response: &HttpResponse, endpoint: OAuthEndpoint) -> Result<()> {
    if response.is_success() {
        return Ok(());
    }

    if response.status >= 400 {
        if let Ok(map) = codec::decode_json_object(&response.body) {
            if let Some(error) = OAuthErrorResponse::from_json(endpoint, &map) {
                tracing::warn!(%endpoint, code = %error.code, "endpoint returned OAuth error");
                return Err(OAuthError::OAuth(error));
            }
        }
    }

    tracing::warn!(%endpoint, status = response.status, "endpoint returned HTTP failure");
    Err(OAuthError::Server {
        status: response.status,
        body: response.text(),
    })
}
