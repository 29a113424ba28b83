//! RP-initiated logout
//!
//! An [`EndSessionRequest`] is presented through the external user agent
//! exactly like an authorization request.  The provider redirects back to
//! `post_logout_redirect_uri` echoing `state`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::codec;
use crate::discovery::ServiceConfiguration;
use crate::error::{OAuthError, Result};
use crate::user_agent::UserAgentFlow;

/// An immutable end-session request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndSessionRequest {
    configuration: ServiceConfiguration,
    id_token_hint: String,
    post_logout_redirect_uri: Url,
    state: String,
    #[serde(default)]
    additional_parameters: BTreeMap<String, String>,
}

impl EndSessionRequest {
    /// Creates a request with a random `state`.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::Configuration`] when the configuration has no
    /// end-session endpoint.
    pub fn new(
        configuration: ServiceConfiguration,
        id_token_hint: impl Into<String>,
        post_logout_redirect_uri: Url,
    ) -> Result<Self> {
        if configuration.end_session_endpoint().is_none() {
            return Err(OAuthError::Configuration(
                "provider has no end_session_endpoint".to_string(),
            ));
        }
        Ok(Self {
            configuration,
            id_token_hint: id_token_hint.into(),
            post_logout_redirect_uri,
            state: codec::random_url_safe_string(),
            additional_parameters: BTreeMap::new(),
        })
    }

    /// Adds an extra query parameter.
    pub fn with_additional_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_parameters.insert(key.into(), value.into());
        self
    }

    /// The logout URL presented to the user.
    pub fn end_session_request_url(&self) -> Result<Url> {
        let mut url = self
            .configuration
            .end_session_endpoint()
            .cloned()
            .ok_or_else(|| {
                OAuthError::Configuration("provider has no end_session_endpoint".to_string())
            })?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("id_token_hint", &self.id_token_hint);
            query.append_pair(
                "post_logout_redirect_uri",
                self.post_logout_redirect_uri.as_str(),
            );
            query.append_pair("state", &self.state);
            for (key, value) in &self.additional_parameters {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// Provider configuration.
    pub fn configuration(&self) -> &ServiceConfiguration {
        &self.configuration
    }

    /// ID token identifying the session to end.
    pub fn id_token_hint(&self) -> &str {
        &self.id_token_hint
    }

    /// Where the provider returns after logout.
    pub fn post_logout_redirect_uri(&self) -> &Url {
        &self.post_logout_redirect_uri
    }

    /// `state` value.
    pub fn state(&self) -> &str {
        &self.state
    }
}

impl UserAgentFlow for EndSessionRequest {
    type Response = EndSessionResponse;

    fn external_url(&self) -> Result<Url> {
        self.end_session_request_url()
    }

    fn redirect_uri(&self) -> &Url {
        &self.post_logout_redirect_uri
    }

    fn parse_redirect(&self, url: &Url) -> Result<EndSessionResponse> {
        let response = EndSessionResponse::from_redirect(self.clone(), url)?;
        if response.state != self.state {
            return Err(OAuthError::state_mismatch());
        }
        Ok(response)
    }
}

/// The redirect that concludes an end-session request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndSessionResponse {
    request: EndSessionRequest,
    state: String,
    #[serde(default)]
    raw: BTreeMap<String, String>,
}

impl EndSessionResponse {
    /// Decodes the post-logout redirect.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::AuthorizationResponseConstruction`] when the
    /// redirect has no `state`.
    pub fn from_redirect(request: EndSessionRequest, url: &Url) -> Result<Self> {
        let raw = codec::redirect_parameters(url);
        let state = raw.get("state").cloned().ok_or_else(|| {
            OAuthError::AuthorizationResponseConstruction(
                "missing state parameter in end-session redirect".to_string(),
            )
        })?;
        Ok(Self {
            request,
            state,
            raw,
        })
    }

    /// The originating request.
    pub fn request(&self) -> &EndSessionRequest {
        &self.request
    }

    /// Echoed `state`.
    pub fn state(&self) -> &str {
        &self.state
    }

    /// Every redirect parameter.
    pub fn raw(&self) -> &BTreeMap<String, String> {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::tests::configuration;
    use crate::error::{OAuthEndpoint, OAuthErrorCode};

    fn logout_configuration() -> ServiceConfiguration {
        configuration().with_end_session_endpoint(Url::parse("https://auth.example.com/logout").unwrap())
    }

    fn post_logout() -> Url {
        Url::parse("http://127.0.0.1:8080/logged-out").unwrap()
    }

    #[test]
    fn test_end_session_url_contains_hint_and_state() {
        let request = EndSessionRequest::new(logout_configuration(), "idt", post_logout()).unwrap();
        let url = request.end_session_request_url().unwrap();
        let params = codec::parse_query(url.query().unwrap());
        assert_eq!(params["id_token_hint"], "idt");
        assert_eq!(params["post_logout_redirect_uri"], post_logout().as_str());
        assert_eq!(params["state"], request.state());
        assert_eq!(url.path(), "/logout");
    }

    #[test]
    fn test_missing_endpoint_is_configuration_error() {
        let err = EndSessionRequest::new(configuration(), "idt", post_logout()).unwrap_err();
        assert!(matches!(err, OAuthError::Configuration(_)));
    }

    #[test]
    fn test_redirect_with_matching_state_is_accepted() {
        let request = EndSessionRequest::new(logout_configuration(), "idt", post_logout()).unwrap();
        let mut url = post_logout();
        url.query_pairs_mut().append_pair("state", request.state());
        let response = request.parse_redirect(&url).unwrap();
        assert_eq!(response.state(), request.state());
    }

    #[test]
    fn test_redirect_with_other_state_is_client_error() {
        let request = EndSessionRequest::new(logout_configuration(), "idt", post_logout()).unwrap();
        let url = Url::parse("http://127.0.0.1:8080/logged-out?state=other").unwrap();
        let err = request.parse_redirect(&url).unwrap_err();
        assert!(err.is_oauth(OAuthEndpoint::Authorization, &OAuthErrorCode::ClientError));
    }
}
