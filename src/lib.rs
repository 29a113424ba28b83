//! oauthkit - OAuth 2.0 / OpenID Connect client library
//!
//! This library implements the client side of the authorization code flow
//! with PKCE for native applications: protocol message construction and
//! validation, interactive sessions through an external user agent, and a
//! long-lived auth state that keeps tokens fresh.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `error`: Error taxonomy, OAuth error codes, and result alias
//! - `codec`: Base64url, randomness, hashing, and form/query encoding
//! - `pkce`: Proof Key for Code Exchange (S256)
//! - `discovery`: OpenID Provider metadata and service configuration
//! - `authorization`, `token`, `registration`, `end_session`, `id_token`:
//!   protocol requests and responses
//! - `transport`: HTTP capability and its reqwest implementation
//! - `user_agent`: External user agent sessions and the loopback agent
//! - `service`: Endpoint calls and flow presentation
//! - `auth_state`: Token bookkeeping and coordinated refresh
//! - `store`: Keyring persistence of the auth state
//! - `config`, `logging`, `cli`, `commands`: the `oauthkit` binary
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use oauthkit::{AuthState, AuthorizationRequest, AuthorizationService, LoopbackUserAgent};
//! use url::Url;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let service = AuthorizationService::default();
//!     let issuer = Url::parse("https://accounts.example.com")?;
//!     let configuration = service.discover_for_issuer(&issuer).await?;
//!
//!     let agent = Arc::new(LoopbackUserAgent::bind(0, "/callback").await?);
//!     let request = AuthorizationRequest::builder(configuration, "my-app", agent.redirect_uri().clone())
//!         .scopes(["openid", "offline_access"])
//!         .build()?;
//!
//!     let (_session, completion) = service.present_authorization_request(request, agent).await?;
//!     let state = AuthState::exchange_authorization(service, completion).await?;
//!     println!("authorized: {}", state.is_authorized());
//!     Ok(())
//! }
//! ```

pub mod auth_state;
pub mod authorization;
pub mod cli;
pub mod codec;
pub mod commands;
pub mod config;
pub mod discovery;
pub mod end_session;
pub mod error;
pub mod id_token;
pub mod logging;
pub mod pkce;
pub mod registration;
pub mod service;
pub mod store;
pub mod token;
pub mod transport;
pub mod user_agent;

// Re-export commonly used types
pub use auth_state::{AuthState, AuthStateObserver, FreshTokens};
pub use authorization::{AuthorizationRequest, AuthorizationResponse};
pub use config::Config;
pub use discovery::{ServiceConfiguration, ServiceDiscovery};
pub use end_session::{EndSessionRequest, EndSessionResponse};
pub use error::{OAuthEndpoint, OAuthError, OAuthErrorCode, OAuthErrorResponse, Result};
pub use id_token::IdToken;
pub use registration::{RegistrationRequest, RegistrationResponse};
pub use service::AuthorizationService;
pub use store::KeyringStore;
pub use token::{GrantType, TokenRequest, TokenResponse};
pub use user_agent::{ExternalUserAgent, ExternalUserAgentSession, LoopbackUserAgent};
