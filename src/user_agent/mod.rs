//! External user agent capability and interactive flow sessions
//!
//! An interactive flow is handed to an [`ExternalUserAgent`] (a browser, a
//! system authentication sheet) and comes back as a redirect URI.  The
//! [`ExternalUserAgentSession`] in between guarantees that exactly one
//! outcome is delivered, whichever of redirect, user dismissal, or program
//! cancellation happens first.
//!
//! - [`session::ExternalUserAgentSession`] -- the state machine.
//! - [`loopback::LoopbackUserAgent`] -- opens the system browser and
//!   receives the redirect on a `127.0.0.1` listener.

use std::fmt;
use std::sync::Arc;

use url::Url;

use crate::error::Result;

pub mod loopback;
pub mod session;

pub use loopback::LoopbackUserAgent;
pub use session::{ExternalUserAgentSession, SessionCompletion, SessionState};

/// A request that is completed by a redirect through the external agent.
pub trait UserAgentFlow: Send + Sync + 'static {
    /// What a successful redirect decodes to.
    type Response: Send + 'static;

    /// The URL presented to the user.
    fn external_url(&self) -> Result<Url>;

    /// The redirect URI that ends the flow.
    fn redirect_uri(&self) -> &Url;

    /// Decodes and validates the redirect that ended the flow.
    fn parse_redirect(&self, url: &Url) -> Result<Self::Response>;
}

/// The channel from an external agent back into its session.
pub trait ResumableSession: Send + Sync {
    /// Delivers a redirect.
    ///
    /// Returns `Ok(false)` when `url` is not this session's redirect URI and
    /// the agent should keep waiting.
    fn resume(&self, url: &Url) -> Result<bool>;

    /// Reports that the user dismissed the agent.
    fn user_cancelled(&self);
}

/// The presentation capability of an external user agent.
#[async_trait::async_trait]
pub trait ExternalUserAgent: Send + Sync + fmt::Debug {
    /// Presents `url` to the user.
    ///
    /// The agent keeps `session` and later calls
    /// [`ResumableSession::resume`] with the redirect, or
    /// [`ResumableSession::user_cancelled`] on dismissal.
    ///
    /// # Errors
    ///
    /// Returns an error when the agent could not be launched.
    async fn present(&self, url: Url, session: Arc<dyn ResumableSession>) -> Result<()>;

    /// Tears down the presentation after a program cancellation.
    fn dismiss(&self);
}

/// Compares two URLs up to their query and fragment.
pub(crate) fn matches_redirect(redirect_uri: &Url, candidate: &Url) -> bool {
    redirect_uri.scheme() == candidate.scheme()
        && redirect_uri.host_str() == candidate.host_str()
        && redirect_uri.port_or_known_default() == candidate.port_or_known_default()
        && redirect_uri.path() == candidate.path()
}
