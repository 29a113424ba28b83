//! The interactive flow session state machine
//!
//! ```text
//! Idle --start--> Started --resume--> Completed
//!                    |
//!                    +--cancel------> Cancelled
//! ```
//!
//! The first of `resume` and `cancel` to reach the session delivers the one
//! outcome; the other is discarded.  `cancel` on a finished session is a
//! no-op, while `resume` on a finished session is a contract violation and
//! is reported as [`OAuthError::SessionContract`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use url::Url;

use crate::error::{OAuthError, Result};
use crate::user_agent::{matches_redirect, ExternalUserAgent, ResumableSession, UserAgentFlow};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet presented.
    Idle,
    /// Presented, waiting for the redirect.
    Started,
    /// Finished by a redirect or a presentation failure.
    Completed,
    /// Finished by a cancellation.
    Cancelled,
}

struct SessionInner<T> {
    state: SessionState,
    sender: Option<oneshot::Sender<Result<T>>>,
    agent: Option<Arc<dyn ExternalUserAgent>>,
}

/// One interactive flow instance.
///
/// Created with [`ExternalUserAgentSession::new`], which also returns the
/// [`SessionCompletion`] that resolves to the flow's single outcome.
pub struct ExternalUserAgentSession<F: UserAgentFlow> {
    flow: F,
    completed: AtomicBool,
    inner: Mutex<SessionInner<F::Response>>,
}

impl<F: UserAgentFlow> fmt::Debug for ExternalUserAgentSession<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalUserAgentSession")
            .field("redirect_uri", &self.flow.redirect_uri().as_str())
            .field("state", &self.state())
            .finish()
    }
}

impl<F: UserAgentFlow> ExternalUserAgentSession<F> {
    /// Creates an idle session for `flow`.
    pub fn new(flow: F) -> (Arc<Self>, SessionCompletion<F::Response>) {
        let (sender, receiver) = oneshot::channel();
        let session = Arc::new(Self {
            flow,
            completed: AtomicBool::new(false),
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                sender: Some(sender),
                agent: None,
            }),
        });
        (session, SessionCompletion { receiver })
    }

    /// The flow this session drives.
    pub fn flow(&self) -> &F {
        &self.flow
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Presents the flow through `agent`.
    ///
    /// A presentation failure does not fail this call; it completes the
    /// session with [`OAuthError::AgentPresentation`].
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::SessionContract`] unless the session is idle.
    pub async fn start(self: &Arc<Self>, agent: Arc<dyn ExternalUserAgent>) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.state != SessionState::Idle {
                let state = inner.state;
                drop(inner);
                tracing::error!(?state, "start called on a session that is not idle");
                return Err(OAuthError::SessionContract(format!(
                    "start called on a {state:?} session"
                )));
            }
            inner.state = SessionState::Started;
            inner.agent = Some(Arc::clone(&agent));
        }

        let url = match self.flow.external_url() {
            Ok(url) => url,
            Err(e) => {
                self.finish(Err(e), SessionState::Completed, false);
                return Ok(());
            }
        };

        tracing::info!(redirect_uri = %self.flow.redirect_uri(), "presenting external user agent");
        let session: Arc<dyn ResumableSession> = Arc::clone(self) as Arc<dyn ResumableSession>;
        if let Err(e) = agent.present(url, session).await {
            let error = match e {
                OAuthError::AgentPresentation(_) => e,
                other => OAuthError::AgentPresentation(other.to_string()),
            };
            self.finish(Err(error), SessionState::Completed, false);
        }
        Ok(())
    }

    /// Cancels the flow on behalf of the program.
    ///
    /// Delivers [`OAuthError::ProgramCanceled`] and dismisses the agent.  A
    /// no-op once the session has finished.
    pub fn cancel(&self) {
        if self.finish(Err(OAuthError::ProgramCanceled), SessionState::Cancelled, true) {
            tracing::info!("session cancelled by program");
        }
    }

    /// Delivers `outcome` unless another outcome won the race.  Returns
    /// whether this call delivered.
    fn finish(&self, outcome: Result<F::Response>, state: SessionState, dismiss: bool) -> bool {
        if self
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let (sender, agent) = {
            let mut inner = self.lock();
            inner.state = state;
            (inner.sender.take(), inner.agent.take())
        };

        if dismiss {
            if let Some(agent) = agent {
                agent.dismiss();
            }
        }
        if let Some(sender) = sender {
            // The receiver may already be gone; the outcome is then unobserved.
            let _ = sender.send(outcome);
        }
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner<F::Response>> {
        // A poisoned lock only means a panic elsewhere; the state is still
        // consistent because every write is a single assignment.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<F: UserAgentFlow> ResumableSession for ExternalUserAgentSession<F> {
    fn resume(&self, url: &Url) -> Result<bool> {
        if !matches_redirect(self.flow.redirect_uri(), url) {
            tracing::debug!(%url, "ignoring URL that is not this session's redirect");
            return Ok(false);
        }

        let state = self.state();
        if state != SessionState::Started {
            tracing::error!(?state, "resume called on a session that is not started");
            return Err(OAuthError::SessionContract(format!(
                "resume called on a {state:?} session"
            )));
        }

        let outcome = self.flow.parse_redirect(url);
        if !self.finish(outcome, SessionState::Completed, false) {
            tracing::error!("resume lost the race against another completion");
            return Err(OAuthError::SessionContract(
                "resume called on a finished session".to_string(),
            ));
        }
        tracing::info!("session completed by redirect");
        Ok(true)
    }

    fn user_cancelled(&self) {
        if self.finish(Err(OAuthError::UserCanceled), SessionState::Cancelled, false) {
            tracing::info!("session cancelled by user");
        }
    }
}

// ---------------------------------------------------------------------------
// SessionCompletion
// ---------------------------------------------------------------------------

/// Resolves to the single outcome of a session.
///
/// If the session is dropped without finishing, the outcome is
/// [`OAuthError::ProgramCanceled`].
#[derive(Debug)]
pub struct SessionCompletion<T> {
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> Future for SessionCompletion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(OAuthError::ProgramCanceled)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
