//! Loopback redirect agent for native apps and CLIs (RFC 8252 section 7.3)
//!
//! [`LoopbackUserAgent`] binds a listener on `127.0.0.1`, opens the system
//! browser at the presented URL, and resumes the session with whichever
//! request arrives on the redirect path.

use std::fmt;
use std::sync::{Arc, Mutex};

use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use url::Url;

use crate::error::{OAuthError, Result};
use crate::user_agent::{ExternalUserAgent, ResumableSession};

const SUCCESS_PAGE: &str = "Authorization complete. You may close this tab.";

/// Upper bound on a redirect request's line and headers.
const MAX_REQUEST_HEAD_BYTES: u64 = 16 * 1024;

/// How long a connection may stay open before sending its request.
const REQUEST_HEAD_TIMEOUT: Duration = Duration::from_secs(120);

/// External user agent that receives the redirect on a loopback listener.
///
/// # Examples
///
/// ```no_run
/// use oauthkit::user_agent::LoopbackUserAgent;
///
/// # async fn example() -> oauthkit::error::Result<()> {
/// let agent = LoopbackUserAgent::bind(0, "/callback").await?;
/// println!("redirect to {}", agent.redirect_uri());
/// # Ok(())
/// # }
/// ```
pub struct LoopbackUserAgent {
    listener: Mutex<Option<TcpListener>>,
    redirect_uri: Url,
    open_browser: bool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for LoopbackUserAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackUserAgent")
            .field("redirect_uri", &self.redirect_uri.as_str())
            .field("open_browser", &self.open_browser)
            .finish()
    }
}

impl LoopbackUserAgent {
    /// Binds the redirect listener.
    ///
    /// # Arguments
    ///
    /// * `port` - Port on `127.0.0.1`; `0` picks a free one.
    /// * `path` - Redirect path, such as `/callback`.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::AgentPresentation`] if the port cannot be bound.
    pub async fn bind(port: u16, path: &str) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| {
                OAuthError::AgentPresentation(format!("failed to bind redirect listener: {e}"))
            })?;
        let local_addr = listener.local_addr().map_err(|e| {
            OAuthError::AgentPresentation(format!("failed to get local address: {e}"))
        })?;

        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        let redirect_uri = Url::parse(&format!("http://127.0.0.1:{}{path}", local_addr.port()))
            .map_err(|e| OAuthError::Configuration(format!("invalid redirect path: {e}")))?;

        Ok(Self {
            listener: Mutex::new(Some(listener)),
            redirect_uri,
            open_browser: true,
            task: Mutex::new(None),
        })
    }

    /// Does not launch a browser; the URL is only printed.
    pub fn without_browser(mut self) -> Self {
        self.open_browser = false;
        self
    }

    /// The redirect URI to register and send with the request.
    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    /// Attempts to open the URL in the user's default browser.
    ///
    /// Errors are ignored; the user can copy the URL from stderr.
    fn try_open_browser(url: &Url) {
        #[cfg(target_os = "macos")]
        {
            let _ = std::process::Command::new("open").arg(url.as_str()).spawn();
        }
        #[cfg(target_os = "linux")]
        {
            let _ = std::process::Command::new("xdg-open")
                .arg(url.as_str())
                .spawn();
        }
        #[cfg(target_os = "windows")]
        {
            let _ = std::process::Command::new("cmd")
                .args(["/C", "start", "", url.as_str()])
                .spawn();
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            let _ = url;
        }
    }
}

#[async_trait::async_trait]
impl ExternalUserAgent for LoopbackUserAgent {
    async fn present(&self, url: Url, session: Arc<dyn ResumableSession>) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| {
                OAuthError::AgentPresentation("loopback agent already presented".to_string())
            })?;

        eprintln!("Open the following URL in your browser to continue:\n{url}");
        if self.open_browser {
            Self::try_open_browser(&url);
        }

        let origin = self.redirect_uri.clone();
        let handle = tokio::spawn(accept_redirects(listener, origin, session));
        *self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
        Ok(())
    }

    fn dismiss(&self) {
        if let Some(handle) = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

/// Serves connections until one of them finishes the session.
///
/// Each connection is handled on its own task, so a socket the browser
/// opens early and leaves idle does not hold up the redirect.
async fn accept_redirects(listener: TcpListener, origin: Url, session: Arc<dyn ResumableSession>) {
    let finished = Arc::new(Notify::new());
    loop {
        let stream = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _peer)) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to accept redirect connection");
                    continue;
                }
            },
            _ = finished.notified() => break,
        };

        let origin = origin.clone();
        let session = session.clone();
        let finished = finished.clone();
        tokio::spawn(async move {
            match handle_connection(stream, &origin, session.as_ref()).await {
                Ok(true) => finished.notify_one(),
                Ok(false) => {}
                Err(e) => tracing::debug!(error = %e, "redirect connection dropped"),
            }
        });
    }
}

/// Reads one request, resumes the session with its target, and answers the
/// browser.  Returns `true` once the session is finished.
async fn handle_connection(
    stream: TcpStream,
    origin: &Url,
    session: &dyn ResumableSession,
) -> std::io::Result<bool> {
    let mut reader = BufReader::new(stream.take(MAX_REQUEST_HEAD_BYTES));

    let request_line = tokio::time::timeout(REQUEST_HEAD_TIMEOUT, read_request_head(&mut reader))
        .await
        .map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::TimedOut, "request head not received")
        })??;

    let target = request_line.split_whitespace().nth(1).unwrap_or("/");
    let (status, body, finished) = match origin.join(target) {
        Ok(url) => match session.resume(&url) {
            Ok(true) => ("200 OK", SUCCESS_PAGE.to_string(), true),
            Ok(false) => ("404 Not Found", "Not found.".to_string(), false),
            Err(e) => ("400 Bad Request", format!("Authorization failed: {e}"), true),
        },
        Err(_) => ("400 Bad Request", "Malformed request.".to_string(), false),
    };

    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let mut stream = reader.into_inner().into_inner();
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(finished)
}

/// Returns the request line, e.g. `GET /callback?code=...&state=... HTTP/1.1`,
/// after consuming the headers.
async fn read_request_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<String> {
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    loop {
        let mut header = String::new();
        let read = reader.read_line(&mut header).await?;
        if read == 0 || header.trim_end().is_empty() {
            break;
        }
    }
    Ok(request_line)
}
