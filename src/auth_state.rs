//! Long-lived authorization state with coordinated token refresh
//!
//! [`AuthState`] holds the latest authorization, token, and registration
//! responses of one grant.  It answers "give me a usable access token" via
//! [`AuthState::fresh_tokens`], refreshing when the current token is missing
//! or about to expire.  Concurrent callers share a single refresh: the first
//! starts it, the rest queue behind it, and every caller receives the same
//! outcome in the order it asked.
//!
//! Errors are classified with [`OAuthError::is_terminal`]:
//!
//! - terminal errors (OAuth endpoint errors, ID token failures) invalidate
//!   the grant, clear the tokens, and reach
//!   [`AuthStateObserver::on_authorization_error`];
//! - transient errors are recorded as [`AuthState::last_error`] and leave
//!   the tokens untouched so the next call can retry.
//!
//! The state is persisted by its owner through [`AuthState::to_mapping`] and
//! restored with [`AuthState::from_mapping`].
//!
//! # Examples
//!
//! ```no_run
//! use chrono::Duration;
//! use oauthkit::auth_state::AuthState;
//!
//! # async fn example(state: AuthState) -> oauthkit::error::Result<()> {
//! let tokens = state.fresh_tokens(Duration::seconds(60)).await?;
//! println!("Authorization: Bearer {}", tokens.access_token);
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::authorization::AuthorizationResponse;
use crate::codec::JsonMap;
use crate::error::{OAuthError, Result};
use crate::registration::RegistrationResponse;
use crate::service::AuthorizationService;
use crate::token::{GrantType, TokenRequest, TokenResponse};
use crate::user_agent::SessionCompletion;

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// Receives change notifications from an [`AuthState`].
///
/// Observers are held weakly; drop the `Arc` to unsubscribe.  Callbacks run
/// outside the state's lock, so an observer may call back into the state.
pub trait AuthStateObserver: Send + Sync {
    /// The state changed and should be persisted.
    fn on_state_changed(&self, state: &AuthState);

    /// A terminal error invalidated the grant.  The user must authorize
    /// again.
    fn on_authorization_error(&self, state: &AuthState, error: &OAuthError);
}

/// Tokens handed to a caller of [`AuthState::fresh_tokens`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreshTokens {
    /// A valid access token.
    pub access_token: String,
    /// The current ID token, if any.
    pub id_token: Option<String>,
}

// ---------------------------------------------------------------------------
// Persisted fields
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_authorization_response: Option<AuthorizationResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_token_response: Option<TokenResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_registration_response: Option<RegistrationResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    authorization_error: Option<OAuthError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<OAuthError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
    #[serde(default)]
    needs_token_refresh: bool,
}

impl Snapshot {
    fn apply_authorization_response(&mut self, result: Result<AuthorizationResponse>) {
        let response = match result {
            Ok(response) => response,
            Err(e) => return self.apply_error(e),
        };
        if let Err(e) = response.validate_state() {
            return self.apply_authorization_error(e);
        }

        self.scope = response
            .scope()
            .map(str::to_string)
            .or_else(|| response.request().scope());
        self.last_authorization_response = Some(response);
        self.last_token_response = None;
        self.refresh_token = None;
        self.authorization_error = None;
        self.last_error = None;
        self.needs_token_refresh = false;
    }

    fn apply_token_response(&mut self, result: Result<TokenResponse>) {
        if let Some(previous) = self.authorization_error.take() {
            tracing::warn!(
                error = %previous,
                "token response applied to a state with an authorization error; \
                 update with a fresh authorization response first"
            );
        }

        let mut response = match result {
            Ok(response) => response,
            Err(e) => return self.apply_error(e),
        };

        let previous_id_token = self
            .last_token_response
            .as_ref()
            .and_then(|r| r.id_token().map(str::to_string));
        response.carry_forward_id_token(previous_id_token.as_deref());

        if let Some(refresh_token) = response.refresh_token() {
            self.refresh_token = Some(refresh_token.to_string());
        }
        if let Some(scope) = response.scope() {
            self.scope = Some(scope.to_string());
        }
        self.last_token_response = Some(response);
        self.last_error = None;
        self.needs_token_refresh = false;
    }

    fn apply_registration_response(&mut self, response: RegistrationResponse) {
        *self = Snapshot {
            last_registration_response: Some(response),
            ..Snapshot::default()
        };
    }

    fn apply_error(&mut self, error: OAuthError) {
        if error.is_terminal() {
            self.apply_authorization_error(error);
        } else {
            tracing::debug!(%error, "recording transient error");
            self.last_error = Some(error);
        }
    }

    fn apply_authorization_error(&mut self, error: OAuthError) {
        tracing::info!(%error, "authorization state invalidated");
        self.last_token_response = None;
        self.refresh_token = None;
        self.last_error = Some(error.clone());
        self.authorization_error = Some(error);
    }

    fn access_token(&self) -> Option<&str> {
        if self.authorization_error.is_some() {
            return None;
        }
        self.last_token_response.as_ref().map(TokenResponse::access_token)
    }

    fn id_token(&self) -> Option<&str> {
        if self.authorization_error.is_some() {
            return None;
        }
        self.last_token_response.as_ref().and_then(TokenResponse::id_token)
    }

    fn access_token_expires_at(&self) -> Option<DateTime<Utc>> {
        self.last_token_response.as_ref().and_then(TokenResponse::expires_at)
    }

    fn needs_refresh(&self, now: DateTime<Utc>, min_validity: Duration) -> bool {
        match &self.last_token_response {
            None => true,
            Some(response) => {
                self.needs_token_refresh || response.expires_within(now, min_validity)
            }
        }
    }

    fn fresh_tokens(&self) -> Result<FreshTokens> {
        if let Some(error) = &self.authorization_error {
            return Err(error.clone());
        }
        let access_token = self.access_token().ok_or_else(|| {
            OAuthError::TokenRefresh("no access token available".to_string())
        })?;
        Ok(FreshTokens {
            access_token: access_token.to_string(),
            id_token: self.id_token().map(str::to_string),
        })
    }

    fn is_authorized(&self, now: DateTime<Utc>) -> bool {
        if self.authorization_error.is_some() {
            return false;
        }
        let live_access_token = self
            .last_token_response
            .as_ref()
            .is_some_and(|r| !r.expires_within(now, Duration::zero()));
        live_access_token || self.refresh_token.is_some()
    }

    fn token_refresh_request(&self) -> Result<TokenRequest> {
        let refresh_token = self.refresh_token.as_deref().ok_or_else(|| {
            OAuthError::TokenRefresh("no refresh token available".to_string())
        })?;

        let (configuration, client_id, client_secret) =
            if let Some(authorization) = &self.last_authorization_response {
                let request = authorization.request();
                (
                    request.configuration().clone(),
                    request.client_id().to_string(),
                    request.client_secret().map(str::to_string),
                )
            } else if let Some(token) = &self.last_token_response {
                let request = token.request();
                (
                    request.configuration().clone(),
                    request.client_id().to_string(),
                    request.client_secret().map(str::to_string),
                )
            } else {
                return Err(OAuthError::TokenRefresh(
                    "no request to derive the refresh from".to_string(),
                ));
            };

        let mut builder = TokenRequest::builder(configuration, GrantType::RefreshToken, client_id)
            .refresh_token(refresh_token);
        if let Some(secret) = client_secret {
            builder = builder.client_secret(secret);
        }
        builder.build()
    }
}

// ---------------------------------------------------------------------------
// AuthState
// ---------------------------------------------------------------------------

type Waiter = oneshot::Sender<Result<FreshTokens>>;

/// Clears the in-flight flag and fails the waiters if a refresh task
/// unwinds before publishing its outcome.
struct RefreshGuard<'a> {
    state: &'a AuthState,
    armed: bool,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::error!("token refresh ended without an outcome");
        let waiters = {
            let mut inner = self.state.lock();
            inner.refresh_in_flight = false;
            std::mem::take(&mut inner.pending)
        };
        for waiter in waiters {
            let _ = waiter.send(Err(OAuthError::TokenRefresh(
                "token refresh ended without an outcome".to_string(),
            )));
        }
    }
}

#[derive(Default)]
struct Inner {
    snapshot: Snapshot,
    refresh_in_flight: bool,
    pending: VecDeque<Waiter>,
}

struct Shared {
    service: AuthorizationService,
    inner: Mutex<Inner>,
    observers: Mutex<Vec<Weak<dyn AuthStateObserver>>>,
}

/// The authorization state of one grant.
///
/// Cloning yields another handle to the same state.
#[derive(Clone)]
pub struct AuthState {
    shared: Arc<Shared>,
}

impl fmt::Debug for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("AuthState")
            .field("is_authorized", &inner.snapshot.is_authorized(Utc::now()))
            .field("scope", &inner.snapshot.scope)
            .field("refresh_in_flight", &inner.refresh_in_flight)
            .finish()
    }
}

impl PartialEq for AuthState {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.shared, &other.shared) {
            return true;
        }
        let mine = self.lock().snapshot.clone();
        let theirs = other.lock().snapshot.clone();
        mine == theirs
    }
}

impl AuthState {
    fn with_snapshot(service: AuthorizationService, snapshot: Snapshot) -> Self {
        Self {
            shared: Arc::new(Shared {
                service,
                inner: Mutex::new(Inner {
                    snapshot,
                    ..Inner::default()
                }),
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Creates an empty, unauthorized state.
    pub fn new(service: AuthorizationService) -> Self {
        Self::with_snapshot(service, Snapshot::default())
    }

    /// Creates a state from a completed authorization and, when the code
    /// was already exchanged, its token response.
    pub fn from_responses(
        service: AuthorizationService,
        authorization_response: AuthorizationResponse,
        token_response: Option<TokenResponse>,
    ) -> Self {
        let mut snapshot = Snapshot::default();
        snapshot.apply_authorization_response(Ok(authorization_response));
        if let Some(token_response) = token_response {
            snapshot.apply_token_response(Ok(token_response));
        }
        Self::with_snapshot(service, snapshot)
    }

    /// Creates a state holding only a client registration.
    pub fn from_registration(
        service: AuthorizationService,
        registration_response: RegistrationResponse,
    ) -> Self {
        let mut snapshot = Snapshot::default();
        snapshot.apply_registration_response(registration_response);
        Self::with_snapshot(service, snapshot)
    }

    /// Awaits an authorization session, exchanges its code, and builds the
    /// resulting state.
    ///
    /// # Errors
    ///
    /// Returns the session's error, or the error of the code exchange.
    pub async fn exchange_authorization(
        service: AuthorizationService,
        completion: SessionCompletion<AuthorizationResponse>,
    ) -> Result<Self> {
        let authorization_response = completion.await?;
        let token_request = authorization_response.token_exchange_request()?;
        let token_response = service
            .perform_token_request(&token_request, Some(&authorization_response))
            .await?;
        Ok(Self::from_responses(
            service,
            authorization_response,
            Some(token_response),
        ))
    }

    // -----------------------------------------------------------------------
    // Observers
    // -----------------------------------------------------------------------

    /// Registers an observer.  Only a weak reference is kept.
    pub fn add_observer(&self, observer: &Arc<dyn AuthStateObserver>) {
        self.observers().push(Arc::downgrade(observer));
    }

    fn live_observers(&self) -> Vec<Arc<dyn AuthStateObserver>> {
        let mut observers = self.observers();
        observers.retain(|weak| weak.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }

    // -----------------------------------------------------------------------
    // Updates
    // -----------------------------------------------------------------------

    /// Applies the outcome of an authorization flow.
    ///
    /// A response clears the previous tokens, since they belong to the
    /// previous grant.  A response whose `state` does not match its request
    /// invalidates the state.
    pub fn update_with_authorization_response(&self, result: Result<AuthorizationResponse>) {
        self.mutate(|inner| inner.snapshot.apply_authorization_response(result));
    }

    /// Applies the outcome of a token request.
    ///
    /// A refresh response that omits the refresh token or ID token keeps the
    /// previous ones.
    pub fn update_with_token_response(&self, result: Result<TokenResponse>) {
        self.mutate(|inner| inner.snapshot.apply_token_response(result));
    }

    /// Replaces the state with a new client registration.
    pub fn update_with_registration_response(&self, response: RegistrationResponse) {
        self.mutate(|inner| inner.snapshot.apply_registration_response(response));
    }

    /// Invalidates the grant.
    pub fn update_with_authorization_error(&self, error: OAuthError) {
        self.mutate(|inner| inner.snapshot.apply_authorization_error(error));
    }

    /// Forces the next [`Self::fresh_tokens`] call to refresh.
    pub fn set_needs_token_refresh(&self) {
        self.mutate(|inner| inner.snapshot.needs_token_refresh = true);
    }

    /// Runs `f` under the lock, then notifies observers of any change.
    fn mutate<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let (result, changed, new_error) = {
            let mut inner = self.lock();
            let before = inner.snapshot.clone();
            let result = f(&mut inner);
            let changed = inner.snapshot != before;
            let new_error = match (&before.authorization_error, &inner.snapshot.authorization_error)
            {
                (None, Some(error)) => Some(error.clone()),
                _ => None,
            };
            (result, changed, new_error)
        };

        if changed {
            for observer in self.live_observers() {
                observer.on_state_changed(self);
            }
        }
        if let Some(error) = new_error {
            for observer in self.live_observers() {
                observer.on_authorization_error(self, &error);
            }
        }
        result
    }

    // -----------------------------------------------------------------------
    // Fresh tokens
    // -----------------------------------------------------------------------

    /// Returns tokens valid for at least `min_validity`, refreshing first
    /// when needed.
    ///
    /// At most one refresh request is in flight at a time.  Callers that
    /// arrive while one is running wait for it and receive its outcome, in
    /// arrival order.  The refresh runs on its own task, so dropping the
    /// returned future does not abandon the other waiters.
    ///
    /// # Errors
    ///
    /// - The recorded authorization error, if the grant is invalid.
    /// - [`OAuthError::TokenRefresh`] when no refresh token is available.
    /// - The refresh request's error otherwise.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use oauthkit::transport::ReqwestTransport;
    /// use oauthkit::{AuthState, AuthorizationService, OAuthError};
    ///
    /// # tokio_test::block_on(async {
    /// let service = AuthorizationService::new(Arc::new(ReqwestTransport::new()));
    /// let state = AuthState::new(service);
    ///
    /// // Nothing to refresh with yet.
    /// let err = state.fresh_tokens(chrono::Duration::seconds(60)).await.unwrap_err();
    /// assert!(matches!(err, OAuthError::TokenRefresh(_)));
    /// # });
    /// ```
    pub async fn fresh_tokens(&self, min_validity: Duration) -> Result<FreshTokens> {
        let (receiver, refresh) = {
            let mut inner = self.lock();
            if let Some(error) = &inner.snapshot.authorization_error {
                return Err(error.clone());
            }
            if !inner.snapshot.needs_refresh(Utc::now(), min_validity) {
                return inner.snapshot.fresh_tokens();
            }

            let refresh = if inner.refresh_in_flight {
                None
            } else {
                let request = inner.snapshot.token_refresh_request()?;
                inner.refresh_in_flight = true;
                Some(request)
            };

            let (sender, receiver) = oneshot::channel();
            inner.pending.push_back(sender);
            (receiver, refresh)
        };

        if let Some(request) = refresh {
            tracing::debug!("starting token refresh");
            let state = self.clone();
            tokio::spawn(async move { state.run_refresh(request).await });
        } else {
            tracing::debug!("waiting for in-flight token refresh");
        }

        receiver.await.unwrap_or_else(|_| {
            Err(OAuthError::TokenRefresh(
                "refresh task ended without a result".to_string(),
            ))
        })
    }

    /// Calls `action` with fresh tokens, refreshing first when needed.
    ///
    /// See [`Self::fresh_tokens`].
    pub async fn with_fresh_tokens<F, R>(&self, min_validity: Duration, action: F) -> R
    where
        F: FnOnce(Result<FreshTokens>) -> R,
    {
        action(self.fresh_tokens(min_validity).await)
    }

    async fn run_refresh(self, request: TokenRequest) {
        let mut guard = RefreshGuard {
            state: &self,
            armed: true,
        };

        let result = self
            .shared
            .service
            .perform_token_request(&request, None)
            .await;

        match &result {
            Ok(_) => tracing::info!("token refresh succeeded"),
            Err(e) if e.is_terminal() => tracing::warn!(error = %e, "token refresh rejected"),
            Err(e) => tracing::warn!(error = %e, "token refresh failed, tokens kept"),
        }

        let failure = result.as_ref().err().cloned();
        let (waiters, outcome) = self.mutate(|inner| {
            inner.snapshot.apply_token_response(result);
            inner.refresh_in_flight = false;
            let outcome = match failure {
                Some(error) => Err(error),
                None => inner.snapshot.fresh_tokens(),
            };
            (std::mem::take(&mut inner.pending), outcome)
        });
        guard.armed = false;

        for waiter in waiters {
            // A waiter whose caller went away is skipped.
            let _ = waiter.send(outcome.clone());
        }
    }

    /// The refresh request the next refresh would send.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::TokenRefresh`] when there is no refresh token.
    pub fn token_refresh_request(&self) -> Result<TokenRequest> {
        self.lock().snapshot.token_refresh_request()
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// `true` when no authorization error is recorded and either an
    /// unexpired access token or a refresh token is held.
    pub fn is_authorized(&self) -> bool {
        self.lock().snapshot.is_authorized(Utc::now())
    }

    /// Current access token, possibly expired.
    pub fn access_token(&self) -> Option<String> {
        self.lock().snapshot.access_token().map(str::to_string)
    }

    /// Expiry of the current access token.
    pub fn access_token_expires_at(&self) -> Option<DateTime<Utc>> {
        self.lock().snapshot.access_token_expires_at()
    }

    /// Current ID token.
    pub fn id_token(&self) -> Option<String> {
        self.lock().snapshot.id_token().map(str::to_string)
    }

    /// Current refresh token.
    pub fn refresh_token(&self) -> Option<String> {
        self.lock().snapshot.refresh_token.clone()
    }

    /// Granted scope.
    pub fn scope(&self) -> Option<String> {
        self.lock().snapshot.scope.clone()
    }

    /// Whether the next fresh-token request is forced to refresh.
    pub fn needs_token_refresh(&self) -> bool {
        self.lock().snapshot.needs_token_refresh
    }

    /// Last authorization response.
    pub fn last_authorization_response(&self) -> Option<AuthorizationResponse> {
        self.lock().snapshot.last_authorization_response.clone()
    }

    /// Last token response.
    pub fn last_token_response(&self) -> Option<TokenResponse> {
        self.lock().snapshot.last_token_response.clone()
    }

    /// Last registration response.
    pub fn last_registration_response(&self) -> Option<RegistrationResponse> {
        self.lock().snapshot.last_registration_response.clone()
    }

    /// The terminal error that invalidated the grant.
    pub fn authorization_error(&self) -> Option<OAuthError> {
        self.lock().snapshot.authorization_error.clone()
    }

    /// The most recent error of any kind.
    pub fn last_error(&self) -> Option<OAuthError> {
        self.lock().snapshot.last_error.clone()
    }

    /// The service used for refreshes.
    pub fn service(&self) -> &AuthorizationService {
        &self.shared.service
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Serializes the state to a JSON mapping.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::JsonSerialization`] if a field cannot be
    /// encoded.
    pub fn to_mapping(&self) -> Result<JsonMap> {
        let snapshot = self.lock().snapshot.clone();
        match serde_json::to_value(&snapshot) {
            Ok(serde_json::Value::Object(map)) => Ok(map),
            Ok(_) => Err(OAuthError::JsonSerialization(
                "auth state did not serialize to an object".to_string(),
            )),
            Err(e) => Err(OAuthError::JsonSerialization(e.to_string())),
        }
    }

    /// Restores a state produced by [`Self::to_mapping`].
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::JsonDeserialization`] if the mapping is not a
    /// serialized auth state.
    pub fn from_mapping(mapping: JsonMap, service: AuthorizationService) -> Result<Self> {
        let snapshot: Snapshot = serde_json::from_value(serde_json::Value::Object(mapping))
            .map_err(|e| OAuthError::JsonDeserialization(e.to_string()))?;
        Ok(Self::with_snapshot(service, snapshot))
    }

    // -----------------------------------------------------------------------
    // Locks
    // -----------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every mutation completes before the guard drops; a panic in an
        // observer cannot leave the snapshot half-written.
        self.shared
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn observers(&self) -> MutexGuard<'_, Vec<Weak<dyn AuthStateObserver>>> {
        self.shared
            .observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use url::Url;

    use crate::authorization::tests::request;
    use crate::error::{OAuthEndpoint, OAuthErrorCode};
    use crate::transport::fake::FakeTransport;
    use crate::transport::TransportError;

    #[derive(Default)]
    struct CountingObserver {
        changes: AtomicUsize,
        errors: Mutex<Vec<OAuthError>>,
    }

    impl AuthStateObserver for CountingObserver {
        fn on_state_changed(&self, state: &AuthState) {
            // Re-entering the state from a callback must not deadlock.
            let _ = state.is_authorized();
            self.changes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_authorization_error(&self, _state: &AuthState, error: &OAuthError) {
            self.errors.lock().unwrap().push(error.clone());
        }
    }

    fn authorization_response(state: &str) -> AuthorizationResponse {
        let url = Url::parse(&format!(
            "http://127.0.0.1:8080/callback?code=abc&state={state}"
        ))
        .unwrap();
        AuthorizationResponse::from_redirect(request(), &url).unwrap()
    }

    fn token_response(body: serde_json::Value) -> TokenResponse {
        let token_request = authorization_response("state-1")
            .token_exchange_request()
            .unwrap();
        TokenResponse::from_json(token_request, body.to_string().as_bytes(), Utc::now()).unwrap()
    }

    fn authorized_state(fake: &Arc<FakeTransport>, expires_in: i64) -> AuthState {
        AuthState::from_responses(
            AuthorizationService::new(fake.clone()),
            authorization_response("state-1"),
            Some(token_response(json!({
                "access_token": "at-1",
                "token_type": "Bearer",
                "expires_in": expires_in,
                "refresh_token": "rt-1",
                "id_token": "header.payload.sig"
            }))),
        )
    }

    fn observe(state: &AuthState) -> Arc<CountingObserver> {
        let observer = Arc::new(CountingObserver::default());
        let dyn_observer: Arc<dyn AuthStateObserver> = observer.clone();
        state.add_observer(&dyn_observer);
        observer
    }

    #[test]
    fn test_from_responses_is_authorized() {
        let fake = Arc::new(FakeTransport::new());
        let state = authorized_state(&fake, 3600);
        assert!(state.is_authorized());
        assert_eq!(state.access_token().as_deref(), Some("at-1"));
        assert_eq!(state.refresh_token().as_deref(), Some("rt-1"));
        assert_eq!(state.scope().as_deref(), Some("openid profile"));
    }

    #[test]
    fn test_state_mismatch_never_authorizes() {
        let fake = Arc::new(FakeTransport::new());
        let state = AuthState::new(AuthorizationService::new(fake.clone()));
        let observer = observe(&state);

        state.update_with_authorization_response(Ok(authorization_response("forged")));

        assert!(!state.is_authorized());
        assert!(state
            .authorization_error()
            .unwrap()
            .is_oauth(OAuthEndpoint::Authorization, &OAuthErrorCode::ClientError));
        assert_eq!(observer.errors.lock().unwrap().len(), 1);
        assert_eq!(fake.request_count(), 0, "no token exchange attempted");
    }

    #[test]
    fn test_invalid_grant_clears_tokens() {
        let fake = Arc::new(FakeTransport::new());
        let state = authorized_state(&fake, 3600);
        let observer = observe(&state);

        let error = OAuthError::OAuth(
            crate::error::OAuthErrorResponse::from_json(
                OAuthEndpoint::Token,
                json!({"error": "invalid_grant"}).as_object().unwrap(),
            )
            .unwrap(),
        );
        state.update_with_token_response(Err(error.clone()));

        assert!(!state.is_authorized());
        assert!(state.access_token().is_none());
        assert!(state.refresh_token().is_none());
        assert_eq!(state.authorization_error(), Some(error.clone()));
        assert_eq!(observer.changes.load(Ordering::SeqCst), 1);
        assert_eq!(observer.errors.lock().unwrap().as_slice(), &[error]);
    }

    #[test]
    fn test_transient_error_keeps_tokens() {
        let fake = Arc::new(FakeTransport::new());
        let state = authorized_state(&fake, 3600);
        let observer = observe(&state);

        state.update_with_token_response(Err(OAuthError::Network("offline".to_string())));

        assert!(state.is_authorized());
        assert_eq!(state.access_token().as_deref(), Some("at-1"));
        assert!(matches!(state.last_error(), Some(OAuthError::Network(_))));
        assert!(state.authorization_error().is_none());
        assert!(observer.errors.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unchanged_update_does_not_notify() {
        let fake = Arc::new(FakeTransport::new());
        let state = authorized_state(&fake, 3600);
        let observer = observe(&state);

        let same = state.last_token_response().unwrap();
        state.update_with_token_response(Ok(same));

        assert_eq!(observer.changes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dropped_observer_is_not_called() {
        let fake = Arc::new(FakeTransport::new());
        let state = authorized_state(&fake, 3600);
        let observer = observe(&state);
        drop(observer);

        state.set_needs_token_refresh();
        assert!(state.needs_token_refresh());
        assert!(state.live_observers().is_empty());
    }

    #[test]
    fn test_registration_update_resets_state() {
        let fake = Arc::new(FakeTransport::new());
        let state = authorized_state(&fake, 3600);
        let config = crate::authorization::tests::configuration()
            .with_registration_endpoint(Url::parse("https://auth.example.com/register").unwrap());
        let registration_request = crate::registration::RegistrationRequest::builder(
            config,
            vec![crate::authorization::tests::redirect_uri()],
        )
        .build()
        .unwrap();
        let registration = RegistrationResponse::from_json(
            registration_request,
            br#"{"client_id":"registered"}"#,
        )
        .unwrap();

        state.update_with_registration_response(registration);

        assert!(!state.is_authorized());
        assert!(state.last_authorization_response().is_none());
        assert_eq!(
            state.last_registration_response().unwrap().client_id(),
            "registered"
        );
    }

    #[tokio::test]
    async fn test_fresh_tokens_without_refresh_when_valid() {
        let fake = Arc::new(FakeTransport::new());
        let state = authorized_state(&fake, 3600);

        let tokens = state.fresh_tokens(Duration::seconds(60)).await.unwrap();

        assert_eq!(tokens.access_token, "at-1");
        assert_eq!(fake.request_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_fresh_tokens_share_one_refresh() {
        let fake = Arc::new(FakeTransport::new().with_delay(std::time::Duration::from_millis(50)));
        fake.push_json(
            200,
            json!({"access_token": "at-2", "token_type": "Bearer", "expires_in": 3600}),
        );
        let state = authorized_state(&fake, 10);

        let calls = (0..5).map(|_| {
            let state = state.clone();
            tokio::spawn(async move { state.fresh_tokens(Duration::seconds(60)).await })
        });
        let results = futures::future::join_all(calls).await;

        assert_eq!(fake.request_count(), 1, "exactly one refresh request");
        for result in results {
            assert_eq!(result.unwrap().unwrap().access_token, "at-2");
        }
        assert_eq!(state.refresh_token().as_deref(), Some("rt-1"), "refresh token carried forward");
        assert_eq!(
            state.id_token().as_deref(),
            Some("header.payload.sig"),
            "id token carried forward"
        );

        let body = String::from_utf8(fake.requests()[0].body.clone().unwrap()).unwrap();
        assert!(body.starts_with("grant_type=refresh_token&refresh_token=rt-1"));
    }

    #[tokio::test]
    async fn test_refresh_rejection_is_terminal_for_all_waiters() {
        let fake = Arc::new(FakeTransport::new().with_delay(std::time::Duration::from_millis(20)));
        fake.push_json(400, json!({"error": "invalid_grant"}));
        let state = authorized_state(&fake, 0);
        let observer = observe(&state);

        let (a, b) = tokio::join!(
            state.fresh_tokens(Duration::seconds(60)),
            state.fresh_tokens(Duration::seconds(60))
        );

        for result in [a, b] {
            assert!(result
                .unwrap_err()
                .is_oauth(OAuthEndpoint::Token, &OAuthErrorCode::InvalidGrant));
        }
        assert_eq!(fake.request_count(), 1);
        assert!(!state.is_authorized());
        assert!(state.refresh_token().is_none());
        assert_eq!(observer.errors.lock().unwrap().len(), 1);

        let again = state.fresh_tokens(Duration::seconds(60)).await.unwrap_err();
        assert!(again.is_oauth(OAuthEndpoint::Token, &OAuthErrorCode::InvalidGrant));
        assert_eq!(fake.request_count(), 1, "no retry after a terminal error");
    }

    #[tokio::test]
    async fn test_transient_refresh_failure_keeps_tokens_and_allows_retry() {
        let fake = Arc::new(FakeTransport::new());
        fake.push(Err(TransportError::Connection("reset".to_string())));
        fake.push_json(
            200,
            json!({"access_token": "at-3", "token_type": "Bearer", "expires_in": 3600}),
        );
        let state = authorized_state(&fake, 0);

        let err = state.fresh_tokens(Duration::seconds(60)).await.unwrap_err();
        assert!(matches!(err, OAuthError::Network(_)));
        assert_eq!(state.refresh_token().as_deref(), Some("rt-1"));

        let tokens = state.fresh_tokens(Duration::seconds(60)).await.unwrap();
        assert_eq!(tokens.access_token, "at-3");
        assert!(state.last_error().is_none());
    }

    #[tokio::test]
    async fn test_out_of_range_expiry_fails_refresh_without_hanging() {
        let fake = Arc::new(FakeTransport::new().with_delay(std::time::Duration::from_millis(20)));
        fake.push_json(
            200,
            json!({"access_token": "at-2", "token_type": "Bearer", "expires_in": i64::MAX}),
        );
        fake.push_json(
            200,
            json!({"access_token": "at-3", "token_type": "Bearer", "expires_in": 3600}),
        );
        let state = authorized_state(&fake, 0);

        let (a, b) = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            tokio::join!(
                state.fresh_tokens(Duration::seconds(60)),
                state.fresh_tokens(Duration::seconds(60))
            )
        })
        .await
        .expect("waiters resolve");

        for result in [a, b] {
            assert!(matches!(
                result.unwrap_err(),
                OAuthError::TokenResponseConstruction(_)
            ));
        }
        assert_eq!(state.refresh_token().as_deref(), Some("rt-1"));

        let tokens = state.fresh_tokens(Duration::seconds(60)).await.unwrap();
        assert_eq!(tokens.access_token, "at-3");
        assert_eq!(fake.request_count(), 2);
    }

    #[derive(Debug, Default)]
    struct PanickingTransport {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl crate::transport::HttpTransport for PanickingTransport {
        async fn execute(
            &self,
            _request: crate::transport::HttpRequest,
        ) -> std::result::Result<crate::transport::HttpResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            panic!("transport failure");
        }
    }

    #[tokio::test]
    async fn test_refresh_task_panic_releases_waiters() {
        let fake = Arc::new(FakeTransport::new());
        let seed = authorized_state(&fake, 0);
        let mapping = seed.to_mapping().unwrap();

        let transport = Arc::new(PanickingTransport::default());
        let state =
            AuthState::from_mapping(mapping, AuthorizationService::new(transport.clone())).unwrap();

        let first = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            state.fresh_tokens(Duration::seconds(60)),
        )
        .await
        .expect("waiter resolves");
        assert!(matches!(first.unwrap_err(), OAuthError::TokenRefresh(_)));

        let second = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            state.fresh_tokens(Duration::seconds(60)),
        )
        .await
        .expect("waiter resolves");
        assert!(second.is_err());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2, "a new refresh was issued");
    }

    #[tokio::test]
    async fn test_needs_token_refresh_forces_refresh() {
        let fake = Arc::new(FakeTransport::new());
        fake.push_json(
            200,
            json!({"access_token": "at-4", "token_type": "Bearer", "refresh_token": "rt-4"}),
        );
        let state = authorized_state(&fake, 3600);
        state.set_needs_token_refresh();

        let seen = state
            .with_fresh_tokens(Duration::seconds(60), |result| result.map(|t| t.access_token))
            .await
            .unwrap();

        assert_eq!(seen, "at-4");
        assert_eq!(state.refresh_token().as_deref(), Some("rt-4"));
        assert!(!state.needs_token_refresh());
    }

    #[tokio::test]
    async fn test_fresh_tokens_without_refresh_token_fails() {
        let fake = Arc::new(FakeTransport::new());
        let state = AuthState::from_responses(
            AuthorizationService::new(fake.clone()),
            authorization_response("state-1"),
            None,
        );

        let err = state.fresh_tokens(Duration::seconds(60)).await.unwrap_err();
        assert!(matches!(err, OAuthError::TokenRefresh(_)));
        assert_eq!(fake.request_count(), 0);
    }

    #[test]
    fn test_mapping_round_trip_preserves_every_field() {
        let fake = Arc::new(FakeTransport::new());
        let state = authorized_state(&fake, 3600);
        state.update_with_token_response(Err(OAuthError::Server {
            status: 502,
            body: "bad gateway".to_string(),
        }));

        let mapping = state.to_mapping().unwrap();
        let restored =
            AuthState::from_mapping(mapping.clone(), AuthorizationService::new(fake.clone()))
                .unwrap();

        assert_eq!(restored, state);
        assert_eq!(restored.to_mapping().unwrap(), mapping);
        assert_eq!(restored.access_token_expires_at(), state.access_token_expires_at());
    }

    #[test]
    fn test_mapping_round_trip_of_errored_state_without_tokens() {
        let fake = Arc::new(FakeTransport::new());
        let state = AuthState::new(AuthorizationService::new(fake.clone()));
        state.update_with_authorization_error(OAuthError::IdTokenValidation("aud".to_string()));

        let restored = AuthState::from_mapping(
            state.to_mapping().unwrap(),
            AuthorizationService::new(fake.clone()),
        )
        .unwrap();

        assert_eq!(restored, state);
        assert!(!restored.is_authorized());
    }

    #[test]
    fn test_from_mapping_rejects_garbage() {
        let fake = Arc::new(FakeTransport::new());
        let mapping = json!({"last_token_response": 5}).as_object().unwrap().clone();
        let err = AuthState::from_mapping(mapping, AuthorizationService::new(fake)).unwrap_err();
        assert!(matches!(err, OAuthError::JsonDeserialization(_)));
    }
}
