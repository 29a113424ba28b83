//! Auth state persistence via the OS keyring
//!
//! [`KeyringStore`] keeps the serialized mapping of an [`AuthState`] in the
//! operating system's credential store (Keychain on macOS, Secret Service on
//! Linux, Credential Manager on Windows).  Each stored state is addressed by
//! an account name under the store's service name, so one application can
//! hold the grants of several providers.
//!
//! [`PersistingObserver`] wires a store to an [`AuthState`] so every change
//! is written back as it happens.

use std::sync::Arc;

use thiserror::Error;

use crate::auth_state::{AuthState, AuthStateObserver};
use crate::error::OAuthError;
use crate::service::AuthorizationService;

/// Default keyring service name.
pub const DEFAULT_SERVICE_NAME: &str = "oauthkit";

/// Errors from the credential store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The OS credential store rejected the operation.
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    /// The stored value is not valid JSON.
    #[error("Stored state is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The stored JSON is not an auth state, or the state could not be
    /// encoded.
    #[error("Stored state is invalid: {0}")]
    State(#[from] OAuthError),
}

// ---------------------------------------------------------------------------
// KeyringStore
// ---------------------------------------------------------------------------

/// Namespaced accessor for auth states in the OS keyring.
///
/// # Examples
///
/// ```no_run
/// use oauthkit::service::AuthorizationService;
/// use oauthkit::store::KeyringStore;
///
/// let store = KeyringStore::default();
/// match store.load("example-provider", AuthorizationService::default()).unwrap() {
///     Some(state) => println!("authorized: {}", state.is_authorized()),
///     None => println!("not logged in"),
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyringStore {
    service_name: String,
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE_NAME)
    }
}

impl KeyringStore {
    /// Creates a store under `service_name`.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    /// The keyring service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    fn entry(&self, account: &str) -> Result<keyring::Entry, StoreError> {
        Ok(keyring::Entry::new(&self.service_name, account)?)
    }

    /// Persists `state` under `account`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::State`] if the state cannot be serialized or
    /// [`StoreError::Keyring`] if the OS credential store rejects the write.
    pub fn save(&self, account: &str, state: &AuthState) -> Result<(), StoreError> {
        let mapping = state.to_mapping()?;
        let json_str = serde_json::to_string(&mapping)?;
        self.entry(account)?.set_password(&json_str)?;
        tracing::debug!(service = %self.service_name, account, "saved auth state");
        Ok(())
    }

    /// Loads the state stored under `account`.
    ///
    /// Returns `Ok(None)` when nothing has been saved, so callers can tell
    /// "not logged in" apart from a keyring failure.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Keyring`] for an unexpected keyring error, or
    /// [`StoreError::Serialization`] / [`StoreError::State`] when the stored
    /// value is malformed.
    pub fn load(
        &self,
        account: &str,
        service: AuthorizationService,
    ) -> Result<Option<AuthState>, StoreError> {
        match self.entry(account)?.get_password() {
            Ok(json_str) => {
                let mapping = serde_json::from_str(&json_str)?;
                Ok(Some(AuthState::from_mapping(mapping, service)?))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes the state stored under `account`.  Deleting a missing entry
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Keyring`] for an unexpected keyring error.
    pub fn delete(&self, account: &str) -> Result<(), StoreError> {
        match self.entry(account)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Creates an observer that saves the state under `account` whenever it
    /// changes.
    pub fn observer(&self, account: impl Into<String>) -> Arc<dyn AuthStateObserver> {
        Arc::new(PersistingObserver {
            store: self.clone(),
            account: account.into(),
        })
    }
}

// ---------------------------------------------------------------------------
// PersistingObserver
// ---------------------------------------------------------------------------

/// Writes an [`AuthState`] to a [`KeyringStore`] on every change.
///
/// Write failures are logged; they never reach the state's callers.
#[derive(Debug)]
pub struct PersistingObserver {
    store: KeyringStore,
    account: String,
}

impl AuthStateObserver for PersistingObserver {
    fn on_state_changed(&self, state: &AuthState) {
        if let Err(e) = self.store.save(&self.account, state) {
            tracing::warn!(account = %self.account, error = %e, "failed to persist auth state");
        }
    }

    fn on_authorization_error(&self, _state: &AuthState, error: &OAuthError) {
        tracing::warn!(
            account = %self.account,
            %error,
            "stored grant is no longer valid; log in again"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
