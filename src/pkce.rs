//! PKCE S256 challenge generation and verification
//!
//! This module implements the Proof Key for Code Exchange (PKCE) extension
//! to OAuth 2.0 as defined in RFC 7636, using the `S256` challenge method.
//!
//! # How PKCE works
//!
//! 1. The client generates a high-entropy random string called the `code_verifier`.
//! 2. The client computes a SHA-256 hash of the verifier and base64url-encodes
//!    it to produce the `code_challenge`.
//! 3. The authorization request includes `code_challenge` and
//!    `code_challenge_method=S256`.
//! 4. The token exchange request includes the original `code_verifier`.
//! 5. The authorization server recomputes the challenge and compares it to
//!    the value sent in step 3, proving possession of the verifier.
//!
//! # References
//!
//! - RFC 7636 <https://www.rfc-editor.org/rfc/rfc7636>

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::discovery::ServiceDiscovery;
use crate::error::{OAuthError, Result};

/// The only challenge method this crate produces.
pub const S256: &str = "S256";

/// Minimum `code_verifier` length (RFC 7636 section 4.1).
pub const MIN_VERIFIER_LENGTH: usize = 43;

/// Maximum `code_verifier` length (RFC 7636 section 4.1).
pub const MAX_VERIFIER_LENGTH: usize = 128;

// ---------------------------------------------------------------------------
// PkceChallenge
// ---------------------------------------------------------------------------

/// A PKCE S256 challenge pair consisting of a verifier and its derived
/// challenge value.
///
/// The verifier stays on the client; the challenge and method travel on the
/// authorization URL.
///
/// # Examples
///
/// ```
/// use oauthkit::pkce::PkceChallenge;
///
/// let pkce = PkceChallenge::generate();
/// assert_eq!(pkce.method, "S256");
/// assert_eq!(pkce.verifier.len(), 43);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkceChallenge {
    /// The code verifier, 43 to 128 characters from the RFC 7636 unreserved
    /// set.
    pub verifier: String,

    /// base64url (no padding) of the SHA-256 digest of [`Self::verifier`].
    pub challenge: String,

    /// The challenge method.  Always `"S256"`.
    pub method: String,
}

impl PkceChallenge {
    /// Generates a fresh challenge from 32 random bytes.
    pub fn generate() -> Self {
        let verifier = codec::random_url_safe_string();
        let challenge = challenge_for(&verifier);
        Self {
            verifier,
            challenge,
            method: S256.to_string(),
        }
    }

    /// Builds a challenge from a caller-supplied verifier.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::Configuration`] when the verifier is shorter
    /// than 43 or longer than 128 characters, or contains a character
    /// outside `[A-Za-z0-9-._~]`.
    ///
    /// # Examples
    ///
    /// ```
    /// use oauthkit::pkce::PkceChallenge;
    ///
    /// assert!(PkceChallenge::from_verifier(&"a".repeat(43)).is_ok());
    /// assert!(PkceChallenge::from_verifier(&"a".repeat(42)).is_err());
    /// ```
    pub fn from_verifier(verifier: &str) -> Result<Self> {
        validate_verifier(verifier)?;
        Ok(Self {
            verifier: verifier.to_string(),
            challenge: challenge_for(verifier),
            method: S256.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Public functions
// ---------------------------------------------------------------------------

/// Computes `base64url(sha256(verifier))` (RFC 7636 section 4.2).
pub fn challenge_for(verifier: &str) -> String {
    codec::base64url_encode(codec::sha256(verifier.as_bytes()))
}

/// Checks a verifier against the RFC 7636 length and character rules.
pub fn validate_verifier(verifier: &str) -> Result<()> {
    let len = verifier.len();
    if !(MIN_VERIFIER_LENGTH..=MAX_VERIFIER_LENGTH).contains(&len) {
        return Err(OAuthError::Configuration(format!(
            "code_verifier must be {MIN_VERIFIER_LENGTH}-{MAX_VERIFIER_LENGTH} characters, got {len}"
        )));
    }

    let unreserved = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~');
    if !verifier.chars().all(unreserved) {
        return Err(OAuthError::Configuration(
            "code_verifier contains characters outside the unreserved set".to_string(),
        ));
    }

    Ok(())
}

/// Verifies that the provider advertises the PKCE `S256` method.
///
/// # Errors
///
/// Returns [`OAuthError::Configuration`] when `S256` is absent from
/// `code_challenge_methods_supported` or the field is missing entirely.
pub fn verify_s256_support(discovery: &ServiceDiscovery) -> Result<()> {
    let supported = discovery
        .code_challenge_methods_supported
        .as_deref()
        .unwrap_or(&[]);

    if supported.iter().any(|m| m == S256) {
        Ok(())
    } else {
        Err(OAuthError::Configuration(
            "PKCE S256 not supported by authorization server".to_string(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generate_produces_correct_verifier_length() {
        let pkce = PkceChallenge::generate();
        assert_eq!(
            pkce.verifier.len(),
            43,
            "32 random bytes in base64url without padding produces 43 chars"
        );
    }

    #[test]
    fn test_challenge_is_s256_of_verifier() {
        let pkce = PkceChallenge::generate();
        assert_eq!(pkce.challenge, challenge_for(&pkce.verifier));
        assert_eq!(pkce.method, "S256");
    }

    #[test]
    fn test_generate_produces_unique_verifiers() {
        let a = PkceChallenge::generate();
        let b = PkceChallenge::generate();
        assert_ne!(a.verifier, b.verifier);
        assert_ne!(a.challenge, b.challenge);
    }

    #[test]
    fn test_verifier_length_boundaries() {
        assert!(PkceChallenge::from_verifier(&"a".repeat(42)).is_err());
        assert!(PkceChallenge::from_verifier(&"a".repeat(43)).is_ok());
        assert!(PkceChallenge::from_verifier(&"a".repeat(128)).is_ok());
        assert!(PkceChallenge::from_verifier(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_verifier_rejects_reserved_characters() {
        let verifier = format!("{}+", "a".repeat(50));
        let err = PkceChallenge::from_verifier(&verifier).unwrap_err();
        assert!(matches!(err, OAuthError::Configuration(_)));
    }

    #[test]
    fn test_verifier_accepts_full_unreserved_set() {
        let verifier = format!("{}-._~", "Az09".repeat(10));
        assert!(PkceChallenge::from_verifier(&verifier).is_ok());
    }

    /// RFC 7636 Appendix B test vector.
    #[test]
    fn test_s256_known_answer_rfc7636_appendix_b() {
        let pkce =
            PkceChallenge::from_verifier("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk").unwrap();
        assert_eq!(
            pkce.challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM",
            "S256 challenge must match RFC 7636 Appendix B test vector"
        );
    }

    fn discovery_with(methods: serde_json::Value) -> ServiceDiscovery {
        let mut doc = json!({
            "issuer": "https://auth.example.com",
            "authorization_endpoint": "https://auth.example.com/authorize",
            "token_endpoint": "https://auth.example.com/token"
        });
        if !methods.is_null() {
            doc["code_challenge_methods_supported"] = methods;
        }
        ServiceDiscovery::from_json(doc.as_object().unwrap().clone()).unwrap()
    }

    #[test]
    fn test_verify_s256_support_accepts_when_present() {
        assert!(verify_s256_support(&discovery_with(json!(["plain", "S256"]))).is_ok());
    }

    #[test]
    fn test_verify_s256_support_rejects_when_absent_or_missing() {
        assert!(verify_s256_support(&discovery_with(json!(["plain"]))).is_err());
        assert!(verify_s256_support(&discovery_with(serde_json::Value::Null)).is_err());
    }

    #[test]
    fn test_verify_s256_support_is_case_sensitive() {
        assert!(verify_s256_support(&discovery_with(json!(["s256"]))).is_err());
    }
}
