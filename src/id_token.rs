//! OpenID Connect ID token decoding and claim validation
//!
//! The token is split into its three JWS segments and the header and
//! payload are decoded.  Signature verification is outside the scope of
//! this crate: tokens arrive directly from the token endpoint over TLS, which
//! OpenID Connect Core section 3.1.3.7 accepts in place of a signature check.
//!
//! # References
//!
//! - OpenID Connect Core 1.0 section 3.1.3.7 <https://openid.net/specs/openid-connect-core-1_0.html#IDTokenValidation>

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::codec::{self, JsonMap};
use crate::error::{OAuthError, Result};

/// How far in the future `iat` may lie before the token is rejected.
pub const MAX_ISSUED_AT_SKEW_SECONDS: i64 = 600;

/// The `aud` claim: a single client id or a list of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    /// `"aud": "client"`
    Single(String),
    /// `"aud": ["client", "other"]`
    Multiple(Vec<String>),
}

impl Audience {
    /// Returns `true` when `client_id` is one of the audiences.
    pub fn contains(&self, client_id: &str) -> bool {
        match self {
            Self::Single(aud) => aud == client_id,
            Self::Multiple(auds) => auds.iter().any(|aud| aud == client_id),
        }
    }
}

/// Decoded ID token claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdTokenClaims {
    /// Issuer identifier.
    pub iss: String,
    /// Subject identifier.
    pub sub: String,
    /// Audience(s).
    pub aud: Audience,
    /// Expiration time, seconds since the epoch.
    pub exp: i64,
    /// Issued-at time, seconds since the epoch.
    pub iat: i64,
    /// Nonce echoed from the authorization request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Every other claim.
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// A decoded ID token.
///
/// # Examples
///
/// ```
/// use oauthkit::codec::base64url_encode;
/// use oauthkit::id_token::IdToken;
///
/// let header = base64url_encode(br#"{"alg":"RS256"}"#);
/// let payload = base64url_encode(
///     br#"{"iss":"https://auth.example.com","sub":"user","aud":"client","exp":2000000000,"iat":1700000000}"#,
/// );
/// let raw = format!("{header}.{payload}.sig");
///
/// let token = IdToken::parse(&raw).unwrap();
/// assert_eq!(token.claims.sub, "user");
/// assert!(token.claims.aud.contains("client"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct IdToken {
    /// The compact serialization as received.
    pub raw: String,
    /// Decoded JOSE header.
    pub header: JsonMap,
    /// Decoded claims.
    pub claims: IdTokenClaims,
}

impl IdToken {
    /// Decodes a compact-serialized ID token.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::IdTokenParsing`] when the token does not have
    /// three segments, a segment is not base64url JSON, or a required claim
    /// is missing.
    pub fn parse(raw: &str) -> Result<Self> {
        let segments: Vec<&str> = raw.split('.').collect();
        if segments.len() != 3 {
            return Err(OAuthError::IdTokenParsing(format!(
                "expected 3 segments, found {}",
                segments.len()
            )));
        }

        let header = decode_segment(segments[0])?;
        let payload = decode_segment(segments[1])?;
        let claims: IdTokenClaims = serde_json::from_value(serde_json::Value::Object(payload))
            .map_err(|e| OAuthError::IdTokenParsing(format!("invalid claims: {e}")))?;

        Ok(Self {
            raw: raw.to_string(),
            header,
            claims,
        })
    }

    /// Expiry as an instant.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.claims.exp, 0).single()
    }

    /// Issued-at as an instant.
    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.claims.iat, 0).single()
    }

    /// Validates the claims against the request that produced this token.
    ///
    /// # Arguments
    ///
    /// * `issuer` - The provider's issuer identifier.
    /// * `client_id` - Must be one of the token's audiences.
    /// * `nonce` - The nonce sent on the authorization request, if any.
    /// * `now` - Reference time for the expiry and issued-at checks.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::IdTokenValidation`] naming the first failed
    /// check.
    pub fn validate(
        &self,
        issuer: &Url,
        client_id: &str,
        nonce: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let claimed_issuer = Url::parse(&self.claims.iss).map_err(|_| {
            OAuthError::IdTokenValidation(format!("issuer {} is not a URL", self.claims.iss))
        })?;
        if &claimed_issuer != issuer {
            return Err(OAuthError::IdTokenValidation(format!(
                "issuer mismatch: expected {issuer}, got {}",
                self.claims.iss
            )));
        }

        if !self.claims.aud.contains(client_id) {
            return Err(OAuthError::IdTokenValidation(format!(
                "audience does not contain client id {client_id}"
            )));
        }

        if self.claims.exp <= now.timestamp() {
            return Err(OAuthError::IdTokenValidation(
                "ID token has expired".to_string(),
            ));
        }

        if self.claims.iat.saturating_sub(now.timestamp()) > MAX_ISSUED_AT_SKEW_SECONDS {
            return Err(OAuthError::IdTokenValidation(
                "ID token issued too far in the future".to_string(),
            ));
        }

        if let Some(expected) = nonce {
            if self.claims.nonce.as_deref() != Some(expected) {
                return Err(OAuthError::IdTokenValidation("nonce mismatch".to_string()));
            }
        }

        Ok(())
    }
}

fn decode_segment(segment: &str) -> Result<JsonMap> {
    let bytes = codec::base64url_decode(segment)
        .map_err(|e| OAuthError::IdTokenParsing(e.to_string()))?;
    codec::decode_json_object(&bytes).map_err(|e| OAuthError::IdTokenParsing(e.to_string()))
}

/// Builds an unsigned token around `claims` for tests.
#[cfg(test)]
pub(crate) fn unsigned_jwt(claims: &serde_json::Value) -> String {
    format!(
        "{}.{}.signature",
        codec::base64url_encode(br#"{"alg":"none","typ":"JWT"}"#),
        codec::base64url_encode(claims.to_string())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ISSUER: &str = "https://auth.example.com";
    const CLIENT: &str = "client-123";

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn claims() -> serde_json::Value {
        json!({
            "iss": ISSUER,
            "sub": "user-1",
            "aud": CLIENT,
            "exp": 1_700_003_600,
            "iat": 1_700_000_000,
            "nonce": "n-1",
            "email": "user@example.com"
        })
    }

    fn issuer() -> Url {
        Url::parse(ISSUER).unwrap()
    }

    fn validate(claims: serde_json::Value, nonce: Option<&str>) -> Result<()> {
        IdToken::parse(&unsigned_jwt(&claims))
            .unwrap()
            .validate(&issuer(), CLIENT, nonce, now())
    }

    #[test]
    fn test_parse_reads_claims_and_extras() {
        let token = IdToken::parse(&unsigned_jwt(&claims())).unwrap();
        assert_eq!(token.claims.sub, "user-1");
        assert_eq!(token.claims.nonce.as_deref(), Some("n-1"));
        assert_eq!(token.claims.extra["email"], "user@example.com");
        assert_eq!(token.header["alg"], "none");
        assert_eq!(token.expires_at().unwrap().timestamp(), 1_700_003_600);
    }

    #[test]
    fn test_parse_rejects_wrong_segment_count() {
        let err = IdToken::parse("a.b").unwrap_err();
        assert!(matches!(err, OAuthError::IdTokenParsing(_)));
    }

    #[test]
    fn test_parse_rejects_non_json_payload() {
        let raw = format!("{}.{}.s", codec::base64url_encode("{}"), codec::base64url_encode("nope"));
        assert!(matches!(
            IdToken::parse(&raw).unwrap_err(),
            OAuthError::IdTokenParsing(_)
        ));
    }

    #[test]
    fn test_parse_rejects_missing_required_claim() {
        let mut c = claims();
        c.as_object_mut().unwrap().remove("sub");
        assert!(matches!(
            IdToken::parse(&unsigned_jwt(&c)).unwrap_err(),
            OAuthError::IdTokenParsing(_)
        ));
    }

    #[test]
    fn test_valid_token_passes() {
        assert!(validate(claims(), Some("n-1")).is_ok());
    }

    #[test]
    fn test_audience_array_containing_client_passes() {
        let mut c = claims();
        c["aud"] = json!(["other", CLIENT]);
        assert!(validate(c, None).is_ok());
    }

    #[test]
    fn test_audience_without_client_fails() {
        let mut c = claims();
        c["aud"] = json!(["other"]);
        let err = validate(c, None).unwrap_err();
        assert!(matches!(err, OAuthError::IdTokenValidation(_)));
        assert!(err.is_terminal());
    }

    #[test]
    fn test_issuer_mismatch_fails() {
        let mut c = claims();
        c["iss"] = json!("https://evil.example.com");
        assert!(matches!(
            validate(c, None).unwrap_err(),
            OAuthError::IdTokenValidation(_)
        ));
    }

    #[test]
    fn test_expired_token_fails() {
        let mut c = claims();
        c["exp"] = json!(1_699_999_999);
        assert!(validate(c, None).is_err());
    }

    #[test]
    fn test_issued_at_skew_limit() {
        let mut c = claims();
        c["iat"] = json!(1_700_000_600);
        assert!(validate(c.clone(), None).is_ok());
        c["iat"] = json!(1_700_000_601);
        assert!(validate(c, None).is_err());
    }

    #[test]
    fn test_extreme_timestamps_do_not_overflow() {
        let mut c = claims();
        c["iat"] = json!(i64::MIN);
        assert!(validate(c.clone(), None).is_ok(), "issued long ago is not skew");

        c["iat"] = json!(i64::MAX);
        assert!(matches!(
            validate(c.clone(), None).unwrap_err(),
            OAuthError::IdTokenValidation(_)
        ));

        c["iat"] = json!(1_700_000_000);
        c["exp"] = json!(i64::MIN);
        assert!(matches!(
            validate(c.clone(), None).unwrap_err(),
            OAuthError::IdTokenValidation(_)
        ));

        c["exp"] = json!(i64::MAX);
        assert!(validate(c, None).is_ok());
    }

    #[test]
    fn test_nonce_must_match_when_requested() {
        assert!(validate(claims(), Some("other")).is_err());

        let mut c = claims();
        c.as_object_mut().unwrap().remove("nonce");
        assert!(validate(c.clone(), Some("n-1")).is_err());
        assert!(validate(c, None).is_ok(), "no nonce requested, none required");
    }
}
