//! Codec primitives shared by the protocol types
//!
//! base64url without padding, URL-safe random strings, SHA-256, and
//! `application/x-www-form-urlencoded` encoding and parsing.

use std::collections::BTreeMap;

use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::error::{OAuthError, Result};

/// A JSON object, used for raw parameter mappings and persisted state.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Number of random bytes behind `state`, `nonce`, and `code_verifier`
/// values.  32 bytes encode to 43 base64url characters.
pub const RANDOM_BYTES: usize = 32;

/// Encodes bytes as base64url without padding.
pub fn base64url_encode(bytes: impl AsRef<[u8]>) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Decodes base64url, accepting input with or without trailing padding.
pub fn base64url_decode(input: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(input.trim_end_matches('='))
        .map_err(|e| OAuthError::JsonDeserialization(format!("invalid base64url: {e}")))
}

/// Returns `len` cryptographically random bytes.
pub fn random_bytes(len: usize) -> Vec<u8> {
    use rand::RngCore as _;

    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    bytes
}

/// Generates a URL-safe random string from [`RANDOM_BYTES`] random bytes.
///
/// # Examples
///
/// ```
/// use oauthkit::codec::random_url_safe_string;
///
/// let value = random_url_safe_string();
/// assert_eq!(value.len(), 43);
/// assert!(!value.contains('='));
/// ```
pub fn random_url_safe_string() -> String {
    base64url_encode(random_bytes(RANDOM_BYTES))
}

/// SHA-256 digest of `input`.
pub fn sha256(input: impl AsRef<[u8]>) -> Vec<u8> {
    Sha256::digest(input.as_ref()).to_vec()
}

/// Encodes key/value pairs as an `application/x-www-form-urlencoded` body.
pub fn form_encode<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

/// Parses a query or fragment string into a sorted map.
///
/// Values are percent-decoded and `+` is read as a space.  Duplicate keys are
/// overwritten by the last occurrence; empty keys are dropped.
pub fn parse_query(query: &str) -> BTreeMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect()
}

/// Reads the parameters of a redirect URI.
///
/// Parameters are taken from the query; when the query carries none, the
/// fragment is used instead (implicit and hybrid responses).
pub fn redirect_parameters(url: &url::Url) -> BTreeMap<String, String> {
    let query = parse_query(url.query().unwrap_or_default());
    if !query.is_empty() {
        return query;
    }
    parse_query(url.fragment().unwrap_or_default())
}

/// Decodes a JSON object from bytes.
pub fn decode_json_object(bytes: &[u8]) -> Result<JsonMap> {
    match serde_json::from_slice::<serde_json::Value>(bytes) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(OAuthError::JsonDeserialization(format!(
            "expected a JSON object, found {}",
            json_type_name(&other)
        ))),
        Err(e) => Err(OAuthError::JsonDeserialization(e.to_string())),
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64url_round_trip_without_padding() {
        let encoded = base64url_encode(b"any carnal pleas");
        assert!(!encoded.contains('='));
        assert_eq!(base64url_decode(&encoded).unwrap(), b"any carnal pleas");
    }

    #[test]
    fn test_base64url_decode_tolerates_padding() {
        assert_eq!(base64url_decode("YQ==").unwrap(), b"a");
    }

    #[test]
    fn test_base64url_decode_rejects_standard_alphabet() {
        assert!(base64url_decode("a+b/").is_err());
    }

    #[test]
    fn test_random_strings_are_unique_and_url_safe() {
        let a = random_url_safe_string();
        let b = random_url_safe_string();
        assert_ne!(a, b);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_form_encode_escapes_reserved_characters() {
        let body = form_encode([("scope", "openid profile"), ("redirect_uri", "a:b/c")]);
        assert_eq!(body, "scope=openid+profile&redirect_uri=a%3Ab%2Fc");
    }

    #[test]
    fn test_parse_query_decodes_values() {
        let map = parse_query("code=abc%20123&state=xyz&scope=openid+profile&=dropped");
        assert_eq!(map.get("code").map(String::as_str), Some("abc 123"));
        assert_eq!(map.get("scope").map(String::as_str), Some("openid profile"));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_redirect_parameters_falls_back_to_fragment() {
        let url = url::Url::parse("app://cb#state=s1&code=c1").unwrap();
        let params = redirect_parameters(&url);
        assert_eq!(params.get("state").map(String::as_str), Some("s1"));
    }

    #[test]
    fn test_decode_json_object_rejects_arrays() {
        let err = decode_json_object(b"[1,2]").unwrap_err();
        assert!(matches!(err, OAuthError::JsonDeserialization(_)));
        assert!(err.to_string().contains("an array"));
    }

    #[test]
    fn test_sha256_known_answer() {
        assert_eq!(
            base64url_encode(sha256("abc")),
            "ungWv48Bz-pBQUDeXa4iI7ADYaOWF3qctBD_YfIAFa0"
        );
    }
}
