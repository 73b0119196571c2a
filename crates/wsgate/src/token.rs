//! Signed-token mint and verify with bound client fingerprints.
//!
//! Access and refresh tokens are HS256 envelopes carrying the standard
//! claims plus `username`, `groups`, `ip` and `ua`. Verification rejects a
//! token whose stored fingerprint does not match the live request, so a
//! stolen cookie replayed from another client fails even while the
//! signature is valid.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::netutil::ip_equal;

/// Default access-token lifetime.
pub const ACCESS_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);
/// Default refresh-token lifetime.
pub const REFRESH_TOKEN_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Clock skew tolerated on `exp` and `nbf`.
const LEEWAY_SECS: u64 = 30;

/// Verification and mint failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token expired")]
    Expired,

    #[error("token not valid yet")]
    NotYetValid,

    #[error("invalid token: {0}")]
    Invalid(String),

    #[error("username claim missing")]
    ClaimUsernameMissing,

    #[error("groups claim missing")]
    ClaimGroupsMissing,

    #[error("ip claim missing")]
    ClaimIpMissing,

    #[error("ua claim missing")]
    ClaimUaMissing,

    #[error("ip claim does not match request")]
    ClaimIpMismatch,

    #[error("ua claim does not match request")]
    ClaimUaMismatch,

    #[error("could not mint token: {0}")]
    Mint(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    groups: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ua: Option<String>,
    exp: i64,
    iat: i64,
    nbf: i64,
    sub: String,
    iss: String,
    aud: String,
}

/// Normalize a `groups` claim of any accepted shape into a trimmed,
/// empty-filtered, order-preserving deduplicated list.
///
/// Accepted shapes: JSON array of strings, a JSON-encoded string array, a
/// comma-separated scalar, a whitespace-separated scalar. Anything else is
/// rejected; downstream authorization depends on this.
pub fn normalize_groups(value: Option<&serde_json::Value>) -> Result<Vec<String>, TokenError> {
    let value = value.ok_or(TokenError::ClaimGroupsMissing)?;
    let parts: Vec<String> = match value {
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(s) => out.push(s.to_string()),
                    None => return Err(TokenError::ClaimGroupsMissing),
                }
            }
            out
        }
        serde_json::Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Err(TokenError::ClaimGroupsMissing);
            }
            if s.starts_with('[') {
                if let Ok(arr) = serde_json::from_str::<Vec<String>>(s) {
                    arr
                } else if s.contains(',') {
                    s.split(',').map(str::to_string).collect()
                } else {
                    s.split_whitespace().map(str::to_string).collect()
                }
            } else if s.contains(',') {
                s.split(',').map(str::to_string).collect()
            } else {
                s.split_whitespace().map(str::to_string).collect()
            }
        }
        _ => return Err(TokenError::ClaimGroupsMissing),
    };

    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(parts.len());
    for p in parts {
        let t = p.trim();
        if !t.is_empty() && seen.insert(t.to_string()) {
            out.push(t.to_string());
        }
    }
    Ok(out)
}

struct KeyPair {
    enc: EncodingKey,
    dec: DecodingKey,
}

impl KeyPair {
    fn from_secret(secret: &str) -> Self {
        Self {
            enc: EncodingKey::from_secret(secret.as_bytes()),
            dec: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

/// HS256 token service with separate access and refresh secrets.
pub struct TokenService {
    access: KeyPair,
    refresh: KeyPair,
    issuer: String,
    audience: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenService {
    pub fn new(access_secret: &str, refresh_secret: &str, issuer: &str, audience: &str) -> Self {
        Self::with_ttls(
            access_secret,
            refresh_secret,
            issuer,
            audience,
            ACCESS_TOKEN_TTL,
            REFRESH_TOKEN_TTL,
        )
    }

    /// Constructor with explicit lifetimes, used by tests that need to
    /// exercise expiry windows.
    pub fn with_ttls(
        access_secret: &str,
        refresh_secret: &str,
        issuer: &str,
        audience: &str,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Self {
        Self {
            access: KeyPair::from_secret(access_secret),
            refresh: KeyPair::from_secret(refresh_secret),
            issuer: issuer.to_string(),
            audience: audience.to_string(),
            access_ttl,
            refresh_ttl,
        }
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    fn mint(
        &self,
        keys: &KeyPair,
        ttl: Duration,
        username: &str,
        groups: &[String],
        ip: &str,
        ua: &str,
    ) -> Result<String, TokenError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            username: Some(username.to_string()),
            groups: Some(serde_json::json!(groups)),
            ip: Some(ip.to_string()),
            ua: Some(ua.to_string()),
            exp: now + ttl.as_secs() as i64,
            iat: now,
            nbf: now,
            sub: username.to_string(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &keys.enc)
            .map_err(|e| TokenError::Mint(e.to_string()))
    }

    pub fn create_access(
        &self,
        username: &str,
        groups: &[String],
        ip: &str,
        ua: &str,
    ) -> Result<String, TokenError> {
        self.mint(&self.access, self.access_ttl, username, groups, ip, ua)
    }

    pub fn create_refresh(
        &self,
        username: &str,
        groups: &[String],
        ip: &str,
        ua: &str,
    ) -> Result<String, TokenError> {
        self.mint(&self.refresh, self.refresh_ttl, username, groups, ip, ua)
    }

    fn verify(
        &self,
        keys: &KeyPair,
        token: &str,
        ip: &str,
        ua: &str,
    ) -> Result<(String, Vec<String>), TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = LEEWAY_SECS;
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.required_spec_claims = ["exp", "nbf", "iss", "aud"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let data = jsonwebtoken::decode::<Claims>(token, &keys.dec, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                jsonwebtoken::errors::ErrorKind::ImmatureSignature => TokenError::NotYetValid,
                _ => TokenError::Invalid(e.to_string()),
            }
        })?;
        let claims = data.claims;

        let username = match claims.username.as_deref() {
            Some(u) if !u.is_empty() => u.to_string(),
            _ => return Err(TokenError::ClaimUsernameMissing),
        };

        let groups =
            normalize_groups(claims.groups.as_ref()).map_err(|_| TokenError::ClaimGroupsMissing)?;

        let claim_ip = match claims.ip.as_deref() {
            Some(v) if !v.is_empty() => v,
            _ => return Err(TokenError::ClaimIpMissing),
        };
        if !ip_equal(claim_ip, ip) {
            return Err(TokenError::ClaimIpMismatch);
        }

        let claim_ua = match claims.ua.as_deref() {
            Some(v) if !v.is_empty() => v,
            _ => return Err(TokenError::ClaimUaMissing),
        };
        if claim_ua != ua {
            return Err(TokenError::ClaimUaMismatch);
        }

        Ok((username, groups))
    }

    /// Verify an access token against the live request fingerprint.
    pub fn verify_access(
        &self,
        token: &str,
        ip: &str,
        ua: &str,
    ) -> Result<(String, Vec<String>), TokenError> {
        self.verify(&self.access, token, ip, ua)
    }

    /// Verify a refresh token against the live request fingerprint.
    pub fn verify_refresh(
        &self,
        token: &str,
        ip: &str,
        ua: &str,
    ) -> Result<(String, Vec<String>), TokenError> {
        self.verify(&self.refresh, token, ip, ua)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UA: &str = "Mozilla/5.0 (X11; Linux x86_64)";

    fn svc() -> TokenService {
        TokenService::new("access-secret", "refresh-secret", "wsgate", "wsgate-users")
    }

    #[test]
    fn mint_and_verify_roundtrip() {
        let svc = svc();
        let groups = vec!["bdadmins".to_string()];
        let token = svc
            .create_access("alice", &groups, "10.0.0.7", UA)
            .unwrap();

        let (user, got) = svc.verify_access(&token, "10.0.0.7", UA).unwrap();
        assert_eq!(user, "alice");
        assert_eq!(got, groups);
    }

    #[test]
    fn access_and_refresh_keys_are_separate() {
        let svc = svc();
        let token = svc.create_access("alice", &["g".into()], "1.2.3.4", UA).unwrap();
        assert!(matches!(
            svc.verify_refresh(&token, "1.2.3.4", UA),
            Err(TokenError::Invalid(_))
        ));
    }

    fn mint_with_times(exp: i64, nbf: i64) -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            username: Some("alice".into()),
            groups: Some(serde_json::json!(["g"])),
            ip: Some("1.2.3.4".into()),
            ua: Some(UA.into()),
            exp,
            iat: now,
            nbf,
            sub: "alice".into(),
            iss: "wsgate".into(),
            aud: "wsgate-users".into(),
        };
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"access-secret"),
        )
        .unwrap()
    }

    #[test]
    fn expiry_window_honors_leeway() {
        let svc = svc();
        let now = Utc::now().timestamp();

        // Expired a few seconds ago: still inside the 30s leeway.
        let fresh = mint_with_times(now - 5, now - 60);
        assert!(svc.verify_access(&fresh, "1.2.3.4", UA).is_ok());

        // Expired well past the leeway: rejected as Expired.
        let stale = mint_with_times(now - 120, now - 240);
        assert_eq!(
            svc.verify_access(&stale, "1.2.3.4", UA).unwrap_err(),
            TokenError::Expired
        );
    }

    #[test]
    fn future_nbf_is_not_yet_valid() {
        let svc = svc();
        let now = Utc::now().timestamp();
        let early = mint_with_times(now + 600, now + 120);
        assert_eq!(
            svc.verify_access(&early, "1.2.3.4", UA).unwrap_err(),
            TokenError::NotYetValid
        );
    }

    #[test]
    fn ip_binding_is_enforced_with_normalization() {
        let svc = svc();
        let token = svc
            .create_access("alice", &["g".into()], "10.0.0.7", UA)
            .unwrap();

        // host:port and v4-in-v6 forms of the same address still match.
        assert!(svc.verify_access(&token, "10.0.0.7:51234", UA).is_ok());
        assert!(svc.verify_access(&token, "::ffff:10.0.0.7", UA).is_ok());
        assert_eq!(
            svc.verify_access(&token, "10.0.0.8", UA).unwrap_err(),
            TokenError::ClaimIpMismatch
        );
    }

    #[test]
    fn ua_binding_is_byte_exact() {
        let svc = svc();
        let token = svc
            .create_access("alice", &["g".into()], "10.0.0.7", UA)
            .unwrap();
        assert_eq!(
            svc.verify_access(&token, "10.0.0.7", "curl/8.5").unwrap_err(),
            TokenError::ClaimUaMismatch
        );
    }

    #[test]
    fn wrong_secret_fails_signature() {
        let svc = svc();
        let other = TokenService::new("not-the-secret", "r", "wsgate", "wsgate-users");
        let token = svc.create_access("alice", &["g".into()], "1.2.3.4", UA).unwrap();
        assert!(matches!(
            other.verify_access(&token, "1.2.3.4", UA),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    fn normalize_groups_accepts_every_shape() {
        use serde_json::json;

        let arr = json!(["ops", " data ", "ops"]);
        assert_eq!(
            normalize_groups(Some(&arr)).unwrap(),
            vec!["ops", "data"]
        );

        let encoded = json!("[\"ops\",\"data\"]");
        assert_eq!(
            normalize_groups(Some(&encoded)).unwrap(),
            vec!["ops", "data"]
        );

        let comma = json!("ops, data , ,ops");
        assert_eq!(
            normalize_groups(Some(&comma)).unwrap(),
            vec!["ops", "data"]
        );

        let spaced = json!("ops   data\tops");
        assert_eq!(
            normalize_groups(Some(&spaced)).unwrap(),
            vec!["ops", "data"]
        );
    }

    #[test]
    fn normalize_groups_rejects_bad_shapes() {
        use serde_json::json;

        assert_eq!(
            normalize_groups(None).unwrap_err(),
            TokenError::ClaimGroupsMissing
        );
        assert_eq!(
            normalize_groups(Some(&json!(""))).unwrap_err(),
            TokenError::ClaimGroupsMissing
        );
        assert_eq!(
            normalize_groups(Some(&json!(["ok", 3]))).unwrap_err(),
            TokenError::ClaimGroupsMissing
        );
        assert_eq!(
            normalize_groups(Some(&json!(42))).unwrap_err(),
            TokenError::ClaimGroupsMissing
        );
    }

    #[test]
    fn missing_claims_map_to_their_errors() {
        // Hand-roll a token without the custom claims.
        #[derive(serde::Serialize)]
        struct Bare {
            exp: i64,
            iat: i64,
            nbf: i64,
            sub: String,
            iss: String,
            aud: String,
        }
        let now = Utc::now().timestamp();
        let bare = Bare {
            exp: now + 60,
            iat: now,
            nbf: now,
            sub: "alice".into(),
            iss: "wsgate".into(),
            aud: "wsgate-users".into(),
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &bare,
            &EncodingKey::from_secret(b"access-secret"),
        )
        .unwrap();

        let svc = svc();
        assert_eq!(
            svc.verify_access(&token, "1.2.3.4", UA).unwrap_err(),
            TokenError::ClaimUsernameMissing
        );
    }
}
