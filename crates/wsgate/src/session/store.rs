//! Encrypted session/token storage on the shared KV store.
//!
//! Record layout per session (prefix configurable, default `session`):
//!
//! ```text
//! acc:{user}:{sid}           hash{access_token: enc}     EX accessTTL
//! ref:{user}:{sid}           hash{refresh_token: enc}    EX refreshTTL
//! usessions:{user}           set<sid>                    EX refreshTTL
//! idx:sid:{sid}              string = user               EX refreshTTL
//! idx:accsha:{mac(access)}   string = "{user}|{sid}"     EX accessTTL
//! idx:refsha:{mac(refresh)}  string = "{user}|{sid}"     EX refreshTTL
//! ```
//!
//! Tokens are sealed with AES-256-GCM before they hit the store; the index
//! keys use an HMAC-SHA-256 fingerprint keyed independently of the AEAD key
//! so a store dump never yields usable token material.

use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use log::warn;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::kv::{timed, KvStore};

use super::StoreError;

type HmacSha256 = Hmac<Sha256>;

/// Derive the 256-bit session key from a configured secret.
///
/// The secret may be given base64 encoded (standard or raw); whichever
/// decoding succeeds feeds SHA-256, otherwise the raw bytes do.
pub fn derive_key(secret: &str) -> [u8; 32] {
    let material = STANDARD
        .decode(secret)
        .or_else(|_| STANDARD_NO_PAD.decode(secret))
        .unwrap_or_else(|_| secret.as_bytes().to_vec());
    Sha256::digest(&material).into()
}

/// Session store over the shared KV store.
#[derive(Clone)]
pub struct SessionStore {
    kv: KvStore,
    prefix: String,
    enc_key: [u8; 32],
    mac_key: [u8; 32],
}

impl SessionStore {
    /// Create a store with the given key prefix and 32-byte session key.
    ///
    /// The MAC key for the reverse indices is derived as
    /// `SHA-256(key || 0x01)` and is therefore independent of the AEAD key.
    pub fn new(kv: KvStore, prefix: &str, enc_key: [u8; 32]) -> Self {
        let mut mac_input = enc_key.to_vec();
        mac_input.push(0x01);
        let mac_key: [u8; 32] = Sha256::digest(&mac_input).into();
        Self {
            kv,
            prefix: prefix.trim_end_matches(':').to_string(),
            enc_key,
            mac_key,
        }
    }

    /// 128-bit random session id, URL-safe base64 without padding.
    pub fn new_session_id() -> String {
        let mut buf = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut buf);
        URL_SAFE_NO_PAD.encode(buf)
    }

    fn key(&self, parts: &[&str]) -> String {
        let mut out = self.prefix.clone();
        for p in parts {
            out.push(':');
            out.push_str(p);
        }
        out
    }

    /// Seal a token: base64(nonce || ciphertext).
    fn encrypt(&self, plain: &str) -> Result<String, StoreError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.enc_key));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ct = cipher
            .encrypt(&nonce, plain.as_bytes())
            .map_err(|e| StoreError::Cipher(e.to_string()))?;
        let mut out = nonce.to_vec();
        out.extend_from_slice(&ct);
        Ok(STANDARD_NO_PAD.encode(out))
    }

    fn decrypt(&self, b64: &str) -> Result<String, StoreError> {
        let raw = STANDARD_NO_PAD
            .decode(b64)
            .map_err(|e| StoreError::Cipher(e.to_string()))?;
        if raw.len() < 12 {
            return Err(StoreError::Cipher("ciphertext too short".into()));
        }
        let (nonce, ct) = raw.split_at(12);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.enc_key));
        let pt = cipher
            .decrypt(Nonce::from_slice(nonce), ct)
            .map_err(|e| StoreError::Cipher(e.to_string()))?;
        String::from_utf8(pt).map_err(|e| StoreError::Cipher(e.to_string()))
    }

    /// Keyed fingerprint used for the accsha/refsha reverse indices.
    fn token_mac(&self, token: &str) -> String {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac_key).expect("hmac accepts any key size");
        mac.update(token.as_bytes());
        STANDARD_NO_PAD.encode(mac.finalize().into_bytes())
    }

    fn parse_user_sid(pair: &str) -> Result<(String, String), StoreError> {
        let (user, sid) = pair.split_once('|').ok_or(StoreError::CorruptIndex)?;
        if user.is_empty() || sid.is_empty() {
            return Err(StoreError::CorruptIndex);
        }
        Ok((user.to_string(), sid.to_string()))
    }

    /// Pipelined write of all six session records.
    pub async fn save_session_tokens(
        &self,
        user: &str,
        sid: &str,
        access: &str,
        refresh: &str,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Result<(), StoreError> {
        if user.is_empty() || sid.is_empty() || access.is_empty() || refresh.is_empty() {
            return Err(StoreError::MissingArguments);
        }
        let enc_a = self.encrypt(access)?;
        let enc_r = self.encrypt(refresh)?;
        let acc_mac = self.token_mac(access);
        let ref_mac = self.token_mac(refresh);
        let pair = format!("{user}|{sid}");

        let mut conn = self.kv.conn().await?;
        let mut pipe = redis::pipe();
        pipe.hset(self.key(&["acc", user, sid]), "access_token", enc_a)
            .ignore()
            .expire(self.key(&["acc", user, sid]), access_ttl.as_secs() as i64)
            .ignore()
            .hset(self.key(&["ref", user, sid]), "refresh_token", enc_r)
            .ignore()
            .expire(self.key(&["ref", user, sid]), refresh_ttl.as_secs() as i64)
            .ignore()
            .sadd(self.key(&["usessions", user]), sid)
            .ignore()
            .expire(self.key(&["usessions", user]), refresh_ttl.as_secs() as i64)
            .ignore()
            .set_ex(self.key(&["idx", "sid", sid]), user, refresh_ttl.as_secs())
            .ignore()
            .set_ex(
                self.key(&["idx", "accsha", &acc_mac]),
                &pair,
                access_ttl.as_secs(),
            )
            .ignore()
            .set_ex(
                self.key(&["idx", "refsha", &ref_mac]),
                &pair,
                refresh_ttl.as_secs(),
            )
            .ignore();
        timed(pipe.query_async::<()>(&mut conn)).await?;
        Ok(())
    }

    async fn hget_enc(&self, key: String, field: &str) -> Result<String, StoreError> {
        let mut conn = self.kv.conn().await?;
        let val: Option<String> = timed(redis::cmd("HGET").arg(&key).arg(field).query_async(&mut conn)).await?;
        let enc = val.ok_or(StoreError::NotFound)?;
        self.decrypt(&enc)
    }

    /// Decrypted access token for `(user, sid)`.
    pub async fn get_access(&self, user: &str, sid: &str) -> Result<String, StoreError> {
        self.hget_enc(self.key(&["acc", user, sid]), "access_token")
            .await
    }

    /// Decrypted refresh token for `(user, sid)`.
    pub async fn get_refresh(&self, user: &str, sid: &str) -> Result<String, StoreError> {
        self.hget_enc(self.key(&["ref", user, sid]), "refresh_token")
            .await
    }

    /// Resolve the owning user through the sid index.
    pub async fn lookup_user_by_sid(&self, sid: &str) -> Result<String, StoreError> {
        let mut conn = self.kv.conn().await?;
        let user: Option<String> = timed(
            redis::cmd("GET")
                .arg(self.key(&["idx", "sid", sid]))
                .query_async(&mut conn),
        )
        .await?;
        user.ok_or(StoreError::NotFound)
    }

    /// One-time-use refresh rotation.
    ///
    /// The provided refresh token is compared in constant time against the
    /// stored one; a mismatch revokes the entire session (theft response)
    /// and fails with [`StoreError::RefreshMismatchRevoked`]. On match the
    /// old reverse indices are deleted and both tokens, TTLs and indices
    /// are replaced in one pipeline.
    #[allow(clippy::too_many_arguments)]
    pub async fn rotate_on_refresh(
        &self,
        user: Option<&str>,
        sid: &str,
        provided_refresh: &str,
        new_access: &str,
        access_ttl: Duration,
        new_refresh: &str,
        refresh_ttl: Duration,
    ) -> Result<(), StoreError> {
        let user = match user {
            Some(u) if !u.is_empty() => u.to_string(),
            _ => self.lookup_user_by_sid(sid).await?,
        };

        let stored_refresh = self.get_refresh(&user, sid).await?;

        if provided_refresh
            .as_bytes()
            .ct_eq(stored_refresh.as_bytes())
            .unwrap_u8()
            != 1
        {
            warn!("refresh mismatch for session {sid}; revoking session");
            let _ = self.revoke(&user, sid).await;
            return Err(StoreError::RefreshMismatchRevoked);
        }

        // Old access may already have expired; its index is then gone too.
        let old_acc_mac = match self.get_access(&user, sid).await {
            Ok(token) => Some(self.token_mac(&token)),
            Err(StoreError::NotFound) => None,
            Err(e) => return Err(e),
        };
        let old_ref_mac = self.token_mac(&stored_refresh);

        let enc_a = self.encrypt(new_access)?;
        let enc_r = self.encrypt(new_refresh)?;
        let pair = format!("{user}|{sid}");

        let mut conn = self.kv.conn().await?;
        let mut pipe = redis::pipe();
        if let Some(mac) = old_acc_mac {
            pipe.del(self.key(&["idx", "accsha", &mac])).ignore();
        }
        pipe.del(self.key(&["idx", "refsha", &old_ref_mac]))
            .ignore()
            .hset(self.key(&["acc", &user, sid]), "access_token", enc_a)
            .ignore()
            .expire(self.key(&["acc", &user, sid]), access_ttl.as_secs() as i64)
            .ignore()
            .hset(self.key(&["ref", &user, sid]), "refresh_token", enc_r)
            .ignore()
            .expire(self.key(&["ref", &user, sid]), refresh_ttl.as_secs() as i64)
            .ignore()
            .set_ex(
                self.key(&["idx", "accsha", &self.token_mac(new_access)]),
                &pair,
                access_ttl.as_secs(),
            )
            .ignore()
            .set_ex(
                self.key(&["idx", "refsha", &self.token_mac(new_refresh)]),
                &pair,
                refresh_ttl.as_secs(),
            )
            .ignore();
        timed(pipe.query_async::<()>(&mut conn)).await?;
        Ok(())
    }

    /// Remove every artifact of `(user, sid)`: both records, the set
    /// membership and all reverse indices.
    pub async fn revoke(&self, user: &str, sid: &str) -> Result<(), StoreError> {
        let acc_mac = match self.get_access(user, sid).await {
            Ok(token) => Some(self.token_mac(&token)),
            Err(StoreError::NotFound) => None,
            Err(e) => return Err(e),
        };
        let ref_mac = match self.get_refresh(user, sid).await {
            Ok(token) => Some(self.token_mac(&token)),
            Err(StoreError::NotFound) => None,
            Err(e) => return Err(e),
        };

        let mut conn = self.kv.conn().await?;
        let mut pipe = redis::pipe();
        pipe.del(self.key(&["acc", user, sid]))
            .ignore()
            .del(self.key(&["ref", user, sid]))
            .ignore()
            .srem(self.key(&["usessions", user]), sid)
            .ignore()
            .del(self.key(&["idx", "sid", sid]))
            .ignore();
        if let Some(mac) = acc_mac {
            pipe.del(self.key(&["idx", "accsha", &mac])).ignore();
        }
        if let Some(mac) = ref_mac {
            pipe.del(self.key(&["idx", "refsha", &mac])).ignore();
        }
        timed(pipe.query_async::<()>(&mut conn)).await?;
        Ok(())
    }

    /// Revoke a session identified only by its sid.
    pub async fn revoke_by_sid(&self, sid: &str) -> Result<(), StoreError> {
        let user = self.lookup_user_by_sid(sid).await?;
        self.revoke(&user, sid).await
    }

    async fn lookup_index_pair(&self, kind: &str, token: &str) -> Result<(String, String), StoreError> {
        let mut conn = self.kv.conn().await?;
        let pair: Option<String> = timed(
            redis::cmd("GET")
                .arg(self.key(&["idx", kind, &self.token_mac(token)]))
                .query_async(&mut conn),
        )
        .await?;
        Self::parse_user_sid(&pair.ok_or(StoreError::NotFound)?)
    }

    /// Revoke the session owning the given access token.
    pub async fn revoke_by_access(&self, access_token: &str) -> Result<(), StoreError> {
        let (user, sid) = self.lookup_index_pair("accsha", access_token).await?;
        self.revoke(&user, &sid).await
    }

    /// Revoke the session owning the given refresh token.
    pub async fn revoke_by_refresh(&self, refresh_token: &str) -> Result<(), StoreError> {
        let (user, sid) = self.lookup_index_pair("refsha", refresh_token).await?;
        self.revoke(&user, &sid).await
    }

    /// Revoke every session of a user and drop the membership set.
    pub async fn revoke_all_for_user(&self, user: &str) -> Result<(), StoreError> {
        let mut conn = self.kv.conn().await?;
        let sids: Vec<String> = timed(
            redis::cmd("SMEMBERS")
                .arg(self.key(&["usessions", user]))
                .query_async(&mut conn),
        )
        .await?;
        for sid in sids {
            self.revoke(user, &sid).await?;
        }
        timed(
            redis::cmd("DEL")
                .arg(self.key(&["usessions", user]))
                .query_async::<()>(&mut conn),
        )
        .await?;
        Ok(())
    }

    /// Revoke every session in the store by walking the sid index.
    pub async fn revoke_all_global(&self) -> Result<(), StoreError> {
        let pattern = self.key(&["idx", "sid", "*"]);
        let keys = self.kv.scan_keys(&pattern).await?;
        for key in keys {
            if let Some(sid) = key.rsplit(':').next() {
                self.revoke_by_sid(sid).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> SessionStore {
        let kv = KvStore::open("127.0.0.1", 1, "", 0).unwrap();
        SessionStore::new(kv, "session:", derive_key("unit-test-secret"))
    }

    #[test]
    fn derive_key_is_deterministic_and_32_bytes() {
        let a = derive_key("s3cret");
        let b = derive_key("s3cret");
        assert_eq!(a, b);
        assert_ne!(a, derive_key("other"));
    }

    #[test]
    fn derive_key_accepts_base64_secrets() {
        // Standard and raw base64 of the same bytes must derive the same key.
        let padded = STANDARD.encode(b"exactly-these-bytes");
        let raw = STANDARD_NO_PAD.encode(b"exactly-these-bytes");
        assert_eq!(derive_key(&padded), derive_key(&raw));
        // A non-base64 secret falls back to its raw bytes.
        assert_ne!(derive_key("no base64 here!"), derive_key(&padded));
    }

    #[test]
    fn session_id_is_url_safe_and_128_bit() {
        let sid = SessionStore::new_session_id();
        // 16 bytes -> 22 chars of unpadded url-safe base64.
        assert_eq!(sid.len(), 22);
        assert!(sid
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(sid, SessionStore::new_session_id());
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let store = test_store();
        let sealed = store.encrypt("the-access-token").unwrap();
        assert_ne!(sealed, "the-access-token");
        assert_eq!(store.decrypt(&sealed).unwrap(), "the-access-token");
    }

    #[test]
    fn encrypt_uses_fresh_nonces() {
        let store = test_store();
        let a = store.encrypt("same-plaintext").unwrap();
        let b = store.encrypt("same-plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn decrypt_rejects_garbage() {
        let store = test_store();
        assert!(matches!(
            store.decrypt("AAAA"),
            Err(StoreError::Cipher(_))
        ));
        let sealed = store.encrypt("x").unwrap();
        let other = SessionStore::new(
            KvStore::open("127.0.0.1", 1, "", 0).unwrap(),
            "session",
            derive_key("different-secret"),
        );
        assert!(other.decrypt(&sealed).is_err());
    }

    #[test]
    fn token_mac_is_stable_and_key_separated() {
        let store = test_store();
        assert_eq!(store.token_mac("tok"), store.token_mac("tok"));
        assert_ne!(store.token_mac("tok"), store.token_mac("tok2"));
        // MAC key must differ from a MAC keyed with the AEAD key itself.
        let mut direct = <HmacSha256 as Mac>::new_from_slice(&store.enc_key).unwrap();
        direct.update(b"tok");
        let direct = STANDARD_NO_PAD.encode(direct.finalize().into_bytes());
        assert_ne!(store.token_mac("tok"), direct);
    }

    #[test]
    fn key_prefix_is_normalized() {
        let store = test_store();
        assert_eq!(store.key(&["acc", "alice", "s1"]), "session:acc:alice:s1");
        assert_eq!(store.key(&["idx", "sid", "s1"]), "session:idx:sid:s1");
    }

    #[test]
    fn parse_user_sid_splits_on_first_pipe() {
        assert_eq!(
            SessionStore::parse_user_sid("alice|s1").unwrap(),
            ("alice".into(), "s1".into())
        );
        // sid may itself contain a pipe; only the first one separates.
        assert_eq!(
            SessionStore::parse_user_sid("bob|a|b").unwrap(),
            ("bob".into(), "a|b".into())
        );
        assert!(SessionStore::parse_user_sid("corrupt").is_err());
        assert!(SessionStore::parse_user_sid("|sid").is_err());
    }
}
