//! Authentication pipeline for the proxy backend.
//!
//! Orchestrates session lookup, access-token verification and silent
//! refresh rotation. Login credentials themselves are checked by the
//! [`directory`] collaborator; everything after a successful login lives in
//! the session store.

pub mod cookie;
pub mod directory;
pub mod middleware;

use std::sync::Arc;

use log::{debug, warn};
use thiserror::Error;

use wsgate::session::StoreError;
use wsgate::token::TokenError;
use wsgate::{Revoker, SessionStore, TokenService};

/// Identity resolved for a request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub username: String,
    pub session_id: String,
    pub groups: Vec<String>,
}

/// Authentication pipeline failures.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No usable session: cookie missing or sid unknown.
    #[error("not authenticated")]
    NotAuthenticated,

    /// Access token failed verification for a reason other than expiry.
    /// Treated as tampering.
    #[error("access token validation failed")]
    AccessTokenValidation,

    /// Access token gone and no refresh record either.
    #[error("refresh token not found")]
    RefreshTokenNotFound,

    /// Refresh token expired; user must log in again.
    #[error("refresh token expired")]
    RefreshTokenExpired,

    /// Refresh token failed verification. Treated as tampering.
    #[error("refresh token validation failed")]
    RefreshTokenValidation,

    /// An administrator revoked the user; the latch was consumed on this
    /// request.
    #[error("user revoked")]
    UserRevoked,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Token(#[from] TokenError),
}

impl AuthError {
    /// Whether the client's session cookie should be expired alongside this
    /// error.
    pub fn expires_cookie(&self) -> bool {
        matches!(
            self,
            AuthError::AccessTokenValidation
                | AuthError::RefreshTokenNotFound
                | AuthError::RefreshTokenExpired
                | AuthError::RefreshTokenValidation
                | AuthError::UserRevoked
                | AuthError::Store(StoreError::RefreshMismatchRevoked)
        )
    }
}

/// Session-backed authentication service.
pub struct AuthService {
    store: Arc<SessionStore>,
    tokens: Arc<TokenService>,
    revoker: Arc<Revoker>,
}

impl AuthService {
    pub fn new(store: Arc<SessionStore>, tokens: Arc<TokenService>, revoker: Arc<Revoker>) -> Self {
        Self {
            store,
            tokens,
            revoker,
        }
    }

    /// Resolve the identity behind a session id, silently rotating the
    /// token pair when the access token has expired.
    pub async fn is_logged_in(
        &self,
        session_id: &str,
        ip: &str,
        ua: &str,
    ) -> Result<AuthContext, AuthError> {
        let user = match self.store.lookup_user_by_sid(session_id).await {
            Ok(user) => user,
            Err(StoreError::NotFound) => return Err(AuthError::NotAuthenticated),
            Err(e) => return Err(e.into()),
        };

        match self.store.get_access(&user, session_id).await {
            Ok(access) => match self.tokens.verify_access(&access, ip, ua) {
                Ok((username, groups)) => {
                    return Ok(AuthContext {
                        username,
                        session_id: session_id.to_string(),
                        groups,
                    })
                }
                Err(TokenError::Expired) => {
                    debug!("access token expired for session {session_id}; trying refresh");
                }
                Err(e) => {
                    warn!("possible theft: access token rejected for session {session_id}: {e}");
                    return Err(AuthError::AccessTokenValidation);
                }
            },
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let refresh = match self.store.get_refresh(&user, session_id).await {
            Ok(refresh) => refresh,
            Err(StoreError::NotFound) => return Err(AuthError::RefreshTokenNotFound),
            Err(e) => return Err(e.into()),
        };

        let (username, groups) = match self.tokens.verify_refresh(&refresh, ip, ua) {
            Ok(v) => v,
            Err(TokenError::Expired) => return Err(AuthError::RefreshTokenExpired),
            Err(e) => {
                warn!("possible theft: refresh token rejected for session {session_id}: {e}");
                return Err(AuthError::RefreshTokenValidation);
            }
        };

        let new_access = self.tokens.create_access(&username, &groups, ip, ua)?;
        let new_refresh = self.tokens.create_refresh(&username, &groups, ip, ua)?;
        self.store
            .rotate_on_refresh(
                Some(&user),
                session_id,
                &refresh,
                &new_access,
                self.tokens.access_ttl(),
                &new_refresh,
                self.tokens.refresh_ttl(),
            )
            .await?;

        Ok(AuthContext {
            username,
            session_id: session_id.to_string(),
            groups,
        })
    }

    /// Wrap [`Self::is_logged_in`]: when the resolved user sits on the
    /// revoke list, the session is destroyed, every parked cancel handle is
    /// fired and the caller gets [`AuthError::UserRevoked`].
    pub async fn consume_if_revoked(
        &self,
        session_id: &str,
        ip: &str,
        ua: &str,
    ) -> Result<AuthContext, AuthError> {
        let ctx = self.is_logged_in(session_id, ip, ua).await?;
        if !self.revoker.should_logout(&ctx.username) {
            return Ok(ctx);
        }

        let user = self.store.lookup_user_by_sid(session_id).await?;
        self.store.revoke(&user, session_id).await?;
        if let Some(handles) = self.revoker.take(&ctx.username) {
            for handle in handles {
                handle.cancel();
            }
        }
        warn!("consumed revocation latch for {user}");
        Err(AuthError::UserRevoked)
    }

    /// Mint a fresh token pair, persist the session and return the new
    /// session id.
    pub async fn login(
        &self,
        username: &str,
        groups: &[String],
        ip: &str,
        ua: &str,
    ) -> Result<String, AuthError> {
        let access = self.tokens.create_access(username, groups, ip, ua)?;
        let refresh = self.tokens.create_refresh(username, groups, ip, ua)?;
        let session_id = SessionStore::new_session_id();
        self.store
            .save_session_tokens(
                username,
                &session_id,
                &access,
                &refresh,
                self.tokens.access_ttl(),
                self.tokens.refresh_ttl(),
            )
            .await?;
        Ok(session_id)
    }

    /// Destroy the session behind a session id, returning the owning user.
    pub async fn logout(&self, session_id: &str) -> Result<String, AuthError> {
        let user = self.store.lookup_user_by_sid(session_id).await?;
        self.store.revoke(&user, session_id).await?;
        Ok(user)
    }
}

/// A request is an upgrade when its query string carries both the
/// reconnection token and the skip-frames marker.
pub fn is_upgrade_query(query: Option<&str>) -> bool {
    match query {
        Some(q) => q.contains("reconnectionToken") && q.contains("skipWebSocketFrames"),
        None => false,
    }
}
