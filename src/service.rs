//! Credential lifecycle orchestration.
//!
//! Registration, confirmation, login, refresh rotation, logout and password
//! reset. Each operation returns a typed [`AuthError`]; the transport layer
//! only maps kinds to status codes.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::clock::SharedClock;
use crate::cooldown::{CooldownDecision, CooldownGate, DEFAULT_COOLDOWN_SECS};
use crate::db::{Database, RotateOutcome, TokenPurpose, User, generate_token};
use crate::error::AuthError;
use crate::jwt::{
    ACCESS_TOKEN_DURATION_SECS, AccessClaims, IssuedToken, JwtConfig,
    REFRESH_TOKEN_DURATION_SECS, VerifyError,
};
use crate::lockout::{AttemptTracker, AttemptVerdict, LockoutPolicy};
use crate::mailer::{
    Mailer, OutgoingEmail, RetryPolicy, confirmation_email, password_reset_email, send_with_retry,
};
use crate::password::{
    hash_password, validate_password_strength, verify_against_dummy, verify_password,
};

const INVALID_CREDENTIALS: &str = "Invalid email or password";
const INVALID_REFRESH_TOKEN: &str = "Invalid or expired refresh token";
const INVALID_CONFIRMATION_TOKEN: &str = "Invalid or expired confirmation token";
const INVALID_RESET_TOKEN: &str = "Invalid or expired reset token";

/// Tunables for the credential flows.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
    pub confirmation_ttl_secs: i64,
    pub reset_ttl_secs: i64,
    pub cooldown_secs: i64,
    pub lockout: LockoutPolicy,
    pub mail_retry: RetryPolicy,
    /// Base URL used in emailed links.
    pub public_url: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            access_ttl_secs: ACCESS_TOKEN_DURATION_SECS,
            refresh_ttl_secs: REFRESH_TOKEN_DURATION_SECS,
            confirmation_ttl_secs: 15 * 60,
            reset_ttl_secs: 30 * 60,
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
            lockout: LockoutPolicy::default(),
            mail_retry: RetryPolicy::default(),
            public_url: "http://localhost:7300".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub role: String,
    pub confirmed: bool,
}

impl From<&User> for UserProfile {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            email: user.email.clone(),
            role: user.role.as_str().to_string(),
            confirmed: user.confirmed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegisterOutcome {
    pub user_id: String,
    pub confirmation_expires_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmOutcome {
    pub user_id: String,
    pub already_confirmed: bool,
}

/// A refresh session handed to the client.
#[derive(Debug, Clone)]
pub struct RefreshGrant {
    pub token: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub access: IssuedToken,
    /// Present only when the client asked to be remembered.
    pub refresh: Option<RefreshGrant>,
    pub user: UserProfile,
}

#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub access: IssuedToken,
    pub refresh: RefreshGrant,
}

#[derive(Clone)]
pub struct CredentialService {
    db: Database,
    jwt: Arc<JwtConfig>,
    mailer: Arc<dyn Mailer>,
    clock: SharedClock,
    settings: Arc<AuthSettings>,
    tracker: AttemptTracker,
    gate: CooldownGate,
}

impl CredentialService {
    pub fn new(
        db: Database,
        jwt: Arc<JwtConfig>,
        mailer: Arc<dyn Mailer>,
        clock: SharedClock,
        settings: AuthSettings,
    ) -> Self {
        let tracker = AttemptTracker::new(db.clone(), settings.lockout, clock.clone());
        let gate = CooldownGate::new(settings.cooldown_secs, clock.clone());
        Self {
            db,
            jwt,
            mailer,
            clock,
            settings: Arc::new(settings),
            tracker,
            gate,
        }
    }

    /// Create an account and send its confirmation email.
    ///
    /// Registering an email that exists but was never confirmed only re-sends
    /// the confirmation, subject to the cooldown. The stored password is kept;
    /// a forgotten one is replaced through the reset flow.
    pub async fn register(
        &self,
        email: &str,
        password: &str,
    ) -> Result<RegisterOutcome, AuthError> {
        let email = normalize_email(email);
        validate_email(&email)?;
        validate_password_strength(password).map_err(AuthError::Validation)?;

        let user_id = match self.db.users().get_by_email(&email).await? {
            Some(user) if user.confirmed => {
                return Err(AuthError::Conflict("Email is already registered".to_string()));
            }
            Some(user) => {
                self.ensure_cooldown(TokenPurpose::Verification, &user.id).await?;
                debug!(user_id = %user.id, "Re-sending confirmation for unconfirmed account");
                user.id
            }
            None => {
                let password_hash = hash_password(password)?;
                let now = self.clock.now();
                match self.db.users().create(&email, &password_hash, now).await {
                    Ok(id) => {
                        info!(user_id = %id, "User registered");
                        id
                    }
                    Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                        return Err(AuthError::Conflict("Email is already registered".to_string()));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let confirmation_expires_at = self.send_confirmation(&user_id, &email).await?;
        Ok(RegisterOutcome {
            user_id,
            confirmation_expires_at,
        })
    }

    /// Consume a confirmation token. Replaying a consumed token is not an error.
    pub async fn confirm_email(&self, token: &str) -> Result<ConfirmOutcome, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::validation("Confirmation token is required"));
        }

        let now = self.clock.now();
        let store = self.db.single_use(TokenPurpose::Verification);
        let record = store
            .find_by_token(token)
            .await?
            .ok_or_else(|| AuthError::NotFound(INVALID_CONFIRMATION_TOKEN.to_string()))?;

        if record.used {
            return Ok(ConfirmOutcome {
                user_id: record.user_id,
                already_confirmed: true,
            });
        }
        if record.is_expired(now) {
            return Err(AuthError::NotFound(INVALID_CONFIRMATION_TOKEN.to_string()));
        }

        if !store.consume_and_confirm(&record.user_id, now).await? {
            // Lost a race with a concurrent confirmation of the same token.
            return Ok(ConfirmOutcome {
                user_id: record.user_id,
                already_confirmed: true,
            });
        }

        info!(user_id = %record.user_id, "Email confirmed");
        Ok(ConfirmOutcome {
            user_id: record.user_id,
            already_confirmed: false,
        })
    }

    /// Send a fresh confirmation email. The cooldown is reported explicitly.
    pub async fn resend_confirmation(&self, email: &str) -> Result<i64, AuthError> {
        let email = normalize_email(email);
        validate_email(&email)?;

        let user = self
            .db
            .users()
            .get_by_email(&email)
            .await?
            .ok_or_else(|| {
                AuthError::NotFound("No account is registered with this email".to_string())
            })?;
        if user.confirmed {
            return Err(AuthError::Conflict("Email is already confirmed".to_string()));
        }

        self.ensure_cooldown(TokenPurpose::Verification, &user.id).await?;
        self.send_confirmation(&user.id, &user.email).await
    }

    /// Password login. Locks are checked before the password is looked at.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        ip: &str,
        remember: bool,
    ) -> Result<LoginOutcome, AuthError> {
        let email = normalize_email(email);
        if email.is_empty() || password.is_empty() {
            return Err(AuthError::validation("Email and password are required"));
        }

        if let Some(retry_after) = self.tracker.check_locks(&email, ip).await? {
            return Err(AuthError::rate_limited(
                retry_after,
                "Too many failed login attempts, try again later",
            ));
        }

        let user = self.db.users().get_by_email(&email).await?;
        let valid = match &user {
            Some(user) => verify_password(password, &user.password_hash).unwrap_or_else(|e| {
                error!(user_id = %user.id, error = %e, "Stored password hash is unreadable");
                false
            }),
            None => {
                verify_against_dummy(password);
                false
            }
        };

        let user = match user {
            Some(user) if valid => user,
            _ => {
                return match self.tracker.register_failed_attempt(&email, ip).await? {
                    AttemptVerdict::UnderThreshold { .. } => {
                        Err(AuthError::Authentication(INVALID_CREDENTIALS.to_string()))
                    }
                    AttemptVerdict::Locked { retry_after_secs } => Err(AuthError::rate_limited(
                        retry_after_secs,
                        "Too many failed login attempts, try again later",
                    )),
                };
            }
        };

        self.tracker.clear_attempts(&email, Some(ip)).await;

        if !user.confirmed {
            return Err(AuthError::Forbidden(
                "Email address has not been confirmed".to_string(),
            ));
        }

        let access = self.issue_access(&user)?;
        let refresh = if remember {
            Some(self.create_session(&user.id).await?)
        } else {
            None
        };

        info!(user_id = %user.id, remember, "User logged in");
        Ok(LoginOutcome {
            access,
            refresh,
            user: UserProfile::from(&user),
        })
    }

    /// Exchange a refresh token for a new pair. Each refresh token works once.
    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshOutcome, AuthError> {
        let refresh_token = refresh_token.trim();
        if refresh_token.is_empty() {
            return Err(AuthError::Authentication(INVALID_REFRESH_TOKEN.to_string()));
        }

        let now = self.clock.now();
        let sessions = self.db.sessions();
        let session = sessions
            .find_active_by_token(refresh_token, now)
            .await?
            .ok_or_else(|| AuthError::Authentication(INVALID_REFRESH_TOKEN.to_string()))?;
        let user = self
            .db
            .users()
            .get_by_id(&session.user_id)
            .await?
            .ok_or_else(|| AuthError::Authentication(INVALID_REFRESH_TOKEN.to_string()))?;

        let new_token = generate_token();
        let expires_at = now + self.settings.refresh_ttl_secs;
        match sessions
            .rotate(&session.id, refresh_token, &new_token, expires_at, now)
            .await?
        {
            RotateOutcome::Rotated => {}
            RotateOutcome::Conflict => {
                warn!(
                    session_id = %session.id,
                    user_id = %user.id,
                    "Refresh token replayed or rotated concurrently"
                );
                return Err(AuthError::Conflict(
                    "Refresh token has already been used".to_string(),
                ));
            }
        }

        let access = self.issue_access(&user)?;
        debug!(session_id = %session.id, user_id = %user.id, "Session rotated");
        Ok(RefreshOutcome {
            access,
            refresh: RefreshGrant {
                token: new_token,
                expires_at,
            },
        })
    }

    /// Verify an access token, including revocation and the session version.
    pub async fn authenticate(&self, token: Option<&str>) -> Result<AccessClaims, AuthError> {
        let claims = self.jwt.verify(token, &self.db.revoked_tokens()).await?;
        let claims = AccessClaims::from_claims(claims)?;

        let user = self.db.users().get_by_id(&claims.sub).await?;
        match user {
            Some(user) if user.session_version == claims.sv => Ok(claims),
            _ => Err(AuthError::InvalidToken(VerifyError::Revoked)),
        }
    }

    /// Revoke the presented access token and, if given, its refresh session.
    pub async fn logout(
        &self,
        claims: &AccessClaims,
        refresh_token: Option<&str>,
    ) -> Result<(), AuthError> {
        let now = self.clock.now();
        self.db
            .revoked_tokens()
            .revoke(&claims.jti, &claims.sub, claims.exp, Some("logout"), now)
            .await?;

        if let Some(refresh_token) = refresh_token.map(str::trim).filter(|t| !t.is_empty()) {
            let sessions = self.db.sessions();
            if let Some(session) = sessions.find_active_by_token(refresh_token, now).await? {
                if session.user_id == claims.sub {
                    sessions.revoke(&session.id, now).await?;
                }
            }
        }

        info!(user_id = %claims.sub, "User logged out");
        Ok(())
    }

    /// Revoke every session and invalidate every access token of the user.
    pub async fn logout_all(&self, claims: &AccessClaims) -> Result<u64, AuthError> {
        let now = self.clock.now();
        let revoked = self.invalidate_everything(&claims.sub, now).await?;

        if let Err(e) = self
            .db
            .revoked_tokens()
            .revoke(&claims.jti, &claims.sub, claims.exp, Some("logout_all"), now)
            .await
        {
            warn!(user_id = %claims.sub, error = %e, "Failed to record revocation");
        }

        info!(user_id = %claims.sub, sessions = revoked, "User logged out everywhere");
        Ok(revoked)
    }

    /// Start a password reset. The outcome never reveals whether the email exists.
    pub async fn request_password_reset(&self, email: &str) -> Result<(), AuthError> {
        let email = normalize_email(email);
        validate_email(&email)?;

        let Some(user) = self.db.users().get_by_email(&email).await? else {
            debug!("Password reset requested for unknown email");
            return Ok(());
        };

        let store = self.db.single_use(TokenPurpose::Reset);
        if let CooldownDecision::Wait { retry_after_secs } =
            self.gate.check_user(&store, &user.id).await?
        {
            debug!(user_id = %user.id, retry_after_secs, "Password reset suppressed by cooldown");
            return Ok(());
        }

        let now = self.clock.now();
        let token = generate_token();
        store
            .issue(&user.id, &token, now + self.settings.reset_ttl_secs, now)
            .await?;

        let message = password_reset_email(
            &user.email,
            &self.settings.public_url,
            &token,
            self.settings.reset_ttl_secs / 60,
        );
        if let Err(e) = self.deliver(&message).await {
            error!(user_id = %user.id, error = %e, "Password reset email failed");
            self.compensate(TokenPurpose::Reset, &user.id).await;
        } else {
            info!(user_id = %user.id, "Password reset email sent");
        }
        Ok(())
    }

    /// Consume a reset token and set a new password.
    pub async fn reset_password(&self, token: &str, new_password: &str) -> Result<(), AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::validation("Reset token is required"));
        }
        validate_password_strength(new_password).map_err(AuthError::Validation)?;

        let now = self.clock.now();
        let store = self.db.single_use(TokenPurpose::Reset);
        let record = match store.find_by_token(token).await? {
            Some(record) if !record.used && !record.is_expired(now) => record,
            _ => return Err(AuthError::Authentication(INVALID_RESET_TOKEN.to_string())),
        };
        let user = self
            .db
            .users()
            .get_by_id(&record.user_id)
            .await?
            .ok_or_else(|| AuthError::Authentication(INVALID_RESET_TOKEN.to_string()))?;

        let password_hash = hash_password(new_password)?;
        let Some(sessions_revoked) = store
            .consume_and_reset(&user.id, &password_hash, now)
            .await?
        else {
            return Err(AuthError::Authentication(INVALID_RESET_TOKEN.to_string()));
        };
        self.tracker.clear_attempts(&user.email, None).await;

        info!(user_id = %user.id, sessions_revoked, "Password reset completed");
        Ok(())
    }

    /// Change the password of an authenticated user.
    pub async fn change_password(
        &self,
        claims: &AccessClaims,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        validate_password_strength(new_password).map_err(AuthError::Validation)?;

        let user = self
            .db
            .users()
            .get_by_id(&claims.sub)
            .await?
            .ok_or_else(|| AuthError::NotFound("User not found".to_string()))?;

        if !verify_password(current_password, &user.password_hash)? {
            return Err(AuthError::Authentication(
                "Current password is incorrect".to_string(),
            ));
        }

        let now = self.clock.now();
        let password_hash = hash_password(new_password)?;
        self.db
            .users()
            .update_password(&user.id, &password_hash, now)
            .await?;
        self.invalidate_everything(&user.id, now).await?;

        info!(user_id = %user.id, "Password changed");
        Ok(())
    }

    pub async fn current_user(&self, claims: &AccessClaims) -> Result<UserProfile, AuthError> {
        let user = self
            .db
            .users()
            .get_by_id(&claims.sub)
            .await?
            .ok_or_else(|| AuthError::NotFound("User not found".to_string()))?;
        Ok(UserProfile::from(&user))
    }

    fn issue_access(&self, user: &User) -> Result<IssuedToken, AuthError> {
        Ok(self.jwt.issue_access_token(
            &user.id,
            &user.email,
            user.role.as_str(),
            user.session_version,
            self.settings.access_ttl_secs,
        )?)
    }

    async fn create_session(&self, user_id: &str) -> Result<RefreshGrant, AuthError> {
        let now = self.clock.now();
        let token = generate_token();
        let expires_at = now + self.settings.refresh_ttl_secs;
        self.db
            .sessions()
            .create(user_id, &token, expires_at, now)
            .await?;
        Ok(RefreshGrant { token, expires_at })
    }

    /// Bump the session version and revoke all refresh sessions.
    async fn invalidate_everything(&self, user_id: &str, now: i64) -> Result<u64, AuthError> {
        let revoked = self.db.sessions().revoke_all_by_user(user_id, now).await?;
        self.db.users().increment_session_version(user_id, now).await?;
        Ok(revoked)
    }

    async fn ensure_cooldown(&self, purpose: TokenPurpose, user_id: &str) -> Result<(), AuthError> {
        let store = self.db.single_use(purpose);
        match self.gate.check_user(&store, user_id).await? {
            CooldownDecision::Ready => Ok(()),
            CooldownDecision::Wait { retry_after_secs } => Err(AuthError::rate_limited(
                retry_after_secs,
                format!(
                    "Please wait {} seconds before requesting another confirmation email",
                    retry_after_secs
                ),
            )),
        }
    }

    /// Issue a confirmation token and mail it. On delivery failure the token
    /// row is deleted so that a retry is not blocked by the cooldown.
    async fn send_confirmation(&self, user_id: &str, email: &str) -> Result<i64, AuthError> {
        let now = self.clock.now();
        let token = generate_token();
        let expires_at = now + self.settings.confirmation_ttl_secs;
        self.db
            .single_use(TokenPurpose::Verification)
            .issue(user_id, &token, expires_at, now)
            .await?;

        let message = confirmation_email(
            email,
            &self.settings.public_url,
            &token,
            self.settings.confirmation_ttl_secs / 60,
        );
        if let Err(e) = self.deliver(&message).await {
            error!(user_id = %user_id, error = %e, "Confirmation email failed");
            self.compensate(TokenPurpose::Verification, user_id).await;
            return Err(AuthError::Dependency(
                "Could not send confirmation email, please try again".to_string(),
            ));
        }

        debug!(user_id = %user_id, "Confirmation email sent");
        Ok(expires_at)
    }

    async fn deliver(&self, message: &OutgoingEmail) -> Result<(), crate::mailer::MailError> {
        send_with_retry(self.mailer.as_ref(), message, self.settings.mail_retry).await
    }

    async fn compensate(&self, purpose: TokenPurpose, user_id: &str) {
        if let Err(e) = self.db.single_use(purpose).delete(user_id).await {
            error!(
                user_id = %user_id,
                purpose = purpose.as_str(),
                error = %e,
                "Failed to delete undelivered token"
            );
        }
    }
}

/// Trim and lower-case an email address for use as a lookup key.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic shape check: one `@`, non-empty local part, dotted domain, no spaces.
pub fn validate_email(email: &str) -> Result<(), AuthError> {
    let invalid = || AuthError::validation("Invalid email address");
    if email.is_empty() || email.len() > 254 || email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty()
        || domain.contains('@')
        || !domain.contains('.')
        || domain.starts_with('.')
        || domain.ends_with('.')
    {
        return Err(invalid());
    }
    Ok(())
}
