//! JWT token generation and validation.
//!
//! Tokens are signed with RS256 when a private key is configured and with
//! HS256 over a shared secret otherwise. Verification fails closed with a
//! small set of reasons and always consults the revocation registry.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::clock::{SharedClock, system_clock};
use crate::db::RevokedTokenStore;

/// Free-form claim set carried by a token.
pub type Claims = serde_json::Map<String, Value>;

/// Access token duration: 15 minutes
pub const ACCESS_TOKEN_DURATION_SECS: i64 = 15 * 60;

/// Refresh session duration: 2 weeks
pub const REFRESH_TOKEN_DURATION_SECS: i64 = 14 * 24 * 60 * 60;

/// Typed view of the claims inside an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject (user id)
    pub sub: String,
    pub email: String,
    /// Flat role string
    pub role: String,
    /// Session version of the user when the token was issued
    pub sv: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// JWT ID, the revocation key
    pub jti: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

impl AccessClaims {
    pub fn from_claims(claims: Claims) -> Result<Self, VerifyError> {
        serde_json::from_value(Value::Object(claims)).map_err(|_| VerifyError::Malformed)
    }

    pub fn into_claims(self) -> Claims {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Claims::new(),
        }
    }
}

/// A freshly signed token.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub jti: String,
    /// Expiration timestamp (Unix seconds)
    pub expires_at: i64,
}

/// Configuration for JWT operations.
#[derive(Clone)]
pub struct JwtConfig {
    algorithm: Algorithm,
    encoding_key: Option<EncodingKey>,
    decoding_key: DecodingKey,
    kid: Option<String>,
    issuer: Option<String>,
    audience: Option<String>,
    clock: SharedClock,
}

impl JwtConfig {
    /// HMAC-SHA256 over a shared secret.
    pub fn hs256(secret: &[u8]) -> Self {
        Self {
            algorithm: Algorithm::HS256,
            encoding_key: Some(EncodingKey::from_secret(secret)),
            decoding_key: DecodingKey::from_secret(secret),
            kid: None,
            issuer: None,
            audience: None,
            clock: system_clock(),
        }
    }

    /// RS256 signing with a PEM private key (PKCS#1 or PKCS#8) and SPKI public key.
    pub fn rs256(private_pem: &[u8], public_pem: &[u8], kid: &str) -> Result<Self, JwtError> {
        let mut config = Self::rs256_verifier(public_pem, kid)?;
        config.encoding_key =
            Some(EncodingKey::from_rsa_pem(private_pem).map_err(JwtError::KeyParse)?);
        Ok(config)
    }

    /// RS256 verification only.
    pub fn rs256_verifier(public_pem: &[u8], kid: &str) -> Result<Self, JwtError> {
        Ok(Self {
            algorithm: Algorithm::RS256,
            encoding_key: None,
            decoding_key: DecodingKey::from_rsa_pem(public_pem).map_err(JwtError::KeyParse)?,
            kid: Some(kid.to_string()),
            issuer: None,
            audience: None,
            clock: system_clock(),
        })
    }

    pub fn with_issuer(mut self, issuer: Option<String>) -> Self {
        self.issuer = issuer;
        self
    }

    pub fn with_audience(mut self, audience: Option<String>) -> Self {
        self.audience = audience;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }

    /// Sign `claims` after appending `exp = now + ttl_secs` and a fresh `jti`.
    pub fn issue(&self, mut claims: Claims, ttl_secs: i64) -> Result<IssuedToken, JwtError> {
        let encoding_key = self.encoding_key.as_ref().ok_or(JwtError::NoSigningKey)?;

        let expires_at = self.clock.now() + ttl_secs;
        let jti = uuid::Uuid::new_v4().to_string();
        claims.insert("exp".to_string(), json!(expires_at));
        claims.insert("jti".to_string(), json!(jti));

        let mut header = Header::new(self.algorithm);
        header.kid = self.kid.clone();

        let token =
            jsonwebtoken::encode(&header, &claims, encoding_key).map_err(JwtError::Encoding)?;

        Ok(IssuedToken {
            token,
            jti,
            expires_at,
        })
    }

    /// Issue an access token for a user.
    pub fn issue_access_token(
        &self,
        user_id: &str,
        email: &str,
        role: &str,
        session_version: i64,
        ttl_secs: i64,
    ) -> Result<IssuedToken, JwtError> {
        let mut claims = Claims::new();
        claims.insert("sub".to_string(), json!(user_id));
        claims.insert("email".to_string(), json!(email));
        claims.insert("role".to_string(), json!(role));
        claims.insert("sv".to_string(), json!(session_version));
        claims.insert("iat".to_string(), json!(self.clock.now()));
        if let Some(iss) = &self.issuer {
            claims.insert("iss".to_string(), json!(iss));
        }
        if let Some(aud) = &self.audience {
            claims.insert("aud".to_string(), json!(aud));
        }
        self.issue(claims, ttl_secs)
    }

    /// Verify a token and check its `jti` against the revocation registry.
    pub async fn verify(
        &self,
        token: Option<&str>,
        revocations: &RevokedTokenStore,
    ) -> Result<Claims, VerifyError> {
        let claims = self.decode(token)?;

        if let Some(jti) = claims.get("jti").and_then(Value::as_str) {
            if revocations.is_revoked(jti).await.map_err(VerifyError::Store)? {
                return Err(VerifyError::Revoked);
            }
        }

        Ok(claims)
    }

    /// Signature, expiry, issuer and audience checks. Does not consult revocations.
    pub(crate) fn decode(&self, token: Option<&str>) -> Result<Claims, VerifyError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(VerifyError::Missing)?;

        let segments: Vec<&str> = token.split('.').collect();
        if segments.len() != 3 || segments.iter().any(|s| s.is_empty()) {
            return Err(VerifyError::Malformed);
        }

        let header = jsonwebtoken::decode_header(token).map_err(|_| VerifyError::Malformed)?;
        if header.alg != self.algorithm {
            return Err(VerifyError::InvalidSignatureOrExp);
        }

        // Expiry is checked below against the injected clock.
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = 0;
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature
                | ErrorKind::InvalidAlgorithm
                | ErrorKind::ExpiredSignature => VerifyError::InvalidSignatureOrExp,
                _ => VerifyError::Malformed,
            })?;
        let claims = data.claims;

        let exp = claims
            .get("exp")
            .and_then(Value::as_i64)
            .ok_or(VerifyError::Malformed)?;
        if self.clock.now() >= exp {
            return Err(VerifyError::InvalidSignatureOrExp);
        }

        if let Some(expected) = &self.issuer {
            if claims.get("iss").and_then(Value::as_str) != Some(expected.as_str()) {
                return Err(VerifyError::BadIssuer);
            }
        }

        if let Some(expected) = &self.audience {
            let matches = match claims.get("aud") {
                Some(Value::String(aud)) => aud == expected,
                Some(Value::Array(auds)) => auds.iter().any(|a| a.as_str() == Some(expected)),
                _ => false,
            };
            if !matches {
                return Err(VerifyError::BadAudience);
            }
        }

        Ok(claims)
    }
}

/// Errors that can occur while issuing a token.
#[derive(Debug)]
pub enum JwtError {
    /// Error encoding the token
    Encoding(jsonwebtoken::errors::Error),
    /// Error parsing key material
    KeyParse(jsonwebtoken::errors::Error),
    /// Only a verification key is configured
    NoSigningKey,
}

impl std::fmt::Display for JwtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JwtError::Encoding(e) => write!(f, "Failed to encode token: {}", e),
            JwtError::KeyParse(e) => write!(f, "Failed to parse key: {}", e),
            JwtError::NoSigningKey => write!(f, "No signing key configured"),
        }
    }
}

impl std::error::Error for JwtError {}

/// Why a token was rejected. Deliberately coarse.
#[derive(Debug)]
pub enum VerifyError {
    Missing,
    Malformed,
    InvalidSignatureOrExp,
    BadIssuer,
    BadAudience,
    Revoked,
    /// The revocation registry could not be read.
    Store(sqlx::Error),
}

impl VerifyError {
    /// Caller-visible reason code. `None` when the failure is ours, not the token's.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            VerifyError::Missing => Some("missing"),
            VerifyError::Malformed => Some("malformed"),
            VerifyError::InvalidSignatureOrExp => Some("invalid_signature_or_exp"),
            VerifyError::BadIssuer => Some("bad_iss"),
            VerifyError::BadAudience => Some("bad_aud"),
            VerifyError::Revoked => Some("revoked"),
            VerifyError::Store(_) => None,
        }
    }
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyError::Store(e) => write!(f, "Failed to check revocation list: {}", e),
            other => write!(f, "Invalid token ({})", other.reason().unwrap_or("invalid")),
        }
    }
}

impl std::error::Error for VerifyError {}
