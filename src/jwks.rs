//! Public key discovery document and its TTL cache.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::keys::parse_public_pem;

/// Default time a published document stays fresh (5 minutes).
pub const DEFAULT_CACHE_TTL_SECS: i64 = 5 * 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jwk {
    pub kty: String,
    pub alg: String,
    #[serde(rename = "use")]
    pub key_use: String,
    pub kid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
}

impl Jwks {
    /// Build a single-key document from an SPKI PEM.
    ///
    /// A key that cannot be parsed still yields a document, just without
    /// `n`/`e`; holders of the PEM can verify without it.
    pub fn from_public_pem(pem: &str, kid: &str) -> Self {
        let (n, e) = match parse_public_pem(pem) {
            Ok(parts) => (Some(parts.n_b64()), Some(parts.e_b64())),
            Err(err) => {
                warn!(
                    kid = %kid,
                    error = %err,
                    "Failed to parse public key for discovery document"
                );
                (None, None)
            }
        };
        Self {
            keys: vec![Jwk {
                kty: "RSA".to_string(),
                alg: "RS256".to_string(),
                key_use: "sig".to_string(),
                kid: kid.to_string(),
                n,
                e,
            }],
        }
    }

    pub fn find_by_kid(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid == kid)
    }
}

/// Where the public key PEM comes from on each refresh.
#[derive(Debug, Clone)]
pub enum KeySource {
    Inline(String),
    /// Re-read on every refresh so a replaced key file propagates within one TTL.
    File(PathBuf),
}

impl KeySource {
    async fn load(&self) -> std::io::Result<String> {
        match self {
            KeySource::Inline(pem) => Ok(pem.clone()),
            KeySource::File(path) => tokio::fs::read_to_string(path).await,
        }
    }
}

struct CachedDocument {
    document: Arc<Jwks>,
    fetched_at: i64,
}

/// Process-local discovery document cache with get-or-refresh semantics.
pub struct KeyDocumentCache {
    source: KeySource,
    kid: String,
    ttl_secs: i64,
    clock: SharedClock,
    cached: RwLock<Option<CachedDocument>>,
}

impl KeyDocumentCache {
    pub fn new(
        source: KeySource,
        kid: impl Into<String>,
        ttl_secs: i64,
        clock: SharedClock,
    ) -> Self {
        Self {
            source,
            kid: kid.into(),
            ttl_secs,
            clock,
            cached: RwLock::new(None),
        }
    }

    pub fn ttl_secs(&self) -> i64 {
        self.ttl_secs
    }

    /// Return the cached document, rebuilding it once the TTL has passed.
    pub async fn get_or_refresh(&self) -> std::io::Result<Arc<Jwks>> {
        let now = self.clock.now();
        {
            let cached = self.cached.read().await;
            if let Some(entry) = cached.as_ref() {
                if now - entry.fetched_at < self.ttl_secs {
                    return Ok(entry.document.clone());
                }
            }
        }

        let mut cached = self.cached.write().await;
        // Another task may have refreshed while we waited for the write lock.
        if let Some(entry) = cached.as_ref() {
            if now - entry.fetched_at < self.ttl_secs {
                return Ok(entry.document.clone());
            }
        }
        let document = self.build().await?;
        *cached = Some(CachedDocument {
            document: document.clone(),
            fetched_at: now,
        });
        Ok(document)
    }

    /// Rebuild the document regardless of age.
    pub async fn force_refresh(&self) -> std::io::Result<Arc<Jwks>> {
        let document = self.build().await?;
        *self.cached.write().await = Some(CachedDocument {
            document: document.clone(),
            fetched_at: self.clock.now(),
        });
        Ok(document)
    }

    /// When the cached document was last built, if ever.
    pub async fn last_fetched(&self) -> Option<i64> {
        self.cached.read().await.as_ref().map(|c| c.fetched_at)
    }

    async fn build(&self) -> std::io::Result<Arc<Jwks>> {
        let pem = self.source.load().await?;
        debug!(kid = %self.kid, "Building discovery document");
        Ok(Arc::new(Jwks::from_public_pem(&pem, &self.kid)))
    }
}
