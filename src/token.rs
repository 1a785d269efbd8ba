//! Per-account transaction-id source.
//!
//! Every request carries an opaque `x-client-transaction-id` header derived
//! from the HTTP method and URL path. The derivation itself is an external
//! collaborator behind [`TransactionIdFactory`]; this module owns the
//! per-username cache, the three-attempt initialization, and the
//! regenerate-on-404 path. Concurrent refreshes for the same username are
//! deduplicated by a per-entry async mutex.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::Engine;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const INIT_ATTEMPTS: u32 = 3;
const INIT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// A ready generator: stateless once built, one id per (method, path).
pub trait TransactionIdGen: Send + Sync + std::fmt::Debug {
    fn calc(&self, method: &str, path: &str) -> String;
}

/// Builds generators. Construction may require a remote fetch and may fail.
#[async_trait]
pub trait TransactionIdFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn TransactionIdGen>>;
}

type Slot = Arc<Mutex<Option<Arc<dyn TransactionIdGen>>>>;

/// Username-keyed generator cache.
pub struct TokenSource {
    factory: Arc<dyn TransactionIdFactory>,
    entries: Mutex<HashMap<String, Slot>>,
}

impl TokenSource {
    pub fn new(factory: Arc<dyn TransactionIdFactory>) -> Self {
        Self {
            factory,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached generator for `username`, building one if absent.
    /// `fresh` discards the cached state first; callers pass it after a
    /// request came back 404, which signals a stale id.
    ///
    /// Initialization is attempted three times with one-second spacing,
    /// then fails terminally. While one caller is initializing, other
    /// callers for the same username wait on the slot instead of racing a
    /// second build.
    pub async fn get(&self, username: &str, fresh: bool) -> Result<Arc<dyn TransactionIdGen>> {
        let slot = {
            let mut entries = self.entries.lock().await;
            Arc::clone(entries.entry(username.to_string()).or_default())
        };

        let mut guard = slot.lock().await;
        if let Some(existing) = guard.as_ref() {
            if !fresh {
                return Ok(Arc::clone(existing));
            }
            debug!(username, "discarding cached transaction-id generator");
            *guard = None;
        }

        let mut attempt = 0;
        loop {
            match self.factory.create().await {
                Ok(gen) => {
                    *guard = Some(Arc::clone(&gen));
                    return Ok(gen);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= INIT_ATTEMPTS {
                        return Err(anyhow!(
                            "transaction-id generator init failed after {INIT_ATTEMPTS} attempts: {e}"
                        ));
                    }
                    warn!(username, attempt, err = %e, "transaction-id init failed — retrying");
                    tokio::time::sleep(INIT_RETRY_DELAY).await;
                }
            }
        }
    }
}

// ─── Stand-in generator ──────────────────────────────────────────────────────

/// Deterministic placeholder for the real anti-fingerprint derivation:
/// base64(SHA-256(seed · method · path)), truncated to the wire length the
/// platform expects. Real deployments inject their own factory.
#[derive(Debug)]
pub struct SeededTxIdGen {
    seed: [u8; 32],
}

impl TransactionIdGen for SeededTxIdGen {
    fn calc(&self, method: &str, path: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.seed);
        hasher.update(method.as_bytes());
        hasher.update(b"!");
        hasher.update(path.as_bytes());
        let digest = hasher.finalize();
        let mut out = base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest);
        out.truncate(42);
        out
    }
}

pub struct SeededTxIdFactory {
    seed: [u8; 32],
}

impl SeededTxIdFactory {
    pub fn new(seed: [u8; 32]) -> Self {
        Self { seed }
    }
}

impl Default for SeededTxIdFactory {
    fn default() -> Self {
        // Per-process seed: hash of the process id and start instant.
        let mut hasher = Sha256::new();
        hasher.update(std::process::id().to_le_bytes());
        hasher.update(chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0).to_le_bytes());
        Self {
            seed: hasher.finalize().into(),
        }
    }
}

#[async_trait]
impl TransactionIdFactory for SeededTxIdFactory {
    async fn create(&self) -> Result<Arc<dyn TransactionIdGen>> {
        Ok(Arc::new(SeededTxIdGen { seed: self.seed }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyFactory {
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl TransactionIdFactory for FlakyFactory {
        async fn create(&self) -> Result<Arc<dyn TransactionIdGen>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(anyhow!("remote fetch failed"))
            } else {
                Ok(Arc::new(SeededTxIdGen { seed: [7; 32] }))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn caches_generator_per_username() {
        let factory = Arc::new(FlakyFactory {
            fail_first: 0,
            calls: AtomicU32::new(0),
        });
        let source = TokenSource::new(Arc::clone(&factory) as Arc<dyn TransactionIdFactory>);

        source.get("alice", false).await.unwrap();
        source.get("alice", false).await.unwrap();
        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);

        // fresh=true rebuilds.
        source.get("alice", true).await.unwrap();
        assert_eq!(factory.calls.load(Ordering::SeqCst), 2);

        // Other usernames get their own entry.
        source.get("bob", false).await.unwrap();
        assert_eq!(factory.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn init_retries_twice_then_succeeds() {
        let factory = Arc::new(FlakyFactory {
            fail_first: 2,
            calls: AtomicU32::new(0),
        });
        let source = TokenSource::new(Arc::clone(&factory) as Arc<dyn TransactionIdFactory>);
        source.get("alice", false).await.unwrap();
        assert_eq!(factory.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn init_fails_terminally_after_three_attempts() {
        let factory = Arc::new(FlakyFactory {
            fail_first: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let source = TokenSource::new(Arc::clone(&factory) as Arc<dyn TransactionIdFactory>);
        let err = source.get("alice", false).await.unwrap_err();
        assert!(err.to_string().contains("after 3 attempts"));
        assert_eq!(factory.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn seeded_gen_is_deterministic_per_method_and_path() {
        let gen = SeededTxIdGen { seed: [1; 32] };
        assert_eq!(gen.calc("GET", "/i/api/x"), gen.calc("GET", "/i/api/x"));
        assert_ne!(gen.calc("GET", "/i/api/x"), gen.calc("POST", "/i/api/x"));
        assert_ne!(gen.calc("GET", "/i/api/x"), gen.calc("GET", "/i/api/y"));
        assert_eq!(gen.calc("GET", "/i/api/x").len(), 42);
    }
}
