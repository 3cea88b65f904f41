//! Volatile table of in-flight authorization attempts.
//!
//! Each attempt is keyed by its `state` token and is consumed at most once:
//! `take` removes and returns it in one step, so two callbacks racing on the
//! same state cannot both observe it. A background sweeper drops attempts
//! that were never completed.

use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A pending Authorization-Code-with-PKCE attempt.
#[derive(Clone)]
pub struct PkceAttempt {
    pub provider_slug: String,
    pub code_verifier: String,
    pub nonce: String,
    pub redirect_uri: String,
    pub created_at: Instant,
}

impl PkceAttempt {
    pub fn new(provider_slug: String, code_verifier: String, nonce: String, redirect_uri: String) -> Self {
        Self {
            provider_slug,
            code_verifier,
            nonce,
            redirect_uri,
            created_at: Instant::now(),
        }
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() >= ttl
    }
}

impl std::fmt::Debug for PkceAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkceAttempt")
            .field("provider_slug", &self.provider_slug)
            .field("redirect_uri", &self.redirect_uri)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

pub struct PkceStateStore {
    attempts: Arc<DashMap<String, PkceAttempt>>,
    ttl: Duration,
    shutdown_token: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl PkceStateStore {
    /// A store without a background sweeper. Expired attempts are still
    /// rejected on `take`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            attempts: Arc::new(DashMap::new()),
            ttl,
            shutdown_token: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// Create the store and spawn its sweeper on the current tokio runtime.
    pub fn start(ttl: Duration, interval: Duration) -> Self {
        let store = Self::new(ttl);
        let attempts = store.attempts.clone();
        let shutdown = store.shutdown_token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("PKCE sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let swept = sweep(&attempts, ttl);
                        if swept > 0 {
                            tracing::debug!(swept = swept, "Expired authorization attempts dropped");
                        }
                    }
                }
            }
        });

        if let Ok(mut sweeper) = store.sweeper.lock() {
            *sweeper = Some(handle);
        }
        tracing::info!(
            ttl_seconds = ttl.as_secs(),
            interval_seconds = interval.as_secs(),
            "PKCE state store started"
        );
        store
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn insert(&self, state: String, attempt: PkceAttempt) {
        self.attempts.insert(state, attempt);
    }

    /// Remove and return the attempt for `state`.
    pub fn take(&self, state: &str) -> Option<PkceAttempt> {
        self.attempts.remove(state).map(|(_, attempt)| attempt)
    }

    /// Drop every attempt older than the TTL; returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        sweep(&self.attempts, self.ttl)
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    /// Stop the sweeper and wait for it to exit.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        let handle = self.sweeper.lock().ok().and_then(|mut s| s.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "PKCE sweeper task ended abnormally");
            }
        }
    }
}

impl Drop for PkceStateStore {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

fn sweep(attempts: &DashMap<String, PkceAttempt>, ttl: Duration) -> usize {
    let before = attempts.len();
    attempts.retain(|_, attempt| !attempt.is_expired(ttl));
    before.saturating_sub(attempts.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt() -> PkceAttempt {
        PkceAttempt::new(
            "acme".to_string(),
            "verifier".to_string(),
            "nonce".to_string(),
            "https://app.example.com/cb".to_string(),
        )
    }

    #[test]
    fn test_take_is_single_use() {
        let store = PkceStateStore::new(Duration::from_secs(60));
        store.insert("s1".to_string(), attempt());
        assert!(store.take("s1").is_some());
        assert!(store.take("s1").is_none());
    }

    #[test]
    fn test_sweep_drops_only_expired() {
        let store = PkceStateStore::new(Duration::from_millis(50));
        store.insert("old".to_string(), attempt());
        std::thread::sleep(Duration::from_millis(80));
        store.insert("fresh".to_string(), attempt());

        assert_eq!(store.sweep_expired(), 1);
        assert!(store.take("fresh").is_some());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_background_sweeper_and_shutdown() {
        let store = PkceStateStore::start(Duration::from_millis(20), Duration::from_millis(10));
        store.insert("s".to_string(), attempt());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.is_empty());
        store.shutdown().await;
        assert!(store.sweeper.lock().unwrap().is_none());
    }
}
