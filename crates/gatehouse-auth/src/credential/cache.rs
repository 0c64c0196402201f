//! Per-audience credential cache with single-flight refresh.
//!
//! Reads are lock-free while the cached credential is fresh. When it is
//! missing or inside the refresh margin, the first caller installs a shared
//! mint future and every concurrent caller for the same audience awaits that
//! same future. The mint runs as its own task, so it completes even if every
//! waiter goes away.
//! A failed mint is reported to everyone joined on it and leaves the
//! previous entry untouched, so the next caller simply tries again.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use time::OffsetDateTime;

use super::{CredentialError, CredentialMinter, ServiceCredential};

/// Default time before expiry at which a credential is refreshed.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Default upper bound on a single mint.
pub const DEFAULT_MINT_TIMEOUT: Duration = Duration::from_secs(10);

type MintFuture = Shared<BoxFuture<'static, Result<Arc<ServiceCredential>, CredentialError>>>;

#[derive(Default)]
struct AudienceEntry {
    current: ArcSwapOption<ServiceCredential>,
    in_flight: Mutex<Option<MintFuture>>,
}

impl AudienceEntry {
    fn fresh(&self, margin: Duration) -> Option<Arc<ServiceCredential>> {
        self.current
            .load_full()
            .filter(|cred| cred.is_fresh(OffsetDateTime::now_utc(), margin))
    }
}

/// Caches one service credential per audience.
pub struct ServiceCredentialCache {
    minter: Arc<dyn CredentialMinter>,
    entries: DashMap<String, Arc<AudienceEntry>>,
    refresh_margin: Duration,
    mint_timeout: Duration,
}

impl ServiceCredentialCache {
    /// Creates a cache backed by `minter` with default margin and timeout.
    #[must_use]
    pub fn new(minter: Arc<dyn CredentialMinter>) -> Self {
        Self {
            minter,
            entries: DashMap::new(),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            mint_timeout: DEFAULT_MINT_TIMEOUT,
        }
    }

    /// Sets how long before expiry a credential stops being served from cache.
    #[must_use]
    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    /// Sets the upper bound on a single mint.
    #[must_use]
    pub fn with_mint_timeout(mut self, timeout: Duration) -> Self {
        self.mint_timeout = timeout;
        self
    }

    /// Returns a credential for `audience` that is valid for at least the refresh margin.
    ///
    /// At most one mint per audience is in flight at any time.
    ///
    /// # Errors
    /// Returns the mint failure, or [`CredentialError::Timeout`] if minting exceeded the timeout.
    pub async fn get(&self, audience: &str) -> Result<Arc<ServiceCredential>, CredentialError> {
        let entry = self.entry(audience);

        if let Some(cred) = entry.fresh(self.refresh_margin) {
            return Ok(cred);
        }

        let mint = {
            let mut slot = entry.in_flight.lock();
            // Another caller may have finished a mint while we waited for the lock.
            if let Some(cred) = entry.fresh(self.refresh_margin) {
                return Ok(cred);
            }
            match slot.as_ref() {
                Some(existing) => {
                    tracing::debug!(audience, "Joining in-flight credential mint");
                    existing.clone()
                }
                None => {
                    let fut = self.start_mint(audience, Arc::clone(&entry));
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };

        mint.await
    }

    /// Returns the cached credential for `audience` without minting, fresh or not.
    #[must_use]
    pub fn cached(&self, audience: &str) -> Option<Arc<ServiceCredential>> {
        self.entries
            .get(audience)
            .and_then(|entry| entry.current.load_full())
    }

    fn entry(&self, audience: &str) -> Arc<AudienceEntry> {
        if let Some(entry) = self.entries.get(audience) {
            return Arc::clone(entry.value());
        }
        Arc::clone(
            self.entries
                .entry(audience.to_string())
                .or_default()
                .value(),
        )
    }

    fn start_mint(&self, audience: &str, entry: Arc<AudienceEntry>) -> MintFuture {
        let minter = Arc::clone(&self.minter);
        let audience = audience.to_string();
        let timeout = self.mint_timeout;

        tracing::debug!(audience = %audience, "Minting service credential");

        let task_entry = Arc::clone(&entry);
        let task = tokio::spawn(async move {
            let entry = task_entry;
            let result = match tokio::time::timeout(timeout, minter.mint(&audience)).await {
                Ok(Ok(cred)) => {
                    let cred = Arc::new(cred);
                    entry.current.store(Some(Arc::clone(&cred)));
                    tracing::info!(
                        audience = %audience,
                        expires_at = %cred.expires_at(),
                        "Service credential refreshed"
                    );
                    Ok(cred)
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        audience = %audience,
                        error = %e,
                        "Service credential mint failed"
                    );
                    Err(e)
                }
                Err(_) => {
                    tracing::warn!(
                        audience = %audience,
                        ?timeout,
                        "Service credential mint timed out"
                    );
                    Err(CredentialError::Timeout(timeout))
                }
            };
            entry.in_flight.lock().take();
            result
        });

        async move {
            task.await.unwrap_or_else(|e| {
                entry.in_flight.lock().take();
                Err(CredentialError::Mint(format!("credential mint task failed: {e}")))
            })
        }
        .boxed()
        .shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingMinter {
        calls: AtomicUsize,
        delay: Duration,
        lifetime: Duration,
        fail_first: usize,
    }

    impl CountingMinter {
        fn new(delay: Duration, lifetime: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
                lifetime,
                fail_first: 0,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CredentialMinter for CountingMinter {
        async fn mint(&self, audience: &str) -> Result<ServiceCredential, CredentialError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if n <= self.fail_first {
                return Err(CredentialError::Mint("issuer unavailable".to_string()));
            }
            Ok(ServiceCredential::new(
                format!("token-{n}"),
                audience,
                OffsetDateTime::now_utc() + self.lifetime,
            ))
        }
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn test_fresh_credential_is_reused() {
        let minter = Arc::new(CountingMinter::new(Duration::ZERO, HOUR));
        let cache = ServiceCredentialCache::new(minter.clone());

        let first = cache.get("https://hello.internal").await.unwrap();
        let second = cache.get("https://hello.internal").await.unwrap();

        assert_eq!(first.token(), "token-1");
        assert_eq!(second.token(), "token-1");
        assert_eq!(minter.calls(), 1);
        assert!(cache.cached("https://hello.internal").is_some());
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_mint() {
        let minter = Arc::new(CountingMinter::new(Duration::from_millis(100), HOUR));
        let cache = Arc::new(ServiceCredentialCache::new(minter.clone()));

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get("aud").await })
            })
            .collect();

        for task in tasks {
            let cred = task.await.unwrap().unwrap();
            assert_eq!(cred.token(), "token-1");
        }
        assert_eq!(minter.calls(), 1);
    }

    #[tokio::test]
    async fn test_credential_inside_margin_is_refreshed() {
        // Lifetime shorter than the margin: never fresh once stored.
        let minter = Arc::new(CountingMinter::new(Duration::ZERO, Duration::from_secs(30)));
        let cache = ServiceCredentialCache::new(minter.clone())
            .with_refresh_margin(Duration::from_secs(60));

        assert_eq!(cache.get("aud").await.unwrap().token(), "token-1");
        assert_eq!(cache.get("aud").await.unwrap().token(), "token-2");
        assert_eq!(minter.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_mint_does_not_poison_cache() {
        let minter = Arc::new(CountingMinter {
            fail_first: 1,
            ..CountingMinter::new(Duration::ZERO, HOUR)
        });
        let cache = ServiceCredentialCache::new(minter.clone());

        let err = cache.get("aud").await.unwrap_err();
        assert_eq!(err, CredentialError::Mint("issuer unavailable".to_string()));
        assert!(cache.cached("aud").is_none());

        let cred = cache.get("aud").await.unwrap();
        assert_eq!(cred.token(), "token-2");
        assert_eq!(minter.calls(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_waiters_all_see_failure() {
        let minter = Arc::new(CountingMinter {
            fail_first: 1,
            ..CountingMinter::new(Duration::from_millis(100), HOUR)
        });
        let cache = Arc::new(ServiceCredentialCache::new(minter.clone()));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get("aud").await })
            })
            .collect();

        for task in tasks {
            assert!(task.await.unwrap().is_err());
        }
        assert_eq!(minter.calls(), 1);
    }

    #[tokio::test]
    async fn test_mint_timeout() {
        let minter = Arc::new(CountingMinter::new(Duration::from_secs(5), HOUR));
        let cache = ServiceCredentialCache::new(minter.clone())
            .with_mint_timeout(Duration::from_millis(50));

        let err = cache.get("aud").await.unwrap_err();
        assert_eq!(err, CredentialError::Timeout(Duration::from_millis(50)));
        assert!(cache.cached("aud").is_none());
    }

    #[tokio::test]
    async fn test_audiences_are_independent() {
        let minter = Arc::new(CountingMinter::new(Duration::ZERO, HOUR));
        let cache = ServiceCredentialCache::new(minter.clone());

        let a = cache.get("https://a.internal").await.unwrap();
        let b = cache.get("https://b.internal").await.unwrap();

        assert_eq!(a.audience(), "https://a.internal");
        assert_eq!(b.audience(), "https://b.internal");
        assert_ne!(a.token(), b.token());
        assert_eq!(minter.calls(), 2);
    }

    /// Slow only for one audience.
    struct SlowAudienceMinter {
        slow: &'static str,
    }

    #[async_trait]
    impl CredentialMinter for SlowAudienceMinter {
        async fn mint(&self, audience: &str) -> Result<ServiceCredential, CredentialError> {
            if audience == self.slow {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Ok(ServiceCredential::new(
                format!("token-{audience}"),
                audience,
                OffsetDateTime::now_utc() + HOUR,
            ))
        }
    }

    #[tokio::test]
    async fn test_slow_audience_does_not_block_others() {
        let cache = Arc::new(ServiceCredentialCache::new(Arc::new(SlowAudienceMinter {
            slow: "a",
        })));

        let slow = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get("a").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        let b = cache.get("b").await.unwrap();
        assert_eq!(b.token(), "token-b");
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(!slow.is_finished());

        assert_eq!(slow.await.unwrap().unwrap().token(), "token-a");
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_cancel_mint() {
        let minter = Arc::new(CountingMinter::new(Duration::from_millis(100), HOUR));
        let cache = Arc::new(ServiceCredentialCache::new(minter.clone()));

        let cancelled = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get("aud").await })
        };
        let survivor = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get("aud").await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancelled.abort();

        let cred = survivor.await.unwrap().unwrap();
        assert_eq!(cred.token(), "token-1");
        assert_eq!(minter.calls(), 1);
    }

    #[tokio::test]
    async fn test_mint_completes_without_waiters() {
        let minter = Arc::new(CountingMinter::new(Duration::from_millis(50), HOUR));
        let cache = ServiceCredentialCache::new(minter.clone());

        let abandoned = tokio::time::timeout(Duration::from_millis(10), cache.get("aud")).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.cached("aud").map(|c| c.token().to_string()).as_deref(), Some("token-1"));
        assert_eq!(cache.get("aud").await.unwrap().token(), "token-1");
        assert_eq!(minter.calls(), 1);
    }
}
