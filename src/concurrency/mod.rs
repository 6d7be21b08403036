//! Retry and locking primitives shared by the inventory services.
//!
//! * optimistic retry with exponential backoff ([`ConcurrencyHelper::with_optimistic_lock`])
//! * named distributed mutex with TTL and wait timeout ([`ConcurrencyHelper::with_distributed_lock`])
//! * canonical ascending-id ordering ([`with_deadlock_prevention`])
//! * row locks and compare-and-swap updates ([`with_pessimistic_lock`], [`conditional_update`])
//! * atomic counters ([`ConcurrencyHelper::atomic_increment`])

pub mod lock;
pub mod ordering;
pub mod retry;
pub mod row_lock;

use futures::FutureExt;
use metrics::{counter, histogram};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ConcurrencyConfig;
use crate::errors::ServiceError;

pub use lock::{InMemoryLockBackend, LockBackend, RedisLockBackend};
pub use ordering::{canonical_order, with_deadlock_prevention};
pub use retry::{with_retry, ConflictRetryPolicy, RetryConfig, RetryPolicy};
pub use row_lock::{conditional_update, lock_rows, with_pessimistic_lock};

/// TTL and acquisition timeout of a distributed lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub ttl: Duration,
    pub wait_timeout: Duration,
}

impl From<&ConcurrencyConfig> for LockOptions {
    fn from(cfg: &ConcurrencyConfig) -> Self {
        Self {
            ttl: cfg.lock_ttl(),
            wait_timeout: cfg.lock_wait_timeout(),
        }
    }
}

#[derive(Clone)]
pub struct ConcurrencyHelper {
    backend: Arc<dyn LockBackend>,
    retry: RetryConfig,
    lock_options: LockOptions,
}

impl std::fmt::Debug for ConcurrencyHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyHelper")
            .field("retry", &self.retry)
            .field("lock_options", &self.lock_options)
            .finish()
    }
}

impl ConcurrencyHelper {
    pub fn new(backend: Arc<dyn LockBackend>, config: &ConcurrencyConfig) -> Self {
        Self {
            backend,
            retry: RetryConfig::from(config),
            lock_options: LockOptions::from(config),
        }
    }

    /// Helper backed by an in-process lock table.
    pub fn in_memory(config: &ConcurrencyConfig) -> Self {
        Self::new(Arc::new(InMemoryLockBackend::new()), config)
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Lock options from configuration, used when callers pass none.
    pub fn lock_options(&self) -> LockOptions {
        self.lock_options
    }

    /// Wait bound shared by distributed locks and database row locks.
    pub fn lock_wait_timeout(&self) -> Duration {
        self.lock_options.wait_timeout
    }

    /// Runs `op`, retrying conflict-class failures with exponential backoff.
    /// After the configured attempts the last error is returned unchanged.
    pub async fn with_optimistic_lock<F, Fut, T>(&self, op: F) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        with_retry(&self.retry, ConflictRetryPolicy, op).await
    }

    /// Same as [`Self::with_optimistic_lock`] with an explicit attempt bound.
    pub async fn with_optimistic_lock_attempts<F, Fut, T>(
        &self,
        max_attempts: u32,
        op: F,
    ) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let config = RetryConfig {
            max_attempts: max_attempts.max(1),
            ..self.retry.clone()
        };
        with_retry(&config, ConflictRetryPolicy, op).await
    }

    /// Runs `op` while holding the named mutex `key`.
    ///
    /// Acquisition polls on the shared backoff curve until
    /// `options.wait_timeout` elapses, then fails with
    /// `LockAcquisitionTimeout`. The lock is released on success, on error and
    /// when `op` panics; the TTL covers a crashed process.
    pub async fn with_distributed_lock<F, Fut, T>(
        &self,
        key: &str,
        options: LockOptions,
        op: F,
    ) -> Result<T, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let token = Uuid::new_v4().to_string();
        let started = Instant::now();
        self.acquire(key, &token, options).await?;
        histogram!("lock.wait", started.elapsed());
        debug!(key, "Distributed lock acquired");

        let outcome = AssertUnwindSafe(op()).catch_unwind().await;

        match self.backend.release(key, &token).await {
            Ok(true) => debug!(key, "Distributed lock released"),
            Ok(false) => warn!(key, "Distributed lock expired before release"),
            Err(e) => warn!(key, error = %e, "Failed to release distributed lock"),
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn acquire(
        &self,
        key: &str,
        token: &str,
        options: LockOptions,
    ) -> Result<(), ServiceError> {
        let deadline = Instant::now() + options.wait_timeout;
        let mut attempt = 0;

        loop {
            if self.backend.try_acquire(key, token, options.ttl).await? {
                return Ok(());
            }

            attempt += 1;
            let now = Instant::now();
            if now >= deadline {
                counter!("lock.timeout", 1);
                warn!(key, attempts = attempt, "Distributed lock not acquired in time");
                return Err(ServiceError::LockAcquisitionTimeout(key.to_string()));
            }
            let delay = self.retry.backoff_delay(attempt).min(deadline - now);
            sleep(delay).await;
        }
    }

    /// Lock-free counter increment for non-transactional tallies.
    pub async fn atomic_increment(&self, key: &str, delta: i64) -> Result<i64, ServiceError> {
        self.backend.increment(key, delta).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> ConcurrencyConfig {
        ConcurrencyConfig {
            max_attempts: 3,
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
            lock_ttl_secs: 5,
            lock_wait_timeout_ms: 100,
        }
    }

    #[tokio::test]
    async fn lock_wait_times_out_while_held() {
        let backend = Arc::new(InMemoryLockBackend::new());
        let helper = ConcurrencyHelper::new(backend.clone(), &fast_config());
        assert!(backend
            .try_acquire("variant:1", "someone-else", Duration::from_secs(5))
            .await
            .unwrap());

        let options = LockOptions {
            ttl: Duration::from_secs(5),
            wait_timeout: Duration::from_millis(50),
        };
        let result = helper
            .with_distributed_lock("variant:1", options, || async { Ok(()) })
            .await;
        assert_matches!(result, Err(ServiceError::LockAcquisitionTimeout(_)));
    }

    #[tokio::test]
    async fn lock_is_released_after_error_and_panic() {
        let backend = Arc::new(InMemoryLockBackend::new());
        let helper = ConcurrencyHelper::new(backend.clone(), &fast_config());
        let options = helper.lock_options();

        let failed: Result<(), ServiceError> = helper
            .with_distributed_lock("k", options, || async {
                Err(ServiceError::ValidationError("boom".into()))
            })
            .await;
        assert!(failed.is_err());
        assert!(!backend.is_held("k"));

        let panicking = AssertUnwindSafe(helper.with_distributed_lock(
            "k",
            options,
            || async {
                if true {
                    panic!("op exploded");
                }
                Ok::<(), ServiceError>(())
            },
        ))
        .catch_unwind()
        .await;
        assert!(panicking.is_err());
        assert!(!backend.is_held("k"));
    }

    #[tokio::test]
    async fn concurrent_holders_are_serialized() {
        let helper = ConcurrencyHelper::in_memory(&ConcurrencyConfig {
            lock_wait_timeout_ms: 2_000,
            ..fast_config()
        });
        let inside = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let helper = helper.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                helper
                    .with_distributed_lock("shared", helper.lock_options(), || async {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        sleep(Duration::from_millis(5)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn optimistic_lock_honours_explicit_attempts() {
        let helper = ConcurrencyHelper::in_memory(&fast_config());
        let calls = AtomicU32::new(0);
        let result: Result<(), ServiceError> = helper
            .with_optimistic_lock_attempts(5, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ServiceError::ConcurrencyConflict("version".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn atomic_increment_delegates_to_backend() {
        let helper = ConcurrencyHelper::in_memory(&fast_config());
        assert_eq!(helper.atomic_increment("tally", 2).await.unwrap(), 2);
        assert_eq!(helper.atomic_increment("tally", 3).await.unwrap(), 5);
    }
}
