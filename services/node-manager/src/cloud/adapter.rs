//! Retrying, rate-limited front for a `CloudDriver`.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use super::{BackoffPolicy, CloudDriver, CloudError, CloudInstance, InstanceId, RateLimiter};
use crate::config::Config;
use crate::size::NodeSize;

// =============================================================================
// Cancellation
// =============================================================================

/// Stops a caller from issuing further provider calls.
///
/// Cancellation is only observed before a call is issued and while waiting
/// between retries. A call already on the wire always runs to completion so
/// its outcome can be recorded.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    first: Option<watch::Receiver<bool>>,
    second: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self::default()
    }

    /// Fire when `rx` becomes true.
    pub fn from_watch(rx: watch::Receiver<bool>) -> Self {
        Self {
            first: Some(rx),
            second: None,
        }
    }

    /// Also fire when `rx` becomes true.
    pub fn or(mut self, rx: watch::Receiver<bool>) -> Self {
        if self.first.is_none() {
            self.first = Some(rx);
        } else {
            self.second = Some(rx);
        }
        self
    }

    pub fn is_cancelled(&self) -> bool {
        [&self.first, &self.second]
            .into_iter()
            .flatten()
            .any(|rx| *rx.borrow())
    }

    /// Resolves once any source is true.
    pub async fn cancelled(&mut self) {
        tokio::select! {
            _ = fired(self.first.as_mut()) => {}
            _ = fired(self.second.as_mut()) => {}
        }
    }
}

/// Pending forever unless `rx` turns true. A dropped sender never fires.
async fn fired(rx: Option<&mut watch::Receiver<bool>>) {
    if let Some(rx) = rx {
        if rx.wait_for(|v| *v).await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}

// =============================================================================
// Adapter
// =============================================================================

/// Shared entry point for every provider call in the process.
pub struct CloudAdapter {
    driver: Arc<dyn CloudDriver>,
    limiter: RateLimiter,
    backoff: BackoffPolicy,
    max_retries: u32,
}

impl CloudAdapter {
    pub fn new(
        driver: Arc<dyn CloudDriver>,
        limiter: RateLimiter,
        backoff: BackoffPolicy,
        max_retries: u32,
    ) -> Self {
        Self {
            driver,
            limiter,
            backoff,
            max_retries,
        }
    }

    pub fn from_config(driver: Arc<dyn CloudDriver>, config: &Config) -> Self {
        Self::new(
            driver,
            RateLimiter::from_config(&config.rate_limit),
            BackoffPolicy::from(&config.backoff),
            config.backoff.max_retries,
        )
    }

    pub fn driver_name(&self) -> &str {
        self.driver.name()
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// List every instance visible to our credentials.
    pub async fn list(&self, cancel: &mut CancelSignal) -> Result<Vec<CloudInstance>, CloudError> {
        self.call("list", cancel, || self.driver.list()).await
    }

    /// Create one instance.
    pub async fn create(
        &self,
        size: &NodeSize,
        tags: &BTreeMap<String, String>,
        cancel: &mut CancelSignal,
    ) -> Result<InstanceId, CloudError> {
        self.call("create", cancel, || self.driver.create(size, tags))
            .await
    }

    /// Destroy an instance. An instance that is already gone counts as
    /// destroyed, since an earlier attempt may have succeeded without us
    /// seeing the acknowledgement.
    pub async fn destroy(&self, id: &InstanceId, cancel: &mut CancelSignal) -> Result<(), CloudError> {
        match self.call("destroy", cancel, || self.driver.destroy(id)).await {
            Err(CloudError::NotFound(_)) => {
                debug!(instance_id = %id, "destroy of absent instance treated as success");
                Ok(())
            }
            other => other,
        }
    }

    /// Single destroy attempt that ignores cancellation. Used for cleanup on
    /// the way to FAILED, where the outcome does not change the result.
    pub async fn destroy_best_effort(&self, id: &InstanceId) -> Result<(), CloudError> {
        self.limiter.acquire().await;
        match self.driver.destroy(id).await {
            Ok(()) | Err(CloudError::NotFound(_)) => Ok(()),
            Err(CloudError::RateLimited { retry_after }) => {
                if let Some(pause) = retry_after {
                    self.limiter.penalize(pause).await;
                }
                Err(CloudError::RateLimited { retry_after })
            }
            Err(e) => Err(e),
        }
    }

    async fn call<T, F, Fut>(
        &self,
        op: &'static str,
        cancel: &mut CancelSignal,
        mut attempt_fn: F,
    ) -> Result<T, CloudError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CloudError>>,
    {
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(CloudError::Cancelled);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CloudError::Cancelled),
                _ = self.limiter.acquire() => {}
            }

            let err = match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            if attempt >= self.max_retries {
                warn!(
                    op,
                    driver = self.driver.name(),
                    attempts = attempt + 1,
                    error = %err,
                    "cloud call retries exhausted"
                );
                return Err(CloudError::RetriesExhausted {
                    op,
                    attempts: attempt + 1,
                    last: Box::new(err),
                });
            }

            let mut delay = self.backoff.delay(attempt);
            if let CloudError::RateLimited { retry_after } = &err {
                let pause = retry_after.unwrap_or(delay);
                self.limiter.penalize(pause).await;
                delay = delay.max(pause);
            }

            debug!(
                op,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying cloud call"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CloudError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cloud::{CreateFault, MockCloud};
    use crate::size::tests::size;
    use fleet_id::NodeId;

    fn adapter(mock: Arc<MockCloud>, max_retries: u32) -> CloudAdapter {
        CloudAdapter::new(
            mock,
            RateLimiter::new(1000.0, 100),
            BackoffPolicy {
                base: Duration::from_millis(100),
                max: Duration::from_secs(2),
                jitter: 0.0,
            },
            max_retries,
        )
    }

    fn tags() -> BTreeMap<String, String> {
        crate::cloud::instance_tags("test", NodeId::new(), &size("small", 2, 4096, 0, 0.1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_create_is_retried() {
        let mock = Arc::new(MockCloud::new());
        mock.script_create(CreateFault::Error(CloudError::Transient("503".into())))
            .await;
        mock.script_create(CreateFault::Error(CloudError::Transient("503".into())))
            .await;

        let adapter = adapter(mock.clone(), 4);
        let id = adapter
            .create(&size("small", 2, 4096, 0, 0.1), &tags(), &mut CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(mock.create_calls(), 3);
        assert!(mock.instance(&id).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let mock = Arc::new(MockCloud::new());
        for _ in 0..10 {
            mock.script_create(CreateFault::Error(CloudError::Transient("timeout".into())))
                .await;
        }

        let adapter = adapter(mock.clone(), 2);
        let err = adapter
            .create(&size("small", 2, 4096, 0, 0.1), &tags(), &mut CancelSignal::never())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CloudError::RetriesExhausted { op: "create", attempts: 3, .. }
        ));
        assert_eq!(mock.create_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_is_not_retried() {
        let mock = Arc::new(MockCloud::new());
        mock.script_create(CreateFault::Error(CloudError::Terminal("quota".into())))
            .await;

        let adapter = adapter(mock.clone(), 4);
        let err = adapter
            .create(&size("small", 2, 4096, 0, 0.1), &tags(), &mut CancelSignal::never())
            .await
            .unwrap_err();

        assert!(matches!(err, CloudError::Terminal(_)));
        assert_eq!(mock.create_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_twice_succeeds() {
        let mock = Arc::new(MockCloud::new());
        let adapter = adapter(mock.clone(), 2);
        let id = adapter
            .create(&size("small", 2, 4096, 0, 0.1), &tags(), &mut CancelSignal::never())
            .await
            .unwrap();

        adapter.destroy(&id, &mut CancelSignal::never()).await.unwrap();
        adapter.destroy(&id, &mut CancelSignal::never()).await.unwrap();
        adapter.destroy_best_effort(&id).await.unwrap();
        assert_eq!(mock.destroy_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_issue() {
        let mock = Arc::new(MockCloud::new());
        let adapter = adapter(mock.clone(), 2);
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let err = adapter
            .create(
                &size("small", 2, 4096, 0, 0.1),
                &tags(),
                &mut CancelSignal::from_watch(rx),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CloudError::Cancelled));
        assert_eq!(mock.create_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let mock = Arc::new(MockCloud::new());
        for _ in 0..10 {
            mock.script_create(CreateFault::Error(CloudError::Transient("503".into())))
                .await;
        }
        let adapter = Arc::new(adapter(mock.clone(), 8));
        let (tx, rx) = watch::channel(false);

        let task = {
            let adapter = adapter.clone();
            tokio::spawn(async move {
                adapter
                    .create(
                        &size("small", 2, 4096, 0, 0.1),
                        &tags(),
                        &mut CancelSignal::never().or(rx),
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, CloudError::Cancelled));
        assert_eq!(mock.create_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_honours_retry_after() {
        let mock = Arc::new(MockCloud::new());
        mock.script_create(CreateFault::Error(CloudError::RateLimited {
            retry_after: Some(Duration::from_secs(5)),
        }))
        .await;

        let adapter = adapter(mock.clone(), 2);
        let start = tokio::time::Instant::now();
        adapter
            .create(&size("small", 2, 4096, 0, 0.1), &tags(), &mut CancelSignal::never())
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(mock.create_calls(), 2);
    }
}
