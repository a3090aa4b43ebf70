//! Resource governor
//!
//! Every adapter call runs under the `query_timeout` deadline and the
//! caller's cancellation token; every response is built against a byte
//! budget derived from `max_response_size`.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use quarry_core::metrics::{QUERY_TIMEOUTS, RESPONSES_TOO_LARGE};
use quarry_core::{CanonicalError, EngineResult, Provider, ResourceLimits, RowBudget, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Applies the process-wide [`ResourceLimits`] to individual operations.
#[derive(Debug, Clone, Copy)]
pub struct ResourceGovernor {
    limits: ResourceLimits,
}

impl ResourceGovernor {
    pub fn new(limits: ResourceLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Fresh response budget for one request.
    pub fn budget(&self) -> ResponseBudget {
        ResponseBudget::new(self.limits.max_response_size)
    }

    /// Runs one adapter call under the statement deadline.
    ///
    /// The call's future is dropped as soon as the deadline passes or the
    /// token fires; drivers that support cancellation abort the statement
    /// on drop, and the connection goes back to the pool either way.
    ///
    /// # Errors
    ///
    /// `SocketTimeout` after `query_timeout`, `Cancelled` when `cancel`
    /// fires first, otherwise whatever `call` returns.
    pub async fn run<T, F>(
        &self,
        provider: Provider,
        cancel: &CancellationToken,
        call: F,
    ) -> EngineResult<T>
    where
        F: Future<Output = EngineResult<T>>,
    {
        let timeout = self.limits.query_timeout;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CanonicalError::cancelled()),
            outcome = tokio::time::timeout(timeout, call) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    QUERY_TIMEOUTS.with_label_values(&[provider.as_str()]).inc();
                    warn!(
                        provider = provider.as_str(),
                        timeout_ms = timeout.as_millis() as u64,
                        "Adapter call exceeded query timeout"
                    );
                    Err(CanonicalError::query_timeout(timeout))
                }
            },
        }
    }
}

/// Running byte counter for one response.
///
/// Shared by every node of a request (join fan-out branches charge it
/// concurrently), so it counts with an atomic.
#[derive(Debug)]
pub struct ResponseBudget {
    limit: u64,
    used: AtomicU64,
}

impl ResponseBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            used: AtomicU64::new(0),
        }
    }

    /// Adds `bytes` to the running total.
    ///
    /// # Errors
    ///
    /// `ResponseTooLarge` once the total exceeds the limit; the caller must
    /// stop buffering.
    pub fn charge(&self, bytes: u64) -> EngineResult<()> {
        let used = self.used.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if used > self.limit {
            RESPONSES_TOO_LARGE.inc();
            return Err(CanonicalError::response_too_large(self.limit));
        }
        Ok(())
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}

impl RowBudget for ResponseBudget {
    fn charge_row(&self, row: &[Value]) -> EngineResult<()> {
        self.charge(row.iter().map(Value::estimated_size).sum::<usize>() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::ErrorKind;
    use std::time::Duration;

    fn governor(query_timeout: Duration) -> ResourceGovernor {
        ResourceGovernor::new(ResourceLimits {
            query_timeout,
            ..ResourceLimits::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_times_out() {
        let governor = governor(Duration::from_millis(50));
        let cancel = CancellationToken::new();
        let err = governor
            .run(Provider::Sqlite, &cancel, async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, CanonicalError>(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SocketTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_wins_over_pending_call() {
        let governor = governor(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = governor
            .run(Provider::Postgres, &cancel, async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, CanonicalError>(1)
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_fast_call_passes_through() {
        let governor = governor(Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let value = governor
            .run(Provider::Mysql, &cancel, async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_budget_rejects_overflow() {
        let budget = ResponseBudget::new(100);
        budget.charge(60).unwrap();
        budget.charge(40).unwrap();
        let err = budget.charge(1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ResponseTooLarge);
        assert_eq!(budget.used(), 101);
    }

    #[test]
    fn test_rows_are_charged_by_estimated_size() {
        let budget = ResponseBudget::new(1_000);
        let row = vec![Value::Int(1), Value::from("x".repeat(100))];
        budget.charge_row(&row).unwrap();
        let expected: usize = row.iter().map(Value::estimated_size).sum();
        assert_eq!(budget.used(), expected as u64);
        let err = (0..20)
            .map(|_| budget.charge_row(&row))
            .find_map(Result::err)
            .unwrap();
        assert_eq!(err.kind, ErrorKind::ResponseTooLarge);
    }
}
