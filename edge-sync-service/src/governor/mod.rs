//! Failure categorization, retry with backoff and per-device circuit breaking.

pub mod backoff;
pub mod breaker;
pub mod stats;

use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{ErrorCategory, ProtocolError};

pub use backoff::{retry_async, RetryPolicy};
pub use breaker::{Admission, BreakerStatus, CircuitBreakerTable, CircuitState, Transition};
pub use stats::{ErrorStats, ErrorStatsSnapshot};

#[derive(thiserror::Error, Debug)]
pub enum GovernorError {
    #[error("circuit open for device {device_id}, retry in {retry_in:?}")]
    CircuitOpen { device_id: i64, retry_in: Duration },
    #[error("{category} after {attempts} attempt(s): {source}")]
    Failed {
        category: ErrorCategory,
        attempts: u32,
        #[source]
        source: ProtocolError,
    },
}

#[derive(Debug, Clone)]
pub struct GovernorConfig {
    pub retry: RetryPolicy,
    pub breaker_threshold: u32,
    pub breaker_timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct GovernorSnapshot {
    pub errors: ErrorStatsSnapshot,
    pub breakers: Vec<BreakerStatus>,
}

pub struct RetryGovernor {
    policy: RetryPolicy,
    breakers: Mutex<CircuitBreakerTable>,
    stats: Mutex<ErrorStats>,
}

impl RetryGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            policy: config.retry,
            breakers: Mutex::new(CircuitBreakerTable::new(
                config.breaker_threshold,
                config.breaker_timeout,
            )),
            stats: Mutex::new(ErrorStats::default()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn admit(&self, device_id: i64) -> Admission {
        self.breakers.lock().admit(device_id, Instant::now())
    }

    pub fn record_success(&self, device_id: i64) {
        self.breakers.lock().on_success(device_id);
    }

    /// Count the failure and feed the breaker. Returns the breaker transition.
    pub fn record_failure(&self, err: &ProtocolError) -> Transition {
        let category = err.category();
        self.stats.lock().record(err.device_id, category, err.to_string());
        metrics::counter!("device_errors_total", "category" => category.as_str()).increment(1);

        let transition = self.breakers.lock().on_failure(err.device_id, Instant::now());
        match transition {
            Transition::Opened | Transition::Reopened => {
                metrics::counter!("circuit_breaker_opens_total").increment(1);
                tracing::warn!(device_id = err.device_id, category = %category, "circuit breaker opened");
            }
            Transition::None => {}
        }
        transition
    }

    /// Run `op` against a device, retrying retryable failures with backoff
    /// while the device's circuit admits requests.
    pub async fn execute<C, A, T, F>(
        &self,
        device_id: i64,
        client: &mut C,
        arg: &A,
        mut op: F,
    ) -> Result<T, GovernorError>
    where
        C: ?Sized + Send,
        A: ?Sized + Sync,
        F: for<'a> FnMut(&'a mut C, &'a A) -> BoxFuture<'a, Result<T, ProtocolError>>,
    {
        let mut attempts = 0u32;
        loop {
            if let Admission::Rejected { retry_in } = self.admit(device_id) {
                return Err(GovernorError::CircuitOpen { device_id, retry_in });
            }

            attempts += 1;
            match op(&mut *client, arg).await {
                Ok(value) => {
                    self.record_success(device_id);
                    return Ok(value);
                }
                Err(err) => {
                    let category = err.category();
                    let transition = self.record_failure(&err);
                    let retries_used = attempts - 1;

                    if !category.is_retryable()
                        || retries_used >= self.policy.max_retries
                        || transition != Transition::None
                    {
                        tracing::debug!(device_id, attempts, category = %category, error = %err, "giving up");
                        return Err(GovernorError::Failed {
                            category,
                            attempts,
                            source: err,
                        });
                    }

                    let delay = self.policy.delay_for(attempts);
                    tracing::debug!(device_id, attempts, delay_ms = delay.as_millis() as u64, error = %err, "retrying device operation");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub fn reset_device(&self, device_id: i64) {
        self.breakers.lock().reset(device_id);
        tracing::info!(device_id, "circuit breaker reset");
    }

    pub fn circuit_state(&self, device_id: i64) -> CircuitState {
        self.breakers.lock().state(device_id)
    }

    pub fn snapshot(&self) -> GovernorSnapshot {
        GovernorSnapshot {
            errors: self.stats.lock().snapshot(),
            breakers: self.breakers.lock().snapshot(Instant::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Operation, ProtocolErrorKind};

    struct Device {
        calls: u32,
        script: Vec<Option<ProtocolErrorKind>>,
    }

    impl Device {
        fn new(script: Vec<Option<ProtocolErrorKind>>) -> Self {
            Self { calls: 0, script }
        }

        async fn read(&mut self, points: &[u16]) -> Result<Vec<f64>, ProtocolError> {
            let step = self.calls as usize;
            self.calls += 1;
            match self.script.get_mut(step).and_then(Option::take) {
                Some(kind) => Err(ProtocolError::new(1, Operation::Read, kind)),
                None => Ok(points.iter().map(|p| *p as f64).collect()),
            }
        }
    }

    fn governor(max_retries: u32, threshold: u32) -> RetryGovernor {
        RetryGovernor::new(GovernorConfig {
            retry: RetryPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                multiplier: 2.0,
                jitter: false,
            },
            breaker_threshold: threshold,
            breaker_timeout: Duration::from_secs(60),
        })
    }

    fn timeout() -> Option<ProtocolErrorKind> {
        Some(ProtocolErrorKind::Timeout(Duration::from_millis(5)))
    }

    #[tokio::test]
    async fn retryable_failures_are_retried_until_success() {
        let gov = governor(3, 10);
        let mut device = Device::new(vec![timeout(), timeout(), None]);

        let values = gov
            .execute(1, &mut device, &[4u16, 5][..], |d, p| Box::pin(d.read(p)))
            .await
            .unwrap();

        assert_eq!(values, vec![4.0, 5.0]);
        assert_eq!(device.calls, 3);
        assert_eq!(gov.snapshot().errors.total, 2);
        assert_eq!(gov.circuit_state(1), CircuitState::default());
    }

    #[tokio::test]
    async fn decode_errors_are_not_retried() {
        let gov = governor(3, 10);
        let mut device = Device::new(vec![Some(ProtocolErrorKind::Decode {
            reason: "short".into(),
            raw: "00".into(),
        })]);

        let err = gov
            .execute(1, &mut device, &[1u16][..], |d, p| Box::pin(d.read(p)))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            GovernorError::Failed {
                category: ErrorCategory::ProtocolDecode,
                attempts: 1,
                ..
            }
        ));
        assert_eq!(device.calls, 1);
    }

    #[tokio::test]
    async fn open_circuit_does_not_invoke_the_device() {
        let gov = governor(0, 2);
        let mut device = Device::new(vec![timeout(), timeout(), None]);

        for _ in 0..2 {
            let _ = gov.execute(1, &mut device, &[1u16][..], |d, p| Box::pin(d.read(p))).await;
        }
        assert!(matches!(gov.circuit_state(1), CircuitState::Open { .. }));

        let err = gov
            .execute(1, &mut device, &[1u16][..], |d, p| Box::pin(d.read(p)))
            .await
            .unwrap_err();
        assert!(matches!(err, GovernorError::CircuitOpen { device_id: 1, .. }));
        assert_eq!(device.calls, 2);

        gov.reset_device(1);
        assert!(gov.execute(1, &mut device, &[1u16][..], |d, p| Box::pin(d.read(p))).await.is_ok());
    }

    #[tokio::test]
    async fn retries_stop_once_the_breaker_opens() {
        let gov = governor(5, 2);
        let mut device = Device::new(vec![timeout(), timeout(), timeout(), None]);

        let err = gov
            .execute(1, &mut device, &[1u16][..], |d, p| Box::pin(d.read(p)))
            .await
            .unwrap_err();

        assert!(matches!(err, GovernorError::Failed { attempts: 2, .. }));
        assert_eq!(gov.snapshot().breakers[0].state, "open");
    }
}
