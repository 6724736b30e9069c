//! Operation poller
//!
//! Waits for a long-running provider operation to reach a terminal state.
//! A check reports one of three outcomes: keep waiting, ready with a value,
//! or failed for good. The poller never waits past its timeout.
//!
//! Throttling and brief provider unavailability are absorbed here with a
//! capped exponential backoff. No other component retries provider calls.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, warn};
use trellis_core::domain::{Resource, ResourceKind};
use trellis_core::{ProviderError, ProvisionError, Result};
use trellis_provider::CloudApi;

/// Result of one check of a long-running operation
#[derive(Debug)]
pub enum PollStatus<T> {
    /// Not there yet; carries the observed state for logging
    Waiting(String),
    /// Reached the desired state
    Ready(T),
    /// Entered a state from which the operation cannot complete
    Fatal(ProvisionError),
}

/// Polling cadence and limits
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub max_transient_errors: u32,
    pub max_backoff: Duration,
}

impl PollSettings {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            max_transient_errors: 5,
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Repeatedly runs `check` until it reports ready, fatal, or the timeout elapses
///
/// # Arguments
/// * `operation` - Description used in logs and in the timeout error
/// * `settings` - Interval, timeout and transient-error budget
/// * `check` - Issues one provider query and classifies the result
pub async fn poll_until<T, F, Fut>(operation: &str, settings: &PollSettings, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<PollStatus<T>, ProviderError>>,
{
    let started = Instant::now();
    let mut transient_errors = 0;
    let mut backoff = settings.interval;

    loop {
        let delay = match check().await {
            Ok(PollStatus::Ready(value)) => {
                debug!("{} ready after {:?}", operation, started.elapsed());
                return Ok(value);
            }
            Ok(PollStatus::Fatal(error)) => return Err(error),
            Ok(PollStatus::Waiting(state)) => {
                debug!("Waiting for {} (state: {})", operation, state);
                transient_errors = 0;
                backoff = settings.interval;
                settings.interval
            }
            Err(error) if error.is_transient() => {
                transient_errors += 1;
                if transient_errors > settings.max_transient_errors {
                    warn!(
                        "Giving up on {} after {} transient errors",
                        operation, transient_errors
                    );
                    return Err(error.into());
                }
                warn!(
                    "Transient error while waiting for {} (attempt {}/{}): {}",
                    operation, transient_errors, settings.max_transient_errors, error
                );
                let delay = backoff;
                backoff = (backoff * 2).min(settings.max_backoff);
                delay
            }
            Err(error) => return Err(error.into()),
        };

        let elapsed = started.elapsed();
        if elapsed >= settings.timeout {
            return Err(ProvisionError::Timeout {
                operation: operation.to_string(),
                waited: elapsed,
            });
        }

        sleep(delay.min(settings.timeout - elapsed)).await;
    }
}

/// Polls a resource until it reports `ready`
///
/// States listed in `waiting` keep the poll going; any other state is fatal.
pub async fn wait_for_state(
    api: &dyn CloudApi,
    kind: ResourceKind,
    id: &str,
    ready: &str,
    waiting: &[&str],
    settings: &PollSettings,
) -> Result<Resource> {
    let operation = format!("{kind} {id} to become {ready}");
    poll_until(&operation, settings, move || async move {
        let resource = api.describe(kind, id).await?;
        Ok(if resource.has_state(ready) {
            PollStatus::Ready(resource)
        } else if waiting.contains(&resource.state.as_str()) {
            PollStatus::Waiting(resource.state)
        } else {
            let state = resource.state.clone();
            PollStatus::Fatal(ProvisionError::unexpected_state(resource.label(), state))
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> PollSettings {
        PollSettings::new(Duration::from_millis(1), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_ready_after_waiting() {
        let checks = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&checks);

        let value = poll_until("gateway", &fast(), move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    Ok(PollStatus::Waiting("pending".into()))
                } else {
                    Ok(PollStatus::Ready(42))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(checks.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let settings = PollSettings::new(Duration::from_millis(2), Duration::from_millis(20));
        let result: Result<()> = poll_until("nat gateway", &settings, || async {
            Ok(PollStatus::Waiting("pending".into()))
        })
        .await;

        let error = result.unwrap_err();
        assert!(error.is_timeout());
        assert!(error.to_string().contains("nat gateway"));
    }

    #[tokio::test]
    async fn test_fatal_stops_immediately() {
        let checks = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&checks);

        let result: Result<()> = poll_until("instance", &fast(), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(PollStatus::Fatal(ProvisionError::unexpected_state(
                    "instance i-1",
                    "terminated",
                )))
            }
        })
        .await;

        assert!(matches!(result, Err(ProvisionError::UnexpectedState { .. })));
        assert_eq!(checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let checks = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&checks);

        let value = poll_until("load balancer", &fast(), move || {
            let counter = Arc::clone(&counter);
            async move {
                match counter.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(ProviderError::Throttled("slow down".into())),
                    1 => Err(ProviderError::Unavailable("blip".into())),
                    _ => Ok(PollStatus::Ready("active")),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, "active");
    }

    #[tokio::test]
    async fn test_transient_budget_is_bounded() {
        let mut settings = fast();
        settings.max_transient_errors = 2;

        let result: Result<()> = poll_until("subnet", &settings, || async {
            Err(ProviderError::Throttled("slow down".into()))
        })
        .await;

        assert!(matches!(
            result,
            Err(ProvisionError::Provider(ProviderError::Throttled(_)))
        ));
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let checks = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&checks);

        let result: Result<()> = poll_until("subnet", &fast(), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::rejected(400, "bad request"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(checks.load(Ordering::SeqCst), 1);
    }
}
