//! Retry policy for NetworkManager calls.
//!
//! NetworkManager can restart at any moment and briefly drops objects while
//! it reconfigures devices. Every public [`NmClient`](crate::NmClient) call
//! runs inside exactly one [`RetryPolicy::run`]; the private calls beneath it
//! never retry, so one budget covers the whole call tree.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::error::{Error, TransientKind};

/// Retry budget for transient NetworkManager faults.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Service-unavailable faults are retried at least this many times...
    pub unavailable_min_attempts: u32,
    /// ...and for at least this long. Both must be exceeded to give up.
    pub unavailable_max_elapsed: Duration,
    /// Sleep between service-unavailable attempts.
    pub unavailable_delay: Duration,
    /// Object-missing faults give up after this many attempts.
    pub missing_max_attempts: u32,
    /// Sleep between object-missing attempts.
    pub missing_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            unavailable_min_attempts: 3,
            unavailable_max_elapsed: Duration::from_secs(1),
            unavailable_delay: Duration::from_millis(100),
            missing_max_attempts: 3,
            missing_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Larger budget for the one-time startup connection, so the daemon can
    /// start alongside NetworkManager at boot.
    pub fn initialization() -> Self {
        Self {
            unavailable_min_attempts: 10,
            unavailable_max_elapsed: Duration::from_secs(30),
            unavailable_delay: Duration::from_secs(1),
            ..Self::default()
        }
    }

    /// Run `op` until it succeeds, fails permanently, or exhausts the budget
    /// of its transient class. The last error is returned on exhaustion.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let started = Instant::now();
        let mut unavailable_attempts: u32 = 0;
        let mut missing_attempts: u32 = 0;

        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let delay = match err.transient_kind() {
                None => return Err(err),
                Some(TransientKind::ServiceUnavailable) => {
                    unavailable_attempts += 1;
                    if unavailable_attempts >= self.unavailable_min_attempts
                        && started.elapsed() >= self.unavailable_max_elapsed
                    {
                        warn!(
                            operation,
                            attempts = unavailable_attempts,
                            error = %err,
                            "NetworkManager still unavailable, giving up"
                        );
                        return Err(err);
                    }
                    self.unavailable_delay
                }
                Some(TransientKind::ObjectMissing) => {
                    missing_attempts += 1;
                    if missing_attempts >= self.missing_max_attempts {
                        warn!(
                            operation,
                            attempts = missing_attempts,
                            error = %err,
                            "NetworkManager object still missing, giving up"
                        );
                        return Err(err);
                    }
                    self.missing_delay
                }
            };

            debug!(operation, error = %err, ?delay, "transient NetworkManager fault, retrying");
            sleep(delay).await;
        }
    }
}
