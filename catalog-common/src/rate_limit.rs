//! Minimum-interval spacing between calls to the same upstream API.
use std::collections::HashMap;
use std::time;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::metrics_consts::RATE_LIMIT_WAIT_SECONDS;

/// Spacing state for a single API. The mutex is fair, so waiters are granted in the
/// order they started waiting.
#[derive(Debug)]
struct Gate {
    min_interval: time::Duration,
    last_grant: Mutex<Option<Instant>>,
}

/// Enforces a minimum interval between granted acquisitions, independently per API name.
///
/// A single instance is shared (behind an `Arc`) by every client of a run. Acquisitions never
/// fail, they only wait. APIs without a configured interval are never delayed.
#[derive(Debug, Default)]
pub struct RateLimiter {
    gates: HashMap<String, Gate>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure the minimum interval between two granted calls to `api`.
    pub fn with_interval(mut self, api: &str, min_interval: time::Duration) -> Self {
        self.gates.insert(
            api.to_owned(),
            Gate {
                min_interval,
                last_grant: Mutex::new(None),
            },
        );
        self
    }

    pub fn min_interval(&self, api: &str) -> time::Duration {
        self.gates
            .get(api)
            .map(|gate| gate.min_interval)
            .unwrap_or_default()
    }

    /// Wait until `api` may be called again and return the instant the call was granted.
    pub async fn acquire(&self, api: &str) -> Instant {
        let Some(gate) = self.gates.get(api) else {
            return Instant::now();
        };

        let started = Instant::now();
        let mut last_grant = gate.last_grant.lock().await;

        if let Some(previous) = *last_grant {
            let ready_at = previous + gate.min_interval;
            if ready_at > Instant::now() {
                debug!(api, wait_ms = (ready_at - Instant::now()).as_millis() as u64, "rate limited");
                tokio::time::sleep_until(ready_at).await;
            }
        }

        let granted = Instant::now();
        *last_grant = Some(granted);

        let labels = [("api", api.to_owned())];
        metrics::histogram!(RATE_LIMIT_WAIT_SECONDS, &labels)
            .record((granted - started).as_secs_f64());

        granted
    }
}
