//! Dependencies captured by session effects.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::gateway::StoreGateway;
use crate::retry::RetryPolicy;

/// Time source, injectable for deterministic tests.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Everything session effects need to run.
#[derive(Clone)]
pub struct SessionEnvironment {
    /// The platform purchase store.
    pub gateway: Arc<dyn StoreGateway>,
    /// Time source for transition timestamps.
    pub clock: Arc<dyn Clock>,
    /// Retry policy for transaction finalization.
    pub finalize_retry: RetryPolicy,
}

impl SessionEnvironment {
    /// Builds an environment with the system clock and default retries.
    pub fn new(gateway: Arc<dyn StoreGateway>) -> Self {
        Self {
            gateway,
            clock: Arc::new(SystemClock),
            finalize_retry: RetryPolicy::default(),
        }
    }

    /// Overrides the finalization retry policy.
    #[must_use]
    pub fn with_finalize_retry(mut self, policy: RetryPolicy) -> Self {
        self.finalize_retry = policy;
        self
    }

    /// Overrides the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl std::fmt::Debug for SessionEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEnvironment")
            .field("finalize_retry", &self.finalize_retry)
            .finish_non_exhaustive()
    }
}
