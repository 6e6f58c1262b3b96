//! # Purchase Session Testing
//!
//! Test doubles and harnesses for the purchase session:
//!
//! - [`MockGateway`] — a scriptable [`StoreGateway`] that records every call
//!   and can emit listener notifications on demand
//! - [`ReducerTest`] — drives a reducer action by action and executes the
//!   effects it returns
//! - [`FixedClock`] — a deterministic [`Clock`](purchase_session_core::Clock)
//!
//! [`StoreGateway`]: purchase_session_core::StoreGateway

use std::sync::Arc;

use chrono::{DateTime, Utc};

use purchase_session_core::Clock;

pub mod mock_gateway;

pub use mock_gateway::{GatewayCall, MockGateway, PurchaseScript, purchase_record};
pub use reducer_test::ReducerTest;

/// A clock frozen at a fixed instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    now: DateTime<Utc>,
}

impl FixedClock {
    /// A clock frozen at `now`.
    #[must_use]
    pub const fn new(now: DateTime<Utc>) -> Self {
        Self { now }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }
}

/// A deterministic clock frozen at the Unix epoch.
#[must_use]
pub fn test_clock() -> Arc<dyn Clock> {
    Arc::new(FixedClock::new(DateTime::UNIX_EPOCH))
}
