//! The store gateway contract: the opaque platform boundary the session
//! talks to.
//!
//! The core never implements this trait for a real store backend; it only
//! depends on the contract. Production bindings live with the embedding
//! application, and tests use a scriptable mock.
//!
//! # Dyn Compatibility
//!
//! The async methods return explicit `Pin<Box<dyn Future>>` instead of
//! `async fn` so the trait can be used as `Arc<dyn StoreGateway>` inside
//! effects created by the reducer.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::state::{Offer, ProductId, PurchaseRecord};

/// Boxed future returned by gateway methods.
pub type GatewayFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, GatewayError>> + Send + 'a>>;

/// Callback invoked for every purchase-updated notification.
pub type UpdateCallback = Box<dyn Fn(PurchaseRecord) + Send + Sync>;

/// Callback invoked for every purchase-error notification.
pub type ErrorCallback = Box<dyn Fn(PurchaseFailure) + Send + Sync>;

/// Result of acknowledging a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The gateway acknowledged the transaction.
    Finalized,
    /// The gateway reports the transaction was already acknowledged.
    /// Treated as success, not an error.
    AlreadyFinalized,
}

/// Payload of a purchase-error notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseFailure {
    /// Product the failure refers to, when the store reports one.
    pub product_id: Option<ProductId>,
    /// Platform-specific error code.
    pub code: Option<String>,
    /// Human-readable description.
    pub message: String,
}

impl std::fmt::Display for PurchaseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.product_id, &self.code) {
            (Some(product), Some(code)) => {
                write!(f, "{product}: [{code}] {}", self.message)
            }
            (Some(product), None) => write!(f, "{product}: {}", self.message),
            (None, Some(code)) => write!(f, "[{code}] {}", self.message),
            (None, None) => f.write_str(&self.message),
        }
    }
}

/// Ownership token for an active gateway subscription.
///
/// Releasing is exactly-once: `release()` consumes the handle, and dropping
/// an unreleased handle releases it as a fallback, so a subscription can
/// never outlive the session that registered it.
pub struct ListenerHandle {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerHandle {
    /// Wraps a release closure into a handle.
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Releases the subscription.
    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// The platform purchase store, reached only through this contract.
pub trait StoreGateway: Send + Sync {
    /// Establish the store connection.
    fn connect(&self) -> GatewayFuture<'_, ()>;

    /// Tear the connection down. Best-effort: callers ignore failures during
    /// teardown.
    fn disconnect(&self) -> GatewayFuture<'_, ()>;

    /// Query the purchasable offers for the given products, in store order.
    fn query_catalog(&self, product_ids: Vec<ProductId>) -> GatewayFuture<'_, Vec<Offer>>;

    /// Issue a purchase request.
    ///
    /// The direct response may resolve slower than — or never independently
    /// of — a purchase-updated notification for the same product; the
    /// notification channel is authoritative for subscriptions.
    fn request_purchase(&self, product_id: ProductId) -> GatewayFuture<'_, PurchaseRecord>;

    /// Acknowledge a completed transaction so it is not redelivered.
    /// Idempotent on the gateway side.
    fn finalize(&self, record: PurchaseRecord) -> GatewayFuture<'_, FinalizeOutcome>;

    /// Subscribe to purchase-updated notifications.
    fn on_purchase_updated(&self, callback: UpdateCallback) -> ListenerHandle;

    /// Subscribe to purchase-error notifications.
    fn on_purchase_error(&self, callback: ErrorCallback) -> ListenerHandle;
}
