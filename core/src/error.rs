//! Error types for the purchase session.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::PurchaseFailure;
use crate::state::{ProductId, SessionPhase};

/// Error reported by the store gateway boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct GatewayError {
    /// Platform-specific error code, when the store backend supplies one.
    pub code: Option<String>,
    /// Human-readable description.
    pub message: String,
}

impl GatewayError {
    /// Creates a gateway error without a platform code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Creates a gateway error with a platform code.
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }
}

/// Catalog load failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    /// The caller passed an empty product identifier set. Caught before the
    /// gateway is contacted.
    #[error("product id set must not be empty")]
    EmptyProductIds,

    /// The gateway rejected or failed the catalog query.
    #[error("catalog query failed: {0}")]
    Query(GatewayError),
}

/// Purchase request failures on the direct call path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PurchaseRequestError {
    /// The requested product is not in the last-loaded catalog. Caught before
    /// the gateway is contacted.
    #[error("product {product_id} is not in the loaded catalog")]
    UnknownProduct {
        /// The product that was requested.
        product_id: ProductId,
    },

    /// The gateway rejected or timed out the purchase call.
    #[error("purchase request failed: {0}")]
    Gateway(GatewayError),
}

/// The session operation a caller invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOperation {
    /// `start()` — connect and register listeners.
    Start,
    /// `load_catalog(ids)` — query purchasable offers.
    LoadCatalog,
    /// `request_purchase(id)` — issue a purchase request.
    RequestPurchase,
    /// `stop()` — deregister listeners and disconnect.
    Stop,
}

impl std::fmt::Display for SessionOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::LoadCatalog => "load_catalog",
            Self::RequestPurchase => "request_purchase",
            Self::Stop => "stop",
        };
        f.write_str(name)
    }
}

/// An operation was invoked in a phase that does not permit it.
///
/// This is a programming error in the caller, not a runtime condition; it is
/// always reported loudly, never silently ignored.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} is not valid in phase {phase}")]
pub struct ProtocolViolation {
    /// The rejected operation.
    pub operation: SessionOperation,
    /// The phase the session was in when the operation arrived.
    pub phase: SessionPhase,
}

/// All errors a purchase session can surface.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    /// Store connection could not be established.
    #[error("store connection failed: {message}")]
    Connection {
        /// Description from the gateway.
        message: String,
    },

    /// Catalog load failed; the session reverts to its prior connected phase.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// The direct purchase call failed.
    #[error(transparent)]
    PurchaseRequest(#[from] PurchaseRequestError),

    /// The error listener reported a failure for the in-flight product.
    #[error("purchase error notification: {0}")]
    PurchaseNotification(PurchaseFailure),

    /// Transaction acknowledgment failed. Logged, never surfaced as a
    /// user-facing failure — the purchase itself succeeded.
    #[error("transaction finalization failed: {message}")]
    Finalization {
        /// Description from the gateway.
        message: String,
    },

    /// Operation invoked in an invalid phase.
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),

    /// The in-flight attempt was discarded by session teardown.
    #[error("purchase attempt cancelled by session teardown")]
    Cancelled,
}
