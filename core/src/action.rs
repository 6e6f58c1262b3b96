//! Everything that can happen to a session, in one type.
//!
//! Commands are intents issued by the Presentation Layer; events are
//! feedback produced by effects when a gateway call resolves or a listener
//! fires. Every event carries the epoch it was issued under so late
//! deliveries after a teardown can be recognized as stale.

use crate::error::{GatewayError, SessionError, SessionOperation};
use crate::gateway::{FinalizeOutcome, PurchaseFailure};
use crate::state::{Offer, ProductId, PurchaseRecord};

/// Commands and events of the purchase session.
#[derive(Debug, Clone)]
pub enum SessionAction {
    // ── Commands (Presentation Layer intents) ───────────────────────────

    /// Connect to the store and register listeners.
    Start,
    /// Query the purchasable offers for the given products.
    LoadCatalog {
        /// Products to query. Must not be empty.
        product_ids: Vec<ProductId>,
    },
    /// Issue a purchase request for a cataloged product.
    RequestPurchase {
        /// Product to purchase.
        product_id: ProductId,
        /// Caller-chosen correlation id, echoed in the rejection action and
        /// recorded on the attempt so concurrent waiters can tell outcomes
        /// apart.
        request_id: u64,
    },
    /// Deregister listeners and disconnect.
    Stop,

    // ── Events (gateway feedback) ───────────────────────────────────────

    /// The connect call succeeded.
    Connected {
        /// Epoch the connect was issued under.
        epoch: u64,
    },
    /// The connect call failed.
    ConnectFailed {
        /// Epoch the connect was issued under.
        epoch: u64,
        /// Failure reported by the gateway.
        error: GatewayError,
    },
    /// The catalog query resolved with offers.
    CatalogLoaded {
        /// Epoch the query was issued under.
        epoch: u64,
        /// Offers in store order.
        offers: Vec<Offer>,
    },
    /// The catalog query failed.
    CatalogLoadFailed {
        /// Epoch the query was issued under.
        epoch: u64,
        /// Failure reported by the gateway.
        error: GatewayError,
    },
    /// The direct purchase call resolved.
    PurchaseResponse {
        /// Epoch the request was issued under.
        epoch: u64,
        /// Correlation id of the attempt that issued the call. A response
        /// only resolves the attempt that carries the same id; anything
        /// else is a leftover from an earlier, already settled attempt.
        request_id: u64,
        /// The gateway's direct answer.
        result: Result<PurchaseRecord, GatewayError>,
    },
    /// The purchase-updated listener delivered a completed transaction.
    PurchaseUpdated {
        /// Session epoch at delivery time.
        epoch: u64,
        /// The completed transaction.
        record: PurchaseRecord,
    },
    /// The purchase-error listener delivered a failure.
    PurchaseErrored {
        /// Session epoch at delivery time.
        epoch: u64,
        /// The reported failure.
        failure: PurchaseFailure,
    },
    /// A finalization effect completed.
    PurchaseFinalized {
        /// Epoch the finalized record was accepted under.
        epoch: u64,
        /// The record that was acknowledged.
        record: PurchaseRecord,
        /// Acknowledgment result after retries.
        outcome: Result<FinalizeOutcome, GatewayError>,
        /// Whether this finalization settles the in-flight attempt, as
        /// opposed to acknowledging a stray or duplicate record.
        resolves_attempt: bool,
    },
    /// A command failed its precondition check and was not executed.
    CommandRejected {
        /// The rejected operation.
        operation: SessionOperation,
        /// Why it was rejected.
        error: SessionError,
        /// Correlation id of the rejected command, for operations that carry
        /// one.
        request_id: Option<u64>,
    },
}

impl SessionAction {
    /// Short name for logs and metrics labels.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::LoadCatalog { .. } => "load_catalog",
            Self::RequestPurchase { .. } => "request_purchase",
            Self::Stop => "stop",
            Self::Connected { .. } => "connected",
            Self::ConnectFailed { .. } => "connect_failed",
            Self::CatalogLoaded { .. } => "catalog_loaded",
            Self::CatalogLoadFailed { .. } => "catalog_load_failed",
            Self::PurchaseResponse { .. } => "purchase_response",
            Self::PurchaseUpdated { .. } => "purchase_updated",
            Self::PurchaseErrored { .. } => "purchase_errored",
            Self::PurchaseFinalized { .. } => "purchase_finalized",
            Self::CommandRejected { .. } => "command_rejected",
        }
    }
}
