//! Session state: the lifecycle phase, the loaded catalog, and the tracking
//! record for one in-flight purchase attempt.
//!
//! State is owned data, mutated only by the reducer. The Presentation Layer
//! receives read-only clones of [`SessionState`] and never mutates it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::gateway::PurchaseFailure;

/// Unique identifier of a purchasable product, as listed by the store catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(String);

impl ProductId {
    /// Creates a product identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProductId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProductId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A purchasable subscription offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    /// Product this offer sells.
    pub product_id: ProductId,
    /// Display metadata exactly as the gateway returned it. Opaque to the
    /// session core; the Presentation Layer renders it.
    pub metadata: serde_json::Value,
}

impl Offer {
    /// Creates an offer with no display metadata.
    #[must_use]
    pub fn new(product_id: ProductId) -> Self {
        Self {
            product_id,
            metadata: serde_json::Value::Null,
        }
    }
}

/// The last successfully loaded set of offers.
///
/// Replaced as a whole on every successful reload; the Presentation Layer
/// never observes a partially updated catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    offers: Vec<Offer>,
}

impl Catalog {
    /// Creates a catalog from an ordered sequence of offers.
    #[must_use]
    pub fn new(offers: Vec<Offer>) -> Self {
        Self { offers }
    }

    /// All offers, in the order the gateway returned them.
    #[must_use]
    pub fn offers(&self) -> &[Offer] {
        &self.offers
    }

    /// Whether the catalog lists the given product.
    #[must_use]
    pub fn contains(&self, product_id: &ProductId) -> bool {
        self.offers.iter().any(|o| o.product_id == *product_id)
    }

    /// Number of offers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.offers.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }
}

/// Opaque receipt data for a completed transaction.
///
/// The core's only obligations are to pass it to finalization exactly once
/// per resolution and to surface it verbatim to the Presentation Layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseRecord {
    /// Product the transaction is for.
    pub product_id: ProductId,
    /// Store-assigned transaction identifier, used for duplicate detection.
    pub transaction_id: String,
    /// Receipt payload as the gateway delivered it.
    pub receipt: serde_json::Value,
    /// When the store recorded the purchase.
    pub purchased_at: DateTime<Utc>,
}

/// Lifecycle phase of the purchase session. Exactly one phase is active at
/// any instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    /// No store connection.
    #[default]
    Disconnected,
    /// Connect call issued, not yet answered.
    Connecting,
    /// Connected, listeners registered, no catalog loaded yet.
    Connected,
    /// Catalog query in flight.
    LoadingCatalog,
    /// A catalog is loaded and offers can be purchased.
    CatalogReady,
    /// A purchase request is in flight.
    RequestingPurchase,
    /// The last purchase attempt succeeded and was finalized.
    PurchaseSucceeded,
    /// The last purchase attempt failed.
    PurchaseFailed,
}

impl SessionPhase {
    /// Phases from which a catalog load (or reload) may start.
    #[must_use]
    pub const fn can_load_catalog(self) -> bool {
        matches!(self, Self::Connected | Self::CatalogReady)
    }

    /// Phases from which a new purchase request may start. A prior attempt
    /// must have resolved; `RequestingPurchase` itself is excluded.
    #[must_use]
    pub const fn can_request_purchase(self) -> bool {
        matches!(
            self,
            Self::CatalogReady | Self::PurchaseSucceeded | Self::PurchaseFailed
        )
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::LoadingCatalog => "loading_catalog",
            Self::CatalogReady => "catalog_ready",
            Self::RequestingPurchase => "requesting_purchase",
            Self::PurchaseSucceeded => "purchase_succeeded",
            Self::PurchaseFailed => "purchase_failed",
        };
        f.write_str(name)
    }
}

/// Terminal outcome of a purchase attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptResolution {
    /// The store confirmed the purchase; the record has been handed to
    /// finalization.
    Succeeded(PurchaseRecord),
    /// The store rejected the purchase, or the error listener reported a
    /// failure for this product.
    Failed(SessionError),
    /// The session was torn down while the attempt was still pending.
    Cancelled,
}

/// Tracking record for one in-flight purchase request.
///
/// The resolution slot is written at most once (first writer wins); later
/// arrivals for the same attempt are finalized or logged but never applied.
#[derive(Debug, Clone, PartialEq)]
pub struct PurchaseAttempt {
    /// Product the caller asked to purchase.
    pub product_id: ProductId,
    /// Session epoch the request was issued under.
    pub epoch: u64,
    /// Correlation id from the originating command.
    pub request_id: u64,
    /// Terminal outcome, once resolved.
    pub resolution: Option<AttemptResolution>,
}

impl PurchaseAttempt {
    /// Creates a pending attempt.
    #[must_use]
    pub const fn new(product_id: ProductId, epoch: u64, request_id: u64) -> Self {
        Self {
            product_id,
            epoch,
            request_id,
            resolution: None,
        }
    }

    /// Whether the attempt has not resolved yet.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.resolution.is_none()
    }
}

/// Complete session state. The reducer is the only writer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    /// Current lifecycle phase.
    pub phase: SessionPhase,
    /// Bumped on every `Start` and `Stop`; events carrying an older epoch are
    /// recognized as stale and never touch the phase.
    pub epoch: u64,
    /// Last successfully loaded catalog, if any.
    pub catalog: Option<Catalog>,
    /// The current (or most recently resolved) purchase attempt.
    pub attempt: Option<PurchaseAttempt>,
    /// Last displayable error, for the Presentation Layer.
    pub last_error: Option<SessionError>,
    /// Purchase-error notifications with no matching in-flight attempt.
    /// Kept for observability only; bounded to [`Self::MAX_OUT_OF_BAND_ERRORS`].
    pub out_of_band_errors: Vec<PurchaseFailure>,
    /// When the phase last changed.
    pub last_transition_at: Option<DateTime<Utc>>,
}

impl SessionState {
    /// Cap on retained out-of-band error notifications.
    pub const MAX_OUT_OF_BAND_ERRORS: usize = 32;

    /// A fresh, disconnected session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers of the loaded catalog, or empty if none was loaded.
    #[must_use]
    pub fn offers(&self) -> &[Offer] {
        self.catalog.as_ref().map_or(&[], Catalog::offers)
    }

    pub(crate) fn record_out_of_band(&mut self, failure: PurchaseFailure) {
        if self.out_of_band_errors.len() >= Self::MAX_OUT_OF_BAND_ERRORS {
            self.out_of_band_errors.remove(0);
        }
        self.out_of_band_errors.push(failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lookup() {
        let catalog = Catalog::new(vec![Offer::new(ProductId::from("sub_a"))]);
        assert!(catalog.contains(&ProductId::from("sub_a")));
        assert!(!catalog.contains(&ProductId::from("sub_z")));
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn out_of_band_errors_are_bounded() {
        let mut state = SessionState::new();
        for i in 0..(SessionState::MAX_OUT_OF_BAND_ERRORS + 5) {
            state.record_out_of_band(PurchaseFailure {
                product_id: None,
                code: None,
                message: format!("error {i}"),
            });
        }
        assert_eq!(
            state.out_of_band_errors.len(),
            SessionState::MAX_OUT_OF_BAND_ERRORS
        );
        // Oldest entries were dropped first.
        assert_eq!(state.out_of_band_errors[0].message, "error 5");
    }

    #[test]
    fn phase_preconditions() {
        assert!(SessionPhase::Connected.can_load_catalog());
        assert!(SessionPhase::CatalogReady.can_load_catalog());
        assert!(!SessionPhase::RequestingPurchase.can_load_catalog());

        assert!(SessionPhase::CatalogReady.can_request_purchase());
        assert!(SessionPhase::PurchaseFailed.can_request_purchase());
        assert!(!SessionPhase::RequestingPurchase.can_request_purchase());
        assert!(!SessionPhase::Connected.can_request_purchase());
    }
}
