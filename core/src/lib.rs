//! # Purchase Session Core
//!
//! The session state machine for a platform purchase store connection:
//! connecting and disconnecting, loading subscription catalogs, issuing
//! purchase requests, and resolving the race between direct purchase
//! responses and asynchronous store notifications.
//!
//! ## Core Concepts
//!
//! - **State**: [`state::SessionState`] — the lifecycle phase, loaded catalog,
//!   and at most one in-flight purchase attempt
//! - **Action**: [`action::SessionAction`] — Presentation intents (commands)
//!   and gateway feedback (events) in one type
//! - **Reducer**: [`session::SessionReducer`] — every transition, applied
//!   atomically against a single state snapshot
//! - **Effect**: [`effect::Effect`] — side effect descriptions (gateway
//!   calls), executed by the runtime, never by the reducer
//! - **Environment**: [`environment::SessionEnvironment`] — the injected
//!   [`gateway::StoreGateway`] and [`environment::Clock`]
//!
//! ## Architecture Principles
//!
//! - Functional core, imperative shell: the reducer is a pure function over
//!   `(State, Action, Environment)`
//! - The gateway is an opaque boundary reached only through its trait
//! - Every event carries the session epoch it was issued under, so late
//!   deliveries after a teardown are detached rather than mis-applied

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use smallvec::{SmallVec, smallvec};

pub mod action;
pub mod effect;
pub mod environment;
pub mod error;
pub mod gateway;
pub mod reducer;
pub mod retry;
pub mod session;
pub mod state;

pub use action::SessionAction;
pub use effect::Effect;
pub use environment::{Clock, SessionEnvironment, SystemClock};
pub use error::{
    CatalogError, GatewayError, ProtocolViolation, PurchaseRequestError, SessionError,
    SessionOperation,
};
pub use gateway::{FinalizeOutcome, ListenerHandle, PurchaseFailure, StoreGateway};
pub use reducer::Reducer;
pub use retry::RetryPolicy;
pub use session::SessionReducer;
pub use state::{
    AttemptResolution, Catalog, Offer, ProductId, PurchaseAttempt, PurchaseRecord, SessionPhase,
    SessionState,
};
