//! The session reducer: every lifecycle transition in one place.
//!
//! All decisions are made against the single state snapshot the runtime
//! holds under its write lock, so a check and the transition it guards are
//! always atomic. Gateway work is returned as effects, never performed here.
//!
//! # Staleness
//!
//! Every event carries the epoch it was issued under. Teardown bumps the
//! epoch, so events from a previous session generation arrive with an older
//! epoch and are recognized as stale: they never touch the phase. The one
//! exception is a successful purchase record, which is finalized regardless
//! of staleness so the store does not redeliver it forever.

use std::sync::Arc;

use smallvec::{SmallVec, smallvec};

use crate::action::SessionAction;
use crate::effect::Effect;
use crate::environment::SessionEnvironment;
use crate::error::{
    CatalogError, ProtocolViolation, PurchaseRequestError, SessionError, SessionOperation,
};
use crate::gateway::{FinalizeOutcome, PurchaseFailure};
use crate::reducer::Reducer;
use crate::state::{
    AttemptResolution, Catalog, Offer, ProductId, PurchaseAttempt, PurchaseRecord, SessionPhase,
    SessionState,
};

type Effects = SmallVec<[Effect<SessionAction>; 4]>;

/// Reducer for [`SessionState`] over [`SessionAction`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionReducer;

impl Reducer for SessionReducer {
    type State = SessionState;
    type Action = SessionAction;
    type Environment = SessionEnvironment;

    fn reduce(
        &self,
        state: &mut SessionState,
        action: SessionAction,
        env: &SessionEnvironment,
    ) -> Effects {
        match action {
            SessionAction::Start => self.start(state, env),
            SessionAction::LoadCatalog { product_ids } => {
                self.load_catalog(state, product_ids, env)
            }
            SessionAction::RequestPurchase {
                product_id,
                request_id,
            } => self.request_purchase(state, product_id, request_id, env),
            SessionAction::Stop => self.stop(state, env),
            SessionAction::Connected { epoch } => self.connected(state, epoch, env),
            SessionAction::ConnectFailed { epoch, error } => {
                self.connect_failed(state, epoch, &error, env)
            }
            SessionAction::CatalogLoaded { epoch, offers } => {
                self.catalog_loaded(state, epoch, offers, env)
            }
            SessionAction::CatalogLoadFailed { epoch, error } => {
                self.catalog_load_failed(state, epoch, error, env)
            }
            SessionAction::PurchaseResponse {
                epoch,
                request_id,
                result,
            } => match result {
                Ok(record) => self.success_record(state, epoch, Some(request_id), record, env),
                Err(error) => self.purchase_call_failed(state, epoch, request_id, error, env),
            },
            SessionAction::PurchaseUpdated { epoch, record } => {
                self.success_record(state, epoch, None, record, env)
            }
            SessionAction::PurchaseErrored { epoch, failure } => {
                self.purchase_errored(state, epoch, failure, env)
            }
            SessionAction::PurchaseFinalized {
                epoch,
                record,
                outcome,
                resolves_attempt,
            } => self.purchase_finalized(state, epoch, &record, &outcome, resolves_attempt, env),
            SessionAction::CommandRejected {
                operation, error, ..
            } => {
                tracing::debug!(%operation, %error, "command rejected");
                state.last_error = Some(error);
                smallvec![]
            }
        }
    }
}

impl SessionReducer {
    fn transition(&self, state: &mut SessionState, phase: SessionPhase, env: &SessionEnvironment) {
        tracing::debug!(from = %state.phase, to = %phase, epoch = state.epoch, "session transition");
        state.phase = phase;
        state.last_transition_at = Some(env.clock.now());
    }

    /// Rejections are delivered as a feedback action so callers waiting on
    /// the action stream observe them like any other outcome.
    fn reject(
        &self,
        operation: SessionOperation,
        error: SessionError,
        request_id: Option<u64>,
    ) -> Effects {
        tracing::warn!(%operation, %error, "command precondition failed");
        if matches!(error, SessionError::Protocol(_)) {
            metrics::counter!("session.protocol_violations", "operation" => operation.to_string())
                .increment(1);
        }
        smallvec![crate::async_effect!({
            Some(SessionAction::CommandRejected {
                operation,
                error,
                request_id,
            })
        })]
    }

    fn start(&self, state: &mut SessionState, env: &SessionEnvironment) -> Effects {
        if state.phase != SessionPhase::Disconnected {
            return self.reject(
                SessionOperation::Start,
                ProtocolViolation {
                    operation: SessionOperation::Start,
                    phase: state.phase,
                }
                .into(),
                None,
            );
        }
        state.epoch += 1;
        state.last_error = None;
        let epoch = state.epoch;
        self.transition(state, SessionPhase::Connecting, env);

        let gateway = Arc::clone(&env.gateway);
        smallvec![crate::async_effect!({
            match gateway.connect().await {
                Ok(()) => Some(SessionAction::Connected { epoch }),
                Err(error) => Some(SessionAction::ConnectFailed { epoch, error }),
            }
        })]
    }

    fn connected(&self, state: &mut SessionState, epoch: u64, env: &SessionEnvironment) -> Effects {
        if epoch != state.epoch || state.phase != SessionPhase::Connecting {
            tracing::debug!(epoch, current = state.epoch, phase = %state.phase, "stale connect result ignored");
            return smallvec![];
        }
        self.transition(state, SessionPhase::Connected, env);
        smallvec![]
    }

    fn connect_failed(
        &self,
        state: &mut SessionState,
        epoch: u64,
        error: &crate::error::GatewayError,
        env: &SessionEnvironment,
    ) -> Effects {
        if epoch != state.epoch || state.phase != SessionPhase::Connecting {
            tracing::debug!(epoch, current = state.epoch, "stale connect failure ignored");
            return smallvec![];
        }
        tracing::warn!(%error, "store connection failed");
        state.last_error = Some(SessionError::Connection {
            message: error.message.clone(),
        });
        self.transition(state, SessionPhase::Disconnected, env);
        smallvec![]
    }

    fn load_catalog(
        &self,
        state: &mut SessionState,
        product_ids: Vec<ProductId>,
        env: &SessionEnvironment,
    ) -> Effects {
        if product_ids.is_empty() {
            return self.reject(
                SessionOperation::LoadCatalog,
                CatalogError::EmptyProductIds.into(),
                None,
            );
        }
        if !state.phase.can_load_catalog() {
            return self.reject(
                SessionOperation::LoadCatalog,
                ProtocolViolation {
                    operation: SessionOperation::LoadCatalog,
                    phase: state.phase,
                }
                .into(),
                None,
            );
        }
        let epoch = state.epoch;
        self.transition(state, SessionPhase::LoadingCatalog, env);

        let gateway = Arc::clone(&env.gateway);
        smallvec![crate::async_effect!({
            match gateway.query_catalog(product_ids).await {
                Ok(offers) => Some(SessionAction::CatalogLoaded { epoch, offers }),
                Err(error) => Some(SessionAction::CatalogLoadFailed { epoch, error }),
            }
        })]
    }

    fn catalog_loaded(
        &self,
        state: &mut SessionState,
        epoch: u64,
        offers: Vec<Offer>,
        env: &SessionEnvironment,
    ) -> Effects {
        if epoch != state.epoch || state.phase != SessionPhase::LoadingCatalog {
            tracing::debug!(epoch, current = state.epoch, "stale catalog result ignored");
            return smallvec![];
        }
        tracing::info!(offers = offers.len(), "catalog loaded");
        // Replaced as a whole; observers never see a partial update.
        state.catalog = Some(Catalog::new(offers));
        state.last_error = None;
        self.transition(state, SessionPhase::CatalogReady, env);
        smallvec![]
    }

    fn catalog_load_failed(
        &self,
        state: &mut SessionState,
        epoch: u64,
        error: crate::error::GatewayError,
        env: &SessionEnvironment,
    ) -> Effects {
        if epoch != state.epoch || state.phase != SessionPhase::LoadingCatalog {
            tracing::debug!(epoch, current = state.epoch, "stale catalog failure ignored");
            return smallvec![];
        }
        tracing::warn!(%error, "catalog load failed");
        state.last_error = Some(CatalogError::Query(error).into());
        // A previously loaded catalog stays valid after a failed reload.
        let revert = if state.catalog.is_some() {
            SessionPhase::CatalogReady
        } else {
            SessionPhase::Connected
        };
        self.transition(state, revert, env);
        smallvec![]
    }

    fn request_purchase(
        &self,
        state: &mut SessionState,
        product_id: ProductId,
        request_id: u64,
        env: &SessionEnvironment,
    ) -> Effects {
        if !state.phase.can_request_purchase() {
            return self.reject(
                SessionOperation::RequestPurchase,
                ProtocolViolation {
                    operation: SessionOperation::RequestPurchase,
                    phase: state.phase,
                }
                .into(),
                Some(request_id),
            );
        }
        let cataloged = state
            .catalog
            .as_ref()
            .is_some_and(|catalog| catalog.contains(&product_id));
        if !cataloged {
            return self.reject(
                SessionOperation::RequestPurchase,
                PurchaseRequestError::UnknownProduct { product_id }.into(),
                Some(request_id),
            );
        }

        let epoch = state.epoch;
        state.attempt = Some(PurchaseAttempt::new(product_id.clone(), epoch, request_id));
        state.last_error = None;
        self.transition(state, SessionPhase::RequestingPurchase, env);
        tracing::info!(%product_id, epoch, "purchase requested");

        let gateway = Arc::clone(&env.gateway);
        smallvec![crate::async_effect!({
            let result = gateway.request_purchase(product_id).await;
            Some(SessionAction::PurchaseResponse {
                epoch,
                request_id,
                result,
            })
        })]
    }

    /// Applies a successful purchase record, from either the direct response
    /// or the update listener. First writer wins: only a record matching the
    /// pending attempt resolves it; every record is finalized regardless, so
    /// stray and duplicate deliveries are still acknowledged.
    ///
    /// A direct response carries the correlation id of the attempt that
    /// issued it and resolves only that attempt, so a slow response from an
    /// already settled attempt cannot claim a newer one. Listener deliveries
    /// carry no id and match on the product.
    fn success_record(
        &self,
        state: &mut SessionState,
        epoch: u64,
        request_id: Option<u64>,
        record: PurchaseRecord,
        env: &SessionEnvironment,
    ) -> Effects {
        let resolves_attempt = epoch == state.epoch
            && matches!(
                &state.attempt,
                Some(attempt) if attempt.is_pending()
                    && attempt.epoch == state.epoch
                    && attempt.product_id == record.product_id
                    && request_id.is_none_or(|id| id == attempt.request_id)
            );

        if resolves_attempt {
            tracing::info!(
                product_id = %record.product_id,
                transaction_id = %record.transaction_id,
                "purchase confirmed, finalizing"
            );
            if let Some(attempt) = state.attempt.as_mut() {
                attempt.resolution = Some(AttemptResolution::Succeeded(record.clone()));
            }
            // Phase stays RequestingPurchase until finalization reports
            // back; success is only announced once the transaction is
            // acknowledged.
        } else {
            tracing::info!(
                product_id = %record.product_id,
                transaction_id = %record.transaction_id,
                "finalizing stray purchase record"
            );
        }

        smallvec![self.finalize_effect(state.epoch, record, resolves_attempt, env)]
    }

    fn finalize_effect(
        &self,
        epoch: u64,
        record: PurchaseRecord,
        resolves_attempt: bool,
        env: &SessionEnvironment,
    ) -> Effect<SessionAction> {
        let gateway = Arc::clone(&env.gateway);
        let policy = env.finalize_retry.clone();
        crate::async_effect!({
            let mut attempt_no: u32 = 1;
            let outcome = loop {
                match gateway.finalize(record.clone()).await {
                    Ok(outcome) => break Ok(outcome),
                    Err(error) if policy.should_retry(attempt_no) => {
                        tracing::warn!(attempt = attempt_no, %error, "finalize failed, retrying");
                        metrics::counter!("session.finalize.retries").increment(1);
                        tokio::time::sleep(policy.delay_for_attempt(attempt_no)).await;
                        attempt_no += 1;
                    }
                    Err(error) => break Err(error),
                }
            };
            Some(SessionAction::PurchaseFinalized {
                epoch,
                record,
                outcome,
                resolves_attempt,
            })
        })
    }

    fn purchase_call_failed(
        &self,
        state: &mut SessionState,
        epoch: u64,
        request_id: u64,
        error: crate::error::GatewayError,
        env: &SessionEnvironment,
    ) -> Effects {
        let resolves = epoch == state.epoch
            && matches!(
                &state.attempt,
                Some(attempt) if attempt.is_pending()
                    && attempt.epoch == state.epoch
                    && attempt.request_id == request_id
            );
        if !resolves {
            // The listener already settled that attempt, or the session was
            // torn down; the direct failure carries no new information.
            tracing::debug!(epoch, request_id, %error, "unmatched purchase call failure ignored");
            return smallvec![];
        }
        tracing::warn!(%error, "purchase request failed");
        let error: SessionError = PurchaseRequestError::Gateway(error).into();
        if let Some(attempt) = state.attempt.as_mut() {
            attempt.resolution = Some(AttemptResolution::Failed(error.clone()));
        }
        state.last_error = Some(error);
        self.transition(state, SessionPhase::PurchaseFailed, env);
        smallvec![]
    }

    fn purchase_errored(
        &self,
        state: &mut SessionState,
        epoch: u64,
        failure: PurchaseFailure,
        env: &SessionEnvironment,
    ) -> Effects {
        let resolves = epoch == state.epoch
            && matches!(
                &state.attempt,
                Some(attempt) if attempt.is_pending()
                    && attempt.epoch == state.epoch
                    && failure
                        .product_id
                        .as_ref()
                        .is_none_or(|product| *product == attempt.product_id)
            );
        if !resolves {
            tracing::warn!(%failure, "out-of-band purchase error");
            state.record_out_of_band(failure);
            return smallvec![];
        }
        tracing::warn!(%failure, "purchase failed via error listener");
        let error = SessionError::PurchaseNotification(failure);
        if let Some(attempt) = state.attempt.as_mut() {
            attempt.resolution = Some(AttemptResolution::Failed(error.clone()));
        }
        state.last_error = Some(error);
        self.transition(state, SessionPhase::PurchaseFailed, env);
        smallvec![]
    }

    fn purchase_finalized(
        &self,
        state: &mut SessionState,
        epoch: u64,
        record: &PurchaseRecord,
        outcome: &Result<FinalizeOutcome, crate::error::GatewayError>,
        resolves_attempt: bool,
        env: &SessionEnvironment,
    ) -> Effects {
        match outcome {
            Ok(FinalizeOutcome::Finalized) => {
                tracing::debug!(transaction_id = %record.transaction_id, "transaction finalized");
            }
            Ok(FinalizeOutcome::AlreadyFinalized) => {
                tracing::debug!(transaction_id = %record.transaction_id, "transaction was already finalized");
            }
            Err(error) => {
                // The purchase itself succeeded; a lost acknowledgment only
                // means the store may redeliver the record later.
                tracing::warn!(transaction_id = %record.transaction_id, %error, "finalization gave up");
                if resolves_attempt && epoch == state.epoch {
                    state.last_error = Some(SessionError::Finalization {
                        message: error.message.clone(),
                    });
                }
            }
        }

        if resolves_attempt
            && epoch == state.epoch
            && state.phase == SessionPhase::RequestingPurchase
        {
            self.transition(state, SessionPhase::PurchaseSucceeded, env);
        }
        smallvec![]
    }

    fn stop(&self, state: &mut SessionState, env: &SessionEnvironment) -> Effects {
        let was_active = state.phase != SessionPhase::Disconnected;
        if let Some(attempt) = state.attempt.as_mut() {
            if attempt.is_pending() {
                tracing::info!(product_id = %attempt.product_id, "pending purchase detached by teardown");
                attempt.resolution = Some(AttemptResolution::Cancelled);
            }
        }
        // Bumping the epoch detaches every in-flight effect and listener
        // delivery from this session generation.
        state.epoch += 1;
        state.catalog = None;
        self.transition(state, SessionPhase::Disconnected, env);

        if !was_active {
            return smallvec![];
        }
        let gateway = Arc::clone(&env.gateway);
        smallvec![crate::async_effect!({
            if let Err(error) = gateway.disconnect().await {
                tracing::warn!(%error, "disconnect failed during teardown");
            }
            None
        })]
    }
}
