//! The caller-facing session facade.
//!
//! [`SessionManager`] wires the gateway's listener channels into the store,
//! translates the Presentation Layer's calls into actions, and awaits the
//! terminal action of each operation so callers get a plain `Result`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};

use purchase_session_core::{
    AttemptResolution, Catalog, ListenerHandle, ProductId, PurchaseRecord, RetryPolicy,
    SessionAction, SessionEnvironment, SessionError, SessionOperation, SessionReducer,
    SessionState, StoreGateway,
};

use crate::{SessionStore, SessionStoreError};

/// Configuration for a [`SessionManager`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum time to wait for any single operation's terminal action.
    pub operation_timeout: Duration,
    /// Capacity of the store's action broadcast channel.
    pub broadcast_capacity: usize,
    /// Retry policy for transaction finalization.
    pub finalize_retry: RetryPolicy,
    /// Maximum time `shutdown` waits for in-flight effects.
    pub shutdown_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30),
            broadcast_capacity: 16,
            finalize_retry: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Errors surfaced by [`SessionManager`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// The session reported a domain error.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The runtime failed (timeout, shutdown, closed channel).
    #[error(transparent)]
    Store(#[from] SessionStoreError),
}

struct SessionListeners {
    _update: ListenerHandle,
    _error: ListenerHandle,
}

/// The purchase session manager.
///
/// One manager owns one session. Operations are async and return once the
/// session reaches the operation's terminal state; listener notifications
/// arriving at any point are funneled through the same reducer, so callers
/// and listeners can never observe conflicting decisions.
pub struct SessionManager {
    store: Arc<SessionStore>,
    gateway: Arc<dyn StoreGateway>,
    config: SessionConfig,
    listeners: Mutex<Option<SessionListeners>>,
    action_tx: mpsc::UnboundedSender<SessionAction>,
    next_request_id: AtomicU64,
}

impl SessionManager {
    /// Creates a manager over the given gateway.
    #[must_use]
    pub fn new(gateway: Arc<dyn StoreGateway>, config: SessionConfig) -> Self {
        let environment = SessionEnvironment::new(Arc::clone(&gateway))
            .with_finalize_retry(config.finalize_retry.clone());
        let store = Arc::new(SessionStore::with_broadcast_capacity(
            SessionState::new(),
            SessionReducer,
            environment,
            config.broadcast_capacity,
        ));

        // Listener callbacks are synchronous; this channel bridges them into
        // the async store.
        let (action_tx, mut action_rx) = mpsc::unbounded_channel::<SessionAction>();
        let pump_store = Arc::clone(&store);
        tokio::spawn(async move {
            while let Some(action) = action_rx.recv().await {
                if let Err(error) = pump_store.send(action).await {
                    tracing::debug!(%error, "dropping listener event");
                }
            }
        });

        Self {
            store,
            gateway,
            config,
            listeners: Mutex::new(None),
            action_tx,
            next_request_id: AtomicU64::new(0),
        }
    }

    /// Connects to the store and registers both purchase listeners.
    ///
    /// Listeners are registered as soon as the connection is established,
    /// before this method returns, so no notification window is ever open
    /// without a listener.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Protocol`] if a session is already running
    /// - [`SessionError::Connection`] if the gateway connect fails
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<(), ManagerError> {
        let outcome = self
            .store
            .send_and_wait_for(
                SessionAction::Start,
                |action| {
                    matches!(
                        action,
                        SessionAction::Connected { .. }
                            | SessionAction::ConnectFailed { .. }
                            | SessionAction::CommandRejected {
                                operation: SessionOperation::Start,
                                ..
                            }
                    )
                },
                self.config.operation_timeout,
            )
            .await?;

        match outcome {
            SessionAction::Connected { epoch } => {
                self.register_listeners(epoch);
                tracing::info!(epoch, "session started");
                Ok(())
            }
            SessionAction::ConnectFailed { error, .. } => Err(SessionError::Connection {
                message: error.message,
            }
            .into()),
            SessionAction::CommandRejected { error, .. } => Err(error.into()),
            _ => Err(SessionStoreError::ChannelClosed.into()),
        }
    }

    /// Loads the offer catalog for the given products.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Catalog`] if the query fails or `product_ids` is empty
    /// - [`SessionError::Protocol`] if no catalog load is permitted in the
    ///   current phase
    #[tracing::instrument(skip(self), fields(products = product_ids.len()))]
    pub async fn load_catalog(
        &self,
        product_ids: Vec<ProductId>,
    ) -> Result<Catalog, ManagerError> {
        let outcome = self
            .store
            .send_and_wait_for(
                SessionAction::LoadCatalog { product_ids },
                |action| {
                    matches!(
                        action,
                        SessionAction::CatalogLoaded { .. }
                            | SessionAction::CatalogLoadFailed { .. }
                            | SessionAction::CommandRejected {
                                operation: SessionOperation::LoadCatalog,
                                ..
                            }
                    )
                },
                self.config.operation_timeout,
            )
            .await?;

        match outcome {
            SessionAction::CatalogLoaded { offers, .. } => Ok(Catalog::new(offers)),
            SessionAction::CatalogLoadFailed { error, .. } => {
                Err(SessionError::from(purchase_session_core::CatalogError::Query(error)).into())
            }
            SessionAction::CommandRejected { error, .. } => Err(error.into()),
            _ => Err(SessionStoreError::ChannelClosed.into()),
        }
    }

    /// Requests a purchase and waits for its resolution.
    ///
    /// The outcome may arrive through the direct gateway response or through
    /// a listener notification; whichever settles the attempt first wins.
    /// On success the returned record has already been finalized.
    ///
    /// # Errors
    ///
    /// - [`SessionError::PurchaseRequest`] if the product is unknown or the
    ///   direct call fails
    /// - [`SessionError::PurchaseNotification`] if the error listener settles
    ///   the attempt
    /// - [`SessionError::Cancelled`] if the session is stopped while pending
    #[tracing::instrument(skip(self), fields(product = %product_id))]
    pub async fn request_purchase(
        &self,
        product_id: ProductId,
    ) -> Result<PurchaseRecord, ManagerError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut rx = self.store.subscribe_actions();
        self.store
            .send(SessionAction::RequestPurchase {
                product_id,
                request_id,
            })
            .await?;

        tokio::time::timeout(self.config.operation_timeout, async {
            loop {
                let action = match rx.recv().await {
                    Ok(action) => action,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "purchase waiter lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(ManagerError::Store(SessionStoreError::ChannelClosed));
                    }
                };

                match action {
                    SessionAction::CommandRejected {
                        operation: SessionOperation::RequestPurchase,
                        error,
                        request_id: Some(id),
                    } if id == request_id => return Err(error.into()),
                    // Success is only announced once finalization reported
                    // back for the attempt's own record.
                    SessionAction::PurchaseFinalized {
                        record,
                        resolves_attempt: true,
                        ..
                    } => {
                        let ours = self
                            .store
                            .state(|s| {
                                s.attempt.as_ref().is_some_and(|a| a.request_id == request_id)
                            })
                            .await;
                        if ours {
                            return Ok(record);
                        }
                    }
                    // These may or may not have settled the attempt; the
                    // broadcast arrives after the reduction, so state tells.
                    SessionAction::PurchaseResponse { .. }
                    | SessionAction::PurchaseErrored { .. }
                    | SessionAction::Stop => {
                        let resolution = self
                            .store
                            .state(|s| {
                                s.attempt
                                    .as_ref()
                                    .filter(|a| a.request_id == request_id)
                                    .and_then(|a| a.resolution.clone())
                            })
                            .await;
                        match resolution {
                            Some(AttemptResolution::Failed(error)) => return Err(error.into()),
                            Some(AttemptResolution::Cancelled) => {
                                return Err(ManagerError::Session(SessionError::Cancelled));
                            }
                            // Succeeded: keep waiting for PurchaseFinalized.
                            // None: the event did not concern this attempt.
                            Some(AttemptResolution::Succeeded(_)) | None => {}
                        }
                    }
                    _ => {}
                }
            }
        })
        .await
        .map_err(|_| ManagerError::Store(SessionStoreError::Timeout))?
    }

    /// Tears the session down: releases both listeners, cancels any pending
    /// attempt, and disconnects.
    ///
    /// Safe to call from any phase, including when already stopped.
    ///
    /// # Errors
    ///
    /// Returns a store error if the runtime is already shut down.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), ManagerError> {
        // Listeners go first: once released, the store cannot deliver into a
        // dead session.
        self.release_listeners();

        let mut handle = self.store.send(SessionAction::Stop).await?;
        // Best-effort wait for the disconnect effect.
        if handle
            .wait_with_timeout(self.config.operation_timeout)
            .await
            .is_err()
        {
            tracing::warn!("disconnect did not complete within the operation timeout");
        }
        tracing::info!("session stopped");
        Ok(())
    }

    /// Shuts the runtime down after stopping the session. New operations are
    /// rejected once this is called.
    ///
    /// # Errors
    ///
    /// Returns [`SessionStoreError::ShutdownTimeout`] if effects are still
    /// running when the timeout expires.
    pub async fn shutdown(&self) -> Result<(), ManagerError> {
        if let Err(error) = self.stop().await {
            tracing::debug!(%error, "stop during shutdown failed");
        }
        self.store.shutdown(self.config.shutdown_timeout).await?;
        Ok(())
    }

    /// Subscribes to state snapshots, published after every transition.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.store.subscribe_state()
    }

    /// Subscribes to every action the session processes.
    #[must_use]
    pub fn subscribe_actions(&self) -> broadcast::Receiver<SessionAction> {
        self.store.subscribe_actions()
    }

    /// A clone of the current session state.
    pub async fn current_state(&self) -> SessionState {
        self.store.state(Clone::clone).await
    }

    fn register_listeners(&self, epoch: u64) {
        let tx = self.action_tx.clone();
        let update = self.gateway.on_purchase_updated(Box::new(move |record| {
            let _ = tx.send(SessionAction::PurchaseUpdated { epoch, record });
        }));

        let tx = self.action_tx.clone();
        let error = self.gateway.on_purchase_error(Box::new(move |failure| {
            let _ = tx.send(SessionAction::PurchaseErrored { epoch, failure });
        }));

        let previous = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(SessionListeners {
                _update: update,
                _error: error,
            });
        // A leftover pair from an earlier generation is released on drop.
        drop(previous);
    }

    fn release_listeners(&self) {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if listeners.is_some() {
            tracing::debug!("released purchase listeners");
        }
        drop(listeners);
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
