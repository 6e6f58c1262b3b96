//! # Purchase Session Runtime
//!
//! The runtime that drives the session reducer: it owns the state, executes
//! the effects a reduction returns, and feeds resulting actions back through
//! the reducer.
//!
//! ## Core Components
//!
//! - **`SessionStore`**: owns state behind an `RwLock`, serializes
//!   reductions, broadcasts every processed action, and publishes state
//!   snapshots on a watch channel
//! - **`SessionManager`**: the caller-facing facade — `start`,
//!   `load_catalog`, `request_purchase`, `stop` — that bridges gateway
//!   listeners into the store and awaits terminal actions
//!
//! ## Example
//!
//! ```ignore
//! let manager = SessionManager::new(gateway, SessionConfig::default());
//! manager.start().await?;
//! let catalog = manager.load_catalog(vec![product_id]).await?;
//! let record = manager.request_purchase(catalog.offers()[0].product_id.clone()).await?;
//! manager.stop().await?;
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{RwLock, broadcast, watch};

use purchase_session_core::{
    Effect, Reducer, SessionAction, SessionEnvironment, SessionReducer, SessionState,
};

pub mod manager;

pub use manager::{ManagerError, SessionConfig, SessionManager};

/// Error types for the store runtime
pub mod error {
    use thiserror::Error;

    /// Errors that can occur during store operations.
    #[derive(Error, Debug)]
    pub enum SessionStoreError {
        /// Store is shutting down and not accepting new actions.
        #[error("session store is shutting down")]
        ShutdownInProgress,

        /// Shutdown timed out waiting for effects to complete.
        #[error("shutdown timed out with {0} effects still running")]
        ShutdownTimeout(usize),

        /// Timeout waiting for a terminal action.
        #[error("timeout waiting for action")]
        Timeout,

        /// The action broadcast channel closed, typically because the store
        /// is shutting down.
        #[error("action broadcast channel closed")]
        ChannelClosed,
    }
}

pub use error::SessionStoreError;

/// Handle for tracking effect completion.
///
/// Returned by [`SessionStore::send`] so a caller can wait for the effects
/// spawned by an action to finish.
#[derive(Clone)]
pub struct EffectHandle {
    effects: Arc<AtomicUsize>,
    completion: watch::Receiver<()>,
}

impl EffectHandle {
    fn new() -> (Self, EffectTracking) {
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = watch::channel(());

        let handle = Self {
            effects: Arc::clone(&counter),
            completion: rx,
        };
        let tracking = EffectTracking {
            counter,
            notifier: tx,
        };
        (handle, tracking)
    }

    /// A handle that is already complete.
    #[must_use]
    pub fn completed() -> Self {
        let (tx, rx) = watch::channel(());
        let _ = tx.send(());
        Self {
            effects: Arc::new(AtomicUsize::new(0)),
            completion: rx,
        }
    }

    /// Waits until every tracked effect has completed.
    pub async fn wait(&mut self) {
        while self.effects.load(Ordering::SeqCst) > 0 {
            let _ = self.completion.changed().await;
        }
    }

    /// Waits for effect completion with a timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SessionStoreError::Timeout`] if the timeout expires first.
    pub async fn wait_with_timeout(&mut self, timeout: Duration) -> Result<(), SessionStoreError> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| SessionStoreError::Timeout)
    }
}

impl std::fmt::Debug for EffectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectHandle")
            .field("pending_effects", &self.effects.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Tracking context passed through effect execution.
#[derive(Clone)]
struct EffectTracking {
    counter: Arc<AtomicUsize>,
    notifier: watch::Sender<()>,
}

impl EffectTracking {
    fn increment(&self) {
        self.counter.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement(&self) {
        if self.counter.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _ = self.notifier.send(());
        }
    }
}

/// RAII guard that decrements the per-action effect counter on drop, so the
/// counter stays correct even if an effect panics.
struct DecrementGuard(EffectTracking);

impl Drop for DecrementGuard {
    fn drop(&mut self) {
        self.0.decrement();
    }
}

/// Guard that decrements the global pending-effect counter on drop, used for
/// shutdown tracking.
struct AtomicCounterGuard(Arc<AtomicUsize>);

impl Drop for AtomicCounterGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The runtime for the session reducer.
///
/// The store manages:
/// 1. State (behind an `RwLock`; the reducer runs under the write lock, so
///    a precondition check and the transition it guards are atomic)
/// 2. Effect execution with a feedback loop
/// 3. An action broadcast observed by callers waiting for outcomes
/// 4. A state snapshot channel for read-only observers
///
/// Every processed action is broadcast *after* its reduction, so an observer
/// woken by an action always reads post-transition state.
pub struct SessionStore {
    state: Arc<RwLock<SessionState>>,
    reducer: SessionReducer,
    environment: SessionEnvironment,
    shutdown: Arc<AtomicBool>,
    pending_effects: Arc<AtomicUsize>,
    action_broadcast: broadcast::Sender<SessionAction>,
    snapshot: Arc<watch::Sender<SessionState>>,
}

impl Clone for SessionStore {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            reducer: self.reducer,
            environment: self.environment.clone(),
            shutdown: Arc::clone(&self.shutdown),
            pending_effects: Arc::clone(&self.pending_effects),
            action_broadcast: self.action_broadcast.clone(),
            snapshot: Arc::clone(&self.snapshot),
        }
    }
}

impl SessionStore {
    /// Creates a store with the default broadcast capacity of 16.
    #[must_use]
    pub fn new(
        initial_state: SessionState,
        reducer: SessionReducer,
        environment: SessionEnvironment,
    ) -> Self {
        Self::with_broadcast_capacity(initial_state, reducer, environment, 16)
    }

    /// Creates a store with a custom action broadcast capacity. Increase it
    /// when observers are slow to drain the channel.
    #[must_use]
    pub fn with_broadcast_capacity(
        initial_state: SessionState,
        reducer: SessionReducer,
        environment: SessionEnvironment,
        capacity: usize,
    ) -> Self {
        let (action_broadcast, _) = broadcast::channel(capacity);
        let (snapshot, _) = watch::channel(initial_state.clone());

        Self {
            state: Arc::new(RwLock::new(initial_state)),
            reducer,
            environment,
            shutdown: Arc::new(AtomicBool::new(false)),
            pending_effects: Arc::new(AtomicUsize::new(0)),
            action_broadcast,
            snapshot: Arc::new(snapshot),
        }
    }

    /// Sends an action to the store.
    ///
    /// The reducer executes synchronously under the write lock; the effects
    /// it returns are spawned and may feed further actions back. `send`
    /// returns once effect execution has *started*, not completed — await
    /// the returned [`EffectHandle`] to wait for completion.
    ///
    /// # Errors
    ///
    /// Returns [`SessionStoreError::ShutdownInProgress`] if the store is
    /// shutting down.
    #[tracing::instrument(skip(self, action), fields(action = action.kind()))]
    pub async fn send(&self, action: SessionAction) -> Result<EffectHandle, SessionStoreError> {
        if self.shutdown.load(Ordering::Acquire) {
            tracing::warn!("rejected action: store is shutting down");
            metrics::counter!("session.store.rejected_actions").increment(1);
            return Err(SessionStoreError::ShutdownInProgress);
        }

        metrics::counter!("session.store.actions", "kind" => action.kind()).increment(1);

        let (handle, tracking) = EffectHandle::new();

        let effects = {
            let mut state = self.state.write().await;

            let start = std::time::Instant::now();
            let effects = self
                .reducer
                .reduce(&mut state, action.clone(), &self.environment);
            metrics::histogram!("session.store.reducer_duration_seconds")
                .record(start.elapsed().as_secs_f64());

            // Publish the snapshot while still holding the lock, so the
            // watch channel never observes snapshots out of order.
            self.snapshot.send_replace(state.clone());

            effects
        };

        // Broadcast after the reduction so a waiter woken by this action
        // reads post-transition state.
        let _ = self.action_broadcast.send(action);

        for effect in effects {
            self.execute_effect(effect, tracking.clone());
        }

        Ok(handle)
    }

    /// Sends an action and waits for a matching action.
    ///
    /// Designed for request-response flows: subscribes to the action
    /// broadcast *before* sending to avoid losing the outcome, then returns
    /// the first broadcast action matching the predicate.
    ///
    /// # Errors
    ///
    /// - [`SessionStoreError::Timeout`] if no matching action arrives in time
    /// - [`SessionStoreError::ChannelClosed`] if the broadcast channel closes
    /// - [`SessionStoreError::ShutdownInProgress`] if the store is shutting down
    pub async fn send_and_wait_for<F>(
        &self,
        action: SessionAction,
        predicate: F,
        timeout: Duration,
    ) -> Result<SessionAction, SessionStoreError>
    where
        F: Fn(&SessionAction) -> bool,
    {
        let mut rx = self.action_broadcast.subscribe();
        self.send(action).await?;

        tokio::time::timeout(timeout, async {
            loop {
                match rx.recv().await {
                    Ok(action) if predicate(&action) => return Ok(action),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Slow consumer; if the terminal action was among the
                        // dropped ones the timeout will catch it.
                        tracing::warn!(skipped, "action observer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(SessionStoreError::ChannelClosed);
                    }
                }
            }
        })
        .await
        .map_err(|_| SessionStoreError::Timeout)?
    }

    /// Subscribes to every action the store processes.
    #[must_use]
    pub fn subscribe_actions(&self) -> broadcast::Receiver<SessionAction> {
        self.action_broadcast.subscribe()
    }

    /// Subscribes to state snapshots, published after every reduction.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.snapshot.subscribe()
    }

    /// Reads current state through a closure, so the read lock is released
    /// promptly.
    pub async fn state<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&SessionState) -> T,
    {
        let state = self.state.read().await;
        f(&state)
    }

    /// Initiates graceful shutdown: rejects new actions and waits for
    /// pending effects to complete.
    ///
    /// # Errors
    ///
    /// Returns [`SessionStoreError::ShutdownTimeout`] if effects are still
    /// running when the timeout expires.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), SessionStoreError> {
        tracing::info!("initiating graceful shutdown");
        self.shutdown.store(true, Ordering::Release);

        let start = std::time::Instant::now();
        let poll_interval = Duration::from_millis(100);

        loop {
            let pending = self.pending_effects.load(Ordering::Acquire);
            if pending == 0 {
                tracing::info!("all effects completed, shutdown successful");
                return Ok(());
            }
            if start.elapsed() >= timeout {
                tracing::error!(pending, "shutdown timed out with effects still running");
                return Err(SessionStoreError::ShutdownTimeout(pending));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    fn execute_effect(&self, effect: Effect<SessionAction>, tracking: EffectTracking) {
        match effect {
            Effect::None => {}
            Effect::Future(future) => {
                tracking.increment();
                self.pending_effects.fetch_add(1, Ordering::SeqCst);
                let pending_guard = AtomicCounterGuard(Arc::clone(&self.pending_effects));

                let store = self.clone();
                tokio::spawn(async move {
                    let _guard = DecrementGuard(tracking);
                    let _pending_guard = pending_guard;

                    if let Some(action) = future.await {
                        // Feedback loop: effect-produced actions go through
                        // the same reduction and broadcast path.
                        if let Err(error) = store.send(action).await {
                            tracing::debug!(%error, "dropping effect feedback action");
                        }
                    }
                });
            }
        }
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("shutdown", &self.shutdown.load(Ordering::Acquire))
            .field(
                "pending_effects",
                &self.pending_effects.load(Ordering::Acquire),
            )
            .finish_non_exhaustive()
    }
}
