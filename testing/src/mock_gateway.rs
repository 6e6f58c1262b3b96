//! A scriptable store gateway.
//!
//! Every call is recorded, responses can be scripted per call (falling back
//! to sensible defaults), and listener notifications can be emitted on
//! demand to exercise the dual-source resolution paths.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::oneshot;

use purchase_session_core::gateway::{
    ErrorCallback, FinalizeOutcome, GatewayFuture, ListenerHandle, PurchaseFailure, StoreGateway,
    UpdateCallback,
};
use purchase_session_core::{GatewayError, Offer, ProductId, PurchaseRecord};

/// Builds a purchase record with a JSON receipt, for test fixtures.
#[must_use]
pub fn purchase_record(product_id: &str, transaction_id: &str) -> PurchaseRecord {
    PurchaseRecord {
        product_id: ProductId::from(product_id),
        transaction_id: transaction_id.to_string(),
        receipt: serde_json::json!({ "transaction_id": transaction_id }),
        purchased_at: Utc::now(),
    }
}

/// One recorded gateway invocation.
#[derive(Debug, Clone)]
pub enum GatewayCall {
    /// `connect()` was invoked.
    Connect,
    /// `disconnect()` was invoked.
    Disconnect,
    /// `query_catalog(ids)` was invoked.
    QueryCatalog(Vec<ProductId>),
    /// `request_purchase(id)` was invoked.
    RequestPurchase(ProductId),
    /// `finalize(record)` was invoked.
    Finalize(PurchaseRecord),
}

/// Scripted behavior for one `request_purchase` call.
pub enum PurchaseScript {
    /// Resolve immediately with the given result.
    Respond(Result<PurchaseRecord, GatewayError>),
    /// Stay pending until [`MockGateway::resolve_deferred`] is called (or
    /// forever, to model a direct response that never arrives).
    Defer,
}

#[derive(Default)]
struct Inner {
    calls: Vec<GatewayCall>,
    connect_script: VecDeque<Result<(), GatewayError>>,
    catalog_script: VecDeque<Result<Vec<Offer>, GatewayError>>,
    purchase_script: VecDeque<PurchaseScript>,
    finalize_script: VecDeque<Result<FinalizeOutcome, GatewayError>>,
    deferred: Vec<oneshot::Sender<Result<PurchaseRecord, GatewayError>>>,
    update_listeners: HashMap<u64, Arc<UpdateCallback>>,
    error_listeners: HashMap<u64, Arc<ErrorCallback>>,
    next_listener_id: u64,
}

/// Scriptable [`StoreGateway`] double.
///
/// Defaults when nothing is scripted: connect and disconnect succeed, the
/// catalog query returns one bare offer per requested product, a purchase
/// resolves with transaction id `txn-<product>`, and finalize succeeds.
#[derive(Default)]
pub struct MockGateway {
    inner: Arc<Mutex<Inner>>,
}

impl MockGateway {
    /// Creates a gateway with default behavior.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Scripts the result of the next `connect` call.
    pub fn script_connect(&self, result: Result<(), GatewayError>) {
        self.lock().connect_script.push_back(result);
    }

    /// Scripts the result of the next `query_catalog` call.
    pub fn script_catalog(&self, result: Result<Vec<Offer>, GatewayError>) {
        self.lock().catalog_script.push_back(result);
    }

    /// Scripts the behavior of the next `request_purchase` call.
    pub fn script_purchase(&self, script: PurchaseScript) {
        self.lock().purchase_script.push_back(script);
    }

    /// Scripts the result of the next `finalize` call.
    pub fn script_finalize(&self, result: Result<FinalizeOutcome, GatewayError>) {
        self.lock().finalize_script.push_back(result);
    }

    /// Resolves the oldest deferred purchase call. Returns `false` if no
    /// deferred call is waiting or its future was dropped.
    pub fn resolve_deferred(&self, result: Result<PurchaseRecord, GatewayError>) -> bool {
        let sender = {
            let mut inner = self.lock();
            if inner.deferred.is_empty() {
                return false;
            }
            inner.deferred.remove(0)
        };
        sender.send(result).is_ok()
    }

    /// Fires every registered purchase-updated listener.
    pub fn emit_purchase_update(&self, record: &PurchaseRecord) {
        let listeners: Vec<_> = self.lock().update_listeners.values().cloned().collect();
        for listener in listeners {
            listener(record.clone());
        }
    }

    /// Fires every registered purchase-error listener.
    pub fn emit_purchase_error(&self, failure: &PurchaseFailure) {
        let listeners: Vec<_> = self.lock().error_listeners.values().cloned().collect();
        for listener in listeners {
            listener(failure.clone());
        }
    }

    /// Every call made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.lock().calls.clone()
    }

    /// Number of listeners currently registered, across both channels.
    #[must_use]
    pub fn active_listener_count(&self) -> usize {
        let inner = self.lock();
        inner.update_listeners.len() + inner.error_listeners.len()
    }
}

impl StoreGateway for MockGateway {
    fn connect(&self) -> GatewayFuture<'_, ()> {
        let result = {
            let mut inner = self.lock();
            inner.calls.push(GatewayCall::Connect);
            inner.connect_script.pop_front().unwrap_or(Ok(()))
        };
        Box::pin(async move { result })
    }

    fn disconnect(&self) -> GatewayFuture<'_, ()> {
        self.lock().calls.push(GatewayCall::Disconnect);
        Box::pin(async move { Ok(()) })
    }

    fn query_catalog(&self, product_ids: Vec<ProductId>) -> GatewayFuture<'_, Vec<Offer>> {
        let result = {
            let mut inner = self.lock();
            inner.calls.push(GatewayCall::QueryCatalog(product_ids.clone()));
            inner
                .catalog_script
                .pop_front()
                .unwrap_or_else(|| Ok(product_ids.into_iter().map(Offer::new).collect()))
        };
        Box::pin(async move { result })
    }

    fn request_purchase(&self, product_id: ProductId) -> GatewayFuture<'_, PurchaseRecord> {
        let script = {
            let mut inner = self.lock();
            inner
                .calls
                .push(GatewayCall::RequestPurchase(product_id.clone()));
            inner.purchase_script.pop_front()
        };
        match script {
            Some(PurchaseScript::Respond(result)) => Box::pin(async move { result }),
            Some(PurchaseScript::Defer) => {
                let (tx, rx) = oneshot::channel();
                self.lock().deferred.push(tx);
                Box::pin(async move {
                    rx.await
                        .unwrap_or_else(|_| Err(GatewayError::new("deferred purchase dropped")))
                })
            }
            None => {
                let record = purchase_record(
                    product_id.as_str(),
                    &format!("txn-{}", product_id.as_str()),
                );
                Box::pin(async move { Ok(record) })
            }
        }
    }

    fn finalize(&self, record: PurchaseRecord) -> GatewayFuture<'_, FinalizeOutcome> {
        let result = {
            let mut inner = self.lock();
            inner.calls.push(GatewayCall::Finalize(record));
            inner
                .finalize_script
                .pop_front()
                .unwrap_or(Ok(FinalizeOutcome::Finalized))
        };
        Box::pin(async move { result })
    }

    fn on_purchase_updated(&self, callback: UpdateCallback) -> ListenerHandle {
        let id = {
            let mut inner = self.lock();
            let id = inner.next_listener_id;
            inner.next_listener_id += 1;
            inner.update_listeners.insert(id, Arc::new(callback));
            id
        };
        let inner = Arc::clone(&self.inner);
        ListenerHandle::new(move || {
            inner
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .update_listeners
                .remove(&id);
        })
    }

    fn on_purchase_error(&self, callback: ErrorCallback) -> ListenerHandle {
        let id = {
            let mut inner = self.lock();
            let id = inner.next_listener_id;
            inner.next_listener_id += 1;
            inner.error_listeners.insert(id, Arc::new(callback));
            id
        };
        let inner = Arc::clone(&self.inner);
        ListenerHandle::new(move || {
            inner
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .error_listeners
                .remove(&id);
        })
    }
}
