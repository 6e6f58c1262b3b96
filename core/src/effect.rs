//! Effects describe work to be performed after a state transition.
//!
//! A reducer never performs I/O itself; it returns effect values and the
//! runtime executes them, feeding any resulting action back through the
//! reducer.

use std::future::Future;
use std::pin::Pin;

/// A description of asynchronous work that may produce a follow-up action.
pub enum Effect<A> {
    /// No work to perform.
    None,
    /// Asynchronous work, optionally yielding an action to feed back.
    Future(Pin<Box<dyn Future<Output = Option<A>> + Send>>),
}

impl<A> Effect<A> {
    /// Returns `true` if this effect performs no work.
    pub fn is_none(&self) -> bool {
        matches!(self, Effect::None)
    }

    /// Wraps a future into an effect.
    pub fn future<F>(fut: F) -> Self
    where
        F: Future<Output = Option<A>> + Send + 'static,
    {
        Effect::Future(Box::pin(fut))
    }
}

impl<A> Default for Effect<A> {
    fn default() -> Self {
        Effect::None
    }
}

impl<A> std::fmt::Debug for Effect<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Effect::None => f.write_str("Effect::None"),
            Effect::Future(_) => f.write_str("Effect::Future(..)"),
        }
    }
}

/// Creates an [`Effect::Future`] from an async block.
///
/// The block must evaluate to `Option<A>`; return `Some(action)` to feed an
/// action back into the reducer, `None` for fire-and-forget work.
///
/// ```ignore
/// let effect = async_effect!({
///     gateway.connect().await.ok();
///     Some(SessionAction::Connected)
/// });
/// ```
#[macro_export]
macro_rules! async_effect {
    ($body:expr) => {
        $crate::effect::Effect::future(async move { $body })
    };
}
