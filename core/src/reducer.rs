//! The reducer contract: pure state transitions plus effect descriptions.

use smallvec::SmallVec;

use crate::effect::Effect;

/// A pure function from `(state, action, environment)` to effects.
///
/// Implementations mutate `state` in place and return descriptions of any
/// asynchronous follow-up work. They must not perform I/O directly; all
/// side effects go through the returned [`Effect`] values.
pub trait Reducer {
    /// The state this reducer manages.
    type State;
    /// The actions it understands.
    type Action;
    /// The dependencies its effects capture.
    type Environment;

    /// Applies `action` to `state`, returning follow-up effects.
    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]>;
}
