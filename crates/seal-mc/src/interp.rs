//! The successor generator the search drives.

use crate::heap::{Configuration, HeapError};
use std::fmt::Debug;

/// Executes program steps. Implementations must be pure: the successors of a
/// configuration depend on nothing but the configuration.
pub trait Interpreter: Sync {
    /// Transition label reported to callbacks.
    type Label: Clone + PartialEq + Debug + Send + Sync + 'static;

    /// Every successor of `state`, appended to `out`.
    fn successors(
        &self,
        state: &Configuration,
        out: &mut Vec<(Configuration, Self::Label)>,
    ) -> Result<(), HeapError>;

    /// A subset of the successors that is enough to explore when only
    /// interleavings of independent steps are skipped. Returns true if the set
    /// is a proper subset.
    fn ample(
        &self,
        state: &Configuration,
        out: &mut Vec<(Configuration, Self::Label)>,
    ) -> Result<bool, HeapError> {
        self.successors(state, out)?;
        Ok(false)
    }

    fn is_goal(&self, _state: &Configuration) -> bool {
        false
    }

    fn is_accepting(&self, _state: &Configuration) -> bool {
        false
    }
}
