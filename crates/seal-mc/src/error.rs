//! Search errors.

use crate::arena::ArenaError;
use crate::heap::HeapError;
use crate::table::TableError;
use thiserror::Error;

/// Fatal search error. Any of these aborts every worker; no partial result
/// is reported alongside it.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Arena(#[from] ArenaError),

    #[error(transparent)]
    Table(#[from] TableError),

    #[error("corrupt state block: {0}")]
    Heap(#[from] HeapError),

    #[error("internal invariant violated: {detail}")]
    InvariantViolation { detail: String },

    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl SearchError {
    pub(crate) fn invariant(detail: impl Into<String>) -> Self {
        SearchError::InvariantViolation {
            detail: detail.into(),
        }
    }

    /// Resource exhaustion, as opposed to a defect.
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            SearchError::Arena(ArenaError::Exhausted { .. }) | SearchError::Table(TableError::Full { .. })
        )
    }
}

pub type SearchResult<T> = Result<T, SearchError>;
