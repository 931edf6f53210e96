//! Explicit-state model checking core.
//!
//! States are canonical byte blocks kept in per-worker arenas and deduplicated
//! in hash tables; the search distributes them across workers by hash and
//! optionally applies partial order reduction and accepting-cycle detection.

pub mod arena;
pub mod barrier;
pub mod block;
pub mod canonical;
pub mod error;
pub mod frontier;
pub mod hash;
pub mod heap;
pub mod interp;
pub mod models;
pub mod owcty;
pub mod por;
pub mod search;
pub mod shared_table;
pub mod table;

pub use arena::{Arena, ArenaError, Slot, Transfer};
pub use block::{BlockHasher, Layout};
pub use canonical::Canonicalizer;
pub use error::{SearchError, SearchResult};
pub use frontier::FrontierKind;
pub use heap::{Configuration, Heap, HeapError, Object, Pointer, PointerKind};
pub use interp::Interpreter;
pub use search::{
    search, Handle, ProgressCounters, Search, SearchConfig, SearchOutcome, SearchStats, StateRef,
    TransitionRef, Verdict,
};
pub use table::{HashSet, TableError};
