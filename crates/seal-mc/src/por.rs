//! Ample-set elimination.
//!
//! After a search that used reduced (ample) successor sets, every cycle of the
//! explored graph must contain at least one fully expanded state, or a
//! transition could be postponed forever along it. The eliminator finds such
//! cycles by peeling the graph the way a topological sort would: a state whose
//! predecessors have all been peeled is peeled too. Whatever cannot be peeled
//! sits on or behind a cycle. One of those states is forced to full expansion
//! (which makes it safe, so it is peeled) and the peeling continues.
//!
//! The state extension carries the bookkeeping: the number of explored
//! transitions entering the state, the countdown used while peeling, and the
//! status bits below.

use crate::error::{SearchError, SearchResult};
use std::collections::VecDeque;
use std::fmt::Debug;
use std::hash::Hash;
use tracing::{debug, trace};

/// Extension bits.
pub mod bits {
    /// Expanded with a proper subset of its successors.
    pub const REDUCED: u32 = 1 << 0;
    /// Expanded (or to be expanded) with all of its successors. Together with
    /// `REMOVE` it only records the request.
    pub const FULL: u32 = 1 << 1;
    /// Peeled in the current elimination round.
    pub const DONE: u32 = 1 << 2;
    /// Forced to full expansion; its missing successors still have to be
    /// explored.
    pub const REMOVE: u32 = 1 << 3;
}

/// Per-state POR extension, stored little-endian in the block extension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PorExt {
    /// Explored transitions entering the state.
    pub pred_total: u32,
    /// Predecessors not yet peeled in the current round.
    pub pred_count: u32,
    pub bits: u32,
}

impl PorExt {
    /// Bytes taken in the block extension.
    pub const LEN: usize = 12;

    pub fn read(ext: &[u8]) -> Self {
        let word = |i: usize| u32::from_le_bytes([ext[i], ext[i + 1], ext[i + 2], ext[i + 3]]);
        Self {
            pred_total: word(0),
            pred_count: word(4),
            bits: word(8),
        }
    }

    pub fn write(&self, ext: &mut [u8]) {
        ext[0..4].copy_from_slice(&self.pred_total.to_le_bytes());
        ext[4..8].copy_from_slice(&self.pred_count.to_le_bytes());
        ext[8..12].copy_from_slice(&self.bits.to_le_bytes());
    }

    #[inline]
    pub fn has(&self, bit: u32) -> bool {
        self.bits & bit != 0
    }

    /// Whether the transitions explored out of this state are all of its
    /// successors: full expansion was requested and has been carried out.
    #[inline]
    pub fn explored_full(&self) -> bool {
        self.has(bits::FULL) && !self.has(bits::REMOVE)
    }

    #[inline]
    pub fn set(&mut self, bit: u32, on: bool) {
        if on {
            self.bits |= bit;
        } else {
            self.bits &= !bit;
        }
    }
}

/// An explored state graph.
pub trait Graph {
    type Node: Copy + Eq + Hash + Debug;

    /// All nodes, in an order that is stable for a given exploration.
    fn nodes(&self) -> Vec<Self::Node>;

    /// Successors along the transitions the search followed, one entry per
    /// transition. A state forced to full expansion whose missing successors
    /// have not been explored yet (`REMOVE`) still reports its ample set.
    fn successors(&mut self, node: Self::Node, out: &mut Vec<Self::Node>) -> SearchResult<()>;

    fn is_accepting(&self, node: Self::Node) -> SearchResult<bool>;
}

/// A graph whose nodes carry a [`PorExt`].
pub trait PorGraph: Graph {
    fn ext(&self, node: Self::Node) -> PorExt;
    fn set_ext(&mut self, node: Self::Node, ext: PorExt);
}

/// Outcome of one elimination round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Elimination<N> {
    /// States forced to full expansion.
    pub forced: usize,
    /// Forced states that were expanded reduced: they need their missing
    /// successors explored. Marked `REMOVE`.
    pub expand: Vec<N>,
}

/// Run the elimination to quiescence.
pub fn eliminate<G: PorGraph>(graph: &mut G) -> SearchResult<Elimination<G::Node>> {
    let nodes = graph.nodes();
    for &n in &nodes {
        let mut e = graph.ext(n);
        e.pred_count = e.pred_total;
        e.set(bits::DONE, false);
        graph.set_ext(n, e);
    }

    let mut queue = VecDeque::new();
    for &n in &nodes {
        let e = graph.ext(n);
        if e.pred_count == 0 || e.has(bits::FULL) {
            seed(graph, n, &mut queue);
        }
    }

    let mut result = Elimination {
        forced: 0,
        expand: Vec::new(),
    };
    let mut succs = Vec::new();
    // Scan positions for stalls: peeled nodes never come back.
    let mut accepting = Vec::new();
    for &n in &nodes {
        if graph.is_accepting(n)? {
            accepting.push(n);
        }
    }
    let mut cursor = 0;
    let mut acc_cursor = 0;
    let mut stalls = 0usize;

    loop {
        while let Some(n) = queue.pop_front() {
            succs.clear();
            graph.successors(n, &mut succs)?;
            for &s in &succs {
                let mut e = graph.ext(s);
                if e.has(bits::DONE) {
                    continue;
                }
                if e.pred_count == 0 {
                    return Err(SearchError::invariant(format!(
                        "predecessor count underflow at {s:?} (total {})",
                        e.pred_total
                    )));
                }
                e.pred_count -= 1;
                if e.pred_count == 0 {
                    e.set(bits::DONE, true);
                    queue.push_back(s);
                }
                graph.set_ext(s, e);
            }
        }

        while cursor < nodes.len() && graph.ext(nodes[cursor]).has(bits::DONE) {
            cursor += 1;
        }
        if cursor == nodes.len() {
            break;
        }

        stalls += 1;
        if stalls > nodes.len() {
            return Err(SearchError::invariant(
                "ample-set elimination failed to reach quiescence",
            ));
        }

        // Prefer an accepting state: a cycle through it is the one that matters.
        while acc_cursor < accepting.len() && graph.ext(accepting[acc_cursor]).has(bits::DONE) {
            acc_cursor += 1;
        }
        let victim = accepting.get(acc_cursor).copied().unwrap_or(nodes[cursor]);

        let mut e = graph.ext(victim);
        e.set(bits::FULL, true);
        if e.has(bits::REDUCED) {
            e.set(bits::REMOVE, true);
            result.expand.push(victim);
        }
        graph.set_ext(victim, e);
        result.forced += 1;
        trace!(node = ?victim, "forced to full expansion");
        seed(graph, victim, &mut queue);
    }

    debug!(
        nodes = nodes.len(),
        forced = result.forced,
        expand = result.expand.len(),
        "ample-set elimination finished"
    );
    Ok(result)
}

/// Mark `n` peeled as if its last predecessor had just arrived.
fn seed<G: PorGraph>(graph: &mut G, n: G::Node, queue: &mut VecDeque<G::Node>) {
    let mut e = graph.ext(n);
    e.pred_count = 0;
    e.set(bits::DONE, true);
    graph.set_ext(n, e);
    queue.push_back(n);
}
