//! Accepting-cycle detection (One Way Catch Them Young).
//!
//! Starting from the whole graph, alternately keep only the states reachable
//! from accepting states in the candidate set, and drop candidates with no
//! predecessor among the candidates. The fixpoint is non-empty exactly when an
//! accepting state lies on a cycle.

use crate::error::{SearchError, SearchResult};
use crate::por::Graph;
use ahash::AHashMap;
use tracing::debug;

/// Explored graph in index form.
struct Indexed<N> {
    nodes: Vec<N>,
    succs: Vec<Vec<usize>>,
    accepting: Vec<bool>,
}

fn index<G: Graph>(graph: &mut G) -> SearchResult<Indexed<G::Node>> {
    let nodes = graph.nodes();
    let ids: AHashMap<G::Node, usize> = nodes.iter().enumerate().map(|(i, &n)| (n, i)).collect();
    let mut succs = Vec::with_capacity(nodes.len());
    let mut accepting = Vec::with_capacity(nodes.len());
    let mut out = Vec::new();
    for &n in &nodes {
        out.clear();
        graph.successors(n, &mut out)?;
        let mut row = Vec::with_capacity(out.len());
        for s in &out {
            match ids.get(s) {
                Some(&i) => row.push(i),
                None => {
                    return Err(SearchError::invariant(format!(
                        "successor {s:?} of {n:?} was never explored"
                    )))
                }
            }
        }
        succs.push(row);
        accepting.push(graph.is_accepting(n)?);
    }
    Ok(Indexed {
        nodes,
        succs,
        accepting,
    })
}

/// An accepting state on a cycle, if there is one.
pub fn accepting_cycle<G: Graph>(graph: &mut G) -> SearchResult<Option<G::Node>> {
    let g = index(graph)?;
    let n = g.nodes.len();
    let mut live = vec![true; n];
    let mut rounds = 0;

    loop {
        rounds += 1;
        let before = live.iter().filter(|&&l| l).count();

        // Reset: keep what accepting candidates reach.
        let mut reached = vec![false; n];
        let mut stack: Vec<usize> = (0..n).filter(|&v| live[v] && g.accepting[v]).collect();
        for &v in &stack {
            reached[v] = true;
        }
        while let Some(v) = stack.pop() {
            for &s in &g.succs[v] {
                if live[s] && !reached[s] {
                    reached[s] = true;
                    stack.push(s);
                }
            }
        }
        live = reached;

        // Elimination: drop candidates without candidate predecessors.
        let mut indeg = vec![0usize; n];
        for v in (0..n).filter(|&v| live[v]) {
            for &s in &g.succs[v] {
                if live[s] {
                    indeg[s] += 1;
                }
            }
        }
        let mut stack: Vec<usize> = (0..n).filter(|&v| live[v] && indeg[v] == 0).collect();
        while let Some(v) = stack.pop() {
            live[v] = false;
            for &s in &g.succs[v] {
                if live[s] {
                    indeg[s] -= 1;
                    if indeg[s] == 0 {
                        stack.push(s);
                    }
                }
            }
        }

        let after = live.iter().filter(|&&l| l).count();
        if after == 0 || after == before {
            debug!(rounds, remaining = after, "accepting-cycle detection finished");
            break;
        }
    }

    Ok(witness(&g, &live).map(|v| g.nodes[v]))
}

/// First accepting candidate that reaches itself through candidates.
fn witness<N>(g: &Indexed<N>, live: &[bool]) -> Option<usize> {
    let n = live.len();
    (0..n)
        .filter(|&v| live[v] && g.accepting[v])
        .find(|&start| {
            let mut seen = vec![false; n];
            let mut stack = vec![start];
            while let Some(v) = stack.pop() {
                for &s in &g.succs[v] {
                    if s == start {
                        return true;
                    }
                    if live[s] && !seen[s] {
                        seen[s] = true;
                        stack.push(s);
                    }
                }
            }
            false
        })
}
