//! Small built-in programs.
//!
//! These exercise the search end to end without a real interpreter: each one
//! keeps its data in globals, thread frames and heap objects exactly like a
//! compiled program would.

use crate::heap::{Configuration, HeapError, Object, Pointer};
use crate::interp::Interpreter;

/// One counter stepping around a ring of `len` values.
#[derive(Debug, Clone)]
pub struct Ring {
    pub len: u32,
    /// Counter value of the accepting state.
    pub accepting: Option<u32>,
    /// Counter value of the goal state.
    pub goal: Option<u32>,
}

impl Ring {
    pub fn new(len: u32) -> Self {
        Self {
            len: len.max(1),
            accepting: None,
            goal: None,
        }
    }

    pub fn accepting(mut self, at: u32) -> Self {
        self.accepting = Some(at);
        self
    }

    pub fn goal(mut self, at: u32) -> Self {
        self.goal = Some(at);
        self
    }

    pub fn initial(&self) -> Configuration {
        Configuration::new(Object::new(4))
    }

    pub fn value(state: &Configuration) -> u32 {
        state.globals.read_u32(0)
    }
}

impl Interpreter for Ring {
    type Label = u32;

    fn successors(
        &self,
        state: &Configuration,
        out: &mut Vec<(Configuration, u32)>,
    ) -> Result<(), HeapError> {
        let mut next = state.clone();
        next.globals.write_u32(0, (Self::value(state) + 1) % self.len);
        out.push((next, 0));
        Ok(())
    }

    fn is_goal(&self, state: &Configuration) -> bool {
        self.goal == Some(Self::value(state))
    }

    fn is_accepting(&self, state: &Configuration) -> bool {
        self.accepting == Some(Self::value(state))
    }
}

/// Independent per-thread counters. Every thread's step commutes with every
/// other thread's, so one enabled thread is a valid ample set.
#[derive(Debug, Clone)]
pub struct Counters {
    pub threads: u32,
    pub max: u32,
    /// Counters wrap around to zero instead of stopping at `max`.
    pub wrap: bool,
}

impl Counters {
    pub fn new(threads: u32, max: u32) -> Self {
        Self {
            threads: threads.max(1),
            max,
            wrap: false,
        }
    }

    pub fn wrapping(mut self) -> Self {
        self.wrap = true;
        self
    }

    pub fn initial(&self) -> Configuration {
        Configuration::new(Object::new(4 * self.threads as usize))
    }

    fn enabled(&self, state: &Configuration, t: u32) -> bool {
        self.wrap || state.globals.read_u32(4 * t as usize) < self.max
    }

    fn step(&self, state: &Configuration, t: u32) -> Configuration {
        let at = 4 * t as usize;
        let mut next = state.clone();
        let v = state.globals.read_u32(at);
        let v = if v >= self.max { 0 } else { v + 1 };
        next.globals.write_u32(at, v);
        next
    }

    /// Number of distinct states of the full system.
    pub fn state_count(&self) -> u64 {
        (self.max as u64 + 1).pow(self.threads)
    }
}

impl Interpreter for Counters {
    type Label = u32;

    fn successors(
        &self,
        state: &Configuration,
        out: &mut Vec<(Configuration, u32)>,
    ) -> Result<(), HeapError> {
        for t in 0..self.threads {
            if self.enabled(state, t) {
                out.push((self.step(state, t), t));
            }
        }
        Ok(())
    }

    fn ample(
        &self,
        state: &Configuration,
        out: &mut Vec<(Configuration, u32)>,
    ) -> Result<bool, HeapError> {
        let mut enabled = (0..self.threads).filter(|&t| self.enabled(state, t));
        let Some(first) = enabled.next() else {
            return Ok(false);
        };
        out.push((self.step(state, first), first));
        Ok(enabled.next().is_some())
    }
}

/// Threads pushing nodes onto a shared heap list and popping them off again.
///
/// Globals: list head pointer at 0, node count at 8. Each thread has one frame
/// holding its program counter at 0 and a pointer to the node it touched last
/// at 8; after a pop that pointer dangles. Interleavings allocate the same
/// nodes in different orders, which canonicalization has to see through.
#[derive(Debug, Clone)]
pub struct LinkedList {
    pub threads: u32,
    pub pushes: u32,
}

const NODE_LEN: usize = 16;
const FRAME_LEN: usize = 16;

impl LinkedList {
    pub fn new(threads: u32, pushes: u32) -> Self {
        Self {
            threads: threads.max(1),
            pushes,
        }
    }

    pub fn initial(&self) -> Result<Configuration, HeapError> {
        let mut cfg = Configuration::new(Object::with_pointers(16, &[0])?);
        for _ in 0..self.threads {
            let frame = cfg.heap.alloc(Object::with_pointers(FRAME_LEN, &[8])?)?;
            cfg.threads.push(vec![frame]);
        }
        Ok(cfg)
    }

    fn frame(state: &Configuration, t: u32) -> Pointer {
        state.threads[t as usize][0]
    }

    fn pc(state: &Configuration, t: u32) -> u32 {
        state
            .heap
            .get(Self::frame(state, t))
            .map(|f| f.read_u32(0))
            .unwrap_or(u32::MAX)
    }

    /// Length of the shared list.
    pub fn len(state: &Configuration) -> u32 {
        state.globals.read_u32(8)
    }

    fn step(&self, state: &Configuration, t: u32) -> Result<Option<Configuration>, HeapError> {
        let pc = Self::pc(state, t);
        let head = state.globals.read_pointer(0);
        let mut next = state.clone();
        let frame = Self::frame(state, t);

        let touched = if pc < self.pushes {
            let mut node = Object::with_pointers(NODE_LEN, &[8])?;
            node.write_u32(0, t);
            node.write_pointer(8, head);
            let node = next.heap.alloc(node)?;
            next.globals.write_pointer(0, node);
            next.globals.write_u32(8, Self::len(state) + 1);
            node
        } else if pc < 2 * self.pushes && !head.is_null() {
            let rest = next
                .heap
                .get(head)
                .map(|n| n.read_pointer(8))
                .unwrap_or(Pointer::NULL);
            next.heap.free(head);
            next.globals.write_pointer(0, rest);
            next.globals.write_u32(8, Self::len(state) - 1);
            head
        } else {
            return Ok(None);
        };

        if let Some(f) = next.heap.get_mut(frame) {
            f.write_u32(0, pc + 1);
            f.write_pointer(8, touched);
        }
        Ok(Some(next))
    }
}

impl Interpreter for LinkedList {
    type Label = u32;

    fn successors(
        &self,
        state: &Configuration,
        out: &mut Vec<(Configuration, u32)>,
    ) -> Result<(), HeapError> {
        for t in 0..self.threads {
            if let Some(next) = self.step(state, t)? {
                out.push((next, t));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::Canonicalizer;

    #[test]
    fn test_ring_steps() {
        let ring = Ring::new(3);
        let mut out = Vec::new();
        ring.successors(&ring.initial(), &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(Ring::value(&out[0].0), 1);
    }

    #[test]
    fn test_counters_ample_is_subset() {
        let c = Counters::new(3, 2);
        let init = c.initial();
        let mut full = Vec::new();
        let mut ample = Vec::new();
        c.successors(&init, &mut full).unwrap();
        assert!(c.ample(&init, &mut ample).unwrap());
        assert_eq!(full.len(), 3);
        assert_eq!(ample.len(), 1);
        assert_eq!(ample[0], full[0]);
    }

    #[test]
    fn test_linked_list_push_order_is_visible() {
        let list = LinkedList::new(2, 1);
        let init = list.initial().unwrap();
        let mut canon = Canonicalizer::new();

        // Thread 0 pushes then thread 1 pushes, and the other way around.
        let mut a = Vec::new();
        list.successors(&init, &mut a).unwrap();
        let mut ab = Vec::new();
        list.successors(&a[0].0, &mut ab).unwrap();
        let mut ba = Vec::new();
        list.successors(&a[1].0, &mut ba).unwrap();
        let after_01 = &ab.iter().find(|(_, l)| *l == 1).unwrap().0;
        let after_10 = &ba.iter().find(|(_, l)| *l == 0).unwrap().0;
        assert_ne!(
            canon.payload(after_01).to_vec(),
            canon.payload(after_10).to_vec(),
            "list order differs"
        );
        assert_eq!(LinkedList::len(after_01), 2);
    }

    #[test]
    fn test_linked_list_pop_leaves_dangling_pointer() {
        let list = LinkedList::new(1, 1);
        let init = list.initial().unwrap();
        let mut out = Vec::new();
        list.successors(&init, &mut out).unwrap();
        let pushed = out.pop().unwrap().0;
        list.successors(&pushed, &mut out).unwrap();
        let popped = out.pop().unwrap().0;
        assert_eq!(LinkedList::len(&popped), 0);

        let frame = popped.heap.get(popped.threads[0][0]).unwrap();
        let last = frame.read_pointer(8);
        assert!(!last.is_null());
        assert!(popped.heap.get(last).is_none());

        let mut canon = Canonicalizer::new();
        let restored = Configuration::restore(canon.payload(&popped)).unwrap();
        let frame = restored.heap.get(restored.threads[0][0]).unwrap();
        assert_eq!(frame.read_pointer(8), Pointer::INVALID);
    }

    #[test]
    fn test_linked_list_same_nodes_different_allocation() {
        // Two threads push once then pop once. Both orders end with an empty
        // list and two dangling frame pointers, allocated differently.
        let list = LinkedList::new(2, 1);
        let mut canon = Canonicalizer::new();
        let run = |order: [u32; 4]| {
            let mut state = list.initial().unwrap();
            for t in order {
                let mut out = Vec::new();
                list.successors(&state, &mut out).unwrap();
                state = out.into_iter().find(|(_, l)| *l == t).unwrap().0;
            }
            state
        };
        let one = run([0, 1, 0, 1]);
        let two = run([1, 0, 1, 0]);
        assert_eq!(canon.payload(&one).to_vec(), canon.payload(&two).to_vec());
    }
}
