//! Work queues driving the search.
//!
//! A frontier holds two kinds of items: successors that still have to be
//! deduplicated ([`Item::Fresh`]) and interned states waiting for, or in the
//! middle of, expansion ([`Item::Expanded`]). Three policies are provided:
//! [`Stack`] (depth first), [`Queue`] (breadth first) and [`SharedQueue`], a
//! chunked FIFO whose chunks live in a lock-protected [`ChunkQueue`] that other
//! workers can push into.

use crate::arena::Slot;
use crate::search::Handle;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Initial chunk size of a [`SharedQueue`].
pub const DEFAULT_CHUNK_SIZE: usize = 2;

/// Chunk size a [`SharedQueue`] grows to.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 64;

/// A successor that has not been looked up in the dedup table yet.
#[derive(Debug, Clone)]
pub struct Fresh<L> {
    /// Sealed block in the owning worker's arena.
    pub slot: Slot,
    pub hash: u64,
    /// Transition that produced it; `None` for the initial state.
    pub label: Option<L>,
    pub from: Option<Handle>,
}

#[derive(Debug, Clone)]
pub enum Item<L> {
    Fresh(Fresh<L>),
    /// An interned state to expand.
    Expanded(Slot),
}

/// Counters kept by every frontier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrontierStats {
    /// Expanded items handed out for expansion.
    pub opened: usize,
    /// Expansions reported complete.
    pub closed: usize,
    /// Expansions that produced no successors.
    pub deadlocks: usize,
}

/// The interface the search loop drives.
pub trait Frontier<L> {
    fn push(&mut self, item: Item<L>);

    /// Next item to process. `close` is called for every state whose
    /// expansion has completed since the previous call.
    fn pop_open(&mut self, close: &mut dyn FnMut(Slot)) -> Option<Item<L>>;

    fn is_empty(&self) -> bool;

    /// The state last handed out produced no successors.
    fn on_deadlock(&mut self, slot: Slot);

    fn stats(&self) -> FrontierStats;
}

/// Depth-first frontier.
///
/// An expanded state stays on the stack underneath its successors and is
/// closed when it resurfaces, so closure happens in DFS postorder.
pub struct Stack<L> {
    items: Vec<(Item<L>, bool)>,
    stats: FrontierStats,
    deadlocked: Vec<Slot>,
}

impl<L> Default for Stack<L> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            stats: FrontierStats::default(),
            deadlocked: Vec::new(),
        }
    }
}

impl<L> Stack<L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// States reported as deadlocked, in the order they were found.
    pub fn deadlocked(&self) -> &[Slot] {
        &self.deadlocked
    }

    pub fn depth(&self) -> usize {
        self.items.iter().filter(|(_, opened)| *opened).count()
    }
}

impl<L> Frontier<L> for Stack<L> {
    fn push(&mut self, item: Item<L>) {
        self.items.push((item, false));
    }

    fn pop_open(&mut self, close: &mut dyn FnMut(Slot)) -> Option<Item<L>> {
        loop {
            let (item, opened) = self.items.last_mut()?;
            match item {
                Item::Expanded(slot) if *opened => {
                    let slot = *slot;
                    self.items.pop();
                    self.stats.closed += 1;
                    close(slot);
                }
                Item::Expanded(slot) => {
                    *opened = true;
                    self.stats.opened += 1;
                    return Some(Item::Expanded(*slot));
                }
                Item::Fresh(_) => return self.items.pop().map(|(item, _)| item),
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn on_deadlock(&mut self, slot: Slot) {
        self.stats.deadlocks += 1;
        self.deadlocked.push(slot);
    }

    fn stats(&self) -> FrontierStats {
        self.stats
    }
}

/// Breadth-first frontier: a plain FIFO.
pub struct Queue<L> {
    items: VecDeque<Item<L>>,
    /// Expanded item handed out by the previous pop.
    open: Option<Slot>,
    stats: FrontierStats,
}

impl<L> Default for Queue<L> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
            open: None,
            stats: FrontierStats::default(),
        }
    }
}

impl<L> Queue<L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

fn close_open(open: &mut Option<Slot>, stats: &mut FrontierStats, close: &mut dyn FnMut(Slot)) {
    if let Some(slot) = open.take() {
        stats.closed += 1;
        close(slot);
    }
}

impl<L> Frontier<L> for Queue<L> {
    fn push(&mut self, item: Item<L>) {
        self.items.push_back(item);
    }

    fn pop_open(&mut self, close: &mut dyn FnMut(Slot)) -> Option<Item<L>> {
        close_open(&mut self.open, &mut self.stats, close);
        let item = self.items.pop_front()?;
        if let Item::Expanded(slot) = item {
            self.open = Some(slot);
            self.stats.opened += 1;
        }
        Some(item)
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn on_deadlock(&mut self, _slot: Slot) {
        self.stats.deadlocks += 1;
    }

    fn stats(&self) -> FrontierStats {
        self.stats
    }
}

/// Approximate count of items pushed into chunked queues and not popped yet.
///
/// Incremented on every push and decremented on every pop. Zero is necessary
/// (not sufficient) for termination.
#[derive(Debug, Default)]
pub struct Termination {
    pending: AtomicIsize,
}

impl Termination {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn pushed(&self, n: usize) {
        self.pending.fetch_add(n as isize, Ordering::SeqCst);
    }

    #[inline]
    pub fn popped(&self, n: usize) {
        self.pending.fetch_sub(n as isize, Ordering::SeqCst);
    }

    pub fn pending(&self) -> isize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_zero(&self) -> bool {
        self.pending() == 0
    }
}

/// A queue of chunks shared between producers and one consumer. The lock is
/// taken once per chunk, never per item.
pub struct ChunkQueue<T> {
    chunks: Mutex<VecDeque<Vec<T>>>,
    termination: Arc<Termination>,
}

impl<T> ChunkQueue<T> {
    pub fn new(termination: Arc<Termination>) -> Self {
        Self {
            chunks: Mutex::new(VecDeque::new()),
            termination,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Vec<T>>> {
        self.chunks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_chunk(&self, chunk: Vec<T>) {
        if !chunk.is_empty() {
            self.lock().push_back(chunk);
        }
    }

    pub fn pop_chunk(&self) -> Option<Vec<T>> {
        self.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn termination(&self) -> &Arc<Termination> {
        &self.termination
    }
}

/// One worker's handle on a [`ChunkQueue`]: pushes are batched into an
/// outgoing chunk, pops drain an incoming chunk.
pub struct SharedQueue<T> {
    queue: Arc<ChunkQueue<T>>,
    outgoing: Vec<T>,
    incoming: VecDeque<T>,
    chunk_size: usize,
    max_chunk_size: usize,
    open: Option<Slot>,
    stats: FrontierStats,
}

impl<T> SharedQueue<T> {
    pub fn new(queue: Arc<ChunkQueue<T>>) -> Self {
        Self::with_chunks(queue, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CHUNK_SIZE)
    }

    pub fn with_chunks(queue: Arc<ChunkQueue<T>>, chunk_size: usize, max_chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            queue,
            outgoing: Vec::with_capacity(chunk_size),
            incoming: VecDeque::new(),
            chunk_size,
            max_chunk_size: max_chunk_size.max(chunk_size),
            open: None,
            stats: FrontierStats::default(),
        }
    }

    /// Buffer `item`. Returns true if this push filled the chunk and
    /// flushed it.
    pub fn push_item(&mut self, item: T) -> bool {
        self.queue.termination.pushed(1);
        self.outgoing.push(item);
        if self.outgoing.len() >= self.chunk_size {
            self.flush();
            true
        } else {
            false
        }
    }

    /// Hand the outgoing chunk to the queue. Returns whether anything moved.
    pub fn flush(&mut self) -> bool {
        if self.outgoing.is_empty() {
            return false;
        }
        let chunk = std::mem::replace(&mut self.outgoing, Vec::with_capacity(self.chunk_size));
        self.queue.push_chunk(chunk);
        self.chunk_size = (self.chunk_size * 2).min(self.max_chunk_size);
        true
    }

    pub fn pop_item(&mut self) -> Option<T> {
        if self.incoming.is_empty() {
            match self.queue.pop_chunk() {
                Some(chunk) => self.incoming.extend(chunk),
                None => {
                    // Our own unflushed items come back without a round trip.
                    if self.outgoing.is_empty() {
                        return None;
                    }
                    let chunk = std::mem::take(&mut self.outgoing);
                    self.incoming.extend(chunk);
                }
            }
        }
        let item = self.incoming.pop_front()?;
        self.queue.termination.popped(1);
        Some(item)
    }

    /// Nothing buffered locally and nothing in the shared queue.
    pub fn is_drained(&self) -> bool {
        self.incoming.is_empty() && self.outgoing.is_empty() && self.queue.is_empty()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Items waiting to be flushed.
    pub fn buffered(&self) -> usize {
        self.outgoing.len()
    }
}

impl<L> Frontier<L> for SharedQueue<Item<L>> {
    fn push(&mut self, item: Item<L>) {
        self.push_item(item);
    }

    fn pop_open(&mut self, close: &mut dyn FnMut(Slot)) -> Option<Item<L>> {
        close_open(&mut self.open, &mut self.stats, close);
        let item = self.pop_item()?;
        if let Item::Expanded(slot) = item {
            self.open = Some(slot);
            self.stats.opened += 1;
        }
        Some(item)
    }

    fn is_empty(&self) -> bool {
        self.is_drained()
    }

    fn on_deadlock(&mut self, _slot: Slot) {
        self.stats.deadlocks += 1;
    }

    fn stats(&self) -> FrontierStats {
        self.stats
    }
}

/// The frontier policies a search can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrontierKind {
    /// Depth first.
    Stack,
    /// Breadth first.
    #[default]
    Queue,
    /// Chunked queue.
    Shared,
}

impl FrontierKind {
    /// Build a frontier of this kind. `Shared` gets a private chunk queue
    /// counted against `termination`.
    pub fn build<L: 'static>(
        self,
        termination: &Arc<Termination>,
        chunk_size: usize,
        max_chunk_size: usize,
    ) -> Box<dyn Frontier<L> + Send>
    where
        L: Send,
    {
        match self {
            FrontierKind::Stack => Box::new(Stack::new()),
            FrontierKind::Queue => Box::new(Queue::new()),
            FrontierKind::Shared => Box::new(SharedQueue::with_chunks(
                Arc::new(ChunkQueue::new(Arc::clone(termination))),
                chunk_size,
                max_chunk_size,
            )),
        }
    }
}
