//! Parallel state space search.
//!
//! Each worker owns a shard of the search: an arena, a private dedup table, a
//! canonicalizer and a frontier. A state belongs to the worker picked by its
//! hash; successors owned by someone else are detached from the producer's
//! arena and mailed to the owner in chunks. Workers run on a rayon pool, one
//! broadcast per exploration phase, and agree on the end of a phase through
//! the termination barrier.
//!
//! With partial order reduction the first phase follows ample sets. Between
//! phases the coordinator runs the ample-set elimination over all shards and
//! queues the missing successors of every state it forced to full expansion;
//! this repeats until a round forces nothing. Accepting-cycle detection runs
//! last, over the graph the search actually followed.

use crate::arena::{Arena, Slot, Transfer};
use crate::barrier::{Barrier, Terminable};
use crate::block::{self, flags, BlockHasher, Layout};
use crate::canonical::Canonicalizer;
use crate::error::{SearchError, SearchResult};
use crate::frontier::{
    ChunkQueue, Fresh, Frontier, FrontierKind, Item, SharedQueue, Termination,
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CHUNK_SIZE,
};
use crate::heap::Configuration;
use crate::interp::Interpreter;
use crate::owcty;
use crate::por::{self, bits, Graph, PorExt, PorGraph};
use crate::table::HashSet;
use memory_stats::memory_stats;
use rayon::ThreadPool;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// States expanded between two looks at the mailbox.
const BATCH: usize = 256;

/// Returns current process memory usage in MB, or None if unavailable.
fn current_memory_mb() -> Option<usize> {
    memory_stats().map(|stats| stats.physical_mem / (1024 * 1024))
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Global identity of an interned state: owning worker and arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    pub worker: u32,
    pub slot: Slot,
}

impl Handle {
    fn new(worker: usize, slot: Slot) -> Self {
        Self {
            worker: worker as u32,
            slot,
        }
    }
}

/// A newly discovered state, valid for the duration of the callback.
#[derive(Debug, Clone, Copy)]
pub struct StateRef<'a> {
    pub handle: Handle,
    /// Canonical payload bytes.
    pub payload: &'a [u8],
}

/// An explored transition.
#[derive(Debug, Clone, Copy)]
pub struct TransitionRef<'a, L> {
    pub from: Handle,
    pub to: Handle,
    pub label: &'a L,
    /// Whether `to` was discovered by this transition.
    pub fresh: bool,
}

type StateCallback<'a> = dyn Fn(StateRef<'_>) + Sync + 'a;
type TransitionCallback<'a, L> = dyn Fn(TransitionRef<'_, L>) + Sync + 'a;

/// Lock-free progress counters shared between the search and whoever polls it.
pub struct ProgressCounters {
    pub states: AtomicUsize,
    pub transitions: AtomicUsize,
    /// States expanded so far.
    pub checked: AtomicUsize,
    pub por_rounds: AtomicUsize,
}

impl Default for ProgressCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self {
            states: AtomicUsize::new(0),
            transitions: AtomicUsize::new(0),
            checked: AtomicUsize::new(0),
            por_rounds: AtomicUsize::new(0),
        }
    }
}

/// Configuration for a search.
pub struct SearchConfig {
    /// Number of workers (0 = use all available cores).
    pub workers: usize,
    /// Frontier policy of every worker.
    pub frontier: FrontierKind,
    /// Whether to follow ample sets and run the ample-set elimination.
    pub use_por: bool,
    /// Whether to look for accepting cycles once exploration is done.
    pub check_accepting_cycles: bool,
    /// Whether a state without successors ends the search.
    pub check_deadlock: bool,
    /// Maximum number of states to explore (0 = unlimited).
    pub max_states: usize,
    /// Maximum memory usage in MB (0 = unlimited).
    pub memory_limit_mb: usize,
    /// Maximum time in seconds (0 = unlimited).
    pub max_time_secs: u64,
    /// Per-worker arena ceiling in bytes (0 = unlimited). Exceeding it is fatal.
    pub arena_limit_bytes: usize,
    /// Initial slot count of every worker's dedup table.
    pub table_capacity: usize,
    /// Ceiling on a dedup table's slot count. Exceeding it is fatal.
    pub max_table_slots: usize,
    /// Initial chunk size of mailboxes and chunked frontiers.
    pub chunk_size: usize,
    /// Chunk size mailboxes grow to.
    pub max_chunk_size: usize,
    /// Shared progress counters: the search writes them atomically, callers
    /// read them on their own timer.
    pub progress: Option<Arc<ProgressCounters>>,
    /// Raising this flag stops the search.
    pub stop_flag: Option<Arc<AtomicBool>>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            frontier: FrontierKind::Queue,
            use_por: false,
            check_accepting_cycles: false,
            check_deadlock: false,
            max_states: 0,
            memory_limit_mb: 0,
            max_time_secs: 0,
            arena_limit_bytes: 0,
            table_capacity: 4096,
            max_table_slots: 1 << 30,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            progress: None,
            stop_flag: None,
        }
    }
}

impl Clone for SearchConfig {
    fn clone(&self) -> Self {
        Self {
            workers: self.workers,
            frontier: self.frontier,
            use_por: self.use_por,
            check_accepting_cycles: self.check_accepting_cycles,
            check_deadlock: self.check_deadlock,
            max_states: self.max_states,
            memory_limit_mb: self.memory_limit_mb,
            max_time_secs: self.max_time_secs,
            arena_limit_bytes: self.arena_limit_bytes,
            table_capacity: self.table_capacity,
            max_table_slots: self.max_table_slots,
            chunk_size: self.chunk_size,
            max_chunk_size: self.max_chunk_size,
            progress: self.progress.clone(),
            stop_flag: self.stop_flag.clone(),
        }
    }
}

impl std::fmt::Debug for SearchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchConfig")
            .field("workers", &self.workers)
            .field("frontier", &self.frontier)
            .field("use_por", &self.use_por)
            .field("check_accepting_cycles", &self.check_accepting_cycles)
            .field("check_deadlock", &self.check_deadlock)
            .field("max_states", &self.max_states)
            .field("memory_limit_mb", &self.memory_limit_mb)
            .field("max_time_secs", &self.max_time_secs)
            .field("arena_limit_bytes", &self.arena_limit_bytes)
            .field("table_capacity", &self.table_capacity)
            .field("max_table_slots", &self.max_table_slots)
            .field("chunk_size", &self.chunk_size)
            .field("max_chunk_size", &self.max_chunk_size)
            .field("progress", &self.progress.as_ref().map(|_| "..."))
            .field("stop_flag", &self.stop_flag.as_ref().map(|_| "..."))
            .finish()
    }
}

/// How a search ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Every reachable state was explored and nothing was found.
    Exhausted,
    /// A goal state was reached.
    GoalReached { state: Configuration },
    /// An accepting state lies on a cycle.
    AcceptingCycle { state: Configuration },
    /// A state without successors.
    Deadlock { state: Configuration },
    /// Exploration stopped due to state limit.
    StateLimitReached,
    /// Exploration stopped due to memory limit.
    MemoryLimitReached { memory_mb: usize },
    /// Exploration stopped due to time limit.
    TimeLimitReached,
    /// The stop flag was raised.
    Stopped,
}

impl Verdict {
    /// A property violation was found.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            Verdict::GoalReached { .. } | Verdict::AcceptingCycle { .. } | Verdict::Deadlock { .. }
        )
    }

    /// The search gave up before finishing.
    pub fn is_incomplete(&self) -> bool {
        matches!(
            self,
            Verdict::StateLimitReached
                | Verdict::MemoryLimitReached { .. }
                | Verdict::TimeLimitReached
                | Verdict::Stopped
        )
    }
}

/// Counters describing a finished search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchStats {
    pub states: usize,
    pub transitions: usize,
    pub deadlocks: usize,
    /// States owned by each worker.
    pub per_worker: Vec<usize>,
    pub por_rounds: usize,
    /// States forced to full expansion.
    pub por_forced: usize,
    /// Dedup table doublings over all workers.
    pub table_growths: usize,
    pub elapsed: Duration,
}

/// Result of a search.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub verdict: Verdict,
    pub stats: SearchStats,
}

/// A block on its way to its owner.
struct Message<L> {
    block: Transfer,
    hash: u64,
    label: L,
    from: Handle,
}

/// Everything one worker owns.
struct WorkerContext<L> {
    id: usize,
    arena: Arena,
    table: HashSet<Slot>,
    canon: Canonicalizer,
    frontier: Box<dyn Frontier<L> + Send>,
    inbox: SharedQueue<Message<L>>,
    /// One outgoing handle per destination worker (our own is never used).
    outboxes: Vec<SharedQueue<Message<L>>>,
    succs: Vec<(Configuration, L)>,
    states: usize,
    expanded: usize,
    deadlocks: usize,
}

/// A configured search over one interpreter.
pub struct Search<'a, I: Interpreter> {
    interp: &'a I,
    config: SearchConfig,
    on_state: Option<Box<StateCallback<'a>>>,
    on_transition: Option<Box<TransitionCallback<'a, I::Label>>>,
}

impl<'a, I: Interpreter> Search<'a, I> {
    pub fn new(interp: &'a I, config: SearchConfig) -> Self {
        Self {
            interp,
            config,
            on_state: None,
            on_transition: None,
        }
    }

    /// Called once per distinct state.
    pub fn on_new_state(mut self, f: impl Fn(StateRef<'_>) + Sync + 'a) -> Self {
        self.on_state = Some(Box::new(f));
        self
    }

    /// Called once per explored transition.
    pub fn on_transition(mut self, f: impl Fn(TransitionRef<'_, I::Label>) + Sync + 'a) -> Self {
        self.on_transition = Some(Box::new(f));
        self
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Explore everything reachable from `initial`.
    pub fn run(&self, initial: &Configuration) -> SearchResult<SearchOutcome> {
        let config = &self.config;
        let workers = if config.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            config.workers
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("seal-worker-{i}"))
            .build()?;

        let layout = Layout::new(if config.use_por { PorExt::LEN } else { 0 });
        let termination = Arc::new(Termination::new());
        let mailboxes: Vec<Arc<ChunkQueue<Message<I::Label>>>> = (0..workers)
            .map(|_| Arc::new(ChunkQueue::new(Arc::clone(&termination))))
            .collect();
        let contexts: Vec<Mutex<WorkerContext<I::Label>>> = (0..workers)
            .map(|id| {
                Mutex::new(WorkerContext {
                    id,
                    arena: Arena::with_limit(config.arena_limit_bytes),
                    table: HashSet::with_limit(config.table_capacity, config.max_table_slots),
                    canon: Canonicalizer::new(),
                    frontier: config.frontier.build(
                        &termination,
                        config.chunk_size,
                        config.max_chunk_size,
                    ),
                    inbox: SharedQueue::with_chunks(
                        Arc::clone(&mailboxes[id]),
                        config.chunk_size,
                        config.max_chunk_size,
                    ),
                    outboxes: mailboxes
                        .iter()
                        .map(|m| {
                            SharedQueue::with_chunks(
                                Arc::clone(m),
                                config.chunk_size,
                                config.max_chunk_size,
                            )
                        })
                        .collect(),
                    succs: Vec::new(),
                    states: 0,
                    expanded: 0,
                    deadlocks: 0,
                })
            })
            .collect();

        let shared = Shared {
            interp: self.interp,
            config,
            layout,
            hasher: BlockHasher::for_layout(layout),
            workers,
            mailboxes,
            termination,
            stop: AtomicBool::new(false),
            verdict: Mutex::new(None),
            error: Mutex::new(None),
            states: AtomicUsize::new(0),
            transitions: AtomicUsize::new(0),
            por_rounds: AtomicUsize::new(0),
            por_forced: AtomicUsize::new(0),
            start: Instant::now(),
            on_state: self.on_state.as_deref(),
            on_transition: self.on_transition.as_deref(),
        };

        info!(
            workers,
            frontier = ?config.frontier,
            por = config.use_por,
            "starting search"
        );
        shared.seed(&contexts, initial)?;
        shared.explore(&pool, &contexts)?;
        if config.use_por {
            shared.reduce(&pool, &contexts)?;
        }
        if config.check_accepting_cycles && !shared.stopping() {
            shared.find_accepting_cycle(&contexts)?;
        }
        Ok(shared.outcome(&contexts))
    }
}

/// Run a search with default settings and `workers` workers.
pub fn search<I: Interpreter>(
    interp: &I,
    initial: &Configuration,
    workers: usize,
    on_transition: impl Fn(TransitionRef<'_, I::Label>) + Sync,
    on_new_state: impl Fn(StateRef<'_>) + Sync,
) -> SearchResult<SearchOutcome> {
    let config = SearchConfig {
        workers,
        ..Default::default()
    };
    Search::new(interp, config)
        .on_transition(on_transition)
        .on_new_state(on_new_state)
        .run(initial)
}

/// State shared by the workers of one search.
struct Shared<'s, I: Interpreter> {
    interp: &'s I,
    config: &'s SearchConfig,
    layout: Layout,
    hasher: BlockHasher,
    workers: usize,
    mailboxes: Vec<Arc<ChunkQueue<Message<I::Label>>>>,
    termination: Arc<Termination>,
    stop: AtomicBool,
    verdict: Mutex<Option<Verdict>>,
    error: Mutex<Option<SearchError>>,
    states: AtomicUsize,
    transitions: AtomicUsize,
    por_rounds: AtomicUsize,
    por_forced: AtomicUsize,
    start: Instant,
    on_state: Option<&'s StateCallback<'s>>,
    on_transition: Option<&'s TransitionCallback<'s, I::Label>>,
}

impl<I: Interpreter> Terminable for Shared<'_, I> {
    fn work_waiting(&self, worker: usize) -> bool {
        !self.mailboxes[worker].is_empty()
    }

    fn quiescent(&self) -> bool {
        self.termination.is_zero()
    }
}

impl<'s, I: Interpreter> Shared<'s, I> {
    /// Worker owning states with this hash. The table indexes by the low
    /// bits, so ownership comes from the high half.
    #[inline]
    fn owner(&self, hash: u64) -> usize {
        ((hash >> 32) % self.workers as u64) as usize
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
            || self
                .config
                .stop_flag
                .as_ref()
                .is_some_and(|f| f.load(Ordering::Relaxed))
    }

    /// Record how the search ends and stop every worker. First verdict wins.
    fn conclude(&self, verdict: Verdict) {
        let mut v = lock(&self.verdict);
        if v.is_none() {
            *v = Some(verdict);
        }
        self.stop.store(true, Ordering::SeqCst);
    }

    fn fail(&self, err: SearchError) {
        error!(error = %err, "search aborted");
        let mut e = lock(&self.error);
        if e.is_none() {
            *e = Some(err);
        }
        self.stop.store(true, Ordering::SeqCst);
    }

    fn seed(
        &self,
        contexts: &[Mutex<WorkerContext<I::Label>>],
        initial: &Configuration,
    ) -> SearchResult<()> {
        let mut canon = Canonicalizer::new();
        let payload = canon.payload(initial);
        let hash = self.hasher.hash_key(payload);
        let mut ctx = lock(&contexts[self.owner(hash)]);
        let slot = self.layout.seal(&mut ctx.arena, payload)?;
        ctx.frontier.push(Item::Fresh(Fresh {
            slot,
            hash,
            label: None,
            from: None,
        }));
        Ok(())
    }

    /// One parallel exploration phase, until every frontier and mailbox is
    /// empty.
    fn explore(
        &self,
        pool: &ThreadPool,
        contexts: &[Mutex<WorkerContext<I::Label>>],
    ) -> SearchResult<()> {
        let barrier = Barrier::new(self.workers);
        pool.broadcast(|b| {
            let mut ctx = lock(&contexts[b.index()]);
            self.worker(&mut ctx, &barrier);
        });
        if let Some(err) = lock(&self.error).take() {
            return Err(err);
        }
        debug!(
            states = self.states.load(Ordering::Relaxed),
            transitions = self.transitions.load(Ordering::Relaxed),
            "exploration phase finished"
        );
        Ok(())
    }

    fn worker(&self, ctx: &mut WorkerContext<I::Label>, barrier: &Barrier) {
        let mut presence = barrier.started(ctx.id);
        debug!(worker = ctx.id, "worker started");
        loop {
            if !self.stopping() {
                if let Err(err) = self.run_batch(ctx, barrier) {
                    self.fail(err);
                }
            }
            if self.stopping() {
                Self::drain(ctx);
            }
            if ctx.frontier.is_empty() && ctx.inbox.is_drained() {
                self.flush(ctx, barrier);
                if barrier.idle(&mut presence, self) {
                    break;
                }
            } else {
                self.flush(ctx, barrier);
            }
        }
        debug!(
            worker = ctx.id,
            states = ctx.states,
            expanded = ctx.expanded,
            "worker finished"
        );
    }

    fn flush(&self, ctx: &mut WorkerContext<I::Label>, barrier: &Barrier) {
        for (dest, outbox) in ctx.outboxes.iter_mut().enumerate() {
            if dest != ctx.id && outbox.flush() {
                barrier.wakeup(dest);
            }
        }
    }

    /// Throw away pending work after a stop.
    fn drain(ctx: &mut WorkerContext<I::Label>) {
        while ctx.frontier.pop_open(&mut |_| {}).is_some() {}
        while ctx.inbox.pop_item().is_some() {}
    }

    fn run_batch(&self, ctx: &mut WorkerContext<I::Label>, barrier: &Barrier) -> SearchResult<()> {
        while let Some(msg) = ctx.inbox.pop_item() {
            let slot = ctx.arena.transfer_in(msg.block);
            ctx.frontier.push(Item::Fresh(Fresh {
                slot,
                hash: msg.hash,
                label: Some(msg.label),
                from: Some(msg.from),
            }));
        }
        for _ in 0..BATCH {
            if self.stopping() {
                break;
            }
            let arena = &mut ctx.arena;
            let item = ctx
                .frontier
                .pop_open(&mut |slot| block::set_flag(arena.get_mut(slot), flags::ON_STACK, false));
            match item {
                Some(Item::Fresh(fresh)) => self.intern(ctx, fresh)?,
                Some(Item::Expanded(slot)) => self.expand(ctx, slot, barrier)?,
                None => break,
            }
        }
        Ok(())
    }

    /// Look a successor up in the local table.
    fn intern(&self, ctx: &mut WorkerContext<I::Label>, fresh: Fresh<I::Label>) -> SearchResult<()> {
        let hasher = self.hasher;
        let candidate = fresh.slot;
        let arena = &ctx.arena;
        let (slot, is_new) = ctx.table.insert_or_find(fresh.hash, candidate, |&other| {
            hasher.equal(arena.get(other), arena.get(candidate))
        })?;
        if !is_new {
            let size = block::size(ctx.arena.get(candidate));
            ctx.arena.release(candidate, size);
        }

        let to = Handle::new(ctx.id, slot);
        if let (Some(from), Some(label)) = (fresh.from, fresh.label.as_ref()) {
            let total = self.transitions.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(p) = &self.config.progress {
                p.transitions.fetch_max(total, Ordering::Relaxed);
            }
            if self.config.use_por {
                let ext = self.layout.ext_mut(ctx.arena.get_mut(slot));
                let mut e = PorExt::read(ext);
                e.pred_total += 1;
                e.write(ext);
            }
            if let Some(cb) = self.on_transition {
                cb(TransitionRef {
                    from,
                    to,
                    label,
                    fresh: is_new,
                });
            }
        }
        if !is_new {
            return Ok(());
        }

        ctx.states += 1;
        let total = self.states.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(p) = &self.config.progress {
            p.states.fetch_max(total, Ordering::Relaxed);
        }
        trace!(worker = ctx.id, ?slot, "new state");
        if let Some(cb) = self.on_state {
            cb(StateRef {
                handle: to,
                payload: self.layout.payload(ctx.arena.get(slot)),
            });
        }
        block::set_flag(ctx.arena.get_mut(slot), flags::ON_STACK, true);
        ctx.frontier.push(Item::Expanded(slot));

        if self.config.max_states > 0 && total >= self.config.max_states {
            info!(states = total, "reached state limit");
            self.conclude(Verdict::StateLimitReached);
        }
        Ok(())
    }

    fn check_resources(&self) {
        if self.config.memory_limit_mb > 0 {
            if let Some(mb) = current_memory_mb() {
                if mb > self.config.memory_limit_mb {
                    info!(memory_mb = mb, "reached memory limit");
                    self.conclude(Verdict::MemoryLimitReached { memory_mb: mb });
                }
            }
        }
        if self.config.max_time_secs > 0
            && self.start.elapsed().as_secs() >= self.config.max_time_secs
        {
            info!("reached time limit");
            self.conclude(Verdict::TimeLimitReached);
        }
    }

    fn expand(
        &self,
        ctx: &mut WorkerContext<I::Label>,
        slot: Slot,
        barrier: &Barrier,
    ) -> SearchResult<()> {
        let state = Configuration::restore(self.layout.payload(ctx.arena.get(slot)))?;
        ctx.expanded += 1;
        if let Some(p) = &self.config.progress {
            p.checked.fetch_add(1, Ordering::Relaxed);
        }
        if ctx.expanded % 1024 == 0 {
            self.check_resources();
        }
        if self.interp.is_goal(&state) {
            info!(worker = ctx.id, "goal state reached");
            self.conclude(Verdict::GoalReached { state });
            return Ok(());
        }

        let mut succs = std::mem::take(&mut ctx.succs);
        succs.clear();
        let ext = self
            .config
            .use_por
            .then(|| PorExt::read(self.layout.ext(ctx.arena.get(slot))));
        let reduced = match ext {
            Some(e) if !e.has(bits::FULL) => self.interp.ample(&state, &mut succs)?,
            _ => {
                self.interp.successors(&state, &mut succs)?;
                false
            }
        };
        if let Some(mut e) = ext {
            e.set(if reduced { bits::REDUCED } else { bits::FULL }, true);
            e.write(self.layout.ext_mut(ctx.arena.get_mut(slot)));
        }
        block::set_flag(ctx.arena.get_mut(slot), flags::SEEN, true);

        let deadlocked = succs.is_empty();
        let from = Handle::new(ctx.id, slot);
        for (next, label) in succs.drain(..) {
            self.emit(ctx, &next, label, from, barrier)?;
        }
        ctx.succs = succs;

        if deadlocked {
            ctx.frontier.on_deadlock(slot);
            ctx.deadlocks += 1;
            if self.config.check_deadlock {
                info!(worker = ctx.id, "deadlock found");
                self.conclude(Verdict::Deadlock { state });
            }
        }
        Ok(())
    }

    /// Canonicalize a successor and route it to its owner.
    fn emit(
        &self,
        ctx: &mut WorkerContext<I::Label>,
        next: &Configuration,
        label: I::Label,
        from: Handle,
        barrier: &Barrier,
    ) -> SearchResult<()> {
        let slot = ctx.canon.canonicalize(next, self.layout, &mut ctx.arena)?;
        let hash = self.hasher.hash(ctx.arena.get(slot));
        let owner = self.owner(hash);
        if owner == ctx.id {
            ctx.frontier.push(Item::Fresh(Fresh {
                slot,
                hash,
                label: Some(label),
                from: Some(from),
            }));
            return Ok(());
        }
        let size = block::size(ctx.arena.get(slot));
        let block = ctx.arena.transfer_out(slot, size);
        let flushed = ctx.outboxes[owner].push_item(Message {
            block,
            hash,
            label,
            from,
        });
        if flushed {
            barrier.wakeup(owner);
        }
        Ok(())
    }

    /// Ample-set elimination rounds, each followed by an exploration phase
    /// for the successors it uncovered.
    fn reduce(
        &self,
        pool: &ThreadPool,
        contexts: &[Mutex<WorkerContext<I::Label>>],
    ) -> SearchResult<()> {
        loop {
            if self.stopping() {
                return Ok(());
            }
            let round = self.por_rounds.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(p) = &self.config.progress {
                p.por_rounds.store(round, Ordering::Relaxed);
            }
            let queued = {
                let mut graph = ShardedGraph::new(self, contexts);
                let elimination = por::eliminate(&mut graph)?;
                self.por_forced
                    .fetch_add(elimination.forced, Ordering::Relaxed);
                let mut queued = 0;
                for &node in &elimination.expand {
                    queued += graph.expand_rest(node)?;
                }
                info!(
                    round,
                    forced = elimination.forced,
                    reexpanded = elimination.expand.len(),
                    queued,
                    "ample-set elimination round"
                );
                if elimination.expand.is_empty() {
                    return Ok(());
                }
                queued
            };
            if queued > 0 {
                self.explore(pool, contexts)?;
            }
        }
    }

    fn find_accepting_cycle(&self, contexts: &[Mutex<WorkerContext<I::Label>>]) -> SearchResult<()> {
        let mut graph = ShardedGraph::new(self, contexts);
        if let Some(node) = owcty::accepting_cycle(&mut graph)? {
            let state = graph.restore(node)?;
            info!("accepting cycle found");
            self.conclude(Verdict::AcceptingCycle { state });
        }
        Ok(())
    }

    fn outcome(&self, contexts: &[Mutex<WorkerContext<I::Label>>]) -> SearchOutcome {
        let mut stats = SearchStats {
            states: self.states.load(Ordering::Relaxed),
            transitions: self.transitions.load(Ordering::Relaxed),
            por_rounds: self.por_rounds.load(Ordering::Relaxed),
            por_forced: self.por_forced.load(Ordering::Relaxed),
            elapsed: self.start.elapsed(),
            ..Default::default()
        };
        for ctx in contexts {
            let ctx = lock(ctx);
            stats.per_worker.push(ctx.states);
            stats.deadlocks += ctx.deadlocks;
            stats.table_growths += ctx.table.growths();
        }

        let verdict = lock(&self.verdict).take().unwrap_or_else(|| {
            if self.stopping() {
                Verdict::Stopped
            } else {
                Verdict::Exhausted
            }
        });
        if verdict.is_incomplete() {
            warn!(verdict = ?verdict, "search incomplete");
        }
        let secs = stats.elapsed.as_secs_f64();
        info!(
            states = stats.states,
            transitions = stats.transitions,
            elapsed_secs = %format!("{secs:.2}"),
            states_per_sec = %format!("{:.0}", stats.states as f64 / secs.max(1e-9)),
            "search finished"
        );
        SearchOutcome { verdict, stats }
    }
}

/// All shards seen as one graph, for the sequential passes between
/// exploration phases. Holds every worker's context locked.
struct ShardedGraph<'g, 's, I: Interpreter> {
    shared: &'g Shared<'s, I>,
    shards: Vec<MutexGuard<'g, WorkerContext<I::Label>>>,
    canon: Canonicalizer,
    succs: Vec<(Configuration, I::Label)>,
}

impl<'g, 's, I: Interpreter> ShardedGraph<'g, 's, I> {
    fn new(shared: &'g Shared<'s, I>, contexts: &'g [Mutex<WorkerContext<I::Label>>]) -> Self {
        Self {
            shared,
            shards: contexts.iter().map(lock).collect(),
            canon: Canonicalizer::new(),
            succs: Vec::new(),
        }
    }

    fn block(&self, node: Handle) -> &[u8] {
        self.shards[node.worker as usize].arena.get(node.slot)
    }

    /// Restore a state the search sealed itself. Failing to is a defect.
    fn restore(&self, node: Handle) -> SearchResult<Configuration> {
        Configuration::restore(self.shared.layout.payload(self.block(node))).map_err(|e| {
            SearchError::invariant(format!("sealed block of {node:?} does not restore: {e}"))
        })
    }

    /// Interned handle of a canonical payload.
    fn lookup(
        shared: &Shared<'s, I>,
        shards: &[MutexGuard<'g, WorkerContext<I::Label>>],
        payload: &[u8],
    ) -> Option<Handle> {
        let hash = shared.hasher.hash_key(payload);
        let owner = shared.owner(hash);
        let shard = &shards[owner];
        let layout = shared.layout;
        shard
            .table
            .find(hash, |&s| layout.payload(shard.arena.get(s)) == payload)
            .map(|slot| Handle::new(owner, slot))
    }

    /// Queue the successors of a forced state that its ample set left out.
    /// Returns how many were queued.
    fn expand_rest(&mut self, node: Handle) -> SearchResult<usize> {
        let state = self.restore(node)?;
        let interp = self.shared.interp;
        let mut ample = Vec::new();
        interp.ample(&state, &mut ample)?;
        let mut full = Vec::new();
        interp.successors(&state, &mut full)?;

        let mut followed: Vec<(Vec<u8>, I::Label)> = ample
            .iter()
            .map(|(c, l)| (self.canon.payload(c).to_vec(), l.clone()))
            .collect();
        let layout = self.shared.layout;
        let mut queued = 0;
        for (next, label) in full {
            let payload = self.canon.payload(&next);
            if let Some(i) = followed
                .iter()
                .position(|(p, l)| p.as_slice() == payload && *l == label)
            {
                followed.swap_remove(i);
                continue;
            }
            let hash = self.shared.hasher.hash_key(payload);
            let shard = &mut self.shards[self.shared.owner(hash)];
            let slot = layout.seal(&mut shard.arena, payload)?;
            shard.frontier.push(Item::Fresh(Fresh {
                slot,
                hash,
                label: Some(label),
                from: Some(node),
            }));
            queued += 1;
        }

        let mut e = self.ext(node);
        e.set(bits::REMOVE, false);
        self.set_ext(node, e);
        trace!(?node, queued, "re-expanded in full");
        Ok(queued)
    }
}

impl<I: Interpreter> Graph for ShardedGraph<'_, '_, I> {
    type Node = Handle;

    fn nodes(&self) -> Vec<Handle> {
        self.shards
            .iter()
            .enumerate()
            .flat_map(|(w, shard)| shard.table.iter().map(move |slot| Handle::new(w, slot)))
            .collect()
    }

    fn successors(&mut self, node: Handle, out: &mut Vec<Handle>) -> SearchResult<()> {
        if !block::has_flag(self.block(node), flags::SEEN) {
            return Ok(());
        }
        let state = self.restore(node)?;
        let mut succs = std::mem::take(&mut self.succs);
        succs.clear();
        let full = !self.shared.config.use_por || self.ext(node).explored_full();
        if full {
            self.shared.interp.successors(&state, &mut succs)?;
        } else {
            self.shared.interp.ample(&state, &mut succs)?;
        }
        for (next, _) in &succs {
            let payload = self.canon.payload(next);
            let found = Self::lookup(self.shared, &self.shards, payload);
            match found {
                Some(h) => out.push(h),
                None => {
                    self.succs = succs;
                    return Err(SearchError::invariant(format!(
                        "successor of {node:?} missing from the dedup table"
                    )));
                }
            }
        }
        self.succs = succs;
        Ok(())
    }

    fn is_accepting(&self, node: Handle) -> SearchResult<bool> {
        let state = self.restore(node)?;
        Ok(self.shared.interp.is_accepting(&state))
    }
}

impl<I: Interpreter> PorGraph for ShardedGraph<'_, '_, I> {
    fn ext(&self, node: Handle) -> PorExt {
        PorExt::read(self.shared.layout.ext(self.block(node)))
    }

    fn set_ext(&mut self, node: Handle, ext: PorExt) {
        let layout = self.shared.layout;
        let block = self.shards[node.worker as usize].arena.get_mut(node.slot);
        ext.write(layout.ext_mut(block));
    }
}
