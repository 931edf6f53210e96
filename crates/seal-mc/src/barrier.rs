//! Termination detection for a fixed set of workers.
//!
//! A worker that runs out of work calls [`Barrier::idle`]. Unless it is the
//! last worker awake it goes to sleep on its own seat; the last one awake
//! declares termination once nobody has work waiting, or wakes whoever does.
//! Sleeping and waking both happen under one lock, so the number of sleepers
//! is exact: a worker counts as awake from the moment somebody wakes it.
//!
//! Producers that hand work to another worker call [`Barrier::wakeup`]. It
//! never blocks beyond the lock and never waits for the sleeper to run.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

/// Work accounting the barrier consults.
pub trait Terminable: Sync {
    /// Whether `worker` has work it has not picked up yet.
    fn work_waiting(&self, worker: usize) -> bool;

    /// Extra global condition for termination (e.g. an in-flight counter).
    fn quiescent(&self) -> bool {
        true
    }
}

#[derive(Default)]
struct Global {
    registered: usize,
    /// Per worker: asleep and not woken since.
    asleep: Vec<bool>,
    sleeping: usize,
    done: bool,
    /// Completed sleeps, for diagnostics.
    naps: usize,
}

/// Barrier shared by one episode's workers.
pub struct Barrier {
    seats: Vec<Condvar>,
    global: Mutex<Global>,
}

/// A worker's registration.
pub struct Presence<'a> {
    barrier: &'a Barrier,
    who: usize,
}

impl Presence<'_> {
    pub fn worker(&self) -> usize {
        self.who
    }
}

impl Drop for Presence<'_> {
    fn drop(&mut self) {
        let mut g = self.barrier.lock_global();
        g.registered -= 1;
    }
}

impl Barrier {
    pub fn new(workers: usize) -> Self {
        Self {
            seats: (0..workers).map(|_| Condvar::new()).collect(),
            global: Mutex::new(Global {
                asleep: vec![false; workers],
                ..Global::default()
            }),
        }
    }

    pub fn workers(&self) -> usize {
        self.seats.len()
    }

    /// Times any worker went to sleep and was woken again.
    pub fn naps(&self) -> usize {
        self.lock_global().naps
    }

    fn lock_global(&self) -> MutexGuard<'_, Global> {
        self.global.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register worker `who`. Termination is never declared before every
    /// worker has registered.
    pub fn started(&self, who: usize) -> Presence<'_> {
        self.lock_global().registered += 1;
        trace!(worker = who, "registered with barrier");
        Presence { barrier: self, who }
    }

    /// Called by a worker with nothing to do. Returns true once the search
    /// has terminated; false when the caller should look for work again.
    /// May block until another worker wakes the caller.
    pub fn idle<T: Terminable>(&self, presence: &mut Presence<'_>, work: &T) -> bool {
        self.maybe_idle(presence, work, true)
    }

    /// Whether termination would be declared right now. Never sleeps and never
    /// ends the episode.
    pub fn last_man<T: Terminable>(&self, presence: &mut Presence<'_>, work: &T) -> bool {
        self.maybe_idle(presence, work, false)
    }

    /// Wake `who` if it is asleep. Returns whether it was.
    pub fn wakeup(&self, who: usize) -> bool {
        let mut g = self.lock_global();
        Self::wake_locked(&mut g, &self.seats, who)
    }

    fn wake_locked(g: &mut Global, seats: &[Condvar], who: usize) -> bool {
        if !g.asleep[who] {
            return false;
        }
        g.asleep[who] = false;
        g.sleeping -= 1;
        seats[who].notify_one();
        true
    }

    fn maybe_idle<T: Terminable>(&self, presence: &mut Presence<'_>, work: &T, really: bool) -> bool {
        let who = presence.who;
        let mut g = self.lock_global();
        if g.done {
            return true;
        }
        if g.registered < self.seats.len() {
            drop(g);
            std::thread::yield_now();
            return false;
        }

        let last_awake = g.sleeping + 1 >= g.registered;
        if last_awake {
            let waiting: Vec<usize> = (0..self.seats.len())
                .filter(|&w| work.work_waiting(w))
                .collect();
            if waiting.is_empty() && work.quiescent() {
                if really {
                    g.done = true;
                    debug!(worker = who, "termination detected");
                    for seat in &self.seats {
                        seat.notify_all();
                    }
                }
                return true;
            }
            if !really {
                return false;
            }
            let mut woke = false;
            for w in waiting {
                if w != who {
                    woke |= Self::wake_locked(&mut g, &self.seats, w);
                }
            }
            drop(g);
            if !woke {
                // Items still in flight: poll.
                std::thread::yield_now();
            }
            return false;
        }

        if !really || work.work_waiting(who) {
            return false;
        }

        g.asleep[who] = true;
        g.sleeping += 1;
        while g.asleep[who] && !g.done {
            g = self.seats[who]
                .wait(g)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if g.asleep[who] {
            g.asleep[who] = false;
            g.sleeping -= 1;
        }
        g.naps += 1;
        g.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    struct Inboxes {
        boxes: Vec<Mutex<Vec<u32>>>,
    }

    impl Terminable for Inboxes {
        fn work_waiting(&self, worker: usize) -> bool {
            !self.boxes[worker].lock().unwrap().is_empty()
        }
    }

    #[test]
    fn test_single_worker_terminates() {
        let barrier = Barrier::new(1);
        let work = Inboxes {
            boxes: vec![Mutex::new(Vec::new())],
        };
        let mut me = barrier.started(0);
        assert!(barrier.last_man(&mut me, &work));
        assert!(barrier.idle(&mut me, &work));
    }

    #[test]
    fn test_pending_work_blocks_termination() {
        let barrier = Barrier::new(1);
        let work = Inboxes {
            boxes: vec![Mutex::new(vec![1])],
        };
        let mut me = barrier.started(0);
        assert!(!barrier.last_man(&mut me, &work));
        assert!(!barrier.idle(&mut me, &work));
        work.boxes[0].lock().unwrap().clear();
        assert!(barrier.idle(&mut me, &work));
    }

    #[test]
    fn test_last_man_waits_for_running_peer() {
        let barrier = Barrier::new(2);
        let work = Inboxes {
            boxes: vec![Mutex::new(Vec::new()), Mutex::new(Vec::new())],
        };
        let go = AtomicBool::new(false);
        thread::scope(|s| {
            let mut me = barrier.started(0);
            let peer = s.spawn(|| {
                let mut peer = barrier.started(1);
                while !go.load(Ordering::SeqCst) {
                    thread::yield_now();
                }
                barrier.idle(&mut peer, &work)
            });
            while barrier.lock_global().registered < 2 {
                thread::yield_now();
            }
            // The peer is still busy.
            assert!(!barrier.last_man(&mut me, &work));
            go.store(true, Ordering::SeqCst);
            let start = Instant::now();
            while !barrier.last_man(&mut me, &work) {
                assert!(start.elapsed() < Duration::from_secs(10));
                thread::yield_now();
            }
            assert!(barrier.idle(&mut me, &work));
            assert!(peer.join().unwrap());
        });
    }

    #[test]
    fn test_ping_pong_terminates_promptly() {
        // Two workers hand one token back and forth: every hand-off wakes
        // the other side exactly once, and the end is seen right away.
        const ROUNDS: u32 = 1000;
        let barrier = Barrier::new(2);
        let work = Inboxes {
            boxes: vec![Mutex::new(vec![ROUNDS]), Mutex::new(Vec::new())],
        };
        let idles = AtomicUsize::new(0);
        let start = Instant::now();
        thread::scope(|s| {
            for who in 0..2 {
                let (barrier, work, idles) = (&barrier, &work, &idles);
                s.spawn(move || {
                    let mut me = barrier.started(who);
                    loop {
                        let task = work.boxes[who].lock().unwrap().pop();
                        match task {
                            Some(0) => {}
                            Some(left) => {
                                work.boxes[1 - who].lock().unwrap().push(left - 1);
                                barrier.wakeup(1 - who);
                            }
                            None => {
                                idles.fetch_add(1, Ordering::Relaxed);
                                if barrier.idle(&mut me, work) {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "took {:?}",
            start.elapsed()
        );
        // A nap ends with a hand-off or with termination.
        assert!(barrier.naps() <= ROUNDS as usize + 2, "naps: {}", barrier.naps());
        assert!(idles.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_wakeup_of_awake_worker_is_a_no_op() {
        let barrier = Barrier::new(2);
        let _a = barrier.started(0);
        let _b = barrier.started(1);
        assert!(!barrier.wakeup(1));
        assert_eq!(barrier.naps(), 0);
    }

    #[test]
    fn test_random_work_terminates_everywhere() {
        for seed in 0..4u64 {
            let workers = 4;
            let barrier = Arc::new(Barrier::new(workers));
            let work = Arc::new(Inboxes {
                boxes: (0..workers).map(|_| Mutex::new(Vec::new())).collect(),
            });
            let produced = Arc::new(AtomicUsize::new(1));
            let consumed = Arc::new(AtomicUsize::new(0));
            work.boxes[0].lock().unwrap().push(6);

            let handles: Vec<_> = (0..workers)
                .map(|who| {
                    let barrier = Arc::clone(&barrier);
                    let work = Arc::clone(&work);
                    let produced = Arc::clone(&produced);
                    let consumed = Arc::clone(&consumed);
                    thread::spawn(move || {
                        let mut rng = rand::rngs::StdRng::seed_from_u64(seed * 31 + who as u64);
                        let mut me = barrier.started(who);
                        loop {
                            let task = work.boxes[who].lock().unwrap().pop();
                            match task {
                                Some(depth) => {
                                    consumed.fetch_add(1, Ordering::SeqCst);
                                    if depth > 0 {
                                        for _ in 0..rng.gen_range(0..3) {
                                            let to = rng.gen_range(0..workers);
                                            produced.fetch_add(1, Ordering::SeqCst);
                                            work.boxes[to].lock().unwrap().push(depth - 1);
                                            if to != who {
                                                barrier.wakeup(to);
                                            }
                                        }
                                    }
                                }
                                None => {
                                    if barrier.idle(&mut me, &*work) {
                                        break;
                                    }
                                }
                            }
                        }
                        // Nothing may be left anywhere once termination is seen.
                        for b in &work.boxes {
                            assert!(b.lock().unwrap().is_empty());
                        }
                    })
                })
                .collect();

            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(
                produced.load(Ordering::SeqCst),
                consumed.load(Ordering::SeqCst)
            );
        }
    }
}
