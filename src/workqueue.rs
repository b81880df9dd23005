// CLASSIFICATION: COMMUNITY
// Filename: workqueue.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Shared background queue for delayed work items.
//!
//! A single worker thread owns a timer heap. A [`DelayedWork`] is either idle,
//! pending on the heap, or running; scheduling an already pending item is a
//! no-op, so each item has at most one live timer. `flush` runs a pending
//! item inline and waits for a running one to finish.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error};
use once_cell::sync::Lazy;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WorkState {
    Idle,
    Pending(u64),
    Running,
}

struct WorkShared {
    name: String,
    state: Mutex<WorkState>,
    done: Condvar,
    func: Box<dyn Fn() + Send + Sync>,
}

impl WorkShared {
    fn lock(&self) -> MutexGuard<'_, WorkState> {
        // WorkState is a plain enum, always consistent
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn run(&self) {
        (self.func)();
        let mut state = self.lock();
        if *state == WorkState::Running {
            *state = WorkState::Idle;
        }
        self.done.notify_all();
    }

    /// Timer expiry for generation `seq`; stale timers are ignored.
    fn fire(&self, seq: u64) {
        {
            let mut state = self.lock();
            if *state != WorkState::Pending(seq) {
                return;
            }
            *state = WorkState::Running;
        }
        debug!("[workqueue] running {}", self.name);
        self.run();
    }
}

/// A unit of work that runs on the shared queue after a delay.
pub struct DelayedWork {
    shared: Arc<WorkShared>,
}

impl DelayedWork {
    pub fn new(name: impl Into<String>, func: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(WorkShared {
                name: name.into(),
                state: Mutex::new(WorkState::Idle),
                done: Condvar::new(),
                func: Box::new(func),
            }),
        }
    }

    /// Queue the work to run after `delay`. Returns `false` if it was already pending.
    pub fn schedule(&self, delay: Duration) -> bool {
        let seq = {
            let mut state = self.shared.lock();
            if matches!(*state, WorkState::Pending(_)) {
                return false;
            }
            let seq = QUEUE.next_seq();
            *state = WorkState::Pending(seq);
            seq
        };
        QUEUE.push(Instant::now() + delay, seq, Arc::downgrade(&self.shared));
        true
    }

    /// Run pending work now and wait for any running instance to complete.
    pub fn flush(&self) {
        let mut state = self.shared.lock();
        loop {
            match *state {
                WorkState::Idle => return,
                WorkState::Running => {
                    state = self
                        .shared
                        .done
                        .wait(state)
                        .unwrap_or_else(|p| p.into_inner());
                }
                WorkState::Pending(_) => {
                    *state = WorkState::Running;
                    drop(state);
                    self.shared.run();
                    return;
                }
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.shared.lock(), WorkState::Pending(_))
    }
}

struct Timer {
    deadline: Instant,
    seq: u64,
    work: Weak<WorkShared>,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        (self.deadline, self.seq) == (other.deadline, other.seq)
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

struct WorkQueue {
    timers: Arc<(Mutex<BinaryHeap<Reverse<Timer>>>, Condvar)>,
    seq: AtomicU64,
}

static QUEUE: Lazy<WorkQueue> = Lazy::new(WorkQueue::start);

impl WorkQueue {
    fn start() -> Self {
        let timers = Arc::new((Mutex::new(BinaryHeap::new()), Condvar::new()));
        let worker = Arc::clone(&timers);
        if let Err(e) = thread::Builder::new()
            .name("pil-workqueue".into())
            .spawn(move || Self::worker(&worker))
        {
            error!("[workqueue] failed to start worker: {e}");
        }
        Self {
            timers,
            seq: AtomicU64::new(1),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn push(&self, deadline: Instant, seq: u64, work: Weak<WorkShared>) {
        let (heap, wake) = &*self.timers;
        heap.lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Reverse(Timer { deadline, seq, work }));
        wake.notify_one();
    }

    fn worker(timers: &(Mutex<BinaryHeap<Reverse<Timer>>>, Condvar)) {
        let (heap, wake) = timers;
        let mut guard = heap.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            let now = Instant::now();
            let next = guard.peek().map(|Reverse(t)| t.deadline);
            match next {
                None => {
                    guard = wake.wait(guard).unwrap_or_else(|p| p.into_inner());
                }
                Some(deadline) if deadline > now => {
                    guard = wake
                        .wait_timeout(guard, deadline - now)
                        .map(|(g, _)| g)
                        .unwrap_or_else(|p| p.into_inner().0);
                }
                Some(_) => {
                    if let Some(Reverse(timer)) = guard.pop() {
                        drop(guard);
                        if let Some(work) = timer.work.upgrade() {
                            work.fire(timer.seq);
                        }
                        guard = heap.lock().unwrap_or_else(|p| p.into_inner());
                    }
                }
            }
        }
    }
}
