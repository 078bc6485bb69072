//! Worker pool and resource budgets.
//!
//! Two counting budgets give the pipeline its back-pressure: the open-file
//! budget bounds how many inputs are mapped at once, the byte budget bounds
//! how many uncompressed bytes sit in the chunk queue. Both are plain
//! Mutex/Condvar counters; `submit` blocks on them, workers never do.
//!
//! Ordering is preserved by the entry queue: submission pushes one slot per
//! entry in order, workers fill slots as entries finish, and the writer pops
//! slots strictly in push order, waiting on each until it is filled.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use crate::planner::{self, AssembledEntry, ChunkJob};
use crate::ArchiveError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counting budget. Acquisition of more than the total capacity is clamped
/// so oversized requests can still make progress one at a time.
pub(crate) struct Budget {
    capacity: u64,
    available: Mutex<u64>,
    released: Condvar,
}

impl Budget {
    pub fn new(capacity: u64) -> Budget {
        Budget {
            capacity: capacity.max(1),
            available: Mutex::new(capacity.max(1)),
            released: Condvar::new(),
        }
    }

    /// Blocks until `want` units (clamped to capacity) are free, then takes
    /// them. Returns the amount actually charged.
    pub fn acquire(&self, want: u64) -> u64 {
        let need = want.min(self.capacity);
        let mut available = lock(&self.available);
        while *available < need {
            available = self
                .released
                .wait(available)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *available -= need;
        need
    }

    pub fn release(&self, amount: u64) {
        if amount == 0 {
            return;
        }
        let mut available = lock(&self.available);
        *available += amount;
        self.released.notify_all();
    }
}

/// RAII charge against a budget, released on drop.
pub(crate) struct BudgetPermit {
    budget: Arc<Budget>,
    amount: u64,
}

impl BudgetPermit {
    pub fn acquire(budget: &Arc<Budget>, want: u64) -> BudgetPermit {
        let amount = budget.acquire(want);
        BudgetPermit {
            budget: Arc::clone(budget),
            amount,
        }
    }
}

impl Drop for BudgetPermit {
    fn drop(&mut self) {
        self.budget.release(self.amount);
    }
}

struct ChannelState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded FIFO shared between one or more producers and consumers.
/// `push` blocks while full, `pop` blocks while empty and returns `None`
/// once the channel is closed and drained.
pub(crate) struct BoundedQueue<T> {
    state: Mutex<ChannelState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> BoundedQueue<T> {
        BoundedQueue {
            state: Mutex::new(ChannelState {
                items: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, item: T) -> Result<(), ArchiveError> {
        let mut state = lock(&self.state);
        while state.items.len() >= self.capacity && !state.closed {
            state = self
                .not_full
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.closed {
            return Err(ArchiveError::Inconsistent("push into closed queue"));
        }
        state.items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    pub fn pop(&self) -> Option<T> {
        let mut state = lock(&self.state);
        loop {
            if let Some(item) = state.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stops accepting new items; queued items remain poppable.
    pub fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

pub(crate) type EntryResult = Result<AssembledEntry, ArchiveError>;

/// One-shot cell an entry's assembled result is delivered into. The writer
/// waits on the slot at the head of the entry queue.
pub(crate) struct EntrySlot {
    cell: Mutex<Option<EntryResult>>,
    filled: Condvar,
}

impl EntrySlot {
    pub fn new() -> EntrySlot {
        EntrySlot {
            cell: Mutex::new(None),
            filled: Condvar::new(),
        }
    }

    pub fn fill(&self, result: EntryResult) {
        let mut cell = lock(&self.cell);
        if cell.is_none() {
            *cell = Some(result);
            self.filled.notify_all();
        }
    }

    pub fn wait(&self) -> EntryResult {
        let mut cell = lock(&self.cell);
        loop {
            if let Some(result) = cell.take() {
                return result;
            }
            cell = self
                .filled
                .wait(cell)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

pub(crate) fn spawn_workers(
    jobs: &Arc<BoundedQueue<ChunkJob>>,
    threads: usize,
) -> Vec<JoinHandle<()>> {
    (0..threads.max(1))
        .map(|_| {
            let jobs = Arc::clone(jobs);
            std::thread::spawn(move || {
                while let Some(job) = jobs.pop() {
                    planner::execute_chunk(job);
                }
            })
        })
        .collect()
}
