//! Pooled completion cells
//!
//! Each in-flight request that someone waits on owns one cell. The cell is
//! split into two handles: a [`CompletionRef`] travelling with the message,
//! which delivers the result, and a [`CompletionWaiter`] held by the caller.
//!
//! Cells live in a fixed arena; free indices sit in a lock-free queue. When
//! the arena is exhausted a heap cell is allocated and simply dropped on
//! release. Every acquisition bumps the cell's generation so a late delivery
//! aimed at a previous occupant is discarded.
//!
//! A cell returns to the free list only once both sides are done with it:
//! the waiter took the result, or the waiter gave up and the carrier then
//! delivered (or was dropped).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::utils::{MuxError, RespValue};

/// Raw reply or the failure that replaced it
pub type Reply = Result<RespValue, MuxError>;

/// How the caller consumes the result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Nobody waits; no cell is allocated
    FireAndForget,
    /// Caller blocks up to the sync timeout
    Blocking,
    /// Caller polls a future; the heartbeat expires it after the sync timeout
    Future,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellState {
    Free,
    Armed,
    Completed,
    /// Waiter gave up; the carrier releases the cell when it finishes
    Abandoned,
}

struct CellInner {
    generation: u32,
    state: CellState,
    result: Option<Reply>,
    waker: Option<Waker>,
}

struct CompletionCell {
    inner: Mutex<CellInner>,
    ready: Condvar,
}

impl CompletionCell {
    fn new() -> Self {
        Self {
            inner: Mutex::new(CellInner {
                generation: 0,
                state: CellState::Free,
                result: None,
                waker: None,
            }),
            ready: Condvar::new(),
        }
    }
}

#[derive(Clone)]
enum CellRef {
    Pooled(u32),
    Overflow(Arc<CompletionCell>),
}

impl CellRef {
    fn get<'a>(&'a self, pool: &'a CompletionPool) -> &'a CompletionCell {
        match self {
            CellRef::Pooled(idx) => &pool.cells[*idx as usize],
            CellRef::Overflow(cell) => cell,
        }
    }
}

/// Pool usage counters
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub in_use: usize,
    pub overflow_allocated: u64,
}

/// Arena of completion cells
pub struct CompletionPool {
    cells: Box<[CompletionCell]>,
    free: ArrayQueue<u32>,
    in_use: AtomicUsize,
    overflow_allocated: AtomicU64,
}

impl CompletionPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let free = ArrayQueue::new(capacity);
        for idx in 0..capacity {
            free.push(idx as u32).ok();
        }
        Arc::new(Self {
            cells: (0..capacity).map(|_| CompletionCell::new()).collect(),
            free,
            in_use: AtomicUsize::new(0),
            overflow_allocated: AtomicU64::new(0),
        })
    }

    /// Arm a cell and split it into carrier and waiter
    pub fn acquire(self: &Arc<Self>) -> (CompletionRef, CompletionWaiter) {
        let cell = match self.free.pop() {
            Some(idx) => CellRef::Pooled(idx),
            None => {
                self.overflow_allocated.fetch_add(1, Ordering::Relaxed);
                CellRef::Overflow(Arc::new(CompletionCell::new()))
            }
        };

        let generation = {
            let mut inner = cell.get(self).inner.lock();
            debug_assert_eq!(inner.state, CellState::Free);
            inner.generation = inner.generation.wrapping_add(1);
            inner.state = CellState::Armed;
            inner.result = None;
            inner.waker = None;
            inner.generation
        };
        self.in_use.fetch_add(1, Ordering::Relaxed);

        (
            CompletionRef {
                pool: Arc::clone(self),
                cell: cell.clone(),
                generation,
                done: false,
            },
            CompletionWaiter {
                pool: Arc::clone(self),
                cell,
                generation,
                finished: false,
            },
        )
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.cells.len(),
            in_use: self.in_use.load(Ordering::Relaxed),
            overflow_allocated: self.overflow_allocated.load(Ordering::Relaxed),
        }
    }

    /// Return a cell whose state was already reset to free
    fn recycle(&self, cell: &CellRef) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        if let CellRef::Pooled(idx) = cell {
            self.free.push(*idx).ok();
        }
    }
}

fn reset(inner: &mut CellInner) {
    inner.state = CellState::Free;
    inner.result = None;
    inner.waker = None;
}

/// Delivering side of a completion cell
///
/// Dropping it without delivering completes the cell with [`MuxError::Closed`].
pub struct CompletionRef {
    pool: Arc<CompletionPool>,
    cell: CellRef,
    generation: u32,
    done: bool,
}

impl CompletionRef {
    /// Deliver the result; returns false when nobody will observe it
    /// (already delivered, abandoned, or aimed at a recycled cell)
    pub fn complete(&mut self, result: Reply) -> bool {
        if self.done {
            return false;
        }
        self.done = true;

        let cell = self.cell.get(&self.pool);
        let mut inner = cell.inner.lock();
        if inner.generation != self.generation {
            return false;
        }
        match inner.state {
            CellState::Armed => {
                inner.result = Some(result);
                inner.state = CellState::Completed;
                let waker = inner.waker.take();
                drop(inner);
                cell.ready.notify_all();
                if let Some(waker) = waker {
                    waker.wake();
                }
                true
            }
            CellState::Abandoned => {
                reset(&mut inner);
                drop(inner);
                self.pool.recycle(&self.cell);
                false
            }
            CellState::Free | CellState::Completed => false,
        }
    }

    /// The waiter gave up
    pub fn is_abandoned(&self) -> bool {
        let inner = self.cell.get(&self.pool).inner.lock();
        inner.generation == self.generation && inner.state == CellState::Abandoned
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

impl Drop for CompletionRef {
    fn drop(&mut self) {
        if !self.done {
            self.complete(Err(MuxError::Closed));
        }
    }
}

impl std::fmt::Debug for CompletionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionRef")
            .field("generation", &self.generation)
            .field("done", &self.done)
            .finish()
    }
}

/// Waiting side of a completion cell
pub struct CompletionWaiter {
    pool: Arc<CompletionPool>,
    cell: CellRef,
    generation: u32,
    finished: bool,
}

impl CompletionWaiter {
    /// Block until the result arrives or `timeout` passes
    ///
    /// On timeout the cell is abandoned and `None` returned; the cell stays
    /// out of the free list until the carrier lets go of it.
    pub fn wait(&mut self, timeout: Duration) -> Option<Reply> {
        if self.finished {
            return Some(Err(MuxError::Closed));
        }
        let deadline = Instant::now() + timeout;
        let cell = self.cell.get(&self.pool);
        let mut inner = cell.inner.lock();

        loop {
            if inner.generation != self.generation {
                self.finished = true;
                return Some(Err(MuxError::Closed));
            }
            match inner.state {
                CellState::Completed => {
                    let result = inner.result.take().unwrap_or(Err(MuxError::Closed));
                    reset(&mut inner);
                    drop(inner);
                    self.finished = true;
                    self.pool.recycle(&self.cell);
                    return Some(result);
                }
                CellState::Armed => {
                    if cell.ready.wait_until(&mut inner, deadline).timed_out()
                        && inner.state == CellState::Armed
                    {
                        inner.state = CellState::Abandoned;
                        self.finished = true;
                        return None;
                    }
                }
                CellState::Free | CellState::Abandoned => {
                    self.finished = true;
                    return Some(Err(MuxError::Closed));
                }
            }
        }
    }

    /// Non-blocking check for futures; registers `cx`'s waker when pending
    pub fn poll_reply(&mut self, cx: &mut Context<'_>) -> Poll<Reply> {
        if self.finished {
            return Poll::Ready(Err(MuxError::Closed));
        }
        let cell = self.cell.get(&self.pool);
        let mut inner = cell.inner.lock();
        if inner.generation != self.generation {
            self.finished = true;
            return Poll::Ready(Err(MuxError::Closed));
        }
        match inner.state {
            CellState::Completed => {
                let result = inner.result.take().unwrap_or(Err(MuxError::Closed));
                reset(&mut inner);
                drop(inner);
                self.finished = true;
                self.pool.recycle(&self.cell);
                Poll::Ready(result)
            }
            CellState::Armed => {
                match inner.waker {
                    Some(ref w) if w.will_wake(cx.waker()) => {}
                    _ => inner.waker = Some(cx.waker().clone()),
                }
                Poll::Pending
            }
            CellState::Free | CellState::Abandoned => {
                self.finished = true;
                Poll::Ready(Err(MuxError::Closed))
            }
        }
    }
}

impl Drop for CompletionWaiter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut inner = self.cell.get(&self.pool).inner.lock();
        if inner.generation != self.generation {
            return;
        }
        match inner.state {
            CellState::Completed => {
                reset(&mut inner);
                drop(inner);
                self.pool.recycle(&self.cell);
            }
            CellState::Armed => {
                inner.state = CellState::Abandoned;
                inner.waker = None;
            }
            CellState::Free | CellState::Abandoned => {}
        }
    }
}
