#![forbid(unsafe_code)]

//! Deferred execution of controller flushes.
//!
//! A controller never flushes synchronously from `update`; it hands a task to
//! its [`Scheduler`] the first time a key enters an empty frame. Every update
//! made before that task runs lands in the same frame.
//!
//! # Implementations
//!
//! - [`TaskQueue`]: FIFO queue stepped by the host. The thread-local
//!   [`microtasks`] queue is the default scheduler.
//! - [`futures::executor::LocalSpawner`]: flushes run as local tasks of a
//!   `LocalPool`.
//!
//! # Invariants
//!
//! 1. `defer` never runs the task before returning.
//! 2. Tasks run in the order they were deferred.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::executor::LocalSpawner;
use futures::task::{LocalSpawnExt, noop_waker_ref};

/// Unit of deferred work.
pub type Task = Box<dyn FnOnce()>;

/// Executor abstraction for "run soon, after the current synchronous work".
pub trait Scheduler {
    fn defer(&self, task: Task);
}

/// Manually stepped FIFO task queue.
///
/// Cloning shares the queue.
#[derive(Clone, Default)]
pub struct TaskQueue {
    tasks: Rc<RefCell<VecDeque<Task>>>,
}

impl TaskQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.tasks.borrow().is_empty()
    }

    /// Run the oldest task. Returns `false` when the queue was empty.
    pub fn run_next(&self) -> bool {
        let task = self.tasks.borrow_mut().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Run tasks until the queue is empty, including tasks queued meanwhile.
    /// Returns how many tasks ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        ran
    }

    /// Poll `future`, running one queued task between polls, until it
    /// completes. Returns `None` if the queue drains first.
    pub fn run_until<F: Future>(&self, future: F) -> Option<F::Output> {
        let mut future = pin!(future);
        let mut cx = Context::from_waker(noop_waker_ref());

        loop {
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return Some(output);
            }
            if !self.run_next() {
                return None;
            }
        }
    }
}

impl Scheduler for TaskQueue {
    fn defer(&self, task: Task) {
        self.tasks.borrow_mut().push_back(task);
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("len", &self.len())
            .finish()
    }
}

thread_local! {
    static MICROTASKS: TaskQueue = TaskQueue::new();
}

/// The thread's default queue. Hosts drain it once their synchronous work
/// is done, the way an event loop drains microtasks.
#[must_use]
pub fn microtasks() -> TaskQueue {
    MICROTASKS.with(TaskQueue::clone)
}

impl Scheduler for LocalSpawner {
    fn defer(&self, task: Task) {
        if let Err(err) = self.spawn_local(async move { task() }) {
            tracing::error!(%err, "failed to spawn deferred task");
        }
    }
}
