#![forbid(unsafe_code)]

//! Reactive update engine for observable models.
//!
//! - [`Controller`]: owns one instance's tracked state, batches changed keys
//!   into a frame and flushes them through a deferred [`Scheduler`] task.
//! - [`compute`]: getter-backed properties recomputed in priority order
//!   within a flush.
//! - [`Subscriber`]: scoped observer notified only for the keys it read.
//! - [`Instruction`]: declarative field initializers resolved when the
//!   controller starts.
//!
//! # Architecture
//!
//! Everything is single-threaded. Shared state lives behind
//! `Rc<RefCell<..>>`; subscribers and computed engines hold their controller
//! weakly, so releasing an observer never keeps a model alive and dropping a
//! model detaches its observers.
//!
//! Flush timing is owned by the injected scheduler. The default is the
//! thread-local [`scheduler::microtasks`] queue, which the host drains after
//! its synchronous work.

pub mod compute;
pub mod config;
pub mod controller;
pub mod error;
pub mod instruction;
pub mod release;
pub mod request;
pub mod scheduler;
pub mod store;
pub mod subscriber;
pub mod value;

pub use config::Config;
pub use controller::{
    Access, Callback, Controller, Follower, Getter, OnChange, Property, Setter, Stateful,
    WeakController,
};
pub use error::{Error, Result};
pub use instruction::{Field, Install, Instruction, Token};
pub use release::Release;
pub use request::{Keys, UpdateRequest};
pub use scheduler::{Scheduler, Task, TaskQueue};
pub use store::Snapshot;
pub use subscriber::{Subscriber, Watch, WeakSubscriber};
pub use value::{Func, Handle, Value};
