#![forbid(unsafe_code)]

//! Per-controller configuration.

use std::fmt;
use std::rc::Rc;

use crate::scheduler::{self, Scheduler};

/// Settings shared by every controller created from one model type.
#[derive(Clone)]
pub struct Config {
    /// Executor for deferred flushes.
    pub scheduler: Rc<dyn Scheduler>,
    /// Warn when a computed value is materialized outside any subscriber.
    pub warn_computed_early: bool,
    /// Emit a `DEBUG` event with the key list of every flush.
    pub trace_flushes: bool,
}

impl Config {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_scheduler(mut self, scheduler: impl Scheduler + 'static) -> Self {
        self.scheduler = Rc::new(scheduler);
        self
    }

    #[must_use]
    pub fn with_warn_computed_early(mut self, warn: bool) -> Self {
        self.warn_computed_early = warn;
        self
    }

    #[must_use]
    pub fn with_trace_flushes(mut self, trace: bool) -> Self {
        self.trace_flushes = trace;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler: Rc::new(scheduler::microtasks()),
            warn_computed_early: true,
            trace_flushes: false,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("warn_computed_early", &self.warn_computed_early)
            .field("trace_flushes", &self.trace_flushes)
            .finish_non_exhaustive()
    }
}
