#![forbid(unsafe_code)]

//! Async actions with a tracked "running" flag.
//!
//! The key of an action reads `true` while a call is in flight and `false`
//! otherwise, and both transitions are ordinary updates. A second call while
//! one is pending fails with [`Error::DuplicatePending`]. The flag resets when
//! the call's future completes or is dropped, whichever happens first.

use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::rc::Rc;

use futures::FutureExt;
use futures::future::LocalBoxFuture;
use mvc_core::{Error, Instruction, Property, Result, Value, WeakController};
use tracing::trace;

use crate::model::Model;

type Task = Rc<dyn Fn(Model, Vec<Value>) -> LocalBoxFuture<'static, Result<Value>>>;

/// Installed state of an action property.
pub struct Action {
    key: String,
    pending: Cell<bool>,
    task: Task,
}

impl Action {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether a call is in flight.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.pending.get()
    }

    /// Start a call. The flag is raised before this returns.
    pub fn invoke(
        self: &Rc<Self>,
        model: &Model,
        args: &[Value],
    ) -> Result<LocalBoxFuture<'static, Result<Value>>> {
        if self.pending.replace(true) {
            return Err(Error::DuplicatePending {
                key: self.key.clone(),
            });
        }
        trace!(model = %model.name(), key = %self.key, "action start");
        model.control().update(&self.key, Some(Value::Bool(true)));

        let settle = Settle {
            action: Rc::clone(self),
            control: model.downgrade(),
        };
        let task = (self.task)(model.clone(), args.to_vec());
        Ok(async move {
            let _settle = settle;
            task.await
        }
        .boxed_local())
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("key", &self.key)
            .field("pending", &self.pending.get())
            .finish_non_exhaustive()
    }
}

/// Lowers the flag when the call finishes or is abandoned.
struct Settle {
    action: Rc<Action>,
    control: WeakController,
}

impl Drop for Settle {
    fn drop(&mut self) {
        self.action.pending.set(false);
        if let Some(control) = self.control.upgrade() {
            trace!(model = %control.name(), key = %self.action.key, "action settled");
            control.update(&self.action.key, Some(Value::Bool(false)));
        }
    }
}

/// Declare an async action. Run it with [`Model::act`].
pub fn act<F, Fut>(task: F) -> Instruction
where
    F: Fn(Model, Vec<Value>) -> Fut + 'static,
    Fut: Future<Output = Result<Value>> + 'static,
{
    let task: Task = Rc::new(move |model, args| task(model, args).boxed_local());
    Instruction::new("act", move |key, on| {
        let action = Action {
            key: key.to_owned(),
            pending: Cell::new(false),
            task: Rc::clone(&task),
        };
        on.define(
            key,
            Property::Extension(Rc::new(action)),
            Some(Value::Bool(false)),
        );
        Ok(None)
    })
}
