#![forbid(unsafe_code)]

//! Tracked mutable slots, typically holding handles to external objects.

use std::fmt;
use std::rc::Rc;

use mvc_core::{Controller, Error, Instruction, OnChange, Property, Result, Setter, Value, WeakController};

use crate::model::Model;

/// Installed state of a reference property.
pub struct Ref {
    key: String,
    setter: Setter,
    control: WeakController,
}

impl Ref {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current value, or undefined once the model is gone.
    #[must_use]
    pub fn current(&self) -> Value {
        self.control
            .upgrade()
            .and_then(|control| control.peek(&self.key))
            .unwrap_or_default()
    }

    /// Replace the value. Equal values are ignored.
    pub fn set(&self, value: impl Into<Value>) -> Result<()> {
        if self.control.upgrade().is_none() {
            return Err(Error::Detached);
        }
        (self.setter)(value.into())
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ref")
            .field("key", &self.key)
            .field("current", &self.current())
            .finish()
    }
}

/// Declare a reference slot, initially undefined.
pub fn reference() -> Instruction {
    Instruction::new("ref", |key, on| {
        install(key, on, None);
        Ok(None)
    })
}

/// Declare a reference slot that calls `on_change` with each new value.
pub fn reference_with(on_change: impl Fn(&Model, &Value) + 'static) -> Instruction {
    let on_change = Rc::new(on_change);
    Instruction::new("ref", move |key, on| {
        let on_change = Rc::clone(&on_change);
        let handler: OnChange = Rc::new(move |control: &Controller, value: &Value| {
            on_change(&Model::from_control(control.clone()), value);
            None
        });
        install(key, on, Some(handler));
        Ok(None)
    })
}

fn install(key: &str, on: &Controller, handler: Option<OnChange>) {
    let slot = Ref {
        key: key.to_owned(),
        setter: on.setter(key, handler),
        control: on.downgrade(),
    };
    on.define(key, Property::Extension(Rc::new(slot)), Some(Value::Undefined));
}
