#![forbid(unsafe_code)]

//! Value-flavoured instructions: managed, memoized, lazy and required
//! properties.

use std::cell::OnceCell;
use std::rc::Rc;

use mvc_core::{
    Controller, Error, Getter, Install, Instruction, OnChange, Property, Result, Subscriber, Value,
};

use crate::model::Model;

/// Tracked value with a change handler run before each write.
///
/// The handler returns `Some(true)` to emit an update without storing,
/// `Some(false)` to drop the write, or `None` to store and emit normally.
pub fn managed(
    initial: impl Into<Value>,
    on_change: impl Fn(&Model, &Value) -> Option<bool> + 'static,
) -> Instruction {
    let initial = initial.into();
    let on_change = Rc::new(on_change);
    Instruction::new("managed", move |key, on| {
        let on_change = Rc::clone(&on_change);
        let handler: OnChange = Rc::new(move |control: &Controller, value: &Value| {
            on_change(&Model::from_control(control.clone()), value)
        });
        on.manage(key, initial.clone(), Some(handler));
        Ok(None)
    })
}

/// Untracked value computed once when the instance starts.
pub fn memo(factory: impl Fn(&Model) -> Result<Value> + 'static) -> Instruction {
    Instruction::new("memo", move |_, on| {
        let value = factory(&Model::from_control(on.clone()))?;
        Ok(Some(Install::Property(Property::Value(value))))
    })
}

/// Untracked value computed on first read and cached. A failed factory is
/// retried on the next read.
pub fn memo_lazy(factory: impl Fn(&Model) -> Result<Value> + 'static) -> Instruction {
    let factory = Rc::new(factory);
    Instruction::new("memo", move |_, _| {
        let factory = Rc::clone(&factory);
        let cache: OnceCell<Value> = OnceCell::new();
        let get: Getter = Rc::new(move |control: &Controller, _: Option<&Subscriber>| {
            if let Some(value) = cache.get() {
                return Ok(value.clone());
            }
            let value = factory(&Model::from_control(control.clone()))?;
            Ok(cache.get_or_init(|| value).clone())
        });
        Ok(Some(Install::Property(Property::Accessor { get, set: None })))
    })
}

/// Untracked value that is still part of exports.
pub fn lazy(value: impl Into<Value>) -> Instruction {
    let value = value.into();
    Instruction::new("lazy", move |key, on| {
        on.define(key, Property::Value(value.clone()), Some(value.clone()));
        Ok(None)
    })
}

/// Tracked value that must be assigned before it is read. Reads raise
/// [`Error::Suspend`] while it is undefined.
pub fn required() -> Instruction {
    Instruction::new("required", |key, _| {
        let key: Rc<str> = key.into();
        let get: Getter = Rc::new(move |control: &Controller, _: Option<&Subscriber>| {
            match control.peek(&key) {
                Some(Value::Undefined) | None => Err(Error::Suspend {
                    model: control.name().to_owned(),
                    key: key.to_string(),
                }),
                Some(value) => Ok(value),
            }
        });
        Ok(Some(Install::Getter(get)))
    })
}
