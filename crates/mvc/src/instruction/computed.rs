#![forbid(unsafe_code)]

//! Getter-backed properties.

use std::rc::Rc;

use mvc_core::compute::{self, ComputeFn};
use mvc_core::{Access, Error, Instruction, Result, Setter, Subscriber, Value};

use crate::model::Model;

/// Property computed from the model's own state.
///
/// The getter runs on first read and again whenever a key it read changes.
/// Assigning the key replaces it with a plain value.
pub fn computed(getter: impl Fn(&dyn Access) -> Result<Value> + 'static) -> Instruction {
    let getter = wrap(getter);
    Instruction::new("computed", move |key, on| {
        compute::prepare(on, key, on, Rc::clone(&getter), None);
        Ok(None)
    })
}

/// Like [`computed`], with assignments routed to `set`.
pub fn computed_with(
    getter: impl Fn(&dyn Access) -> Result<Value> + 'static,
    set: impl Fn(&Model, Value) -> Result<()> + 'static,
) -> Instruction {
    let getter = wrap(getter);
    let set = Rc::new(set);
    Instruction::new("computed", move |key, on| {
        let weak = on.downgrade();
        let set = Rc::clone(&set);
        let setter: Setter = Rc::new(move |value| {
            let control = weak.upgrade().ok_or(Error::Detached)?;
            set(&Model::from_control(control), value)
        });
        compute::prepare(on, key, on, Rc::clone(&getter), Some(setter));
        Ok(None)
    })
}

/// Property computed from another model's state. Changes on `source`
/// refresh the value immediately.
pub fn computed_from(
    source: &Model,
    getter: impl Fn(&dyn Access) -> Result<Value> + 'static,
) -> Instruction {
    let getter = wrap(getter);
    let source = source.downgrade();
    Instruction::new("computed", move |key, on| {
        let source = source.upgrade().ok_or(Error::Detached)?;
        compute::prepare(on, key, &source, Rc::clone(&getter), None);
        Ok(None)
    })
}

fn wrap(getter: impl Fn(&dyn Access) -> Result<Value> + 'static) -> ComputeFn {
    Rc::new(move |sub: &Subscriber| {
        let access: &dyn Access = sub;
        getter(access)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelType;
    use mvc_core::{Config, TaskQueue};

    fn int(access: &dyn Access, key: &str) -> Result<i64> {
        i64::try_from(access.get(key)?)
    }

    #[test]
    fn recomputes_after_dependency_changes() {
        let queue = TaskQueue::new();
        let model = ModelType::new("Area")
            .config(Config::default().with_scheduler(queue.clone()))
            .field("width", 2)
            .field("height", 3)
            .field(
                "area",
                computed(|state| Ok(Value::Int(int(state, "width")? * int(state, "height")?))),
            )
            .create()
            .unwrap();

        assert_eq!(model.get("area"), Ok(Value::Int(6)));
        let _ = model.set("width", 5).unwrap();
        let keys = queue.run_until(model.update()).flatten().unwrap();
        assert_eq!(&*keys, &["width".to_owned(), "area".to_owned()]);
        assert_eq!(model.get("area"), Ok(Value::Int(15)));
    }

    #[test]
    fn setter_receives_assignment() {
        let queue = TaskQueue::new();
        let model = ModelType::new("Temperature")
            .config(Config::default().with_scheduler(queue.clone()))
            .field("celsius", 0)
            .field(
                "fahrenheit",
                computed_with(
                    |state| Ok(Value::Int(int(state, "celsius")? * 9 / 5 + 32)),
                    |model, value| {
                        let f = i64::try_from(value)?;
                        let _ = model.set("celsius", (f - 32) * 5 / 9)?;
                        Ok(())
                    },
                ),
            )
            .create()
            .unwrap();

        assert_eq!(model.get("fahrenheit"), Ok(Value::Int(32)));
        let _ = model.set("fahrenheit", 212).unwrap();
        queue.run_until_idle();
        assert_eq!(model.get("celsius"), Ok(Value::Int(100)));
        assert_eq!(model.get("fahrenheit"), Ok(Value::Int(212)));
    }

    #[test]
    fn follows_another_model() {
        let queue = TaskQueue::new();
        let config = Config::default().with_scheduler(queue.clone());
        let source = ModelType::new("Source")
            .config(config.clone())
            .field("value", 1)
            .create()
            .unwrap();
        let mirror = ModelType::new("Mirror")
            .config(config)
            .field(
                "double",
                computed_from(&source, |state| Ok(Value::Int(int(state, "value")? * 2))),
            )
            .create()
            .unwrap();

        assert_eq!(mirror.get("double"), Ok(Value::Int(2)));
        let _ = source.set("value", 4).unwrap();
        queue.run_until_idle();
        assert_eq!(mirror.get("double"), Ok(Value::Int(8)));
    }
}
