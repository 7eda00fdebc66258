#![forbid(unsafe_code)]

//! Parent and child model links.

use std::rc::Rc;

use mvc_core::{Controller, Error, Getter, Install, Instruction, Property, Snapshot, Subscriber, Value};

use crate::model::ModelType;

/// Own a new instance of `model_type`, created with this model as parent.
///
/// The child is tracked like any value and destroyed with its parent.
pub fn child(model_type: &ModelType) -> Instruction {
    let model_type = model_type.clone();
    Instruction::new("child", move |key, on| {
        let child = model_type.build(&Snapshot::new(), Some(on))?;
        on.manage(key, Value::Model(child.control().clone()), None);
        Ok(None)
    })
}

/// Read-only link to the model this one was created under.
///
/// With `expects`, a parent of another type fails creation with
/// [`Error::Unexpected`]. With `required`, creating the model standalone
/// fails with [`Error::Required`]. Otherwise a missing parent reads as
/// undefined.
pub fn parent(expects: Option<&ModelType>, required: bool) -> Instruction {
    let expects = expects.cloned();
    Instruction::new("parent", move |_, on| {
        let expected = expects
            .as_ref()
            .map_or_else(|| "Model".to_owned(), |ty| ty.name().to_owned());
        match on.parent() {
            None if required => {
                return Err(Error::Required {
                    expects: expected,
                    child: on.name().to_owned(),
                });
            }
            Some(owner) if expects.as_ref().is_some_and(|ty| ty.name() != owner.name()) => {
                return Err(Error::Unexpected {
                    expects: expected,
                    child: on.name().to_owned(),
                    got: owner.name().to_owned(),
                });
            }
            _ => {}
        }

        let get: Getter = Rc::new(|control: &Controller, _: Option<&Subscriber>| {
            Ok(control.parent().map(Value::Model).unwrap_or_default())
        });
        Ok(Some(Install::Property(Property::Accessor { get, set: None })))
    })
}
