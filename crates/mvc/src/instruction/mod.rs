#![forbid(unsafe_code)]

//! Declarative field initializers.
//!
//! Each function here returns an [`Instruction`](mvc_core::Instruction)
//! placeholder. Declared as a field of a [`ModelType`](crate::ModelType), it
//! is consumed when the instance starts and installs the property it
//! describes.

pub mod act;
pub mod collection;
pub mod computed;
pub mod family;
pub mod reference;
pub mod value;

pub use act::{Action, act};
pub use collection::{Changes, TrackedMap, TrackedSet, managed_map, managed_set};
pub use computed::{computed, computed_from, computed_with};
pub use family::{child, parent};
pub use reference::{Ref, reference, reference_with};
pub use value::{lazy, managed, memo, memo_lazy, required};
