#![forbid(unsafe_code)]

//! Observable models.
//!
//! A [`ModelType`] declares fields; each [`Model`] created from it tracks
//! its values, batches changes into one update per tick and notifies
//! listeners, effects and computed properties with the keys that changed.
//! Declarative helpers in [`instruction`] describe properties that need
//! more than a plain value.
//!
//! The engine underneath lives in `mvc-core`.

pub mod instruction;
pub mod model;

pub use model::{Cleanup, Model, ModelType};

pub mod prelude {
    pub use crate::instruction::{
        TrackedMap, TrackedSet, act, child, computed, computed_from, computed_with, lazy,
        managed, managed_map, managed_set, memo, memo_lazy, parent, reference, reference_with,
        required,
    };
    pub use crate::model::{Cleanup, Model, ModelType};
    pub use mvc_core::{
        Access, Config, Error, Keys, Release, Result, Snapshot, TaskQueue, UpdateRequest, Value,
    };
}
