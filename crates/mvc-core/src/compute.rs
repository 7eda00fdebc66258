#![forbid(unsafe_code)]

//! Computed-value engine.
//!
//! A computed property is materialized on first read. Its getter runs
//! against a [`Subscriber`] on the source controller, which records every
//! key the getter reads. When one of those keys changes the recompute is
//! queued on the owning controller, ordered by priority, and drained at the
//! start of the next flush so dependents always see settled dependencies.
//!
//! # Invariants
//!
//! 1. A computed key's priority is strictly greater than the priority of
//!    every computed key of the same controller it reads.
//! 2. The pending queue is sorted by ascending priority; equal priorities
//!    keep insertion order.
//! 3. A key is queued at most once per flush and skipped when it already
//!    changed in the frame being flushed.
//!
//! # Failure Modes
//!
//! - Initial compute failure: logged at `WARN` and returned to the reader.
//! - Recompute failure: logged at `ERROR`; the last good value is kept and
//!   no update is emitted.

use std::rc::Rc;

use indexmap::IndexMap;
use tracing::{error, warn};

use crate::controller::{Controller, Property, Setter, WeakController};
use crate::error::{Error, Result};
use crate::subscriber::{Subscriber, Watch};
use crate::value::Value;

/// Getter of a computed property. Reads go through the subscriber.
pub type ComputeFn = Rc<dyn Fn(&Subscriber) -> Result<Value>>;

struct GetterInfo {
    priority: u32,
    source: WeakController,
    getter: ComputeFn,
    setter: Option<Setter>,
    subscriber: Option<Subscriber>,
    created: bool,
}

/// Per-controller computed metadata and pending recompute queue.
#[derive(Default)]
pub(crate) struct ComputeTable {
    info: IndexMap<String, GetterInfo>,
    pending: Vec<String>,
}

/// Declare `key` on `on` as computed from `source`.
///
/// Nothing runs until the key is first read.
pub fn prepare(
    on: &Controller,
    key: &str,
    source: &Controller,
    getter: ComputeFn,
    setter: Option<Setter>,
) {
    on.inner.computed.borrow_mut().info.insert(
        key.to_owned(),
        GetterInfo {
            priority: 1,
            source: source.downgrade(),
            getter,
            setter,
            subscriber: None,
            created: false,
        },
    );
    on.replace_property(key, Property::Computed);
}

/// Read a computed key, materializing or refreshing it as needed.
pub(crate) fn read(on: &Controller, key: &str, local: Option<&Subscriber>) -> Result<Value> {
    let (created, stale) = {
        let table = on.inner.computed.borrow();
        match table.info.get(key) {
            Some(info) => (info.created, table.pending.iter().any(|k| k == key)),
            None => return Ok(on.peek(key).unwrap_or_default()),
        }
    };

    if !created {
        return create(on, key, local.is_none());
    }
    if stale {
        on.inner.computed.borrow_mut().pending.retain(|k| k != key);
        refresh(on, key);
    }
    Ok(on.peek(key).unwrap_or_default())
}

fn create(on: &Controller, key: &str, early: bool) -> Result<Value> {
    let (source, getter) = {
        let table = on.inner.computed.borrow();
        let info = table
            .info
            .get(key)
            .ok_or_else(|| Error::unknown(on.name(), key))?;
        (info.source.upgrade(), Rc::clone(&info.getter))
    };
    let source = source.ok_or(Error::Detached)?;

    let owner = on.downgrade();
    let target: Rc<str> = key.into();
    let sub = Subscriber::new(&source, move |_, emitter| {
        if let Some(owner) = owner.upgrade() {
            capture(&owner, &target, emitter);
        }
        None
    });
    if source.ptr_eq(on) {
        sub.follow(key, Some(Watch::Ignore));
    }

    if let Some(info) = on.inner.computed.borrow_mut().info.get_mut(key) {
        info.created = true;
        info.subscriber = Some(sub.clone());
    }
    on.store_value(key, Value::Undefined);

    if early && on.config().warn_computed_early {
        warn!(
            model = %on.name(),
            key,
            "Note: Computed values don't run until accessed, except when subscribed to. \
             '{key}' getter may have run earlier than intended."
        );
    }

    let result = evaluate(on, key, &sub, &getter, true);
    let _ = sub.commit();
    reprioritize(on, key, &source, &sub);

    let value = result?;
    on.store_value(key, value.clone());
    Ok(value)
}

fn evaluate(
    on: &Controller,
    key: &str,
    sub: &Subscriber,
    getter: &ComputeFn,
    initial: bool,
) -> Result<Value> {
    getter(sub).inspect_err(|err| {
        warn!(
            model = %on.name(),
            key,
            initial,
            %err,
            "An exception was thrown while {} [{}.{}].",
            if initial { "initializing" } else { "refreshing" },
            on.name(),
            key
        );
    })
}

/// Re-run the getter and emit an update if the value changed.
fn refresh(on: &Controller, key: &str) {
    let entry = {
        let table = on.inner.computed.borrow();
        table.info.get(key).and_then(|info| {
            Some((
                info.subscriber.clone()?,
                Rc::clone(&info.getter),
                info.source.upgrade()?,
            ))
        })
    };
    let Some((sub, getter, source)) = entry else {
        return;
    };

    match evaluate(on, key, &sub, &getter, false) {
        Ok(value) => {
            reprioritize(on, key, &source, &sub);
            if on.peek(key).as_ref() != Some(&value) {
                on.update(key, Some(value));
            }
        }
        Err(err) => error!(
            model = %on.name(),
            key,
            %err,
            "recompute failed; keeping previous value"
        ),
    }
}

/// Raise the priority of `key` above every computed key of the same
/// controller that its getter reads.
fn reprioritize(on: &Controller, key: &str, source: &Controller, sub: &Subscriber) {
    if !source.ptr_eq(on) {
        return;
    }
    let deps = sub.using();
    let mut table = on.inner.computed.borrow_mut();
    let Some(mut priority) = table.info.get(key).map(|info| info.priority) else {
        return;
    };
    for dep in deps.iter().filter(|dep| dep.as_str() != key) {
        if let Some(info) = table.info.get(dep) {
            priority = priority.max(info.priority + 1);
        }
    }
    if let Some(info) = table.info.get_mut(key) {
        info.priority = priority;
    }
}

/// Schedule a recompute of `key` in response to `emitter` changing.
///
/// Changes from another controller refresh immediately since there is no
/// shared frame to queue into.
fn capture(owner: &Controller, key: &str, emitter: &Controller) {
    if !emitter.ptr_eq(owner) {
        refresh(owner, key);
        return;
    }

    let mut table = owner.inner.computed.borrow_mut();
    if table.pending.iter().any(|k| k == key) {
        return;
    }
    let priority = table.info.get(key).map_or(1, |info| info.priority);
    let at = table
        .pending
        .iter()
        .rposition(|k| table.info.get(k).map_or(0, |info| info.priority) <= priority)
        .map_or(0, |index| index + 1);
    table.pending.insert(at, key.to_owned());
}

/// Drain the pending queue, refreshing keys not already in the frame.
pub(crate) fn flush(on: &Controller) {
    loop {
        let next = {
            let mut table = on.inner.computed.borrow_mut();
            if table.pending.is_empty() {
                break;
            }
            table.pending.remove(0)
        };
        if !on.in_frame(&next) {
            refresh(on, &next);
        }
    }
}

/// Materialize any of `keys` that are computed and not yet created.
/// Failures are already logged by the compute path.
pub fn ensure(on: &Controller, keys: &[String]) {
    for key in keys {
        let uncreated = on
            .inner
            .computed
            .borrow()
            .info
            .get(key)
            .is_some_and(|info| !info.created);
        if uncreated {
            let _ = create(on, key, false);
        }
    }
}

/// Write to a computed key: through its setter if it has one, otherwise
/// the key reverts to a plain untracked value.
pub(crate) fn assign(on: &Controller, key: &str, value: Value) -> Result<()> {
    let setter = on
        .inner
        .computed
        .borrow()
        .info
        .get(key)
        .and_then(|info| info.setter.clone());
    if let Some(setter) = setter {
        return setter(value);
    }

    let removed = on.inner.computed.borrow_mut().info.shift_remove(key);
    on.inner.computed.borrow_mut().pending.retain(|k| k != key);
    if let Some(sub) = removed.and_then(|info| info.subscriber) {
        sub.release();
    }
    on.forget(key);
    on.replace_property(key, Property::Value(value));
    Ok(())
}

pub(crate) fn has_setter(on: &Controller, key: &str) -> bool {
    on.inner
        .computed
        .borrow()
        .info
        .get(key)
        .is_some_and(|info| info.setter.is_some())
}

pub(crate) fn keys(on: &Controller) -> Vec<String> {
    on.inner.computed.borrow().info.keys().cloned().collect()
}

/// Release every dependency subscriber of `on`.
pub(crate) fn release_all(on: &Controller) {
    let subs: Vec<Subscriber> = {
        let mut table = on.inner.computed.borrow_mut();
        table.pending.clear();
        table
            .info
            .values_mut()
            .filter_map(|info| info.subscriber.take())
            .collect()
    };
    for sub in subs {
        sub.release();
    }
}

/// Topological priority of a computed key.
#[must_use]
pub fn priority(on: &Controller, key: &str) -> Option<u32> {
    on.inner
        .computed
        .borrow()
        .info
        .get(key)
        .map(|info| info.priority)
}

/// Computed keys waiting for the next flush, in recompute order.
#[must_use]
pub fn pending_keys(on: &Controller) -> Vec<String> {
    on.inner.computed.borrow().pending.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::controller::Access;
    use crate::instruction::Field;
    use crate::scheduler::TaskQueue;
    use std::cell::Cell;

    fn int(access: &dyn Access, key: &str) -> Result<i64> {
        i64::try_from(access.get(key)?)
    }

    fn clock(queue: &TaskQueue) -> Controller {
        let control = Controller::new(
            "Clock",
            vec![("seconds", Field::from(0))],
            Config::default()
                .with_scheduler(queue.clone())
                .with_warn_computed_early(false),
        );
        control.start().unwrap();
        prepare(
            &control,
            "minutes",
            &control.clone(),
            Rc::new(|sub: &Subscriber| Ok(Value::Int(int(sub, "seconds")? / 60))),
            None,
        );
        control
    }

    #[test]
    fn computes_lazily_and_refreshes_on_flush() {
        let queue = TaskQueue::new();
        let control = clock(&queue);
        assert_eq!(control.peek("minutes"), None);

        assert_eq!(control.get("minutes"), Ok(Value::Int(0)));
        control.set("seconds", 60.into()).unwrap();
        let keys = queue.run_until(control.request_update()).flatten().unwrap();

        assert_eq!(&*keys, &["seconds".to_owned(), "minutes".to_owned()]);
        assert_eq!(control.get("minutes"), Ok(Value::Int(1)));
    }

    #[test]
    fn unchanged_result_emits_nothing() {
        let queue = TaskQueue::new();
        let control = clock(&queue);
        control.get("minutes").unwrap();

        control.set("seconds", 30.into()).unwrap();
        let keys = queue.run_until(control.request_update()).flatten().unwrap();
        assert_eq!(&*keys, &["seconds".to_owned()]);
    }

    #[test]
    fn priority_exceeds_dependencies() {
        let queue = TaskQueue::new();
        let control = clock(&queue);
        prepare(
            &control,
            "hours",
            &control.clone(),
            Rc::new(|sub: &Subscriber| Ok(Value::Int(int(sub, "minutes")? / 60))),
            None,
        );

        control.get("hours").unwrap();
        assert_eq!(priority(&control, "minutes"), Some(1));
        assert_eq!(priority(&control, "hours"), Some(2));

        control.set("seconds", 3600.into()).unwrap();
        let keys = queue.run_until(control.request_update()).flatten().unwrap();
        assert_eq!(
            &*keys,
            &[
                "seconds".to_owned(),
                "minutes".to_owned(),
                "hours".to_owned()
            ]
        );
        assert_eq!(control.get("hours"), Ok(Value::Int(1)));
    }

    #[test]
    fn pending_queue_orders_by_priority() {
        let queue = TaskQueue::new();
        let control = clock(&queue);
        prepare(
            &control,
            "hours",
            &control.clone(),
            Rc::new(|sub: &Subscriber| {
                int(sub, "seconds")?;
                Ok(Value::Int(int(sub, "minutes")? / 60))
            }),
            None,
        );
        control.get("hours").unwrap();

        control.set("seconds", 7200.into()).unwrap();
        assert_eq!(pending_keys(&control), vec!["minutes", "hours"]);
        queue.run_until_idle();
        assert!(pending_keys(&control).is_empty());
        assert_eq!(control.get("hours"), Ok(Value::Int(2)));
    }

    #[test]
    fn recompute_failure_keeps_last_value() {
        let queue = TaskQueue::new();
        let control = Controller::new(
            "Guard",
            vec![("n", Field::from(1))],
            Config::default().with_scheduler(queue.clone()),
        );
        control.start().unwrap();
        prepare(
            &control,
            "inverse",
            &control.clone(),
            Rc::new(|sub: &Subscriber| match int(sub, "n")? {
                0 => Err(Error::custom("division by zero")),
                n => Ok(Value::Int(100 / n)),
            }),
            None,
        );
        control.read("inverse", None).unwrap();

        control.set("n", 0.into()).unwrap();
        let keys = queue.run_until(control.request_update()).flatten().unwrap();

        assert_eq!(&*keys, &["n".to_owned()]);
        assert_eq!(control.get("inverse"), Ok(Value::Int(100)));
    }

    #[test]
    fn initial_failure_propagates() {
        let queue = TaskQueue::new();
        let control = Controller::new(
            "Broken",
            Vec::<(&str, Field)>::new(),
            Config::default().with_scheduler(queue),
        );
        control.start().unwrap();
        prepare(
            &control,
            "value",
            &control.clone(),
            Rc::new(|_: &Subscriber| Err(Error::custom("bad"))),
            None,
        );

        assert_eq!(control.get("value"), Err(Error::custom("bad")));
        assert_eq!(control.get("value"), Ok(Value::Undefined));
    }

    #[test]
    fn cross_controller_dependency_refreshes_immediately() {
        let queue = TaskQueue::new();
        let source = Controller::new(
            "Source",
            vec![("n", Field::from(1))],
            Config::default().with_scheduler(queue.clone()),
        );
        source.start().unwrap();
        let target = Controller::new(
            "Target",
            Vec::<(&str, Field)>::new(),
            Config::default().with_scheduler(queue.clone()),
        );
        target.start().unwrap();
        prepare(
            &target,
            "double",
            &source,
            Rc::new(|sub: &Subscriber| Ok(Value::Int(int(sub, "n")? * 2))),
            None,
        );
        target.read("double", None).unwrap();

        source.set("n", 5.into()).unwrap();
        assert_eq!(target.peek("double"), Some(Value::Int(10)));
        assert!(target.is_pending());
    }

    #[test]
    fn setter_and_revert() {
        let queue = TaskQueue::new();
        let control = clock(&queue);
        let writes = Rc::new(Cell::new(0));
        let w = Rc::clone(&writes);
        prepare(
            &control,
            "settable",
            &control.clone(),
            Rc::new(|_: &Subscriber| Ok(Value::Null)),
            Some(Rc::new(move |_: Value| {
                w.set(w.get() + 1);
                Ok(())
            })),
        );

        assert!(control.is_settable("settable"));
        control.set("settable", 1.into()).unwrap();
        assert_eq!(writes.get(), 1);

        control.get("minutes").unwrap();
        control.set("minutes", 99.into()).unwrap();
        assert!(matches!(control.property("minutes"), Some(Property::Value(_))));
        assert_eq!(control.get("minutes"), Ok(Value::Int(99)));
        assert!(!control.state_keys().contains(&"minutes".to_owned()));
    }

    #[test]
    fn ensure_materializes_without_reading() {
        let queue = TaskQueue::new();
        let control = clock(&queue);
        ensure(&control, &["minutes".to_owned(), "seconds".to_owned()]);
        assert_eq!(control.peek("minutes"), Some(Value::Int(0)));
    }
}
