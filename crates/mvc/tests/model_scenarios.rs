#![forbid(unsafe_code)]

//! End-to-end scenarios over the model facade.
//!
//! Validates that:
//! 1. Computed values settle inside the batch that changed their inputs.
//! 2. Actions raise and lower their flag and reject duplicate calls.
//! 3. Effects, subscribers and computed values hear only about keys, and
//!    collection entries, they read.
//! 4. Release handles are idempotent.
//! 5. `import(export())` leaves observable state untouched.
//! 6. Child models are destroyed with their parent.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use futures::channel::oneshot;
use mvc::prelude::*;
use mvc_core::{Controller, Scheduler, Subscriber};

// ============================================================================
// Helpers
// ============================================================================

fn config(queue: &TaskQueue) -> Config {
    Config::default().with_scheduler(queue.clone())
}

fn int(access: &dyn Access, key: &str) -> Result<i64> {
    i64::try_from(access.get(key)?)
}

fn keys(list: &[&str]) -> Vec<String> {
    list.iter().map(|key| (*key).to_owned()).collect()
}

fn timer(queue: &TaskQueue) -> ModelType {
    ModelType::new("Timer")
        .config(config(queue))
        .field("seconds", 0)
        .field(
            "minutes",
            computed(|state| Ok(Value::Int(int(state, "seconds")?.div_euclid(60)))),
        )
}

// ============================================================================
// Computed values
// ============================================================================

#[test]
fn minutes_follow_seconds_in_one_batch() {
    let queue = TaskQueue::new();
    let model = timer(&queue).create().unwrap();
    let _release = model.on(&["minutes"], |_, _| {});

    let _ = model.set("seconds", 60).unwrap();
    let batch = queue.run_until(model.update()).flatten().unwrap();

    assert_eq!(batch.to_vec(), keys(&["seconds", "minutes"]));
    assert_eq!(model.get("minutes"), Ok(Value::Int(1)));
}

#[test]
fn chained_computed_never_reads_stale_values() {
    let queue = TaskQueue::new();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&seen);
    let model = timer(&queue)
        .field(
            "hours",
            computed(move |state| {
                let minutes = int(state, "minutes")?;
                log.borrow_mut().push((int(state, "seconds")?, minutes));
                Ok(Value::Int(minutes / 60))
            }),
        )
        .create()
        .unwrap();

    assert_eq!(model.get("hours"), Ok(Value::Int(0)));
    let _ = model.set("seconds", 7200).unwrap();
    queue.run_until_idle();

    assert_eq!(model.get("hours"), Ok(Value::Int(2)));
    assert_eq!(*seen.borrow(), vec![(0, 0), (7200, 120)]);
    assert_eq!(
        model.last_update().unwrap().to_vec(),
        keys(&["seconds", "minutes", "hours"])
    );
}

#[test]
fn unchanged_computed_is_not_emitted() {
    let queue = TaskQueue::new();
    let model = timer(&queue).create().unwrap();
    assert_eq!(model.get("minutes"), Ok(Value::Int(0)));

    let _ = model.set("seconds", 59).unwrap();
    let batch = queue.run_until(model.update()).flatten().unwrap();
    assert_eq!(batch.to_vec(), keys(&["seconds"]));
}

// ============================================================================
// Actions
// ============================================================================

#[test]
fn rejected_action_settles_its_flag() {
    let queue = TaskQueue::new();
    let gate = queue.clone();
    let model = ModelType::new("Test")
        .config(config(&queue))
        .field(
            "nope",
            act(move |_, _| {
                let (tx, rx) = oneshot::channel::<()>();
                gate.defer(Box::new(move || {
                    let _ = tx.send(());
                }));
                async move {
                    let _ = rx.await;
                    Err(Error::custom("nope"))
                }
            }),
        )
        .create()
        .unwrap();

    let call = model.act("nope", &[]).unwrap();
    let batch = queue.run_until(model.update()).flatten().unwrap();
    assert_eq!(batch.to_vec(), keys(&["nope"]));
    assert_eq!(model.get("nope"), Ok(Value::Bool(true)));

    let duplicate = model.act("nope", &[]).map(|_| ()).unwrap_err();
    assert_eq!(
        duplicate.to_string(),
        "Invoked action nope but one is already active."
    );

    assert_eq!(queue.run_until(call), Some(Err(Error::custom("nope"))));
    assert!(!model.is_active("nope"));

    let batch = queue.run_until(model.update()).flatten().unwrap();
    assert_eq!(batch.to_vec(), keys(&["nope"]));
    assert_eq!(model.get("nope"), Ok(Value::Bool(false)));

    let again = model.act("nope", &[]);
    assert!(again.is_ok());
}

#[test]
fn action_flag_is_observable() {
    let queue = TaskQueue::new();
    let model = ModelType::new("Loader")
        .config(config(&queue))
        .field("load", act(|_, _| async { Ok(Value::from("loaded")) }))
        .create()
        .unwrap();

    let flags = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&flags);
    let _release = model.watch("load", move |value| log.borrow_mut().push(value.clone()));

    let call = model.act("load", &[]).unwrap();
    queue.run_until_idle();
    assert_eq!(queue.run_until(call), Some(Ok(Value::from("loaded"))));
    queue.run_until_idle();

    assert_eq!(*flags.borrow(), vec![Value::Bool(true), Value::Bool(false)]);
}

// ============================================================================
// Selective notification
// ============================================================================

#[test]
fn subscriber_ignores_unread_keys() {
    let queue = TaskQueue::new();
    let model = ModelType::new("Pair")
        .config(config(&queue))
        .field("a", 1)
        .field("b", 2)
        .create()
        .unwrap();

    let hits = Rc::new(Cell::new(0));
    let h = Rc::clone(&hits);
    let sub = Subscriber::new(model.control(), move |_: &str, _: &Controller| {
        h.set(h.get() + 1);
        None
    });
    assert_eq!(sub.get("a"), Ok(Value::Int(1)));
    let release = sub.commit();

    let _ = model.set("b", 3).unwrap();
    queue.run_until_idle();
    assert_eq!(hits.get(), 0);

    let _ = model.set("a", 5).unwrap();
    queue.run_until_idle();
    assert_eq!(hits.get(), 1);

    release.release();
    release.release();
    assert!(sub.is_released());
    let _ = model.set("a", 6).unwrap();
    queue.run_until_idle();
    assert_eq!(hits.get(), 1);
}

#[test]
fn nested_subscriber_hears_child_changes() {
    let queue = TaskQueue::new();
    let address = ModelType::new("Address")
        .config(config(&queue))
        .field("city", "Oslo");
    let person = ModelType::new("Person")
        .config(config(&queue))
        .field("name", "Ada")
        .field("address", child(&address))
        .create()
        .unwrap();
    let home = Model::from_control(person.get("address").unwrap().as_model().unwrap().clone());

    let heard = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&heard);
    let sub = Subscriber::new(person.control(), move |key: &str, _: &Controller| {
        log.borrow_mut().push(key.to_owned());
        None
    });
    let nested = sub.nested("address").unwrap().unwrap();
    assert_eq!(nested.get("city"), Ok(Value::from("Oslo")));
    let release = sub.commit();

    let _ = person.set("name", "Grace").unwrap();
    queue.run_until_idle();
    assert!(heard.borrow().is_empty());

    let _ = home.set("city", "Bergen").unwrap();
    queue.run_until_idle();
    assert_eq!(*heard.borrow(), keys(&["city"]));

    release.release();
    assert!(nested.is_released());
}

#[test]
fn computed_over_map_entry_skips_other_entries() {
    let queue = TaskQueue::new();
    let runs = Rc::new(Cell::new(0));
    let r = Rc::clone(&runs);
    let model = ModelType::new("Pantry")
        .config(config(&queue))
        .field("stock", managed_map([("apples", 3), ("pears", 5)]))
        .field(
            "apples",
            computed(move |state| {
                r.set(r.get() + 1);
                let stock = TrackedMap::try_from(state.get("stock")?)?;
                Ok(stock.get("apples").unwrap_or_default())
            }),
        )
        .create()
        .unwrap();
    let _release = model.on(&["apples"], |_, _| {});
    assert_eq!(runs.get(), 1);

    let stock = model.get_as::<TrackedMap>("stock").unwrap();
    stock.insert("pears", 9);
    let batch = queue.run_until(model.update()).flatten().unwrap();
    assert_eq!(batch.to_vec(), keys(&["stock"]));
    assert_eq!(runs.get(), 1);

    stock.insert("apples", 4);
    let batch = queue.run_until(model.update()).flatten().unwrap();
    assert_eq!(batch.to_vec(), keys(&["stock", "apples"]));
    assert_eq!(runs.get(), 2);
    assert_eq!(model.get("apples"), Ok(Value::Int(4)));
}

#[test]
fn listener_release_is_idempotent() {
    let queue = TaskQueue::new();
    let model = timer(&queue).create().unwrap();
    let calls = Rc::new(Cell::new(0));
    let c = Rc::clone(&calls);
    let release = model.on(&["seconds"], move |_, _| c.set(c.get() + 1));

    let _ = model.set("seconds", 1).unwrap();
    queue.run_until_idle();
    release.release();
    release.release();
    assert!(release.is_released());

    let _ = model.set("seconds", 2).unwrap();
    queue.run_until_idle();
    assert_eq!(calls.get(), 1);
}

#[test]
fn listener_can_release_itself() {
    let queue = TaskQueue::new();
    let model = timer(&queue).create().unwrap();
    let slot: Rc<RefCell<Option<Release>>> = Rc::new(RefCell::new(None));
    let calls = Rc::new(Cell::new(0));

    let (own, c) = (Rc::clone(&slot), Rc::clone(&calls));
    let release = model.on_batch(&["seconds"], move |_| {
        c.set(c.get() + 1);
        if let Some(release) = own.borrow().as_ref() {
            release.release();
        }
    });
    *slot.borrow_mut() = Some(release);

    let _ = model.set("seconds", 1).unwrap();
    queue.run_until_idle();
    let _ = model.set("seconds", 2).unwrap();
    queue.run_until_idle();
    assert_eq!(calls.get(), 1);
}

// ============================================================================
// Snapshots
// ============================================================================

#[test]
fn import_of_export_changes_nothing() {
    let queue = TaskQueue::new();
    let model = ModelType::new("Triple")
        .config(config(&queue))
        .field("a", 1)
        .field("b", "two")
        .field("c", Value::from(vec![3, 4]))
        .create()
        .unwrap();

    let snapshot = model.export();
    assert_eq!(
        snapshot.keys().cloned().collect::<Vec<_>>(),
        keys(&["a", "b", "c"])
    );

    let request = model.import(&snapshot).unwrap();
    assert!(!model.control().is_pending());
    assert_eq!(queue.run_until(request), Some(None));
    assert!(queue.is_idle());
}

#[test]
fn import_skips_read_only_keys() {
    let queue = TaskQueue::new();
    let model = timer(&queue).create().unwrap();
    let _ = model.get("minutes").unwrap();

    let mut snapshot = Snapshot::new();
    snapshot.insert("seconds".into(), Value::Int(120));
    snapshot.insert("unknown".into(), Value::Int(1));
    let request = model.import(&snapshot).unwrap();

    let batch = queue.run_until(request).flatten().unwrap();
    assert_eq!(batch.to_vec(), keys(&["seconds", "minutes"]));
    assert_eq!(model.export_only(&["minutes"]).get("minutes"), Some(&Value::Int(2)));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn destroying_a_parent_destroys_children() {
    let queue = TaskQueue::new();
    let destroyed = Rc::new(RefCell::new(Vec::new()));
    let (a, b) = (Rc::clone(&destroyed), Rc::clone(&destroyed));
    let leaf = ModelType::new("Leaf")
        .config(config(&queue))
        .will_destroy(move |model| a.borrow_mut().push(model.name().to_owned()));
    let root = ModelType::new("Root")
        .config(config(&queue))
        .field("leaf", child(&leaf))
        .will_destroy(move |model| b.borrow_mut().push(model.name().to_owned()))
        .create()
        .unwrap();

    let batches = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&batches);
    let _release = root.on_batch(&["will_destroy"], move |keys| {
        log.borrow_mut().push(keys.to_vec());
    });

    root.destroy();
    queue.run_until_idle();

    assert_eq!(*destroyed.borrow(), vec!["Leaf".to_owned(), "Root".to_owned()]);
    assert_eq!(*batches.borrow(), vec![keys(&["will_destroy"])]);
    assert!(root.control().is_destroyed());
    let leaf = root.get("leaf").unwrap();
    assert!(leaf.as_model().unwrap().is_destroyed());
}

#[test]
fn next_resolves_with_the_new_value() {
    let queue = TaskQueue::new();
    let model = timer(&queue).create().unwrap();
    let next = model.next("seconds");
    let _ = model.set("seconds", 30).unwrap();
    assert_eq!(queue.run_until(next), Some(Ok(Value::Int(30))));
}
