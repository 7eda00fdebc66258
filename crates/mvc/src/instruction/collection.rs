#![forbid(unsafe_code)]

//! Map and set properties tracked per entry.
//!
//! Reading a collection property yields a view. A view handed to a
//! subscriber records what that subscriber looked at: a lookup (`get`,
//! `contains`) follows that entry only, while anything that observes the
//! whole collection (`len`, iteration, copies) follows every change. Writes
//! store the new contents, emit the property key and wake only the
//! subscribers whose reads intersect the change.
//!
//! # Invariants
//!
//! 1. A subscriber is woken at most once per batch by a given collection.
//! 2. [`Changes`] covers the batch being assembled and is cleared once that
//!    batch flushes.
//! 3. The store holds the plain contents (`Map` for maps, `List` for sets),
//!    so exports, imports and key listeners see ordinary values.
//!
//! # Failure Modes
//!
//! - Assigning a value of the wrong shape fails with [`Error::Type`].
//! - Writes through a view whose model is gone change the contents but emit
//!   nothing.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use mvc_core::{
    Controller, Error, Getter, Handle, Instruction, Property, Result, Setter, Subscriber, Value,
    Watch, WeakController, WeakSubscriber,
};

/// Entries written since the last flush.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changes {
    /// The collection was replaced or cleared.
    pub whole: bool,
    /// Individual entries, in write order. Map entries are their keys.
    pub entries: Vec<Value>,
}

impl Changes {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.whole && self.entries.is_empty()
    }

    fn record(&mut self, change: Option<&Value>) {
        match change {
            None => self.whole = true,
            Some(entry) => push_unique(&mut self.entries, entry),
        }
    }
}

fn push_unique(list: &mut Vec<Value>, entry: &Value) {
    if !list.contains(entry) {
        list.push(entry.clone());
    }
}

// ---------------------------------------------------------------------------
// Shared tracking
// ---------------------------------------------------------------------------

/// Reads made through one subscriber's views.
#[derive(Default)]
struct Usage {
    whole: Cell<bool>,
    entries: RefCell<Vec<Value>>,
    woken: Cell<bool>,
}

impl Usage {
    fn record(&self, entry: Option<&Value>) {
        match entry {
            None => self.whole.set(true),
            Some(entry) => push_unique(&mut self.entries.borrow_mut(), entry),
        }
    }

    fn wants(&self, change: Option<&Value>) -> bool {
        if self.whole.get() {
            return true;
        }
        let entries = self.entries.borrow();
        match change {
            None => !entries.is_empty(),
            Some(entry) => entries.contains(entry),
        }
    }
}

struct Observer {
    sub: WeakSubscriber,
    usage: Rc<Usage>,
}

trait Contents: Clone + PartialEq + 'static {
    fn to_value(&self) -> Value;
    fn from_value(value: Value) -> Result<Self>;
}

impl Contents for IndexMap<String, Value> {
    fn to_value(&self) -> Value {
        Value::Map(self.clone())
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Map(map) => Ok(map),
            other => Err(Error::Type {
                expected: "map",
                found: other.type_name(),
            }),
        }
    }
}

impl Contents for Vec<Value> {
    fn to_value(&self) -> Value {
        Value::List(self.clone())
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::List(items) => Ok(items.iter().fold(Vec::new(), |mut set, item| {
                push_unique(&mut set, item);
                set
            })),
            other => Err(Error::Type {
                expected: "list",
                found: other.type_name(),
            }),
        }
    }
}

struct Tracker<C> {
    key: String,
    control: WeakController,
    items: RefCell<C>,
    changes: RefCell<Changes>,
    reset_queued: Cell<bool>,
    observers: RefCell<Vec<Observer>>,
}

impl<C: Contents> Tracker<C> {
    fn new(key: &str, control: &Controller, items: C) -> Self {
        Self {
            key: key.to_owned(),
            control: control.downgrade(),
            items: RefCell::new(items),
            changes: RefCell::new(Changes::default()),
            reset_queued: Cell::new(false),
            observers: RefCell::new(Vec::new()),
        }
    }

    /// Usage table for `local`, created on its first read. The property key
    /// is watched with `Ignore` so only [`Tracker::wake`] notifies it.
    fn usage(&self, local: &Subscriber) -> Rc<Usage> {
        local.follow(&self.key, Some(Watch::Ignore));
        let mut observers = self.observers.borrow_mut();
        let existing = observers.iter().find(|observer| {
            observer
                .sub
                .upgrade()
                .is_some_and(|sub| sub.ptr_eq(local))
        });
        if let Some(observer) = existing {
            return Rc::clone(&observer.usage);
        }
        let usage = Rc::new(Usage::default());
        observers.push(Observer {
            sub: local.downgrade(),
            usage: Rc::clone(&usage),
        });
        usage
    }

    fn emit(self: &Rc<Self>, change: Option<Value>) {
        let Some(control) = self.control.upgrade() else {
            return;
        };
        self.changes.borrow_mut().record(change.as_ref());
        let contents = self.items.borrow().to_value();
        control.update(&self.key, Some(contents));

        if !self.reset_queued.replace(true) {
            let weak = Rc::downgrade(self);
            control.enqueue(Box::new(move |_| {
                if let Some(tracker) = weak.upgrade() {
                    tracker.reset();
                }
            }));
        }
        self.wake(change.as_ref());
    }

    fn wake(&self, change: Option<&Value>) {
        let woken: Vec<Subscriber> = {
            let mut observers = self.observers.borrow_mut();
            observers.retain(|observer| {
                observer
                    .sub
                    .upgrade()
                    .is_some_and(|sub| !sub.is_released())
            });
            observers
                .iter()
                .filter(|observer| !observer.usage.woken.get() && observer.usage.wants(change))
                .filter_map(|observer| {
                    let sub = observer.sub.upgrade().filter(Subscriber::is_active)?;
                    observer.usage.woken.set(true);
                    Some(sub)
                })
                .collect()
        };
        for sub in woken {
            sub.trigger(&self.key);
        }
    }

    fn reset(&self) {
        self.reset_queued.set(false);
        *self.changes.borrow_mut() = Changes::default();
        for observer in self.observers.borrow().iter() {
            observer.usage.woken.set(false);
        }
    }

    fn replace(self: &Rc<Self>, value: Value) -> Result<()> {
        let next = C::from_value(value)?;
        if *self.items.borrow() == next {
            return Ok(());
        }
        *self.items.borrow_mut() = next;
        self.emit(None);
        Ok(())
    }
}

/// A tracker plus the reads of the subscriber it was handed to, if any.
struct View<C> {
    tracker: Rc<Tracker<C>>,
    usage: Option<Rc<Usage>>,
}

impl<C> Clone for View<C> {
    fn clone(&self) -> Self {
        Self {
            tracker: Rc::clone(&self.tracker),
            usage: self.usage.clone(),
        }
    }
}

impl<C: Contents> View<C> {
    fn watch(&self, entry: Option<&Value>) {
        if let Some(usage) = &self.usage {
            usage.record(entry);
        }
    }

    fn read<R>(&self, entry: Option<&Value>, f: impl FnOnce(&C) -> R) -> R {
        self.watch(entry);
        f(&self.tracker.items.borrow())
    }

    /// Apply `f` to the contents and emit `change` when it reports a write.
    fn write<R>(&self, change: Option<Value>, f: impl FnOnce(&mut C) -> (bool, R)) -> R {
        let (changed, result) = f(&mut self.tracker.items.borrow_mut());
        if changed {
            self.tracker.emit(change);
        }
        result
    }

    fn changes(&self) -> Changes {
        self.tracker.changes.borrow().clone()
    }
}

fn install<C: Contents, T: Any>(key: &str, on: &Controller, initial: C, wrap: fn(View<C>) -> T) {
    let tracker = Rc::new(Tracker::new(key, on, initial));
    let contents = tracker.items.borrow().to_value();

    let reader = Rc::clone(&tracker);
    let get: Getter = Rc::new(move |_: &Controller, local: Option<&Subscriber>| {
        let view = View {
            tracker: Rc::clone(&reader),
            usage: local.map(|local| reader.usage(local)),
        };
        Ok(Value::Handle(Handle::new(wrap(view))))
    });
    let set: Setter = Rc::new(move |value: Value| tracker.replace(value));

    on.define(key, Property::Accessor { get, set: Some(set) }, Some(contents));
}

fn downcast<T: Any + Clone>(value: &Value, expected: &'static str) -> Result<T> {
    match value {
        Value::Handle(handle) => handle.downcast::<T>().map(|view| (*view).clone()),
        _ => None,
    }
    .ok_or(Error::Type {
        expected,
        found: value.type_name(),
    })
}

// ---------------------------------------------------------------------------
// Map
// ---------------------------------------------------------------------------

/// View of a property declared with [`managed_map`].
///
/// Obtain one with `TrackedMap::try_from(state.get(key)?)` or
/// `model.get_as::<TrackedMap>(key)`. Views read
/// through a subscriber record their lookups against it.
#[derive(Clone)]
pub struct TrackedMap(View<IndexMap<String, Value>>);

impl TrackedMap {
    /// Value under `key`, following that entry.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.0
            .read(Some(&Value::from(key)), |map| map.get(key).cloned())
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0
            .read(Some(&Value::from(key)), |map| map.contains_key(key))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.read(None, IndexMap::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.read(None, IndexMap::is_empty)
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.0.read(None, |map| map.keys().cloned().collect())
    }

    /// Copy of every entry, in insertion order.
    #[must_use]
    pub fn to_map(&self) -> IndexMap<String, Value> {
        self.0.read(None, Clone::clone)
    }

    /// Store `value` under `key`, returning the previous value. Writing an
    /// equal value changes nothing.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let (key, value) = (key.into(), value.into());
        let change = Value::from(key.as_str());
        self.0.write(Some(change), |map| {
            if map.get(&key) == Some(&value) {
                return (false, Some(value));
            }
            (true, map.insert(key, value))
        })
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0.write(Some(Value::from(key)), |map| {
            let removed = map.shift_remove(key);
            (removed.is_some(), removed)
        })
    }

    pub fn clear(&self) {
        self.0.write(None, |map| {
            let changed = !map.is_empty();
            map.clear();
            (changed, ())
        });
    }

    /// Keys written in the batch being assembled.
    #[must_use]
    pub fn changes(&self) -> Changes {
        self.0.changes()
    }
}

impl TryFrom<Value> for TrackedMap {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        downcast(&value, "tracked map")
    }
}

impl fmt::Debug for TrackedMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedMap")
            .field("key", &self.0.tracker.key)
            .field("entries", &*self.0.tracker.items.borrow())
            .finish()
    }
}

/// Map property tracked per key.
pub fn managed_map<K, V>(initial: impl IntoIterator<Item = (K, V)>) -> Instruction
where
    K: Into<String>,
    V: Into<Value>,
{
    let initial: IndexMap<String, Value> = initial
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .collect();
    Instruction::new("map", move |key, on| {
        install(key, on, initial.clone(), TrackedMap);
        Ok(None)
    })
}

// ---------------------------------------------------------------------------
// Set
// ---------------------------------------------------------------------------

/// View of a property declared with [`managed_set`]. Items are unique under
/// [`Value`] equality and keep insertion order.
#[derive(Clone)]
pub struct TrackedSet(View<Vec<Value>>);

impl TrackedSet {
    /// Whether `item` is present, following that item.
    #[must_use]
    pub fn contains(&self, item: impl Into<Value>) -> bool {
        let item = item.into();
        self.0.read(Some(&item), |items| items.contains(&item))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.read(None, Vec::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.read(None, Vec::is_empty)
    }

    /// Copy of every item, in insertion order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Value> {
        self.0.read(None, Clone::clone)
    }

    /// Add `item`; returns whether it was new.
    pub fn insert(&self, item: impl Into<Value>) -> bool {
        let item = item.into();
        self.0.write(Some(item.clone()), |items| {
            let added = !items.contains(&item);
            if added {
                items.push(item);
            }
            (added, added)
        })
    }

    pub fn remove(&self, item: impl Into<Value>) -> bool {
        let item = item.into();
        self.0.write(Some(item.clone()), |items| {
            let before = items.len();
            items.retain(|existing| *existing != item);
            let removed = items.len() != before;
            (removed, removed)
        })
    }

    pub fn clear(&self) {
        self.0.write(None, |items| {
            let changed = !items.is_empty();
            items.clear();
            (changed, ())
        });
    }

    /// Items written in the batch being assembled.
    #[must_use]
    pub fn changes(&self) -> Changes {
        self.0.changes()
    }
}

impl TryFrom<Value> for TrackedSet {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        downcast(&value, "tracked set")
    }
}

impl fmt::Debug for TrackedSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedSet")
            .field("key", &self.0.tracker.key)
            .field("items", &*self.0.tracker.items.borrow())
            .finish()
    }
}

/// Set property tracked per item.
pub fn managed_set<V: Into<Value>>(initial: impl IntoIterator<Item = V>) -> Instruction {
    let initial = initial.into_iter().fold(Vec::new(), |mut set, item| {
        push_unique(&mut set, &item.into());
        set
    });
    Instruction::new("set", move |key, on| {
        install(key, on, initial.clone(), TrackedSet);
        Ok(None)
    })
}
