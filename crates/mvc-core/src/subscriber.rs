#![forbid(unsafe_code)]

//! Scoped observer with fine-grained dependency tracking.
//!
//! A [`Subscriber`] is one observation scope over a controller: a render, an
//! effect run or a computed getter. Reads made through it record the key in
//! its watch table, and once committed it is notified only for the keys it
//! actually read.
//!
//! Every tracked key starts *armed*. The first read of an armed key disarms
//! it and follows it; later reads go straight to the controller.
//!
//! # Invariants
//!
//! 1. An inactive subscriber records reads but is never notified.
//! 2. Notification happens only for keys in the watch table, and never for
//!    keys watched with [`Watch::Ignore`] unless the owning property calls
//!    [`Subscriber::trigger`].
//! 3. `release` is idempotent and cascades to dependants.
//!
//! # Failure Modes
//!
//! - Reading after the controller was dropped returns [`Error::Detached`].
//! - Suspense errors from the controller pass through untouched.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use ahash::AHashMap;
use indexmap::{IndexMap, IndexSet};

use crate::controller::{Access, Callback, Controller, WeakController};
use crate::error::{Error, Result};
use crate::release::Release;
use crate::request::Keys;
use crate::store::Snapshot;
use crate::value::Value;

/// Reaction to an update of a key the subscriber read.
pub type OnUpdate = Rc<dyn Fn(&str, &Controller) -> Option<Callback>>;

/// What happens when a watched key changes.
#[derive(Clone)]
pub enum Watch {
    /// Call the subscriber's update handler.
    Notify,
    /// Record the key without reacting to it.
    Ignore,
    /// Run the handler first, then notify.
    Handler(Rc<dyn Fn()>),
}

impl fmt::Debug for Watch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Notify => f.write_str("Notify"),
            Self::Ignore => f.write_str("Ignore"),
            Self::Handler(_) => f.write_str("Handler(..)"),
        }
    }
}

struct SubInner {
    parent: WeakController,
    on_update: OnUpdate,
    active: Cell<bool>,
    registered: Cell<bool>,
    released: Cell<bool>,
    watch: RefCell<IndexMap<String, Watch>>,
    intercept: RefCell<IndexSet<String>>,
    dependants: RefCell<Vec<Subscriber>>,
    nested: RefCell<AHashMap<String, Subscriber>>,
    clear: RefCell<Option<Release>>,
    latest: RefCell<Option<Keys>>,
}

#[derive(Clone)]
pub struct Subscriber {
    inner: Rc<SubInner>,
}

/// Non-owning subscriber handle.
#[derive(Clone)]
pub struct WeakSubscriber {
    inner: Weak<SubInner>,
}

impl WeakSubscriber {
    #[must_use]
    pub fn upgrade(&self) -> Option<Subscriber> {
        self.inner.upgrade().map(|inner| Subscriber { inner })
    }
}

impl Subscriber {
    /// Create an inactive subscriber over `parent` with every tracked key
    /// armed.
    pub fn new(
        parent: &Controller,
        on_update: impl Fn(&str, &Controller) -> Option<Callback> + 'static,
    ) -> Self {
        Self::with_handler(parent, Rc::new(on_update))
    }

    fn with_handler(parent: &Controller, on_update: OnUpdate) -> Self {
        Self {
            inner: Rc::new(SubInner {
                parent: parent.downgrade(),
                on_update,
                active: Cell::new(false),
                registered: Cell::new(false),
                released: Cell::new(false),
                watch: RefCell::new(IndexMap::new()),
                intercept: RefCell::new(parent.tracked_keys().into_iter().collect()),
                dependants: RefCell::new(Vec::new()),
                nested: RefCell::new(AHashMap::new()),
                clear: RefCell::new(None),
                latest: RefCell::new(None),
            }),
        }
    }

    #[must_use]
    pub fn parent(&self) -> Option<Controller> {
        self.inner.parent.upgrade()
    }

    /// Read `key`, following it on first read.
    pub fn get(&self, key: &str) -> Result<Value> {
        let parent = self.parent().ok_or(Error::Detached)?;
        let armed = self.inner.intercept.borrow_mut().shift_remove(key);
        if armed {
            self.follow(key, None);
        }
        parent.read(key, Some(self))
    }

    /// Watch `key`. Without an explicit `watch`, an existing entry is kept
    /// and a new one defaults to [`Watch::Notify`].
    pub fn follow(&self, key: &str, watch: Option<Watch>) {
        let mut table = self.inner.watch.borrow_mut();
        match watch {
            Some(watch) => {
                table.insert(key.to_owned(), watch);
            }
            None => {
                table.entry(key.to_owned()).or_insert(Watch::Notify);
            }
        }
    }

    /// Keys in the watch table, in first-read order.
    #[must_use]
    pub fn using(&self) -> Vec<String> {
        self.inner.watch.borrow().keys().cloned().collect()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active.get()
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.inner.released.get()
    }

    /// Keys of the last delivered batch that this subscriber watches.
    #[must_use]
    pub fn latest(&self) -> Option<Keys> {
        self.inner.latest.borrow().clone()
    }

    /// Start receiving notifications and commit dependants. The returned
    /// handle releases the subscriber.
    pub fn commit(&self) -> Release {
        if self.inner.released.get() {
            return Release::noop();
        }
        self.inner.active.set(true);

        if !self.inner.registered.replace(true)
            && let Some(parent) = self.parent()
        {
            let sub = self.clone();
            let clear = parent.add_listener(move |key, _| {
                if sub.is_active() {
                    sub.notify(key)
                } else {
                    None
                }
            });
            *self.inner.clear.borrow_mut() = Some(clear);
        }

        let dependants = self.inner.dependants.borrow().clone();
        for dependant in dependants {
            let _ = dependant.commit();
        }

        let sub = self.clone();
        Release::new(move || sub.release())
    }

    /// Stop listening and release every dependant. Safe to call repeatedly.
    pub fn release(&self) {
        if self.inner.released.replace(true) {
            return;
        }
        self.inner.active.set(false);

        let clear = self.inner.clear.borrow_mut().take();
        if let Some(clear) = clear {
            clear.release();
        }

        let dependants = std::mem::take(&mut *self.inner.dependants.borrow_mut());
        self.inner.nested.borrow_mut().clear();
        for dependant in dependants {
            dependant.release();
        }
    }

    fn notify(&self, key: &str) -> Option<Callback> {
        let watch = self.inner.watch.borrow().get(key).cloned()?;
        match watch {
            Watch::Ignore => return None,
            Watch::Handler(handler) => handler(),
            Watch::Notify => {}
        }
        self.deliver(key)
    }

    /// Notify for `key` regardless of its watch entry, queueing the reaction
    /// on the parent's current batch. Properties that filter their own
    /// updates watch with [`Watch::Ignore`] and call this instead.
    pub fn trigger(&self, key: &str) {
        if !self.is_active() {
            return;
        }
        if let Some(callback) = self.deliver(key)
            && let Some(parent) = self.parent()
        {
            parent.enqueue(callback);
        }
    }

    fn deliver(&self, key: &str) -> Option<Callback> {
        let parent = self.parent()?;
        let callback = (self.inner.on_update)(key, &parent)?;
        let weak = Rc::downgrade(&self.inner);

        Some(Box::new(move |keys: &Keys| {
            if let Some(inner) = weak.upgrade() {
                let watched: Keys = {
                    let watch = inner.watch.borrow();
                    keys.iter()
                        .filter(|key| watch.contains_key(key.as_str()))
                        .cloned()
                        .collect()
                };
                *inner.latest.borrow_mut() = Some(watched);
            }
            callback(keys);
        }))
    }

    /// Subscriber over the model held in `key`, chained under this one.
    ///
    /// Returns `None` when the value is not a model. The child shares this
    /// subscriber's update handler and is replaced when `key` changes.
    pub fn nested(&self, key: &str) -> Result<Option<Subscriber>> {
        if let Some(existing) = self.inner.nested.borrow().get(key) {
            return Ok(Some(existing.clone()));
        }
        let Value::Model(target) = self.get(key)? else {
            return Ok(None);
        };

        let child = Subscriber::with_handler(&target, Rc::clone(&self.inner.on_update));
        self.inner
            .nested
            .borrow_mut()
            .insert(key.to_owned(), child.clone());
        self.inner.dependants.borrow_mut().push(child.clone());

        let weak = Rc::downgrade(&self.inner);
        let slot = key.to_owned();
        self.follow(
            key,
            Some(Watch::Handler(Rc::new(move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let stale = inner.nested.borrow_mut().remove(&slot);
                if let Some(stale) = stale {
                    inner
                        .dependants
                        .borrow_mut()
                        .retain(|dep| !Rc::ptr_eq(&dep.inner, &stale.inner));
                    stale.release();
                }
            }))),
        );

        if self.is_active() {
            let _ = child.commit();
        }
        Ok(Some(child))
    }

    /// Assign `values` without notifying this subscriber, then reactivate
    /// once the resulting batch has flushed.
    pub fn apply(&self, values: &Snapshot, keys: Option<&[&str]>) -> Result<()> {
        let parent = self.parent().ok_or(Error::Detached)?;
        let was_active = self.inner.active.replace(false);

        let keys: Vec<String> = match keys {
            Some(keys) => keys.iter().map(|key| (*key).to_owned()).collect(),
            None => parent.keys(),
        };
        let result = keys
            .iter()
            .filter_map(|key| Some((key, values.get(key)?)))
            .try_for_each(|(key, value)| parent.set(key, value.clone()));

        if !was_active {
            return result;
        }
        if parent.is_pending() {
            let weak = Rc::downgrade(&self.inner);
            parent.enqueue(Box::new(move |_| {
                if let Some(inner) = weak.upgrade()
                    && !inner.released.get()
                {
                    inner.active.set(true);
                }
            }));
        } else {
            self.inner.active.set(true);
        }
        result
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakSubscriber {
        WeakSubscriber {
            inner: Rc::downgrade(&self.inner),
        }
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Subscriber) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Access for Subscriber {
    fn get(&self, key: &str) -> Result<Value> {
        Subscriber::get(self, key)
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.parent().ok_or(Error::Detached)?.set(key, value)
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("active", &self.is_active())
            .field("released", &self.is_released())
            .field("watch", &*self.inner.watch.borrow())
            .finish_non_exhaustive()
    }
}
