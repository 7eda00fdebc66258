#![forbid(unsafe_code)]

//! Per-instance state and event hub.
//!
//! A [`Controller`] owns the tracked state of one model instance and batches
//! every change into a *frame*. The first key entering an empty frame
//! schedules one deferred flush on the configured scheduler; the flush
//! settles pending computed values, freezes the frame into a key list and
//! hands it to the callbacks that asked to be told once the batch resolves.
//!
//! # Invariants
//!
//! 1. The frame is non-empty iff a flush has been scheduled and has not run.
//! 2. A key appears at most once per frame; repeated updates are absorbed.
//! 3. Followers are called synchronously, in registration order, from
//!    `update`. Waiting callbacks run once, after the batch, in queue order.
//! 4. Only the controller writes its store.
//!
//! # Failure Modes
//!
//! - A panicking follower or waiting callback is caught and logged at
//!   `ERROR`; the remaining callbacks still run and the frame stays
//!   consistent.
//! - After `destroy` the controller has no followers, so later updates are
//!   stored but observed by no one.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, error, trace};

use crate::compute::{self, ComputeTable};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::instruction::{Field, Install, Instruction, Registry};
use crate::release::Release;
use crate::request::{Keys, UpdateRequest};
use crate::store::{Snapshot, Store};
use crate::subscriber::Subscriber;
use crate::value::{Func, Value};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// One-shot callback run after the next flush with its key list.
pub type Callback = Box<dyn FnOnce(&Keys)>;

/// Persistent listener called for every key entering the frame. A returned
/// callback is queued to run once the batch resolves.
pub type Follower = Rc<dyn Fn(&str, &Controller) -> Option<Callback>>;

/// Assigns a property.
pub type Setter = Rc<dyn Fn(Value) -> Result<()>>;

/// Change handler of a managed property, invoked before the write.
///
/// `Some(true)` emits an update without storing, `Some(false)` suppresses
/// the write, `None` stores and emits normally.
pub type OnChange = Rc<dyn Fn(&Controller, &Value) -> Option<bool>>;

/// Read hook of an accessor property. Receives the subscriber performing
/// the read, if any.
pub type Getter = Rc<dyn Fn(&Controller, Option<&Subscriber>) -> Result<Value>>;

/// How a key of the subject is read and written.
#[derive(Clone)]
pub enum Property {
    /// Untracked plain value. Mirrored into the store when the key is there.
    Value(Value),
    /// Tracked value backed by the store.
    Managed(Option<OnChange>),
    /// Getter-backed value maintained by the computed-value engine.
    Computed,
    /// Custom read and write hooks.
    Accessor { get: Getter, set: Option<Setter> },
    /// Untracked callable.
    Method(Func),
    /// Opaque object installed by an instruction, such as an action.
    Extension(Rc<dyn Any>),
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Managed(handler) => f
                .debug_tuple("Managed")
                .field(&handler.is_some())
                .finish(),
            Self::Computed => f.write_str("Computed"),
            Self::Accessor { set, .. } => f
                .debug_struct("Accessor")
                .field("settable", &set.is_some())
                .finish(),
            Self::Method(_) => f.write_str("Method"),
            Self::Extension(_) => f.write_str("Extension"),
        }
    }
}

/// Anything that exposes its controller.
pub trait Stateful {
    fn control(&self) -> &Controller;
}

/// Keyed read and write, implemented by controllers, subscribers and
/// models. Reads through a subscriber record a dependency.
pub trait Access {
    fn get(&self, key: &str) -> Result<Value>;
    fn set(&self, key: &str, value: Value) -> Result<()>;
}

pub(crate) struct ControlInner {
    id: u64,
    name: Rc<str>,
    config: Config,
    started: Cell<bool>,
    ready: Cell<bool>,
    destroyed: Cell<bool>,
    subject: RefCell<IndexMap<String, Property>>,
    state: RefCell<Store>,
    frame: RefCell<IndexSet<String>>,
    waiting: RefCell<Vec<Callback>>,
    followers: RefCell<Vec<(u64, Follower)>>,
    next_follower: Cell<u64>,
    registry: RefCell<Registry>,
    pub(crate) computed: RefCell<ComputeTable>,
    parent: RefCell<Weak<ControlInner>>,
    last_update: RefCell<Option<Keys>>,
    on_ready: RefCell<Vec<Box<dyn FnOnce(&Controller)>>>,
}

/// Shared handle to one model instance's controller.
#[derive(Clone)]
pub struct Controller {
    pub(crate) inner: Rc<ControlInner>,
}

/// Non-owning controller handle.
#[derive(Clone, Default)]
pub struct WeakController {
    inner: Weak<ControlInner>,
}

impl WeakController {
    #[must_use]
    pub fn upgrade(&self) -> Option<Controller> {
        self.inner.upgrade().map(|inner| Controller { inner })
    }
}

impl fmt::Debug for WeakController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakController")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl Controller {
    /// Build a controller over declared fields. Instruction fields are
    /// registered and replaced by their placeholder token until `start`.
    pub fn new<K: Into<String>>(
        name: impl Into<Rc<str>>,
        fields: impl IntoIterator<Item = (K, Field)>,
        config: Config,
    ) -> Self {
        let mut registry = Registry::new();
        let subject = fields
            .into_iter()
            .map(|(key, field)| {
                let value = match field {
                    Field::Value(value) => value,
                    Field::Instruction(instruction) => {
                        Value::Symbol(registry.register(instruction))
                    }
                };
                (key.into(), Property::Value(value))
            })
            .collect();

        Self {
            inner: Rc::new(ControlInner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                config,
                started: Cell::new(false),
                ready: Cell::new(false),
                destroyed: Cell::new(false),
                subject: RefCell::new(subject),
                state: RefCell::new(Store::new()),
                frame: RefCell::new(IndexSet::new()),
                waiting: RefCell::new(Vec::new()),
                followers: RefCell::new(Vec::new()),
                next_follower: Cell::new(0),
                registry: RefCell::new(registry),
                computed: RefCell::new(ComputeTable::default()),
                parent: RefCell::new(Weak::new()),
                last_update: RefCell::new(None),
                on_ready: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Controller of `subject`, started if it was not yet.
    pub fn of<S: Stateful + ?Sized>(subject: &S) -> Result<Self> {
        let control = subject.control().clone();
        control.start()?;
        Ok(control)
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    // -----------------------------------------------------------------
    // Setup
    // -----------------------------------------------------------------

    /// Scan the declared fields once: consume instruction placeholders, keep
    /// methods as methods and manage everything else as tracked state. Then
    /// run the initial flush and mark the controller ready.
    ///
    /// Calling `start` again is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.inner.started.replace(true) {
            return Ok(());
        }

        let declared: Vec<(String, Value)> = self
            .inner
            .subject
            .borrow()
            .iter()
            .filter_map(|(key, property)| match property {
                Property::Value(value) => Some((key.clone(), value.clone())),
                _ => None,
            })
            .collect();

        for (key, value) in declared {
            match value {
                Value::Symbol(token) => {
                    let instruction = self.inner.registry.borrow_mut().consume(token);
                    match instruction {
                        Some(instruction) => self.install(&key, &instruction)?,
                        None => self.manage(&key, Value::Symbol(token), None),
                    }
                }
                Value::Func(func) if !is_capitalized(&key) => {
                    self.inner
                        .subject
                        .borrow_mut()
                        .insert(key, Property::Method(func));
                }
                other => self.manage(&key, other, None),
            }
        }

        self.flush();
        self.inner.ready.set(true);

        let callbacks = std::mem::take(&mut *self.inner.on_ready.borrow_mut());
        for callback in callbacks {
            callback(self);
        }
        Ok(())
    }

    fn install(&self, key: &str, instruction: &Instruction) -> Result<()> {
        trace!(
            model = %self.inner.name,
            key,
            instruction = instruction.label(),
            "consume placeholder"
        );
        self.inner
            .subject
            .borrow_mut()
            .insert(key.to_owned(), Property::Value(Value::Undefined));

        match instruction.run(key, self)? {
            None => {}
            Some(Install::Property(property)) => {
                self.inner
                    .subject
                    .borrow_mut()
                    .insert(key.to_owned(), property);
            }
            Some(Install::Getter(get)) => {
                {
                    let mut state = self.inner.state.borrow_mut();
                    if !state.contains(key) {
                        state.insert(key, Value::Undefined);
                    }
                }
                let set = self.setter(key, None);
                self.inner.subject.borrow_mut().insert(
                    key.to_owned(),
                    Property::Accessor {
                        get,
                        set: Some(set),
                    },
                );
            }
        }
        Ok(())
    }

    /// Track `key` in the store with an initial value.
    pub fn manage(&self, key: &str, initial: Value, on_change: Option<OnChange>) {
        self.inner.state.borrow_mut().insert(key, initial);
        self.inner
            .subject
            .borrow_mut()
            .insert(key.to_owned(), Property::Managed(on_change));
    }

    /// Install an arbitrary property, optionally seeding the store.
    pub fn define(&self, key: &str, property: Property, initial: Option<Value>) {
        if let Some(initial) = initial {
            self.inner.state.borrow_mut().insert(key, initial);
        }
        self.inner
            .subject
            .borrow_mut()
            .insert(key.to_owned(), property);
    }

    /// Diffing setter for `key`.
    pub fn setter(&self, key: &str, handler: Option<OnChange>) -> Setter {
        let weak = self.downgrade();
        let key: Rc<str> = key.into();
        Rc::new(move |value| {
            let control = weak.upgrade().ok_or(Error::Detached)?;
            control.assign(&key, value, handler.as_ref());
            Ok(())
        })
    }

    fn assign(&self, key: &str, value: Value, handler: Option<&OnChange>) {
        if self.inner.state.borrow().get(key) == Some(&value) {
            return;
        }
        match handler.and_then(|handler| handler(self, &value)) {
            Some(true) => self.update(key, None),
            Some(false) => {}
            None => self.update(key, Some(value)),
        }
    }

    // -----------------------------------------------------------------
    // Reads and writes
    // -----------------------------------------------------------------

    /// Read `key`, recording the read on `local` when given.
    pub fn read(&self, key: &str, local: Option<&Subscriber>) -> Result<Value> {
        let property = self.inner.subject.borrow().get(key).cloned();
        match property {
            None => Err(Error::unknown(&self.inner.name, key)),
            Some(Property::Value(value)) => Ok(value),
            Some(Property::Computed) => compute::read(self, key, local),
            Some(Property::Accessor { get, .. }) => get(self, local),
            Some(Property::Method(func)) => Ok(Value::Func(func)),
            Some(Property::Managed(_) | Property::Extension(_)) => {
                Ok(self.peek(key).unwrap_or_default())
            }
        }
    }

    /// Current stored value, without materializing computed properties.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<Value> {
        self.inner.state.borrow().get(key).cloned()
    }

    /// Write `key` the way assignment on the model would.
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        let property = self.inner.subject.borrow().get(key).cloned();
        match property {
            None => Err(Error::unknown(&self.inner.name, key)),
            Some(Property::Managed(handler)) => {
                self.assign(key, value, handler.as_ref());
                Ok(())
            }
            Some(Property::Accessor { set: Some(set), .. }) => set(value),
            Some(Property::Value(_)) => {
                {
                    let mut state = self.inner.state.borrow_mut();
                    if state.contains(key) {
                        state.insert(key, value.clone());
                    }
                }
                self.inner
                    .subject
                    .borrow_mut()
                    .insert(key.to_owned(), Property::Value(value));
                Ok(())
            }
            Some(Property::Computed) => compute::assign(self, key, value),
            Some(_) => Err(Error::read_only(&self.inner.name, key)),
        }
    }

    pub(crate) fn store_value(&self, key: &str, value: Value) {
        self.inner.state.borrow_mut().insert(key, value);
    }

    pub(crate) fn forget(&self, key: &str) {
        self.inner.state.borrow_mut().remove(key);
    }

    pub(crate) fn replace_property(&self, key: &str, property: Property) {
        self.inner
            .subject
            .borrow_mut()
            .insert(key.to_owned(), property);
    }

    /// Invoke a method or a callable property with this controller as
    /// receiver.
    pub fn call(&self, key: &str, args: &[Value]) -> Result<Value> {
        match self.read(key, None)? {
            Value::Func(func) => func.call(self, args),
            _ => Err(Error::not_callable(&self.inner.name, key)),
        }
    }

    /// Typed extension installed under `key`, if any.
    #[must_use]
    pub fn extension<T: Any>(&self, key: &str) -> Option<Rc<T>> {
        match self.inner.subject.borrow().get(key) {
            Some(Property::Extension(ext)) => Rc::clone(ext).downcast::<T>().ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn property(&self, key: &str) -> Option<Property> {
        self.inner.subject.borrow().get(key).cloned()
    }

    #[must_use]
    pub fn is_settable(&self, key: &str) -> bool {
        match self.inner.subject.borrow().get(key) {
            Some(Property::Value(_) | Property::Managed(_)) => true,
            Some(Property::Accessor { set, .. }) => set.is_some(),
            Some(Property::Computed) => compute::has_setter(self, key),
            _ => false,
        }
    }

    // -----------------------------------------------------------------
    // Update cycle
    // -----------------------------------------------------------------

    /// Record `key` as changed, storing `value` first when given.
    ///
    /// Storing bypasses diffing; use [`Controller::set`] for diffed writes.
    pub fn update(&self, key: &str, value: Option<Value>) {
        if let Some(value) = value {
            self.inner.state.borrow_mut().insert(key, value);
        }

        let schedule = {
            let mut frame = self.inner.frame.borrow_mut();
            if frame.contains(key) {
                return;
            }
            let was_empty = frame.is_empty();
            frame.insert(key.to_owned());
            was_empty
        };
        if schedule {
            self.schedule_flush();
        }
        trace!(model = %self.inner.name, key, "update");

        let followers: Vec<Follower> = self
            .inner
            .followers
            .borrow()
            .iter()
            .map(|(_, follower)| Rc::clone(follower))
            .collect();

        for follower in followers {
            match catch_unwind(AssertUnwindSafe(|| follower(key, self))) {
                Ok(Some(callback)) => self.inner.waiting.borrow_mut().push(callback),
                Ok(None) => {}
                Err(panic) => error!(
                    model = %self.inner.name,
                    key,
                    panic = panic_message(panic.as_ref()),
                    "listener panicked during update"
                ),
            }
        }
    }

    fn schedule_flush(&self) {
        let weak = self.downgrade();
        self.inner.config.scheduler.defer(Box::new(move || {
            if let Some(control) = weak.upgrade()
                && control.is_pending()
            {
                control.flush();
            }
        }));
    }

    fn flush(&self) {
        compute::flush(self);

        let keys: Keys = self.inner.frame.borrow_mut().drain(..).collect();
        let waiting = std::mem::take(&mut *self.inner.waiting.borrow_mut());
        *self.inner.last_update.borrow_mut() = Some(Rc::clone(&keys));

        if self.inner.config.trace_flushes {
            debug!(model = %self.inner.name, keys = ?keys, "flush");
        }

        for callback in waiting {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(&keys))) {
                error!(
                    model = %self.inner.name,
                    panic = panic_message(panic.as_ref()),
                    "update callback panicked"
                );
            }
        }
    }

    /// Register a follower. The returned handle removes it; removal is
    /// idempotent and safe from inside a notification.
    pub fn add_listener(
        &self,
        follower: impl Fn(&str, &Controller) -> Option<Callback> + 'static,
    ) -> Release {
        let id = self.inner.next_follower.get();
        self.inner.next_follower.set(id + 1);
        self.inner
            .followers
            .borrow_mut()
            .push((id, Rc::new(follower)));

        let weak = self.downgrade();
        Release::new(move || {
            if let Some(control) = weak.upgrade() {
                control
                    .inner
                    .followers
                    .borrow_mut()
                    .retain(|(other, _)| *other != id);
            }
        })
    }

    /// Number of registered followers.
    #[must_use]
    pub fn follower_count(&self) -> usize {
        self.inner.followers.borrow().len()
    }

    /// Queue a callback for the end of the current batch.
    pub fn enqueue(&self, callback: Callback) {
        self.inner.waiting.borrow_mut().push(callback);
    }

    /// Resolves with the keys of the pending flush, or `None` right away
    /// when nothing is pending.
    pub fn request_update(&self) -> UpdateRequest {
        if !self.is_pending() {
            return UpdateRequest::settled(None);
        }
        let (tx, request) = UpdateRequest::channel();
        self.enqueue(Box::new(move |keys| {
            let _ = tx.send(Rc::clone(keys));
        }));
        request
    }

    /// Like [`Controller::request_update`], but fails unless the pending
    /// state equals `expect`.
    pub fn request_update_strict(&self, expect: bool) -> Result<UpdateRequest> {
        if self.is_pending() != expect {
            return Err(Error::StrictUpdate { expected: expect });
        }
        Ok(self.request_update())
    }

    /// Run `callback` once the controller is ready; immediately if it is.
    pub fn on_ready(&self, callback: impl FnOnce(&Controller) + 'static) {
        if self.inner.ready.get() {
            callback(self);
        } else {
            self.inner.on_ready.borrow_mut().push(Box::new(callback));
        }
    }

    // -----------------------------------------------------------------
    // Lifecycle and introspection
    // -----------------------------------------------------------------

    /// Release computed subscribers and followers, destroy owned children
    /// and mark the controller inert. Callbacks already waiting on the
    /// current batch still run when it flushes.
    pub fn destroy(&self) {
        if self.inner.destroyed.replace(true) {
            return;
        }
        debug!(model = %self.inner.name, id = self.inner.id, "destroy");

        let children: Vec<Controller> = self
            .inner
            .state
            .borrow()
            .snapshot(None)
            .into_values()
            .filter_map(|value| match value {
                Value::Model(child) => Some(child),
                _ => None,
            })
            .filter(|child| child.parent().is_some_and(|parent| parent.ptr_eq(self)))
            .collect();
        for child in children {
            child.destroy();
        }

        compute::release_all(self);
        self.inner.followers.borrow_mut().clear();
    }

    /// Whether a flush is scheduled.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        !self.inner.frame.borrow().is_empty()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.ready.get()
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.get()
    }

    pub(crate) fn in_frame(&self, key: &str) -> bool {
        self.inner.frame.borrow().contains(key)
    }

    /// Keys of the most recent flush.
    #[must_use]
    pub fn last_update(&self) -> Option<Keys> {
        self.inner.last_update.borrow().clone()
    }

    /// Every declared key, in declaration order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.inner.subject.borrow().keys().cloned().collect()
    }

    /// Keys currently held in the store.
    #[must_use]
    pub fn state_keys(&self) -> Vec<String> {
        self.inner.state.borrow().keys().map(str::to_owned).collect()
    }

    /// Store keys plus computed keys not yet materialized.
    #[must_use]
    pub fn tracked_keys(&self) -> Vec<String> {
        let mut keys = self.state_keys();
        for key in compute::keys(self) {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    /// Snapshot of the store, or of `subset`.
    #[must_use]
    pub fn export(&self, subset: Option<&[&str]>) -> Snapshot {
        self.inner.state.borrow().snapshot(subset)
    }

    pub fn set_parent(&self, parent: &Controller) {
        *self.inner.parent.borrow_mut() = Rc::downgrade(&parent.inner);
    }

    #[must_use]
    pub fn parent(&self) -> Option<Controller> {
        self.inner
            .parent
            .borrow()
            .upgrade()
            .map(|inner| Controller { inner })
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakController {
        WeakController {
            inner: Rc::downgrade(&self.inner),
        }
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Controller) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Stateful for Controller {
    fn control(&self) -> &Controller {
        self
    }
}

impl Access for Controller {
    fn get(&self, key: &str) -> Result<Value> {
        self.read(key, None)
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        Controller::set(self, key, value)
    }
}

impl fmt::Display for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.name)
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.inner.name)
            .field("id", &self.inner.id)
            .field("ready", &self.inner.ready.get())
            .field("pending", &self.is_pending())
            .finish_non_exhaustive()
    }
}

fn is_capitalized(key: &str) -> bool {
    key.chars().next().is_some_and(char::is_uppercase)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}
