#![forbid(unsafe_code)]

//! Model definitions and instance handles.
//!
//! A [`ModelType`] is the declaration: an ordered list of fields (plain
//! values, methods and instructions) plus the configuration every instance
//! gets. [`ModelType::create`] builds a [`Model`], a cheap cloneable handle
//! over the instance's controller.

use std::cell::{Cell, OnceCell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use mvc_core::compute;
use mvc_core::{
    Access, Callback, Config, Controller, Error, Field, Func, Keys, Property, Release, Result,
    Snapshot, Stateful, Subscriber, UpdateRequest, Value, WeakController, WeakSubscriber,
};

use crate::instruction::act::Action;
use crate::instruction::reference::Ref;

/// Teardown returned by an effect run, called before the next run and on
/// release.
pub type Cleanup = Box<dyn FnOnce()>;

const DID_CREATE: &str = "did_create";
const WILL_DESTROY: &str = "will_destroy";

// ---------------------------------------------------------------------------
// ModelType
// ---------------------------------------------------------------------------

/// Declaration of a model: named, ordered fields and shared configuration.
#[derive(Clone)]
pub struct ModelType {
    name: Rc<str>,
    fields: Vec<(String, Field)>,
    config: Config,
}

impl ModelType {
    pub fn new(name: impl Into<Rc<str>>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            config: Config::default(),
        }
    }

    /// Declare a field. Redeclaring a key replaces it in place.
    #[must_use]
    pub fn field(mut self, key: impl Into<String>, field: impl Into<Field>) -> Self {
        let key = key.into();
        let field = field.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = field,
            None => self.fields.push((key, field)),
        }
        self
    }

    /// Declare a method. Lowercase names stay untracked; capitalized names
    /// are treated as factories and tracked like data.
    #[must_use]
    pub fn method(
        self,
        key: impl Into<String>,
        method: impl Fn(&Model, &[Value]) -> Result<Value> + 'static,
    ) -> Self {
        let func = Func::new(move |control, args| method(&Model::from_control(control.clone()), args));
        self.field(key, func)
    }

    /// Hook run once the instance is ready.
    #[must_use]
    pub fn did_create(self, hook: impl Fn(&Model) + 'static) -> Self {
        self.method(DID_CREATE, move |model, _| {
            hook(model);
            Ok(Value::Undefined)
        })
    }

    /// Hook run when the instance is destroyed.
    #[must_use]
    pub fn will_destroy(self, hook: impl Fn(&Model) + 'static) -> Self {
        self.method(WILL_DESTROY, move |model, _| {
            hook(model);
            Ok(Value::Undefined)
        })
    }

    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared keys, in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(key, _)| key.as_str())
    }

    pub fn create(&self) -> Result<Model> {
        self.build(&Snapshot::new(), None)
    }

    /// Create with some fields replaced by plain values.
    pub fn create_with(&self, overrides: &Snapshot) -> Result<Model> {
        self.build(overrides, None)
    }

    pub(crate) fn build(&self, overrides: &Snapshot, parent: Option<&Controller>) -> Result<Model> {
        let fields = self.fields.iter().map(|(key, field)| {
            let field = match overrides.get(key) {
                Some(value) => Field::Value(value.clone()),
                None => field.clone(),
            };
            (key.clone(), field)
        });
        let control = Controller::new(Rc::clone(&self.name), fields, self.config.clone());
        if let Some(parent) = parent {
            control.set_parent(parent);
        }
        control.start()?;

        let model = Model::from_control(control);
        if model.has_method(DID_CREATE) {
            model.call(DID_CREATE, &[])?;
        }
        Ok(model)
    }

    /// Whether `model` was created from a type with this name.
    #[must_use]
    pub fn is_type_of(&self, model: &Model) -> bool {
        model.name() == &*self.name
    }
}

impl fmt::Debug for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelType")
            .field("name", &self.name)
            .field("fields", &self.fields.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Handle to one model instance.
#[derive(Clone)]
pub struct Model {
    control: Controller,
}

impl Model {
    #[must_use]
    pub fn from_control(control: Controller) -> Self {
        Self { control }
    }

    #[must_use]
    pub fn control(&self) -> &Controller {
        &self.control
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.control.id()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.control.name()
    }

    fn has_method(&self, key: &str) -> bool {
        matches!(self.control.property(key), Some(Property::Method(_)))
    }

    // -- Reads -------------------------------------------------------------

    pub fn get(&self, key: &str) -> Result<Value> {
        self.control.read(key, None)
    }

    /// Read and convert.
    pub fn get_as<T>(&self, key: &str) -> Result<T>
    where
        T: TryFrom<Value, Error = Error>,
    {
        T::try_from(self.get(key)?)
    }

    /// Resolves with the value of `key` after its next update.
    pub fn next(&self, key: &str) -> impl Future<Output = Result<Value>> + 'static {
        let request = self.once(&[key]);
        let weak = self.control.downgrade();
        let key = key.to_owned();
        async move {
            request.await.ok_or(Error::Detached)?;
            let control = weak.upgrade().ok_or(Error::Detached)?;
            control.read(&key, None)
        }
    }

    /// Call `callback` with the new value each time `key` changes.
    pub fn watch(&self, key: &str, callback: impl Fn(&Value) + 'static) -> Release {
        self.on(&[key], move |value, _| callback(value))
    }

    // -- Writes ------------------------------------------------------------

    /// Assign one key. The request resolves with the batch it lands in, or
    /// `None` when the write changed nothing.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<UpdateRequest> {
        self.control.set(key, value.into())?;
        Ok(self.control.request_update())
    }

    /// Assign several keys in one batch.
    pub fn assign(&self, values: &Snapshot) -> Result<UpdateRequest> {
        for (key, value) in values {
            self.control.set(key, value.clone())?;
        }
        Ok(self.control.request_update())
    }

    /// Emit an update for `key` without changing it.
    pub fn touch(&self, key: &str) -> UpdateRequest {
        self.control.update(key, None);
        self.control.request_update()
    }

    // -- Listening ---------------------------------------------------------

    /// Call `callback(value, key)` after each batch, once per selected key
    /// that changed. An empty selection watches every tracked key.
    pub fn on(&self, keys: &[&str], callback: impl Fn(&Value, &str) + 'static) -> Release {
        let weak = self.control.downgrade();
        let select = self.select(keys);
        let filter = Rc::clone(&select);
        self.listen(
            select,
            false,
            Rc::new(move |batch: &Keys| {
                let Some(control) = weak.upgrade() else {
                    return;
                };
                for key in batch.iter().filter(|key| filter.contains(*key)) {
                    callback(&control.peek(key).unwrap_or_default(), key.as_str());
                }
            }),
        )
    }

    /// Call `callback` once per batch that touches any selected key.
    pub fn on_batch(&self, keys: &[&str], callback: impl Fn(&Keys) + 'static) -> Release {
        self.listen(self.select(keys), false, Rc::new(callback))
    }

    /// Resolves with the next batch touching any selected key. Dropping the
    /// request unregisters its listener.
    pub fn once(&self, keys: &[&str]) -> UpdateRequest {
        let (tx, request) = UpdateRequest::channel();
        let tx = RefCell::new(Some(tx));
        let release = self.listen(
            self.select(keys),
            true,
            Rc::new(move |batch: &Keys| {
                if let Some(tx) = tx.borrow_mut().take() {
                    let _ = tx.send(Rc::clone(batch));
                }
            }),
        );
        request.release_on_drop(release)
    }

    fn select(&self, keys: &[&str]) -> Rc<Vec<String>> {
        Rc::new(if keys.is_empty() {
            self.control.tracked_keys()
        } else {
            keys.iter().map(|key| (*key).to_owned()).collect()
        })
    }

    fn listen(&self, select: Rc<Vec<String>>, once: bool, callback: Rc<dyn Fn(&Keys)>) -> Release {
        compute::ensure(&self.control, &select);

        let queued = Rc::new(Cell::new(false));
        let slot: Rc<OnceCell<Release>> = Rc::new(OnceCell::new());
        let own = Rc::clone(&slot);

        let release = self.control.add_listener(move |key, _| {
            if queued.get() || !select.iter().any(|k| k == key) {
                return None;
            }
            queued.set(true);
            if once && let Some(release) = own.get() {
                release.release();
            }
            let queued = Rc::clone(&queued);
            let callback = Rc::clone(&callback);
            let deliver: Callback = Box::new(move |batch: &Keys| {
                queued.set(false);
                callback(batch);
            });
            Some(deliver)
        });
        let _ = slot.set(release.clone());
        release
    }

    // -- Effects -----------------------------------------------------------

    /// Run `effect` now, tracking what it reads, and again after every batch
    /// that changes one of those keys.
    pub fn effect(
        &self,
        effect: impl Fn(&dyn Access) -> Option<Cleanup> + 'static,
    ) -> Release {
        let runner = Rc::new(EffectRunner::new(effect));
        let slot: Rc<OnceCell<WeakSubscriber>> = Rc::new(OnceCell::new());
        let queued = Rc::new(Cell::new(false));

        let (rerun, own) = (Rc::clone(&runner), Rc::clone(&slot));
        let sub = Subscriber::new(&self.control, move |_, _| {
            if queued.replace(true) {
                return None;
            }
            let runner = Rc::clone(&rerun);
            let slot = Rc::clone(&own);
            let queued = Rc::clone(&queued);
            let deliver: Callback = Box::new(move |_: &Keys| {
                queued.set(false);
                if let Some(sub) = slot.get().and_then(WeakSubscriber::upgrade)
                    && !sub.is_released()
                {
                    runner.invoke(&sub);
                }
            });
            Some(deliver)
        });
        let _ = slot.set(sub.downgrade());

        runner.invoke(&sub);
        let release = sub.commit();
        Release::new(move || {
            release.release();
            runner.cleanup();
        })
    }

    /// Run `effect` now and after every batch touching the selected keys.
    pub fn effect_on(
        &self,
        keys: &[&str],
        effect: impl Fn(&dyn Access) -> Option<Cleanup> + 'static,
    ) -> Release {
        let runner = Rc::new(EffectRunner::new(effect));
        runner.invoke(self);

        let weak = self.control.downgrade();
        let rerun = Rc::clone(&runner);
        let release = self.on_batch(keys, move |_| {
            if let Some(control) = weak.upgrade() {
                rerun.invoke(&Model::from_control(control));
            }
        });
        Release::new(move || {
            release.release();
            runner.cleanup();
        })
    }

    // -- Batches and snapshots -----------------------------------------------

    /// Resolves with the pending batch, or `None` when nothing is pending.
    pub fn update(&self) -> UpdateRequest {
        self.control.request_update()
    }

    /// Like [`Model::update`], failing unless the pending state is `expect`.
    pub fn update_strict(&self, expect: bool) -> Result<UpdateRequest> {
        self.control.request_update_strict(expect)
    }

    #[must_use]
    pub fn last_update(&self) -> Option<Keys> {
        self.control.last_update()
    }

    /// Snapshot of every tracked value.
    #[must_use]
    pub fn export(&self) -> Snapshot {
        self.control.export(None)
    }

    #[must_use]
    pub fn export_only(&self, keys: &[&str]) -> Snapshot {
        self.control.export(Some(keys))
    }

    /// Assign every settable key present in `values`; other keys are
    /// skipped.
    pub fn import(&self, values: &Snapshot) -> Result<UpdateRequest> {
        let keys = self.control.keys();
        self.import_keys(values, keys.iter().map(String::as_str))
    }

    pub fn import_only(&self, values: &Snapshot, keys: &[&str]) -> Result<UpdateRequest> {
        self.import_keys(values, keys.iter().copied())
    }

    fn import_keys<'a>(
        &self,
        values: &Snapshot,
        keys: impl Iterator<Item = &'a str>,
    ) -> Result<UpdateRequest> {
        for key in keys {
            if let Some(value) = values.get(key)
                && self.control.is_settable(key)
            {
                self.control.set(key, value.clone())?;
            }
        }
        Ok(self.control.request_update())
    }

    // -- Methods and actions -------------------------------------------------

    pub fn call(&self, key: &str, args: &[Value]) -> Result<Value> {
        self.control.call(key, args)
    }

    /// Start the action under `key`. Fails immediately while a previous
    /// call of the same action is still pending.
    pub fn act(&self, key: &str, args: &[Value]) -> Result<LocalBoxFuture<'static, Result<Value>>> {
        let action = self
            .control
            .extension::<Action>(key)
            .ok_or_else(|| Error::NotCallable {
                model: self.name().to_owned(),
                key: key.to_owned(),
            })?;
        action.invoke(self, args)
    }

    /// Whether the action under `key` is running.
    #[must_use]
    pub fn is_active(&self, key: &str) -> bool {
        self.control
            .extension::<Action>(key)
            .is_some_and(|action| action.is_active())
    }

    #[must_use]
    pub fn reference(&self, key: &str) -> Option<Rc<Ref>> {
        self.control.extension::<Ref>(key)
    }

    // -- Lifecycle -----------------------------------------------------------

    /// Destroy owned children, emit `will_destroy`, run the hook and tear
    /// down the controller.
    pub fn destroy(&self) {
        if self.control.is_destroyed() {
            return;
        }
        let children = self.export().into_values().filter_map(|value| match value {
            Value::Model(child) if child.parent().is_some_and(|p| p.ptr_eq(&self.control)) => {
                Some(Model::from_control(child))
            }
            _ => None,
        });
        for child in children {
            child.destroy();
        }

        self.control.update(WILL_DESTROY, None);
        if self.has_method(WILL_DESTROY)
            && let Err(err) = self.call(WILL_DESTROY, &[])
        {
            tracing::error!(model = %self.name(), %err, "will_destroy hook failed");
        }
        self.control.destroy();
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakController {
        self.control.downgrade()
    }
}

impl Stateful for Model {
    fn control(&self) -> &Controller {
        &self.control
    }
}

impl Access for Model {
    fn get(&self, key: &str) -> Result<Value> {
        Model::get(self, key)
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.control.set(key, value)
    }
}

impl PartialEq for Model {
    fn eq(&self, other: &Self) -> bool {
        self.control.ptr_eq(&other.control)
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.control, f)
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Model").field(&self.control).finish()
    }
}

// ---------------------------------------------------------------------------
// Effects
// ---------------------------------------------------------------------------

struct EffectRunner {
    effect: Box<dyn Fn(&dyn Access) -> Option<Cleanup>>,
    cleanup: RefCell<Option<Cleanup>>,
}

impl EffectRunner {
    fn new(effect: impl Fn(&dyn Access) -> Option<Cleanup> + 'static) -> Self {
        Self {
            effect: Box::new(effect),
            cleanup: RefCell::new(None),
        }
    }

    fn invoke(&self, access: &dyn Access) {
        self.cleanup();
        let next = (self.effect)(access);
        *self.cleanup.borrow_mut() = next;
    }

    fn cleanup(&self) {
        let cleanup = self.cleanup.borrow_mut().take();
        if let Some(cleanup) = cleanup {
            cleanup();
        }
    }
}
