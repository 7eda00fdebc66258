#![forbid(unsafe_code)]

//! Dynamic property values.
//!
//! Model properties are keyed by name and hold a [`Value`]. Equality decides
//! whether a write is a change:
//!
//! - Scalars compare by value. `Int` and `Float` compare numerically, so
//!   writing `1.0` over `1` is a no-op.
//! - `List` and `Map` are owned values and compare by contents. Replacing a
//!   list with an equal copy emits nothing; use [`Controller::update`] to
//!   force an emit after changing a collection in place.
//! - Callables ([`Func`]), [`Handle`]s and nested models compare by
//!   identity, so
//!   assigning the same nested model twice is a no-op write but assigning an
//!   equal-looking copy is not.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::controller::Controller;
use crate::error::{Error, Result};
use crate::instruction::Token;

/// A callable stored on a model: plain methods and capitalized factories.
#[derive(Clone)]
pub struct Func(Rc<dyn Fn(&Controller, &[Value]) -> Result<Value>>);

impl Func {
    pub fn new(f: impl Fn(&Controller, &[Value]) -> Result<Value> + 'static) -> Self {
        Self(Rc::new(f))
    }

    /// Invoke with the owning controller as receiver.
    pub fn call(&self, on: &Controller, args: &[Value]) -> Result<Value> {
        (self.0)(on, args)
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Func(..)")
    }
}

/// Opaque shared object handed out by a property, such as a collection view
/// bound to one subscriber.
#[derive(Clone)]
pub struct Handle(Rc<dyn Any>);

impl Handle {
    pub fn new<T: Any>(object: T) -> Self {
        Self(Rc::new(object))
    }

    #[must_use]
    pub fn downcast<T: Any>(&self) -> Option<Rc<T>> {
        Rc::clone(&self.0).downcast::<T>().ok()
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Handle(..)")
    }
}

/// A property value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(IndexMap<String, Value>),
    /// Opaque unique token. Registered tokens are instruction placeholders.
    Symbol(Token),
    Func(Func),
    Handle(Handle),
    /// Nested model instance.
    Model(Controller),
}

impl Value {
    /// Short name of the variant, used in conversion errors.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Symbol(_) => "symbol",
            Self::Func(_) => "function",
            Self::Handle(_) => "handle",
            Self::Model(_) => "model",
        }
    }

    #[must_use]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric view; integers widen to `f64`.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(n) => Some(*n as f64),
            Self::Float(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_model(&self) -> Option<&Controller> {
        match self {
            Self::Model(c) => Some(c),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_func(&self) -> Option<&Func> {
        match self {
            Self::Func(f) => Some(f),
            _ => None,
        }
    }

    fn mismatch(&self, expected: &'static str) -> Error {
        Error::Type {
            expected,
            found: self.type_name(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Int(a), Self::Float(b)) | (Self::Float(b), Self::Int(a)) => int_eq_float(*a, *b),
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Symbol(a), Self::Symbol(b)) => a == b,
            (Self::Func(a), Self::Func(b)) => a.ptr_eq(b),
            (Self::Handle(a), Self::Handle(b)) => a.ptr_eq(b),
            (Self::Model(a), Self::Model(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

// Exact comparison: floats outside the i64 range or with a fraction never
// equal an integer, and no precision is lost on large integers.
fn int_eq_float(int: i64, float: f64) -> bool {
    float.fract() == 0.0
        && float >= i64::MIN as f64
        && float < i64::MAX as f64
        && float as i64 == int
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("Undefined"),
            Self::Null => f.write_str("Null"),
            Self::Bool(b) => write!(f, "Bool({b})"),
            Self::Int(n) => write!(f, "Int({n})"),
            Self::Float(n) => write!(f, "Float({n})"),
            Self::Str(s) => write!(f, "Str({s:?})"),
            Self::List(items) => f.debug_list().entries(items).finish(),
            Self::Map(map) => f.debug_map().entries(map).finish(),
            Self::Symbol(token) => write!(f, "Symbol({})", token.raw()),
            Self::Func(func) => fmt::Debug::fmt(func, f),
            Self::Handle(handle) => fmt::Debug::fmt(handle, f),
            Self::Model(on) => write!(f, "Model({}#{})", on.name(), on.id()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Int(i64::from(n))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Self::Int(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Float(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<Func> for Value {
    fn from(f: Func) -> Self {
        Self::Func(f)
    }
}

impl From<Handle> for Value {
    fn from(handle: Handle) -> Self {
        Self::Handle(handle)
    }
}

impl From<Controller> for Value {
    fn from(on: Controller) -> Self {
        Self::Model(on)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl TryFrom<Value> for bool {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        value.as_bool().ok_or_else(|| value.mismatch("bool"))
    }
}

impl TryFrom<Value> for i64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        value.as_i64().ok_or_else(|| value.mismatch("int"))
    }
}

impl TryFrom<Value> for f64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        value.as_f64().ok_or_else(|| value.mismatch("float"))
    }
}

impl TryFrom<Value> for String {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Str(s) => Ok(s),
            other => Err(other.mismatch("string")),
        }
    }
}

#[cfg(feature = "json")]
impl Value {
    /// Convert to JSON. Tokens, callables and handles have no JSON form and yield
    /// `None`; nested models serialize as their exported state.
    #[must_use]
    pub fn to_json(&self) -> Option<serde_json::Value> {
        use serde_json::Value as Json;

        Some(match self {
            Self::Undefined | Self::Symbol(_) | Self::Func(_) | Self::Handle(_) => return None,
            Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Int(n) => Json::from(*n),
            Self::Float(n) => serde_json::Number::from_f64(*n).map_or(Json::Null, Json::Number),
            Self::Str(s) => Json::String(s.clone()),
            Self::List(items) => Json::Array(
                items
                    .iter()
                    .map(|item| item.to_json().unwrap_or(Json::Null))
                    .collect(),
            ),
            Self::Map(map) => Json::Object(
                map.iter()
                    .filter_map(|(k, v)| Some((k.clone(), v.to_json()?)))
                    .collect(),
            ),
            Self::Model(on) => Json::Object(
                on.export(None)
                    .iter()
                    .filter_map(|(k, v)| Some((k.clone(), v.to_json()?)))
                    .collect(),
            ),
        })
    }

    #[must_use]
    pub fn from_json(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;

        match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(b),
            Json::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float))
                .unwrap_or(Self::Null),
            Json::String(s) => Self::Str(s),
            Json::Array(items) => Self::List(items.into_iter().map(Self::from_json).collect()),
            Json::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_compare_by_value() {
        assert_eq!(Value::from(3), Value::Int(3));
        assert_eq!(Value::from("a"), Value::Str("a".into()));
        assert_eq!(Value::Undefined, Value::default());
        assert_ne!(Value::Undefined, Value::Null);
    }

    #[test]
    fn numbers_compare_across_variants() {
        assert_eq!(Value::Int(1), Value::Float(1.0));
        assert_eq!(Value::Float(-3.0), Value::Int(-3));
        assert_ne!(Value::Int(1), Value::Float(1.5));
        assert_ne!(Value::Int(0), Value::Float(f64::NAN));
        assert_ne!(Value::Int(i64::MAX), Value::Float(i64::MAX as f64));
        assert_ne!(Value::Int(1), Value::Bool(true));
    }

    #[test]
    fn containers_compare_by_contents() {
        assert_eq!(Value::from(vec![1, 2]), Value::from(vec![1, 2]));
        assert_eq!(
            Value::List(vec![Value::Int(1)]),
            Value::List(vec![Value::Float(1.0)])
        );
        assert_ne!(Value::from(vec![1, 2]), Value::from(vec![2, 1]));
    }

    #[test]
    fn funcs_compare_by_identity() {
        let a = Func::new(|_, _| Ok(Value::Null));
        let b = Func::new(|_, _| Ok(Value::Null));
        assert_eq!(Value::Func(a.clone()), Value::Func(a));
        assert_ne!(
            Value::Func(b.clone()),
            Value::Func(Func::new(|_, _| Ok(Value::Null)))
        );
    }

    #[test]
    fn handles_compare_by_identity_and_downcast() {
        let handle = Handle::new(5_u8);
        assert_eq!(Value::from(handle.clone()), Value::Handle(handle.clone()));
        assert_ne!(Value::Handle(handle.clone()), Value::Handle(Handle::new(5_u8)));
        assert_eq!(handle.downcast::<u8>().as_deref(), Some(&5));
        assert!(handle.downcast::<String>().is_none());
        assert_eq!(Value::Handle(handle).type_name(), "handle");
    }

    #[test]
    fn conversions_report_mismatch() {
        assert_eq!(i64::try_from(Value::Int(7)), Ok(7));
        assert_eq!(f64::try_from(Value::Int(2)), Ok(2.0));
        assert_eq!(
            i64::try_from(Value::Str("x".into())),
            Err(Error::Type {
                expected: "int",
                found: "string"
            })
        );
        assert_eq!(String::try_from(Value::from("hi")), Ok("hi".to_owned()));
    }

    #[test]
    fn option_and_vec_conversions() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some(2)), Value::Int(2));
        assert_eq!(
            Value::from(vec![1, 2]),
            Value::List(vec![Value::Int(1), Value::Int(2)])
        );
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_conversion_keeps_plain_data() {
        let json = serde_json::json!({ "a": 1, "b": [true, "x"], "c": null });
        let value = Value::from_json(json.clone());
        assert_eq!(value.to_json(), Some(json));
        assert_eq!(Value::Undefined.to_json(), None);
    }
}
