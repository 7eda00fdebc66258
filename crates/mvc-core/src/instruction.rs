#![forbid(unsafe_code)]

//! Declarative property initializers.
//!
//! A model field may be declared as an [`Instruction`] instead of a plain
//! value. When a controller is built it registers each instruction in its own
//! [`Registry`] under a fresh [`Token`] and stores the token as the field's
//! initial value. `Controller::start` later finds the token, consumes the
//! registry entry and runs the setup, which installs the real behavior for
//! that key.
//!
//! # Invariants
//!
//! 1. Tokens are unique for the life of the process.
//! 2. A registry entry is consumed at most once; a second `consume` of the
//!    same token returns `None`.
//! 3. Consuming an unknown token is not an error. The caller treats the
//!    value as ordinary data.

use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;

use crate::controller::{Controller, Getter, Property};
use crate::error::Result;
use crate::value::{Func, Value};

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Opaque unique token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u64);

impl Token {
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// What a setup function asks the controller to install for its key.
pub enum Install {
    /// Install this property as-is.
    Property(Property),
    /// Wrap the getter as a tracked accessor. Writes go through the
    /// controller's default diffing setter.
    Getter(Getter),
}

impl fmt::Debug for Install {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Property(property) => f.debug_tuple("Property").field(property).finish(),
            Self::Getter(_) => f.write_str("Getter(..)"),
        }
    }
}

/// Setup run once per key during `Controller::start`.
///
/// Returning `Ok(None)` means the setup installed everything itself.
pub type Setup = Rc<dyn Fn(&str, &Controller) -> Result<Option<Install>>>;

/// A pending instruction: a labelled setup function.
#[derive(Clone)]
pub struct Instruction {
    label: &'static str,
    setup: Setup,
}

impl Instruction {
    pub fn new(
        label: &'static str,
        setup: impl Fn(&str, &Controller) -> Result<Option<Install>> + 'static,
    ) -> Self {
        Self {
            label,
            setup: Rc::new(setup),
        }
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn run(&self, key: &str, on: &Controller) -> Result<Option<Install>> {
        (self.setup)(key, on)
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Instruction({})", self.label)
    }
}

/// Per-controller table of placeholders awaiting consumption.
#[derive(Debug, Default)]
pub struct Registry {
    pending: AHashMap<Token, Instruction>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, instruction: Instruction) -> Token {
        let token = Token::next();
        self.pending.insert(token, instruction);
        token
    }

    /// Remove and return the setup for `token`, once.
    pub fn consume(&mut self, token: Token) -> Option<Instruction> {
        self.pending.remove(&token)
    }

    #[must_use]
    pub fn contains(&self, token: Token) -> bool {
        self.pending.contains_key(&token)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// A model field declaration: plain initial value or instruction.
#[derive(Debug, Clone)]
pub enum Field {
    Value(Value),
    Instruction(Instruction),
}

impl From<Instruction> for Field {
    fn from(instruction: Instruction) -> Self {
        Self::Instruction(instruction)
    }
}

macro_rules! field_from_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Field {
                fn from(value: $ty) -> Self {
                    Self::Value(Value::from(value))
                }
            }
        )*
    };
}

field_from_value!(bool, i32, i64, u32, f64, &str, String, Func, Controller);

impl From<Value> for Field {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Instruction {
        Instruction::new("noop", |_, _| Ok(None))
    }

    #[test]
    fn tokens_are_unique() {
        let a = Token::next();
        let b = Token::next();
        assert_ne!(a, b);
        assert!(b.raw() > a.raw());
    }

    #[test]
    fn consume_is_single_use() {
        let mut registry = Registry::new();
        let token = registry.register(noop());

        assert!(registry.contains(token));
        assert_eq!(registry.consume(token).map(|i| i.label()), Some("noop"));
        assert!(registry.consume(token).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn unknown_token_is_not_found() {
        let mut registry = Registry::new();
        registry.register(noop());
        assert!(registry.consume(Token::next()).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn fields_convert_from_values() {
        assert!(matches!(Field::from(3), Field::Value(Value::Int(3))));
        assert!(matches!(Field::from(noop()), Field::Instruction(_)));
    }
}
