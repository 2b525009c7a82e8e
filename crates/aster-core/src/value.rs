//! Runtime values exchanged between the evaluator and the workflow runtime.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A runtime value. The workflow runtime treats values as opaque; only the
/// evaluator and builtins look inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// The unit value.
    Unit,

    /// Machine integer.
    Int(i64),

    /// UTF-8 string.
    Str(String),

    /// Boolean.
    Bool(bool),

    /// Ordered list.
    List(Vec<Value>),

    /// Record with string keys, ordered for stable serialization.
    Record(BTreeMap<String, Value>),
}

impl Value {
    /// Returns the string payload, if this is a `Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer payload, if this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns true for the unit value.
    pub fn is_unit(&self) -> bool {
        matches!(self, Value::Unit)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => write!(f, "()"),
            Value::Int(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{}", s),
            Value::Bool(b) => write!(f, "{}", b),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Record(fields) => {
                write!(f, "{{")?;
                for (i, (key, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Evaluator control flow. `return` unwinds blocks as an explicit variant of
/// the evaluator's result type rather than as a host exception.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlFlow {
    /// Evaluation continues; the block produced a value.
    Continue(Value),

    /// A `Return` statement fired; the enclosing function yields the value.
    Return(Value),
}

impl ControlFlow {
    /// Collapses control flow into the value it carries.
    pub fn into_value(self) -> Value {
        match self {
            ControlFlow::Continue(value) | ControlFlow::Return(value) => value,
        }
    }

    /// Returns true if a `Return` fired.
    pub fn is_return(&self) -> bool {
        matches!(self, ControlFlow::Return(_))
    }
}
