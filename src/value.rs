//! Values that flow between pipeline stages.
//!
//! Most stages exchange plain JSON data. Two extra shapes exist for the
//! `apply` and `bind` combinators: callables, and objects exposing
//! late-bound properties and methods.

use std::fmt;
use std::sync::Arc;

use crate::{Error, Result};

/// A value passed from one stage to the next.
#[derive(Clone)]
pub enum Value {
    /// Plain JSON data. HTTP response bodies arrive as `Data(String)`.
    Data(serde_json::Value),
    /// A sequence holding at least one non-data element.
    List(Vec<Value>),
    /// A function that `apply` can invoke.
    Callable(Callable),
    /// An object with late-bound properties and methods.
    Object(Arc<dyn Object>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Data(serde_json::Value::Null)
    }
}

impl Value {
    /// Build a sequence value, collapsing to a JSON array when every element is data.
    pub fn sequence(items: Vec<Value>) -> Self {
        if items.iter().all(|v| matches!(v, Value::Data(_))) {
            let data = items
                .into_iter()
                .map(|v| match v {
                    Value::Data(d) => d,
                    _ => serde_json::Value::Null,
                })
                .collect();
            Value::Data(serde_json::Value::Array(data))
        } else {
            Value::List(items)
        }
    }

    /// Split a sequence value into its elements.
    ///
    /// Returns `None` when the value is not a JSON array or a [`Value::List`].
    pub fn into_sequence(self) -> Option<Vec<Value>> {
        match self {
            Value::Data(serde_json::Value::Array(items)) => {
                Some(items.into_iter().map(Value::Data).collect())
            }
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Borrow the JSON data, if this is a data value.
    pub fn as_data(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Data(d) => Some(d),
            _ => None,
        }
    }

    /// Read the value as an integer.
    pub fn as_i64(&self) -> Option<i64> {
        self.as_data().and_then(serde_json::Value::as_i64)
    }

    /// Read the value as a string slice.
    pub fn as_str(&self) -> Option<&str> {
        self.as_data().and_then(serde_json::Value::as_str)
    }

    /// Short description of the value's shape, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Data(serde_json::Value::Null) => "null",
            Value::Data(serde_json::Value::Bool(_)) => "bool",
            Value::Data(serde_json::Value::Number(_)) => "number",
            Value::Data(serde_json::Value::String(_)) => "string",
            Value::Data(serde_json::Value::Array(_)) => "array",
            Value::Data(serde_json::Value::Object(_)) => "object",
            Value::List(_) => "list",
            Value::Callable(_) => "callable",
            Value::Object(_) => "dynamic object",
        }
    }

    /// Look up `key` on this value.
    ///
    /// JSON objects yield `Null` for missing keys and arrays accept numeric
    /// keys, yielding `Null` when out of range. Scalars and callables are not
    /// indexable.
    pub fn property(&self, key: &str) -> Result<Value> {
        match self {
            Value::Data(serde_json::Value::Object(map)) => {
                Ok(map.get(key).cloned().map(Value::Data).unwrap_or_default())
            }
            Value::Data(serde_json::Value::Array(items)) => {
                let index = parse_index(key, self)?;
                Ok(items.get(index).cloned().map(Value::Data).unwrap_or_default())
            }
            Value::List(items) => {
                let index = parse_index(key, self)?;
                Ok(items.get(index).cloned().unwrap_or_default())
            }
            Value::Object(obj) => Ok(obj.get(key).unwrap_or_default()),
            other => Err(Error::PropertyAccess {
                key: key.to_string(),
                reason: format!("{} is not indexable", other.type_name()),
            }),
        }
    }

    /// Render the value as an HTTP request body.
    ///
    /// Strings are sent raw; other data is serialized as JSON.
    pub fn to_body(&self) -> Result<String> {
        match self {
            Value::Data(serde_json::Value::String(s)) => Ok(s.clone()),
            Value::Data(d) => Ok(serde_json::to_string(d)?),
            other => Err(Error::Unserializable(other.type_name().to_string())),
        }
    }
}

fn parse_index(key: &str, on: &Value) -> Result<usize> {
    key.parse::<usize>().map_err(|_| Error::PropertyAccess {
        key: key.to_string(),
        reason: format!("{} only accepts numeric keys", on.type_name()),
    })
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Data(d) => write!(f, "Data({d})"),
            Value::List(items) => f.debug_tuple("List").field(items).finish(),
            Value::Callable(_) => f.write_str("Callable(..)"),
            Value::Object(_) => f.write_str("Object(..)"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Data(a), Value::Data(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Callable(a), Value::Callable(b)) => Arc::ptr_eq(&a.0, &b.0),
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Value::Data(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Data(value.into())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Data(value.into())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Data(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Data(value.into())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Data(value.into())
    }
}

impl From<Callable> for Value {
    fn from(value: Callable) -> Self {
        Value::Callable(value)
    }
}

type CallableFn = dyn Fn(Vec<Value>) -> Result<Value> + Send + Sync;

/// A shareable function value.
#[derive(Clone)]
pub struct Callable(Arc<CallableFn>);

impl Callable {
    /// Wrap a closure as a callable value.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Invoke the callable with the given arguments.
    pub fn call(&self, args: Vec<Value>) -> Result<Value> {
        (self.0)(args)
    }
}

/// An object whose properties and methods are resolved at call time.
pub trait Object: Send + Sync {
    /// Read a property. `None` means the property does not exist.
    fn get(&self, key: &str) -> Option<Value>;

    /// Invoke a method by name.
    ///
    /// The default implementation looks the method up with [`Object::get`]
    /// and calls it when it is a [`Value::Callable`].
    fn call_method(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        match self.get(method) {
            Some(Value::Callable(c)) => c.call(args),
            Some(other) => Err(Error::PropertyAccess {
                key: method.to_string(),
                reason: format!("{} is not a method", other.type_name()),
            }),
            None => Err(Error::PropertyAccess {
                key: method.to_string(),
                reason: "no such method".to_string(),
            }),
        }
    }
}
