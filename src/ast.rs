//! Runtime values of the interpreter. The parser produces the same [`Value`] type it
//! evaluates, restricted to atoms, pairs and the empty list; evaluation adds closures,
//! primitives and the `Void` marker. Lists are right-nested chains of [`Pair`]s ending in
//! [`Value::Empty`] (proper) or in any other value (improper). Pairs, closures and strings
//! live behind `Rc` so that quoted structure and captured frames are shared rather than
//! copied, and so that `eq?` can compare storage identity.
//!
//! Ergonomic helpers such as [`val`], [`sym`] and [`nil`] build values in code and tests,
//! and the `Display` impl is the printer used by the driver and by `display`.

use crate::Error;
use crate::environment::CapturedFrame;
use std::fmt;
use std::rc::Rc;

/// Type alias for integer values in interpreter
pub type NumberType = i64;

/// Canonical erased signature of a native procedure. Primitives receive their
/// already-evaluated arguments.
pub type OperationFn = dyn Fn(&[Value]) -> Result<Value, Error>;

/// Core value type of the interpreter
#[derive(Clone)]
pub enum Value {
    Integer(NumberType),
    Real(f64),
    Bool(bool),
    /// String literals, shared so that `eq?` can tell two constructions apart
    String(Rc<str>),
    /// Symbols (identifiers)
    Symbol(String),
    /// The sole composite structure
    Pair(Rc<Pair>),
    /// The empty list, also the result of `when`/`unless` when the body is skipped
    Empty,
    /// User-defined procedures
    Closure(Rc<Closure>),
    /// Native procedures, compared by name
    Primitive { name: String, func: Rc<OperationFn> },
    /// Result of side-effecting forms (`define`, `display`), never printed by the driver
    /// and never equal to anything, including itself
    Void,
}

/// A cons cell
pub struct Pair {
    pub head: Value,
    pub tail: Value,
}

impl Drop for Pair {
    fn drop(&mut self) {
        // Unlink uniquely-owned tails one at a time so dropping a long list
        // doesn't recurse once per element.
        let mut tail = std::mem::replace(&mut self.tail, Value::Empty);
        while let Value::Pair(rc) = tail {
            match Rc::try_unwrap(rc) {
                Ok(mut pair) => tail = std::mem::replace(&mut pair.tail, Value::Empty),
                Err(_) => break,
            }
        }
    }
}

/// A procedure value: parameter names, unevaluated body and the frame it was created in
pub struct Closure {
    pub params: Vec<String>,
    /// Body expressions, evaluated in order; never empty
    pub body: Vec<Value>,
    /// The defining frame, owned by the environment it belongs to rather than by the closure
    pub env: CapturedFrame,
}

impl Value {
    /// Build a pair
    pub fn cons(head: Value, tail: Value) -> Value {
        Value::Pair(Rc::new(Pair { head, tail }))
    }

    /// Build a proper list from its elements
    pub fn list(items: Vec<Value>) -> Value {
        Self::improper_list(items, Value::Empty)
    }

    /// Build a chain of pairs from `items` terminated by `tail`
    pub fn improper_list(items: Vec<Value>, tail: Value) -> Value {
        items
            .into_iter()
            .rev()
            .fold(tail, |acc, item| Value::cons(item, acc))
    }

    /// Head of a pair
    pub fn first(&self) -> Option<&Value> {
        match self {
            Value::Pair(pair) => Some(&pair.head),
            _ => None,
        }
    }

    /// Tail of a pair
    pub fn rest(&self) -> Option<&Value> {
        match self {
            Value::Pair(pair) => Some(&pair.tail),
            _ => None,
        }
    }

    /// Check if a value is the empty list
    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    /// Number of elements of a proper list
    pub fn length(&self) -> Result<usize, Error> {
        let mut iter = self.iter();
        let count = iter.by_ref().count();
        if iter.remainder().is_empty() {
            Ok(count)
        } else {
            Err(Error::TypeError(format!(
                "length: contract violation, expected a proper list, given: {self}"
            )))
        }
    }

    /// Iterate over the heads of a pair chain. Stops at the first non-pair tail,
    /// which [`ListIter::remainder`] exposes afterwards.
    pub fn iter(&self) -> ListIter<'_> {
        ListIter { current: self }
    }

    /// Elements of a proper list, or `None` for improper lists and non-lists
    pub fn to_vec(&self) -> Option<Vec<Value>> {
        let mut iter = self.iter();
        let items: Vec<Value> = iter.by_ref().cloned().collect();
        iter.remainder().is_empty().then_some(items)
    }

    /// Check if a value is a closure or primitive
    pub fn is_procedure(&self) -> bool {
        matches!(self, Value::Closure(_) | Value::Primitive { .. })
    }

    /// Deep structural equality (`equal?`): recurses into pairs, compares atoms by value
    pub fn is_equal(&self, other: &Value) -> bool {
        let (mut left, mut right) = (self, other);
        loop {
            match (left, right) {
                (Value::Pair(a), Value::Pair(b)) => {
                    if Rc::ptr_eq(a, b) {
                        return true;
                    }
                    if !a.head.is_equal(&b.head) {
                        return false;
                    }
                    left = &a.tail;
                    right = &b.tail;
                }
                (Value::String(a), Value::String(b)) => return a == b,
                _ => return left.is_eq(right),
            }
        }
    }

    /// Identity comparison (`eq?`). Pairs, closures and strings are the same only when
    /// they share storage; immediates compare by value.
    pub fn is_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Real(a), Value::Real(b)) => a.to_bits() == b.to_bits(),
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Empty, Value::Empty) => true,
            (Value::String(a), Value::String(b)) => Rc::ptr_eq(a, b),
            (Value::Pair(a), Value::Pair(b)) => Rc::ptr_eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Primitive { name: a, .. }, Value::Primitive { name: b, .. }) => a == b,
            _ => false, // Void, or different variants
        }
    }

    /// Name of the variant, for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Bool(_) => "boolean",
            Value::String(_) => "string",
            Value::Symbol(_) => "symbol",
            Value::Pair(_) => "pair",
            Value::Empty => "empty list",
            Value::Closure(_) | Value::Primitive { .. } => "procedure",
            Value::Void => "void",
        }
    }
}

/// Iterator over the elements of a pair chain
pub struct ListIter<'a> {
    current: &'a Value,
}

impl<'a> ListIter<'a> {
    /// What is left of the chain: `Empty` once a proper list is exhausted,
    /// the dotted tail of an improper one
    pub fn remainder(&self) -> &'a Value {
        self.current
    }
}

impl<'a> Iterator for ListIter<'a> {
    type Item = &'a Value;

    fn next(&mut self) -> Option<Self::Item> {
        match self.current {
            Value::Pair(pair) => {
                self.current = &pair.tail;
                Some(&pair.head)
            }
            _ => None,
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Integer(n) => write!(f, "Integer({n})"),
            Value::Real(x) => write!(f, "Real({x:?})"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Symbol(s) => write!(f, "Symbol({s})"),
            Value::Pair(pair) => write!(f, "Pair({:?}, {:?})", pair.head, pair.tail),
            Value::Empty => write!(f, "Empty"),
            Value::Closure(closure) => write!(
                f,
                "Closure(params={:?}, body={:?})",
                closure.params, closure.body
            ),
            Value::Primitive { name, .. } => write!(f, "Primitive({name})"),
            Value::Void => write!(f, "Void"),
        }
    }
}

// From trait implementations for Value - enables .into() conversion
impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Rc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Rc::from(s))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Real(x)
    }
}

macro_rules! impl_from_integer {
    ($int_type:ty) => {
        impl From<$int_type> for Value {
            fn from(n: $int_type) -> Self {
                Value::Integer(n as NumberType)
            }
        }
    };
}

impl_from_integer!(i8);
impl_from_integer!(i16);
impl_from_integer!(i32);
impl_from_integer!(NumberType);
impl_from_integer!(u8);
impl_from_integer!(u16);
impl_from_integer!(u32);

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::list(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for Value {
    fn from(arr: [T; N]) -> Self {
        Value::list(arr.into_iter().map(Into::into).collect())
    }
}

// Fallible conversions from `Value` back into primitive Rust types.

impl TryFrom<&Value> for NumberType {
    type Error = Error;

    fn try_from(value: &Value) -> Result<NumberType, Error> {
        if let Value::Integer(n) = value {
            Ok(*n)
        } else {
            Err(Error::TypeError(format!("expected integer, given: {value}")))
        }
    }
}

impl TryFrom<&Value> for bool {
    type Error = Error;

    fn try_from(value: &Value) -> Result<bool, Error> {
        if let Value::Bool(b) = value {
            Ok(*b)
        } else {
            Err(Error::TypeError(format!("expected boolean, given: {value}")))
        }
    }
}

/// Helper function for creating symbols
pub fn sym<S: AsRef<str>>(name: S) -> Value {
    Value::Symbol(name.as_ref().to_owned())
}

/// Helper function for creating Values from anything convertible
pub fn val<T: Into<Value>>(value: T) -> Value {
    value.into()
}

/// Helper function for the empty list
pub fn nil() -> Value {
    Value::Empty
}

fn write_real(f: &mut fmt::Formatter<'_>, x: f64) -> fmt::Result {
    if x.is_nan() {
        write!(f, "+nan.0")
    } else if x.is_infinite() {
        write!(f, "{}inf.0", if x > 0.0 { "+" } else { "-" })
    } else {
        // Debug formatting keeps the fractional part: 3.0 rather than 3
        write!(f, "{x:?}")
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Integer(n) => write!(f, "{n}"),
            Value::Real(x) => write_real(f, *x),
            Value::Bool(b) => write!(f, "{}", if *b { "#t" } else { "#f" }),
            Value::String(s) => {
                write!(f, "\"")?;
                for ch in s.chars() {
                    match ch {
                        '"' => write!(f, "\\\"")?,
                        '\\' => write!(f, "\\\\")?,
                        '\n' => write!(f, "\\n")?,
                        '\t' => write!(f, "\\t")?,
                        '\r' => write!(f, "\\r")?,
                        c => write!(f, "{c}")?,
                    }
                }
                write!(f, "\"")
            }
            Value::Symbol(s) => write!(f, "{s}"),
            Value::Pair(_) => {
                write!(f, "(")?;
                let mut iter = self.iter();
                for (i, elem) in iter.by_ref().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{elem}")?;
                }
                let tail = iter.remainder();
                if !tail.is_empty() {
                    write!(f, " . {tail}")?;
                }
                write!(f, ")")
            }
            Value::Empty => write!(f, "()"),
            Value::Closure(_) => write!(f, "#<procedure>"),
            Value::Primitive { name, .. } => write!(f, "#<procedure:{name}>"),
            Value::Void => write!(f, "#<void>"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.is_equal(other)
    }
}
