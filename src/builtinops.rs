//! Built-in procedures.
//!
//! Every primitive is registered once in a static table with its Scheme identifier and
//! [`Arity`]; [`crate::evaluator::create_global_env`] binds each of them in the global
//! frame. A primitive receives its already-evaluated arguments and does its own type
//! checking:
//!
//! ```scheme
//! (+ 1 2)          ; => 3
//! (+ 1 2.0)        ; => 3.0   any real operand makes the whole result real
//! (/ 1 3)          ; => 0.3333333333333333
//! (> 3 2 1)        ; => #t    strictly decreasing across the whole sequence
//! (append '(1) 2)  ; => (1 . 2)
//! ```
//!
//! Special forms (`if`, `let`, `lambda`, ...) are not procedures and are dispatched by
//! the evaluator instead.
//!
//! ## Error Handling
//!
//! - **Type Safety**: arithmetic rejects non-numbers, comparisons accept integers only
//! - **Overflow Detection**: integer arithmetic reports overflow instead of wrapping
//! - **Arity Checking**: argument counts are validated against the table before the call

use crate::Error;
use crate::ast::{NumberType, Value};

/// Canonical signature of a table-registered primitive
pub type BuiltinFn = fn(&[Value]) -> Result<Value, Error>;

/// Accepted argument counts of a primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    /// Inclusive bounds
    Range(usize, usize),
    Any,
}

impl Arity {
    /// Check an argument count, reporting the nearest accepted count on failure
    pub fn validate(&self, got: usize) -> Result<(), Error> {
        match *self {
            Arity::Exact(n) if got != n => Err(Error::arity_error(n, got)),
            Arity::AtLeast(min) if got < min => Err(Error::arity_error(min, got)),
            Arity::Range(min, _) if got < min => Err(Error::arity_error(min, got)),
            Arity::Range(_, max) if got > max => Err(Error::arity_error(max, got)),
            _ => Ok(()),
        }
    }
}

/// Definition of a built-in procedure
#[derive(Debug, Clone)]
pub struct BuiltinOp {
    /// The Scheme identifier for this procedure
    pub scheme_id: &'static str,
    pub func: BuiltinFn,
    pub arity: Arity,
}

impl BuiltinOp {
    /// Validate the argument count, then run the primitive
    pub fn call(&self, args: &[Value]) -> Result<Value, Error> {
        self.arity.validate(args.len())?;
        (self.func)(args)
    }
}

//
// Numeric helpers
//

/// A primitive received an argument of the wrong kind
fn contract_violation(op: &str, expected: &str, given: &Value) -> Error {
    Error::TypeError(format!(
        "{op}: contract violation, expected {expected}, given {}: {given}",
        given.type_name()
    ))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Number {
    Int(NumberType),
    Real(f64),
}

impl Number {
    fn from_value(op: &str, value: &Value) -> Result<Number, Error> {
        match value {
            Value::Integer(n) => Ok(Number::Int(*n)),
            Value::Real(x) => Ok(Number::Real(*x)),
            other => Err(contract_violation(op, "number", other)),
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Number::Int(n) => n as f64,
            Number::Real(x) => x,
        }
    }

    fn is_zero(self) -> bool {
        match self {
            Number::Int(n) => n == 0,
            Number::Real(x) => x == 0.0,
        }
    }
}

/// Convert every argument, noting whether any of them is real
fn numeric_args(op: &str, args: &[Value]) -> Result<(Vec<Number>, bool), Error> {
    let numbers = args
        .iter()
        .map(|arg| Number::from_value(op, arg))
        .collect::<Result<Vec<_>, _>>()?;
    let any_real = numbers.iter().any(|n| matches!(n, Number::Real(_)));
    Ok((numbers, any_real))
}

fn overflow(op: &str) -> Error {
    Error::EvalError(format!("Integer overflow in {op}"))
}

/// Integer operands of an all-integer argument list
fn integers(numbers: &[Number]) -> impl Iterator<Item = NumberType> + '_ {
    numbers.iter().filter_map(|n| match n {
        Number::Int(i) => Some(*i),
        Number::Real(_) => None,
    })
}

// Macro to generate folding arithmetic: exact integer fold with overflow detection,
// or a real fold as soon as any operand is real
macro_rules! arithmetic_fold {
    ($name:ident, $op_name:expr, $identity:expr, $checked:ident, $real_op:tt) => {
        fn $name(args: &[Value]) -> Result<Value, Error> {
            let (numbers, any_real) = numeric_args($op_name, args)?;
            if any_real {
                let result = numbers
                    .iter()
                    .fold($identity as f64, |acc, n| acc $real_op n.as_f64());
                return Ok(Value::Real(result));
            }

            let mut result: NumberType = $identity;
            for n in integers(&numbers) {
                result = result.$checked(n).ok_or_else(|| overflow($op_name))?;
            }
            Ok(Value::Integer(result))
        }
    };
}

arithmetic_fold!(builtin_add, "+", 0, checked_add, +);
arithmetic_fold!(builtin_mul, "*", 1, checked_mul, *);

fn builtin_sub(args: &[Value]) -> Result<Value, Error> {
    let (numbers, any_real) = numeric_args("-", args)?;
    let Some((first, rest)) = numbers.split_first() else {
        return Err(Error::arity_error(1, 0));
    };

    if any_real {
        if rest.is_empty() {
            return Ok(Value::Real(-first.as_f64()));
        }
        let result = rest.iter().fold(first.as_f64(), |acc, n| acc - n.as_f64());
        return Ok(Value::Real(result));
    }

    let mut operands = integers(&numbers);
    let mut result = operands.next().unwrap_or_default();
    if rest.is_empty() {
        return result
            .checked_neg()
            .map(Value::Integer)
            .ok_or_else(|| overflow("negation"));
    }
    for n in operands {
        result = result.checked_sub(n).ok_or_else(|| overflow("-"))?;
    }
    Ok(Value::Integer(result))
}

fn builtin_div(args: &[Value]) -> Result<Value, Error> {
    let (numbers, _) = numeric_args("/", args)?;
    // A single argument is the reciprocal: (/ x) is (/ 1 x)
    let (dividend, divisor) = match numbers.as_slice() {
        [divisor] => (Number::Int(1), *divisor),
        [dividend, divisor] => (*dividend, *divisor),
        _ => return Err(Error::arity_error(2, numbers.len())),
    };

    if divisor.is_zero() {
        return Err(Error::DivisionByZero);
    }

    match (dividend, divisor) {
        // Exact integer quotients stay integers
        (Number::Int(a), Number::Int(b)) => match (a.checked_rem(b), a.checked_div(b)) {
            (Some(0), Some(quotient)) => Ok(Value::Integer(quotient)),
            (Some(_), _) => Ok(Value::Real(a as f64 / b as f64)),
            _ => Err(overflow("/")),
        },
        _ => Ok(Value::Real(dividend.as_f64() / divisor.as_f64())),
    }
}

// Macro to generate integer comparison functions that chain across all arguments
macro_rules! integer_comparison {
    ($name:ident, $op:tt, $op_str:literal) => {
        fn $name(args: &[Value]) -> Result<Value, Error> {
            let numbers = args
                .iter()
                .map(|arg| {
                    NumberType::try_from(arg)
                        .map_err(|_| contract_violation($op_str, "integer", arg))
                })
                .collect::<Result<Vec<_>, _>>()?;

            // Every adjacent pair must satisfy the comparison
            Ok(Value::Bool(numbers.windows(2).all(|w| w[0] $op w[1])))
        }
    };
}

integer_comparison!(builtin_gt, >, ">");
integer_comparison!(builtin_lt, <, "<");
integer_comparison!(builtin_num_eq, ==, "=");

fn builtin_car(args: &[Value]) -> Result<Value, Error> {
    match args {
        [Value::Pair(pair)] => Ok(pair.head.clone()),
        [other] => Err(contract_violation("car", "pair", other)),
        _ => Err(Error::arity_error(1, args.len())),
    }
}

fn builtin_cdr(args: &[Value]) -> Result<Value, Error> {
    match args {
        [Value::Pair(pair)] => Ok(pair.tail.clone()),
        [other] => Err(contract_violation("cdr", "pair", other)),
        _ => Err(Error::arity_error(1, args.len())),
    }
}

fn builtin_cons(args: &[Value]) -> Result<Value, Error> {
    match args {
        [head, tail] => Ok(Value::cons(head.clone(), tail.clone())),
        _ => Err(Error::arity_error(2, args.len())),
    }
}

fn builtin_list(args: &[Value]) -> Result<Value, Error> {
    Ok(Value::list(args.to_vec()))
}

fn builtin_append(args: &[Value]) -> Result<Value, Error> {
    let Some((last, lists)) = args.split_last() else {
        return Ok(Value::Empty);
    };

    let mut items = Vec::new();
    for list in lists {
        let elements = list
            .to_vec()
            .ok_or_else(|| contract_violation("append", "list", list))?;
        items.extend(elements);
    }

    // The last argument is shared, not copied, and may be any value
    Ok(Value::improper_list(items, last.clone()))
}

fn builtin_null(args: &[Value]) -> Result<Value, Error> {
    match args {
        [value] => Ok(Value::Bool(value.is_empty())),
        _ => Err(Error::arity_error(1, args.len())),
    }
}

fn builtin_eq(args: &[Value]) -> Result<Value, Error> {
    match args {
        [a, b] => Ok(Value::Bool(a.is_eq(b))),
        _ => Err(Error::arity_error(2, args.len())),
    }
}

fn builtin_equal(args: &[Value]) -> Result<Value, Error> {
    match args {
        [a, b] => Ok(Value::Bool(a.is_equal(b))),
        _ => Err(Error::arity_error(2, args.len())),
    }
}

fn builtin_not(args: &[Value]) -> Result<Value, Error> {
    match args {
        [value] => {
            let b = bool::try_from(value)
                .map_err(|_| contract_violation("not", "boolean", value))?;
            Ok(Value::Bool(!b))
        }
        _ => Err(Error::arity_error(1, args.len())),
    }
}

/// Global registry of all built-in procedures
static BUILTIN_OPS: &[BuiltinOp] = &[
    // Arithmetic
    BuiltinOp {
        scheme_id: "+",
        func: builtin_add,
        arity: Arity::Any,
    },
    BuiltinOp {
        scheme_id: "-",
        func: builtin_sub,
        arity: Arity::AtLeast(1),
    },
    BuiltinOp {
        scheme_id: "*",
        func: builtin_mul,
        arity: Arity::Any,
    },
    BuiltinOp {
        scheme_id: "/",
        func: builtin_div,
        arity: Arity::Range(1, 2),
    },
    // Comparison
    BuiltinOp {
        scheme_id: ">",
        func: builtin_gt,
        arity: Arity::AtLeast(1),
    },
    BuiltinOp {
        scheme_id: "<",
        func: builtin_lt,
        arity: Arity::AtLeast(1),
    },
    BuiltinOp {
        scheme_id: "=",
        func: builtin_num_eq,
        arity: Arity::AtLeast(1),
    },
    // Equality
    BuiltinOp {
        scheme_id: "eq?",
        func: builtin_eq,
        arity: Arity::Exact(2),
    },
    BuiltinOp {
        scheme_id: "equal?",
        func: builtin_equal,
        arity: Arity::Exact(2),
    },
    BuiltinOp {
        scheme_id: "null?",
        func: builtin_null,
        arity: Arity::Exact(1),
    },
    BuiltinOp {
        scheme_id: "not",
        func: builtin_not,
        arity: Arity::Exact(1),
    },
    // List operations
    BuiltinOp {
        scheme_id: "car",
        func: builtin_car,
        arity: Arity::Exact(1),
    },
    BuiltinOp {
        scheme_id: "cdr",
        func: builtin_cdr,
        arity: Arity::Exact(1),
    },
    BuiltinOp {
        scheme_id: "cons",
        func: builtin_cons,
        arity: Arity::Exact(2),
    },
    BuiltinOp {
        scheme_id: "list",
        func: builtin_list,
        arity: Arity::Any,
    },
    BuiltinOp {
        scheme_id: "append",
        func: builtin_append,
        arity: Arity::Any,
    },
];

/// Get all builtin procedures
pub fn get_builtin_ops() -> &'static [BuiltinOp] {
    BUILTIN_OPS
}

/// Find a builtin procedure by its Scheme identifier
pub fn find_scheme_op(id: &str) -> Option<&'static BuiltinOp> {
    BUILTIN_OPS.iter().find(|op| op.scheme_id == id)
}
