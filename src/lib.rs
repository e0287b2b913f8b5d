//! SchemeXP - a small tree-walking evaluator for a strict subset of Scheme
//!
//! This crate gives meaning to parsed s-expressions: symbol resolution through a chain of
//! lexical frames, special-form dispatch, closure creation and procedure application,
//! plus a handful of native primitives.
//!
//! ```scheme
//! (define (square x) (* x x))
//! (let ((a 3) (b 4)) (+ (square a) (square b)))   ; => 25
//! (if (> 3 2 1) 'descending 'unordered)           ; => descending
//! (append '(1 2) '(3) 4)                          ; => (1 2 3 . 4)
//! ```
//!
//! ## Strict Semantics
//!
//! - Conditions of `if`, `when` and `unless` must be actual booleans (no "truthiness")
//! - Closures capture their defining frame, so scoping is lexical
//! - `let` initialisers are evaluated in the enclosing frame (parallel `let`, not `let*`)
//! - Integer arithmetic detects overflow; any real operand promotes the whole result
//! - Special-form keywords are reserved and cannot be rebound
//!
//! Every failure is reported as an [`Error`] value, so the evaluator can be embedded in a
//! REPL that keeps running after a bad top-level form.
//!
//! ## Modules
//!
//! - `ast`: runtime values, list utilities and the printer
//! - `environment`: lexical frames
//! - `evaluator`: special forms, procedure application and the embedding API
//! - `builtinops`: native primitives
//! - `scheme`: lexer and parser from source text

use std::fmt;

/// Maximum list nesting accepted by the parser
pub const MAX_PARSE_DEPTH: usize = 256;

/// Default limit on nested procedure calls before reporting a stack overflow
pub const MAX_EVAL_DEPTH: usize = 10_000;

/// Categorizes the different kinds of parsing errors.
#[derive(Debug, PartialEq, Clone)]
pub enum ParseErrorKind {
    /// Invalid or unexpected syntax (bad tokens, mismatched brackets, misplaced dots)
    InvalidSyntax,
    /// Input ended before the expression was complete (unterminated string, unclosed brackets)
    Incomplete,
    /// Expression nesting exceeded the maximum parse depth
    TooDeeplyNested,
    /// Extra input found after a complete, valid expression
    TrailingContent,
    /// Implementation-imposed limit exceeded (integer literal overflow)
    ImplementationLimit,
}

/// A structured error providing detailed information about a parsing failure.
#[derive(Debug, PartialEq, Clone)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    /// Context snippet from the input showing where the error occurred (max 100 chars)
    pub context: Option<String>,
    /// The problematic token or character encountered, if identifiable
    pub found: Option<String>,
}

impl ParseError {
    /// Create a ParseError with all fields
    pub fn new(
        kind: ParseErrorKind,
        message: impl Into<String>,
        context: Option<String>,
        found: Option<String>,
    ) -> Self {
        ParseError {
            kind,
            message: message.into(),
            context,
            found,
        }
    }

    /// Create a simple ParseError with a kind and message but no context
    pub fn from_message(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message, None, None)
    }

    /// Create a ParseError with context and found token extracted from input at a given offset
    pub fn with_context_and_found(
        kind: ParseErrorKind,
        message: impl Into<String>,
        input: &str,
        error_offset: usize,
        found: Option<String>,
    ) -> Self {
        const MAX_CONTEXT: usize = 100;

        let context_start = error_offset.saturating_sub(20);
        let context_str: String = input
            .chars()
            .skip(context_start)
            .take(MAX_CONTEXT)
            .collect();

        let mut display_context = String::new();
        if context_start > 0 {
            display_context.push_str("[...]");
        }
        display_context.push_str(&context_str);
        // Offsets here count chars, not bytes
        if context_start + context_str.chars().count() < input.chars().count() {
            display_context.push_str("[...]");
        }

        // Keep the snippet on one line
        let display_context = display_context.replace('\n', "\\n").replace('\r', "");

        Self::new(kind, message, Some(display_context), found)
    }
}

/// Error types for the interpreter
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    ParseError(ParseError),
    /// A symbol was looked up but no frame in the chain binds it
    UnboundIdentifier(String),
    /// A special form was used with the wrong shape
    BadSyntax(String),
    ArityError {
        expected: usize,
        got: usize,
        expression: Option<String>, // Optional expression context
    },
    TypeError(String),
    /// The same name appears twice among the clauses of one `let`
    DuplicateBinding(String),
    DivisionByZero,
    /// Something other than a procedure was found in operator position
    NotApplicable(String),
    /// Runtime failures outside the taxonomy above (arithmetic overflow and the like)
    EvalError(String),
    StackOverflow {
        limit: usize,
    },
    /// The output sink used by `display` or the driver failed
    Io(String),
}

impl Error {
    /// Create an ArityError without expression context
    pub fn arity_error(expected: usize, got: usize) -> Self {
        Error::ArityError {
            expected,
            got,
            expression: None,
        }
    }

    /// Create an ArityError with expression context
    pub fn arity_error_with_expr(expected: usize, got: usize, expression: String) -> Self {
        Error::ArityError {
            expected,
            got,
            expression: Some(expression),
        }
    }

    pub(crate) fn bad_syntax(form: &str, detail: impl fmt::Display) -> Self {
        Error::BadSyntax(format!("{form}: {detail}"))
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Error::ParseError(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::ParseError(e) => {
                write!(f, "ParseError: {}", e.message)?;
                if let Some(found) = &e.found {
                    write!(f, "\nFound: {found}")?;
                }
                if let Some(context) = &e.context {
                    write!(f, "\nContext: {context}")?;
                }
                Ok(())
            }
            Error::UnboundIdentifier(name) => write!(
                f,
                "{name}: undefined; cannot reference an identifier before its definition"
            ),
            Error::BadSyntax(msg) => write!(f, "Bad syntax: {msg}"),
            Error::ArityError {
                expected,
                got,
                expression,
            } => match expression {
                Some(expr) => write!(
                    f,
                    "ArityError: expression {expr}: expected {expected} arguments, got {got}"
                ),
                None => write!(
                    f,
                    "ArityError: procedure expected {expected} arguments but got {got}"
                ),
            },
            Error::TypeError(msg) => write!(f, "Type error: {msg}"),
            Error::DuplicateBinding(name) => write!(f, "let: duplicate identifier in: {name}"),
            Error::DivisionByZero => write!(f, "/: division by zero"),
            Error::NotApplicable(value) => {
                write!(f, "application: not a procedure; given: {value}")
            }
            Error::EvalError(msg) => write!(f, "EvaluationError: {msg}"),
            Error::StackOverflow { limit } => {
                write!(f, "Evaluation depth limit exceeded (max: {limit})")
            }
            Error::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

pub mod ast;
pub mod builtinops;
pub mod environment;
pub mod evaluator;

#[cfg(feature = "scheme")]
pub mod scheme;

pub use ast::Value;
pub use environment::{CapturedFrame, Environment};
pub use evaluator::{EvalConfig, Interpreter, create_global_env, eval};
