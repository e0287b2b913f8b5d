use crate::Error;
use crate::MAX_EVAL_DEPTH;
use crate::ast::{Closure, Value};
use crate::builtinops::get_builtin_ops;
use crate::environment::Environment;
use std::io::{self, Write};
use std::rc::Rc;

/// Evaluator settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalConfig {
    /// Nested procedure calls allowed before failing with `StackOverflow`
    pub max_depth: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        EvalConfig {
            max_depth: MAX_EVAL_DEPTH,
        }
    }
}

/// State shared by one evaluation: where `display` writes, and the limits in force
struct Context<'a> {
    out: &'a mut dyn Write,
    config: EvalConfig,
}

/// Syntactic keywords. Their arguments are not uniformly evaluated, and the names are
/// reserved: they cannot be rebound by `define`, `let` or a `lambda` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SpecialForm {
    If,
    Let,
    When,
    Unless,
    Quote,
    Lambda,
    Define,
    Display,
}

type SpecialFormFn = fn(&[Value], &Environment, &mut Context<'_>, usize) -> Result<Value, Error>;

impl SpecialForm {
    pub(crate) fn from_keyword(name: &str) -> Option<Self> {
        match name {
            "if" => Some(SpecialForm::If),
            "let" => Some(SpecialForm::Let),
            "when" => Some(SpecialForm::When),
            "unless" => Some(SpecialForm::Unless),
            "quote" => Some(SpecialForm::Quote),
            "lambda" => Some(SpecialForm::Lambda),
            "define" => Some(SpecialForm::Define),
            "display" => Some(SpecialForm::Display),
            _ => None,
        }
    }

    fn handler(self) -> SpecialFormFn {
        match self {
            SpecialForm::If => eval_if,
            SpecialForm::Let => eval_let,
            SpecialForm::When => eval_when,
            SpecialForm::Unless => eval_unless,
            SpecialForm::Quote => eval_quote,
            SpecialForm::Lambda => eval_lambda,
            SpecialForm::Define => eval_define,
            SpecialForm::Display => eval_display,
        }
    }
}

/// Reject binding a special-form keyword
fn check_not_keyword(form: &str, name: &str) -> Result<(), Error> {
    if SpecialForm::from_keyword(name).is_some() {
        return Err(Error::bad_syntax(
            form,
            format!("cannot rebind the keyword `{name}`"),
        ));
    }
    Ok(())
}

/// Create a global environment with every built-in procedure bound
pub fn create_global_env() -> Environment {
    let env = Environment::new();

    for builtin_op in get_builtin_ops() {
        env.define(
            builtin_op.scheme_id,
            Value::Primitive {
                name: builtin_op.scheme_id.to_owned(),
                func: Rc::new(move |args: &[Value]| builtin_op.call(args)),
            },
        );
    }

    env
}

/// Evaluate an expression in `env`, with `display` writing to stdout
pub fn eval(expr: &Value, env: &Environment) -> Result<Value, Error> {
    let mut stdout = io::stdout();
    let mut ctx = Context {
        out: &mut stdout,
        config: EvalConfig::default(),
    };
    eval_with_depth_tracking(expr, env, &mut ctx, 0)
}

/// Apply a procedure value to already-evaluated arguments, with `display` writing to stdout
pub fn apply(procedure: &Value, args: Vec<Value>) -> Result<Value, Error> {
    let mut stdout = io::stdout();
    let mut ctx = Context {
        out: &mut stdout,
        config: EvalConfig::default(),
    };
    apply_procedure(procedure, args, &mut ctx, 0)
}

/// Stack left before evaluation moves onto a freshly allocated segment
const STACK_RED_ZONE: usize = 64 * 1024;
const STACK_SEGMENT_SIZE: usize = 1024 * 1024;

/// Evaluate an expression; `depth` is the number of closure calls in progress.
/// The native stack grows on demand, so the call limit is what stops runaway recursion.
fn eval_with_depth_tracking(
    expr: &Value,
    env: &Environment,
    ctx: &mut Context<'_>,
    depth: usize,
) -> Result<Value, Error> {
    stacker::maybe_grow(STACK_RED_ZONE, STACK_SEGMENT_SIZE, || {
        eval_expr(expr, env, ctx, depth)
    })
}

fn eval_expr(
    expr: &Value,
    env: &Environment,
    ctx: &mut Context<'_>,
    depth: usize,
) -> Result<Value, Error> {
    match expr {
        // Self-evaluating forms
        Value::Integer(_)
        | Value::Real(_)
        | Value::Bool(_)
        | Value::String(_)
        | Value::Closure(_)
        | Value::Primitive { .. }
        | Value::Void => Ok(expr.clone()),

        // The empty list is not self-evaluating
        Value::Empty => Err(Error::bad_syntax(
            "application",
            "missing procedure expression in ()",
        )),

        Value::Symbol(name) => env.lookup(name),

        Value::Pair(pair) => eval_combination(&pair.head, &pair.tail, env, ctx, depth)
            .map_err(|err| add_context(err, expr)),
    }
}

/// Helper function to add expression context to errors, innermost form only
fn add_context(error: Error, expr: &Value) -> Error {
    const MARKER: &str = "\n  Context: ";
    match error {
        Error::EvalError(msg) if !msg.contains(MARKER) => {
            Error::EvalError(format!("{msg}{MARKER}while evaluating: {expr}"))
        }
        Error::TypeError(msg) if !msg.contains(MARKER) => {
            Error::TypeError(format!("{msg}{MARKER}while evaluating: {expr}"))
        }
        other => other,
    }
}

/// Helper function to evaluate argument expressions left to right
fn eval_args(
    args: &[Value],
    env: &Environment,
    ctx: &mut Context<'_>,
    depth: usize,
) -> Result<Vec<Value>, Error> {
    args.iter()
        .map(|arg| eval_with_depth_tracking(arg, env, ctx, depth))
        .collect()
}

/// Evaluate a sequence of expressions, returning the value of the last one
fn eval_body(
    body: &[Value],
    env: &Environment,
    ctx: &mut Context<'_>,
    depth: usize,
) -> Result<Value, Error> {
    let mut result = Value::Void;
    for expr in body {
        result = eval_with_depth_tracking(expr, env, ctx, depth)?;
    }
    Ok(result)
}

/// Evaluate a pair: a special form when the head is a keyword, otherwise a procedure call
fn eval_combination(
    head: &Value,
    tail: &Value,
    env: &Environment,
    ctx: &mut Context<'_>,
    depth: usize,
) -> Result<Value, Error> {
    let operands = tail.to_vec().ok_or_else(|| {
        Error::bad_syntax("application", "arguments must form a proper list")
    })?;

    if let Value::Symbol(name) = head
        && let Some(special_form) = SpecialForm::from_keyword(name)
    {
        return special_form.handler()(&operands, env, ctx, depth);
    }

    // Operator first, then the operands left to right, all in the current frame
    let procedure = eval_with_depth_tracking(head, env, ctx, depth)?;
    let args = eval_args(&operands, env, ctx, depth)?;
    apply_procedure(&procedure, args, ctx, depth)
}

/// Call a primitive directly, or bind a closure's parameters in a fresh frame whose
/// parent is the closure's defining frame and evaluate its body there
fn apply_procedure(
    procedure: &Value,
    args: Vec<Value>,
    ctx: &mut Context<'_>,
    depth: usize,
) -> Result<Value, Error> {
    match procedure {
        Value::Primitive { name, func } => {
            log::trace!("apply primitive {name} to {} arguments", args.len());
            func(&args)
        }
        Value::Closure(closure) => {
            if closure.params.len() != args.len() {
                return Err(Error::arity_error(closure.params.len(), args.len()));
            }
            if depth >= ctx.config.max_depth {
                return Err(Error::StackOverflow {
                    limit: ctx.config.max_depth,
                });
            }
            log::trace!("apply closure ({}) at depth {depth}", closure.params.join(" "));

            let defining = closure.env.upgrade().ok_or_else(|| {
                Error::EvalError("procedure outlived the environment it was defined in".to_owned())
            })?;
            let frame = Environment::with_parent(&defining);
            for (param, arg) in closure.params.iter().zip(args) {
                frame.define(param.clone(), arg);
            }

            eval_body(&closure.body, &frame, ctx, depth + 1)
        }
        other => Err(Error::NotApplicable(other.to_string())),
    }
}

/// Boolean condition of `if`, `when` and `unless` (no truthiness)
fn eval_condition(
    form: &str,
    condition_expr: &Value,
    env: &Environment,
    ctx: &mut Context<'_>,
    depth: usize,
) -> Result<bool, Error> {
    match eval_with_depth_tracking(condition_expr, env, ctx, depth)? {
        Value::Bool(b) => Ok(b),
        other => Err(Error::TypeError(format!(
            "{form}: condition must be a boolean, given {}: {other}",
            other.type_name()
        ))),
    }
}

/// Evaluate if special form
fn eval_if(
    args: &[Value],
    env: &Environment,
    ctx: &mut Context<'_>,
    depth: usize,
) -> Result<Value, Error> {
    match args {
        [condition_expr, then_expr, else_expr] => {
            if eval_condition("if", condition_expr, env, ctx, depth)? {
                eval_with_depth_tracking(then_expr, env, ctx, depth)
            } else {
                eval_with_depth_tracking(else_expr, env, ctx, depth)
            }
        }
        _ => Err(Error::bad_syntax(
            "if",
            format!("expected 3 arguments, got {}", args.len()),
        )),
    }
}

/// Evaluate let special form
fn eval_let(
    args: &[Value],
    env: &Environment,
    ctx: &mut Context<'_>,
    depth: usize,
) -> Result<Value, Error> {
    let [bindings, body @ ..] = args else {
        return Err(Error::bad_syntax("let", "missing bindings and body"));
    };
    if body.is_empty() {
        return Err(Error::bad_syntax("let", "missing body"));
    }

    let clauses = bindings
        .to_vec()
        .ok_or_else(|| Error::bad_syntax("let", format!("not a list of bindings: {bindings}")))?
        .iter()
        .map(|clause| match clause.to_vec().as_deref() {
            Some([Value::Symbol(name), init]) => {
                check_not_keyword("let", name)?;
                Ok((name.clone(), init.clone()))
            }
            _ => Err(Error::bad_syntax(
                "let",
                format!("not an identifier and expression for a binding: {clause}"),
            )),
        })
        .collect::<Result<Vec<_>, Error>>()?;

    let frame = env.bind_let(&clauses, |init, outer| {
        eval_with_depth_tracking(init, outer, ctx, depth)
    })?;
    eval_body(body, &frame, ctx, depth)
}

// Macro to generate the one-armed conditionals: the body runs only when the
// condition equals $run_when, otherwise the result is the empty list
macro_rules! one_armed_conditional {
    ($name:ident, $form:expr, $run_when:literal) => {
        fn $name(
            args: &[Value],
            env: &Environment,
            ctx: &mut Context<'_>,
            depth: usize,
        ) -> Result<Value, Error> {
            let [condition_expr, body @ ..] = args else {
                return Err(Error::bad_syntax($form, "missing condition"));
            };
            if body.is_empty() {
                return Err(Error::bad_syntax($form, "missing body"));
            }

            if eval_condition($form, condition_expr, env, ctx, depth)? == $run_when {
                eval_body(body, env, ctx, depth)
            } else {
                Ok(Value::Empty)
            }
        }
    };
}

one_armed_conditional!(eval_when, "when", true);
one_armed_conditional!(eval_unless, "unless", false);

/// Evaluate quote special form
fn eval_quote(
    args: &[Value],
    _env: &Environment,
    _ctx: &mut Context<'_>,
    _depth: usize,
) -> Result<Value, Error> {
    match args {
        // Cloning shares the quoted structure with the source tree
        [datum] => Ok(datum.clone()),
        _ => Err(Error::bad_syntax(
            "quote",
            format!("expected 1 argument, got {}", args.len()),
        )),
    }
}

/// Validate a parameter list: a proper list of distinct, non-keyword symbols
fn parse_params(form: &str, param_list: &Value) -> Result<Vec<String>, Error> {
    let items = param_list.to_vec().ok_or_else(|| {
        Error::bad_syntax(form, format!("not an identifier list: {param_list}"))
    })?;

    let mut params: Vec<String> = Vec::with_capacity(items.len());
    for item in &items {
        let Value::Symbol(name) = item else {
            return Err(Error::bad_syntax(form, format!("not an identifier: {item}")));
        };
        check_not_keyword(form, name)?;
        if params.contains(name) {
            return Err(Error::bad_syntax(
                form,
                format!("duplicate argument name: {name}"),
            ));
        }
        params.push(name.clone());
    }

    // Variadic forms such as (lambda args body) or (lambda (a . rest) body) are
    // rejected above: only fixed-arity parameter lists are supported.
    Ok(params)
}

fn make_closure(
    form: &str,
    param_list: &Value,
    body: &[Value],
    env: &Environment,
) -> Result<Value, Error> {
    if body.is_empty() {
        return Err(Error::bad_syntax(form, "missing body"));
    }
    let params = parse_params(form, param_list)?;
    Ok(Value::Closure(Rc::new(Closure {
        params,
        body: body.to_vec(),
        env: env.capture(),
    })))
}

/// Evaluate lambda special form
fn eval_lambda(
    args: &[Value],
    env: &Environment,
    _ctx: &mut Context<'_>,
    _depth: usize,
) -> Result<Value, Error> {
    match args {
        [param_list, body @ ..] => make_closure("lambda", param_list, body, env),
        [] => Err(Error::bad_syntax("lambda", "missing parameter list and body")),
    }
}

/// Evaluate define special form, both `(define name expr)` and
/// `(define (name param ...) body ...)`
fn eval_define(
    args: &[Value],
    env: &Environment,
    ctx: &mut Context<'_>,
    depth: usize,
) -> Result<Value, Error> {
    let (name, value) = match args {
        [Value::Symbol(name), expr] => {
            check_not_keyword("define", name)?;
            let value = eval_with_depth_tracking(expr, env, ctx, depth)?;
            (name, value)
        }
        [Value::Pair(signature), body @ ..] => {
            let Value::Symbol(name) = &signature.head else {
                return Err(Error::bad_syntax(
                    "define",
                    format!("not an identifier: {}", signature.head),
                ));
            };
            check_not_keyword("define", name)?;
            (name, make_closure("define", &signature.tail, body, env)?)
        }
        [Value::Symbol(_), ..] => {
            return Err(Error::bad_syntax(
                "define",
                format!("expected a name and 1 expression, got {} arguments", args.len()),
            ));
        }
        _ => return Err(Error::bad_syntax("define", "expected a name or signature")),
    };

    log::debug!("define {name}");
    env.define(name.clone(), value);
    Ok(Value::Void)
}

/// Evaluate display special form
fn eval_display(
    args: &[Value],
    env: &Environment,
    ctx: &mut Context<'_>,
    depth: usize,
) -> Result<Value, Error> {
    let [expr] = args else {
        return Err(Error::arity_error_with_expr(
            1,
            args.len(),
            "display".to_owned(),
        ));
    };

    match eval_with_depth_tracking(expr, env, ctx, depth)? {
        // Strings are displayed without quotes or escapes
        Value::String(s) => write!(ctx.out, "{s}")?,
        other => write!(ctx.out, "{other}")?,
    }
    Ok(Value::Void)
}

/// An evaluator with its own global frame and output sink, for embedding and for
/// driving whole programs
pub struct Interpreter<W: Write = io::Stdout> {
    env: Environment,
    out: W,
    config: EvalConfig,
}

impl Interpreter<io::Stdout> {
    /// Interpreter writing to stdout
    pub fn new() -> Self {
        Self::with_output(io::stdout())
    }
}

impl Default for Interpreter<io::Stdout> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write> Interpreter<W> {
    /// Interpreter with a fresh global frame, writing to `out`
    pub fn with_output(out: W) -> Self {
        Interpreter {
            env: create_global_env(),
            out,
            config: EvalConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EvalConfig) -> Self {
        self.config = config;
        self
    }

    /// The global frame; definitions made through it are visible to later evaluations
    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    pub fn into_output(self) -> W {
        self.out
    }

    /// Evaluate one expression in the global frame
    pub fn eval(&mut self, expr: &Value) -> Result<Value, Error> {
        let mut ctx = Context {
            out: &mut self.out,
            config: self.config,
        };
        eval_with_depth_tracking(expr, &self.env, &mut ctx, 0)
    }

    /// Apply a procedure value to already-evaluated arguments
    pub fn apply(&mut self, procedure: &Value, args: Vec<Value>) -> Result<Value, Error> {
        let mut ctx = Context {
            out: &mut self.out,
            config: self.config,
        };
        apply_procedure(procedure, args, &mut ctx, 0)
    }

    /// Parse and evaluate every top-level form of `source`, returning the value of
    /// the last one (`Void` for an empty program)
    #[cfg(feature = "scheme")]
    pub fn eval_str(&mut self, source: &str) -> Result<Value, Error> {
        let program = crate::scheme::parse_program(source)?;
        let mut result = Value::Void;
        for expr in &program {
            result = self.eval(expr)?;
        }
        Ok(result)
    }

    /// Run a whole program from source; see [`Interpreter::run_program`]
    #[cfg(feature = "scheme")]
    pub fn run(&mut self, source: &str) -> Result<(), Error> {
        let program = crate::scheme::parse_program(source)?;
        self.run_program(&program)
    }

    /// Evaluate top-level forms left to right, writing each non-void result on its own
    /// line. The first error stops the run; definitions made before it stay in the
    /// global frame.
    pub fn run_program(&mut self, program: &[Value]) -> Result<(), Error> {
        log::debug!("running {} top-level forms", program.len());

        let result = program.iter().try_for_each(|expr| -> Result<(), Error> {
            let value = self.eval(expr)?;
            if !matches!(value, Value::Void) {
                writeln!(self.out, "{value}")?;
            }
            Ok(())
        });
        // An evaluation error takes precedence over a failed flush
        let flushed = self.out.flush();
        result?;
        flushed?;
        Ok(())
    }
}

#[cfg(all(test, feature = "scheme"))]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::ast::{nil, sym, val};
    use crate::scheme::parse_scheme;

    /// Test result variants for comprehensive tests
    #[derive(Debug)]
    enum TestResult {
        EvalResult(Value),           // Evaluation should succeed with this value
        SpecificError(&'static str), // Evaluation should fail with error containing this string
        AnyError,                    // Evaluation should fail (any error)
    }
    use TestResult::*;

    /// Helper for successful evaluation test cases
    fn success<T: Into<Value>>(value: T) -> TestResult {
        EvalResult(value.into())
    }

    /// Test cases that share one global frame, evaluated in order
    struct TestEnvironment(Vec<(&'static str, TestResult)>);

    /// Macro for setup expressions that return Void (like define)
    macro_rules! test_setup {
        ($expr:expr) => {
            ($expr, EvalResult(Value::Void))
        };
    }

    fn run_tests_in_environment(test_environments: Vec<TestEnvironment>) {
        for (env_idx, TestEnvironment(test_cases)) in test_environments.iter().enumerate() {
            let env = create_global_env();
            for (test_idx, (input, expected)) in test_cases.iter().enumerate() {
                let test_id = format!("Environment #{} test #{}", env_idx + 1, test_idx + 1);
                execute_test_case(input, expected, &env, &test_id);
            }
        }
    }

    fn run_comprehensive_tests(test_cases: Vec<(&str, TestResult)>) {
        for (i, (input, expected)) in test_cases.iter().enumerate() {
            let env = create_global_env();
            execute_test_case(input, expected, &env, &format!("#{}", i + 1));
        }
    }

    fn execute_test_case(input: &str, expected: &TestResult, env: &Environment, test_id: &str) {
        let expr = match parse_scheme(input) {
            Ok(expr) => expr,
            Err(parse_err) => {
                panic!("{test_id}: unexpected parse error for '{input}': {parse_err:?}");
            }
        };

        match (eval(&expr, env), expected) {
            (Ok(actual), EvalResult(expected_val)) => match (&actual, expected_val) {
                (Value::Void, Value::Void) => {}
                _ => assert!(
                    actual == *expected_val,
                    "{test_id}: '{input}' expected {expected_val:?}, got {actual:?}"
                ),
            },
            (Err(_), AnyError) => {}
            (Err(e), SpecificError(expected_text)) => {
                let error_msg = format!("{e}");
                assert!(
                    error_msg.contains(expected_text),
                    "{test_id}: error should contain '{expected_text}', got: {error_msg}"
                );
            }
            (Ok(actual), AnyError) => panic!("{test_id}: '{input}' expected error, got {actual:?}"),
            (Ok(actual), SpecificError(expected_text)) => panic!(
                "{test_id}: '{input}' expected error containing '{expected_text}', got {actual:?}"
            ),
            (Err(err), EvalResult(expected_val)) => {
                panic!("{test_id}: '{input}' expected {expected_val:?}, got error {err:?}")
            }
        }
    }

    fn eval_in(env: &Environment, input: &str) -> Result<Value, crate::Error> {
        eval(&parse_scheme(input).unwrap(), env)
    }

    #[test]
    fn test_comprehensive_operations_data_driven() {
        let test_cases = vec![
            // === SELF-EVALUATING FORMS ===
            ("42", success(42)),
            ("-271", success(-271)),
            ("2.5", success(2.5)),
            ("#t", success(true)),
            ("#f", success(false)),
            ("\"hello\"", success("hello")),
            ("\"\"", success("")),
            // === SYMBOLS ===
            ("car", EvalResult(eval(&sym("car"), &create_global_env()).unwrap())),
            ("undefined-thing", SpecificError("undefined-thing: undefined")),
            // === ARITHMETIC ===
            ("(+ 1 2)", success(3)),
            ("(+ 1 2.0)", success(3.0)),
            ("(+ 0.5 0.25)", success(0.75)),
            ("(* 1.5 2)", success(3.0)),
            ("(/ 4 2)", success(2)),
            ("(/ 1 4)", success(0.25)),
            ("(/ 5 0)", SpecificError("division by zero")),
            ("(* (+ 1 2) (- 5 2))", success(9)),
            // === CONDITIONALS ===
            ("(if #t 1 2)", success(1)),
            ("(if #f 1 2)", success(2)),
            ("(if (> 3 2) \"yes\" \"no\")", success("yes")),
            ("(if #t 1 (car '()))", success(1)),
            ("(if #f (car '()) 2)", success(2)),
            ("(if 1 2 3)", SpecificError("condition must be a boolean")),
            ("(if '() 2 3)", AnyError),
            ("(if #t 1)", SpecificError("Bad syntax")),
            ("(if #t 1 2 3)", SpecificError("Bad syntax")),
            ("(when #t 1 2 3)", success(3)),
            ("(when #f (car '()))", EvalResult(nil())),
            ("(when 0 1)", SpecificError("condition must be a boolean")),
            ("(when #t)", SpecificError("missing body")),
            ("(unless #f 1 2)", success(2)),
            ("(unless #t (car '()))", EvalResult(nil())),
            ("(unless \"no\" 1)", AnyError),
            // === QUOTE ===
            ("'a", success(sym("a"))),
            ("'(1 2 3)", success([1, 2, 3])),
            ("(quote (+ 1 2))", success(vec![sym("+"), val(1), val(2)])),
            ("'()", EvalResult(nil())),
            ("''a", success(vec![sym("quote"), sym("a")])),
            ("'(1 . 2)", EvalResult(Value::cons(val(1), val(2)))),
            ("(quote)", SpecificError("quote: expected 1 argument")),
            ("(quote 1 2)", SpecificError("Bad syntax")),
            // === LET ===
            ("(let ((x 1) (y 2)) (+ x y))", success(3)),
            ("(let ((x 1)) x (+ x 10))", success(11)),
            ("(let () 5)", success(5)),
            ("(let ((a 1) (b a)) b)", SpecificError("a: undefined")),
            ("(let ((a 1) (a 2)) a)", SpecificError("duplicate identifier in: a")),
            ("(let ((x 1)))", SpecificError("missing body")),
            ("(let)", SpecificError("Bad syntax")),
            ("(let ((1 2)) 3)", SpecificError("not an identifier")),
            ("(let (x) 3)", SpecificError("not an identifier")),
            ("(let ((x 1 2)) x)", AnyError),
            ("(let ((x 1)) (let ((x 2) (y x)) y))", success(1)),
            // === LAMBDA AND APPLICATION ===
            ("((lambda (x) x) 5)", success(5)),
            ("((lambda (x y) (+ x y)) 3 4)", success(7)),
            ("((lambda () 42))", success(42)),
            ("((lambda (x) 1 2 x) 3)", success(3)),
            ("(((lambda (x) (lambda (y) (+ x y))) 10) 5)", success(15)),
            ("((lambda (x y) x) 1)", SpecificError("expected 2 arguments but got 1")),
            ("((lambda (x y) x) 1 2 3)", SpecificError("expected 2 arguments but got 3")),
            ("(lambda (x x) x)", SpecificError("duplicate argument name")),
            ("(lambda (1) 1)", SpecificError("not an identifier")),
            ("(lambda args 1)", SpecificError("not an identifier list")),
            ("(lambda (x))", SpecificError("missing body")),
            ("(5 1)", SpecificError("not a procedure")),
            ("(\"f\")", SpecificError("not a procedure")),
            ("((quote car) '(1))", SpecificError("not a procedure")),
            ("()", SpecificError("missing procedure expression")),
            ("(+ 1 . 2)", SpecificError("proper list")),
            // === PRIMITIVES THROUGH THE EVALUATOR ===
            ("(car '(1 2))", success(1)),
            ("(cdr '(1 2))", success([2])),
            ("(car 5)", SpecificError("expected pair")),
            ("(cons 1 '(2))", success([1, 2])),
            ("(list 1 (+ 1 1) 3)", success([1, 2, 3])),
            ("(append '(1) '(2) '(3 4))", success([1, 2, 3, 4])),
            ("(append)", EvalResult(nil())),
            ("(null? '())", success(true)),
            ("(equal? (list 1 2) (list 1 2))", success(true)),
            ("(eq? (list 1 2) (list 1 2))", success(false)),
            ("(eq? '() '())", success(true)),
            ("(> 3 2 1)", success(true)),
            ("(> 3 3)", success(false)),
            ("(< 1 2 3)", success(true)),
            ("(< 1 2.5)", SpecificError("expected integer")),
            ("(car)", SpecificError("ArityError")),
            // === DEFINE ===
            ("(define x 5)", EvalResult(Value::Void)),
            ("(define (f) 1)", EvalResult(Value::Void)),
            ("(define x)", SpecificError("define")),
            ("(define 5 6)", SpecificError("define")),
            ("(define (5 x) 6)", SpecificError("not an identifier")),
            ("(define (f x))", SpecificError("missing body")),
            // === KEYWORDS ARE RESERVED ===
            ("(define if 1)", SpecificError("cannot rebind the keyword `if`")),
            ("(define (let x) x)", SpecificError("cannot rebind the keyword `let`")),
            ("(let ((quote 1)) quote)", SpecificError("cannot rebind")),
            ("(lambda (lambda) 1)", SpecificError("cannot rebind")),
            ("(lambda (define) 1)", SpecificError("cannot rebind")),
            // === DISPLAY ===
            ("(display)", SpecificError("ArityError")),
            ("(display 1 2)", SpecificError("ArityError")),
        ];

        run_comprehensive_tests(test_cases);
    }

    #[test]
    fn test_environment_sequences() {
        let environment_test_cases = vec![
            // Lexical scoping: free identifiers resolve in the defining frame
            TestEnvironment(vec![
                test_setup!("(define x 1)"),
                test_setup!("(define f (lambda () x))"),
                ("(let ((x 2)) (f))", success(1)),
                ("(let ((x 2)) x)", success(2)),
            ]),
            // Closures capture call frames
            TestEnvironment(vec![
                test_setup!("(define outer (lambda (a) (lambda (b) (+ a b))))"),
                test_setup!("(define add10 (outer 10))"),
                ("(add10 5)", success(15)),
                ("((outer 3) 7)", success(10)),
                ("(add10 -10)", success(0)),
            ]),
            // Closures capture let frames
            TestEnvironment(vec![
                test_setup!("(define counter-base (let ((base 100)) (lambda (n) (+ base n))))"),
                ("(counter-base 1)", success(101)),
                ("base", SpecificError("base: undefined")),
            ]),
            // Redefinition shadows, later forms see the newest binding
            TestEnvironment(vec![
                test_setup!("(define x 1)"),
                test_setup!("(define get-x (lambda () x))"),
                test_setup!("(define x 2)"),
                ("(get-x)", success(2)),
                ("x", success(2)),
            ]),
            // Parallel let sees outer bindings
            TestEnvironment(vec![
                test_setup!("(define a 10)"),
                ("(let ((a 1) (b a)) b)", success(10)),
                ("(let ((a 1) (b a)) a)", success(1)),
            ]),
            // Recursion through the global frame
            TestEnvironment(vec![
                test_setup!("(define (fact n) (if (< n 1) 1 (* n (fact (- n 1)))))"),
                ("(fact 0)", success(1)),
                ("(fact 10)", success(3628800)),
                test_setup!(
                    "(define (fib n) (if (< n 2) n (+ (fib (- n 1)) (fib (- n 2)))))"
                ),
                ("(fib 15)", success(610)),
            ]),
            // Mutual recursion
            TestEnvironment(vec![
                test_setup!("(define (is-even n) (if (= n 0) #t (is-odd (- n 1))))"),
                test_setup!("(define (is-odd n) (if (= n 0) #f (is-even (- n 1))))"),
                ("(is-even 10)", success(true)),
                ("(is-odd 7)", success(true)),
                ("(is-even 7)", success(false)),
            ]),
            // Recursive list processing
            TestEnvironment(vec![
                test_setup!(
                    "(define (my-length lst) (if (null? lst) 0 (+ 1 (my-length (cdr lst)))))"
                ),
                test_setup!(
                    "(define (my-map f lst)
                       (if (null? lst) '() (cons (f (car lst)) (my-map f (cdr lst)))))"
                ),
                ("(my-length '(a b c d))", success(4)),
                ("(my-map (lambda (x) (* x x)) '(1 2 3))", success([1, 4, 9])),
                ("(my-map car '((1 2) (3 4)))", success([1, 3])),
            ]),
            // Higher-order use of primitives
            TestEnvironment(vec![
                test_setup!("(define (twice f x) (f (f x)))"),
                test_setup!("(define plus +)"),
                ("(twice cdr '(1 2 3))", success([3])),
                ("(plus 1 2 3)", success(6)),
                ("((if #t + *) 2 3)", success(5)),
            ]),
            // Primitive names are ordinary bindings and may be shadowed
            TestEnvironment(vec![
                test_setup!("(define (car x) 'shadowed)"),
                ("(car '(1))", success(sym("shadowed"))),
                ("(let ((list 5)) list)", success(5)),
            ]),
            // define inside a body binds in the local frame
            TestEnvironment(vec![
                test_setup!("(define (f) (define y 3) (+ y 1))"),
                ("(f)", success(4)),
                ("y", SpecificError("y: undefined")),
            ]),
            // An error doesn't discard earlier definitions
            TestEnvironment(vec![
                test_setup!("(define kept 1)"),
                ("(car kept)", AnyError),
                ("kept", success(1)),
            ]),
        ];

        run_tests_in_environment(environment_test_cases);
    }

    #[test]
    fn test_specific_error_kinds() {
        let env = create_global_env();
        eval_in(&env, "(define (two a b) a)").unwrap();

        assert_eq!(
            eval_in(&env, "(two 1)"),
            Err(crate::Error::arity_error(2, 1))
        );
        assert_eq!(
            eval_in(&env, "(two 1 2 3)"),
            Err(crate::Error::arity_error(2, 3))
        );
        assert_eq!(
            eval_in(&env, "nope"),
            Err(crate::Error::UnboundIdentifier("nope".to_owned()))
        );
        assert_eq!(
            eval_in(&env, "(let ((a 1) (a 2)) a)"),
            Err(crate::Error::DuplicateBinding("a".to_owned()))
        );
        assert_eq!(
            eval_in(&env, "(/ 5 0)"),
            Err(crate::Error::DivisionByZero)
        );
        assert!(matches!(
            eval_in(&env, "(if 1 2 3)"),
            Err(crate::Error::TypeError(_))
        ));
        assert!(matches!(
            eval_in(&env, "(if 1 2)"),
            Err(crate::Error::BadSyntax(_))
        ));
        assert!(matches!(
            eval_in(&env, "(1 2)"),
            Err(crate::Error::NotApplicable(_))
        ));
        assert!(matches!(
            eval_in(&env, "(display 1 2)"),
            Err(crate::Error::ArityError { .. })
        ));
    }

    #[test]
    fn test_type_errors_carry_innermost_context() {
        let env = create_global_env();
        let err = eval_in(&env, "(list (+ 1 (car 5)))").unwrap_err();
        let msg = format!("{err}");
        assert!(msg.contains("while evaluating: (car 5)"), "{msg}");
        assert_eq!(msg.matches("Context:").count(), 1, "{msg}");
    }

    #[test]
    fn test_quote_shares_source_structure() {
        let env = create_global_env();
        let expr = parse_scheme("(quote (1 2 3))").unwrap();
        let quoted = expr.rest().unwrap().first().unwrap().clone();

        let result = eval(&expr, &env).unwrap();
        assert!(result.is_eq(&quoted));
        assert_eq!(result, val([1, 2, 3]));
    }

    #[test]
    fn test_self_evaluation_of_atoms() {
        let env = create_global_env();
        for atom in [val(7), val(-1.5), val(true), val("text")] {
            assert_eq!(eval(&atom, &env).unwrap(), atom);
        }
        let s = val("shared");
        assert!(eval(&s, &env).unwrap().is_eq(&s));
    }

    #[test]
    fn test_closure_captures_defining_frame() {
        let env = create_global_env();
        eval_in(&env, "(define (make) (lambda () 1))").unwrap();
        let closure = eval_in(&env, "(make)").unwrap();
        let Value::Closure(closure) = closure else {
            panic!("expected closure, got {closure:?}");
        };
        // The closure's frame is the call frame of `make`, whose parent is global
        let defining = closure.env.upgrade().unwrap();
        assert!(defining.parent().unwrap().ptr_eq(&env));
        assert_eq!(closure.params, Vec::<String>::new());
        assert_eq!(closure.body, vec![val(1)]);
    }

    #[test]
    fn test_procedures_print_opaquely() {
        let env = create_global_env();
        assert_eq!(
            eval_in(&env, "(lambda (x) x)").unwrap().to_string(),
            "#<procedure>"
        );
        assert_eq!(eval_in(&env, "car").unwrap().to_string(), "#<procedure:car>");
    }

    #[test]
    fn test_display_writes_to_interpreter_output() {
        let mut interp = Interpreter::with_output(Vec::new());
        interp.eval_str("(display \"hi\")").unwrap();
        assert_eq!(interp.output().as_slice(), b"hi");

        let result = interp.eval_str("(display '(1 \"a\")) (display 2.0)");
        assert!(matches!(result, Ok(Value::Void)));
        let output = String::from_utf8(interp.into_output()).unwrap();
        assert_eq!(output, "hi(1 \"a\")2.0");
    }

    /// Accepts every write, fails every flush
    struct FlushFails(Vec<u8>);

    impl Write for FlushFails {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::other("sink closed"))
        }
    }

    #[test]
    fn test_run_reports_evaluation_error_before_flush_error() {
        let mut interp = Interpreter::with_output(FlushFails(Vec::new()));
        assert!(matches!(
            interp.run("(display 1) (car '())"),
            Err(crate::Error::TypeError(_))
        ));
        // Without an evaluation error the flush failure is reported
        assert!(matches!(interp.run("2"), Err(crate::Error::Io(_))));
        assert_eq!(interp.into_output().0, b"12\n");
    }

    #[test]
    fn test_dropping_interpreter_frees_closures() {
        let mut interp = Interpreter::with_output(Vec::new());
        interp
            .run(
                "(define (countdown n) (if (= n 0) 'done (countdown (- n 1))))
                 (define (make-adder n) (lambda (m) (+ n m)))
                 (define add5 (make-adder 5))
                 (define (make-looper)
                   (define (loop n) (if (= n 0) 0 (loop (- n 1))))
                   loop)
                 (define looper (make-looper))",
            )
            .unwrap();
        assert_eq!(interp.eval_str("(add5 1)").unwrap(), val(6));
        assert_eq!(interp.eval_str("(looper 3)").unwrap(), val(0));

        let closures: Vec<std::rc::Weak<Closure>> = ["countdown", "add5", "looper"]
            .into_iter()
            .map(|name| match interp.environment().lookup(name).unwrap() {
                Value::Closure(closure) => Rc::downgrade(&closure),
                other => panic!("{name}: expected closure, got {other:?}"),
            })
            .collect();

        drop(interp);
        for closure in closures {
            assert!(closure.upgrade().is_none());
        }
    }

    #[test]
    fn test_closure_outliving_its_interpreter() {
        let mut interp = Interpreter::with_output(Vec::new());
        let add5 = interp.eval_str("(define (make-adder n) (lambda (m) (+ n m))) (make-adder 5)");
        let add5 = add5.unwrap();
        drop(interp);

        let mut other = Interpreter::with_output(Vec::new());
        assert!(matches!(
            other.apply(&add5, vec![val(1)]),
            Err(crate::Error::EvalError(msg)) if msg.contains("outlived")
        ));
    }

    #[test]
    fn test_interpreter_apply() {
        let mut interp = Interpreter::with_output(Vec::new());
        interp.eval_str("(define (add a b) (+ a b))").unwrap();
        let add = interp.environment().lookup("add").unwrap();
        assert_eq!(interp.apply(&add, vec![val(2), val(3)]).unwrap(), val(5));
        assert_eq!(
            interp.apply(&val(1), vec![]),
            Err(crate::Error::NotApplicable("1".to_owned()))
        );
    }

    #[test]
    fn test_register_builtin_function() {
        let env = create_global_env();
        env.register_builtin_function("sum-list", |args: &[Value]| match args {
            [list] => {
                let mut total = 0;
                for item in list.iter() {
                    total += i64::try_from(item)?;
                }
                Ok(Value::Integer(total))
            }
            _ => Err(crate::Error::arity_error(1, args.len())),
        });

        assert_eq!(eval_in(&env, "(sum-list '(1 2 3 4))").unwrap(), val(10));
        assert!(matches!(
            eval_in(&env, "(sum-list '(1 a))"),
            Err(crate::Error::TypeError(_))
        ));
    }

    #[test]
    fn test_evaluation_depth_limit() {
        let depth_test_environments = vec![TestEnvironment(vec![
            test_setup!("(define (deep n) (if (= n 0) 42 (+ 1 (deep (- n 1)))))"),
            ("(deep 10)", success(52)),
            ("(deep 5000)", success(5042)),
            ("(deep 100000)", SpecificError("depth limit exceeded")),
            // The frame is still usable afterwards
            ("(deep 3)", success(45)),
        ])];

        run_tests_in_environment(depth_test_environments);
    }

    #[test]
    fn test_configurable_depth_limit() {
        let mut interp =
            Interpreter::with_output(Vec::new()).with_config(EvalConfig { max_depth: 5 });
        interp.eval_str("(define (down n) (if (= n 0) 0 (down (- n 1))))").unwrap();

        // Five nested calls fit, a sixth does not
        assert_eq!(interp.eval_str("(down 4)").unwrap(), val(0));
        assert_eq!(
            interp.eval_str("(down 5)"),
            Err(crate::Error::StackOverflow { limit: 5 })
        );
        // Only calls count, not nested expressions
        assert_eq!(
            interp.eval_str("(+ 1 (+ 1 (+ 1 (+ 1 (+ 1 (+ 1 1))))))").unwrap(),
            val(7)
        );
    }
}
