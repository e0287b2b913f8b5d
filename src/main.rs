use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use schemexp::scheme::{ParseConfig, parse_program_with_config};
use schemexp::{Environment, EvalConfig, Interpreter, MAX_EVAL_DEPTH, ParseErrorKind, Value};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;

struct Options {
    eval_config: EvalConfig,
    parse_config: ParseConfig,
    filename: Option<PathBuf>,
}

fn print_usage() {
    println!("Usage: schemexp [options] [FILE]");
    println!("Runs FILE, or starts an interactive session when no file is given.");
    println!("Options:");
    println!("  -h, --help: Print this help message");
    println!("  --max-depth <n>: Limit on nested procedure calls (default: {MAX_EVAL_DEPTH})");
    println!("  --no-comments: Treat ';' as an ordinary character instead of a comment");
}

fn parse_options() -> Result<Options, String> {
    let mut args = pico_args::Arguments::from_env();

    if args.contains(["-h", "--help"]) {
        print_usage();
        process::exit(0);
    }

    let max_depth = match args.opt_value_from_str::<_, usize>("--max-depth") {
        Ok(Some(depth)) => depth,
        Ok(None) => MAX_EVAL_DEPTH,
        Err(e) => return Err(e.to_string()),
    };
    let handle_comments = !args.contains("--no-comments");

    let filename = args
        .opt_free_from_str::<PathBuf>()
        .map_err(|e| e.to_string())?;

    let remaining = args.finish();
    if !remaining.is_empty() {
        return Err(format!("unexpected arguments: {remaining:?}"));
    }

    Ok(Options {
        eval_config: EvalConfig { max_depth },
        parse_config: ParseConfig { handle_comments },
        filename,
    })
}

fn main() {
    env_logger::init();

    let options = match parse_options() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("schemexp: {e}");
            print_usage();
            process::exit(2);
        }
    };

    let interpreter = Interpreter::new().with_config(options.eval_config);
    match &options.filename {
        Some(path) => run_file(interpreter, path, options.parse_config),
        None => run_repl(interpreter, options.parse_config),
    }
}

/// Run a program file; the first error is reported and ends the process
fn run_file(mut interpreter: Interpreter, path: &Path, config: ParseConfig) {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("schemexp: cannot read {}: {e}", path.display());
            process::exit(1);
        }
    };

    log::debug!("loaded {} ({} bytes)", path.display(), source.len());
    let result = parse_program_with_config(&source, config)
        .and_then(|program| interpreter.run_program(&program));

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_repl(mut interpreter: Interpreter, config: ParseConfig) {
    println!("SchemeXP - a small strict Scheme evaluator");
    println!("Enter expressions like: (define (square x) (* x x))");
    println!("Type :help for more commands, or Ctrl+D to exit.");
    println!();

    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("schemexp: could not initialize line editor: {e}");
            process::exit(1);
        }
    };

    // Lines of an expression whose brackets are still open
    let mut pending = String::new();

    loop {
        let prompt = if pending.is_empty() {
            "schemexp> "
        } else {
            "      ... "
        };

        match rl.readline(prompt) {
            Ok(line) => {
                if pending.is_empty() {
                    let command = line.trim();
                    if command.is_empty() {
                        continue;
                    }
                    let _ = rl.add_history_entry(command);

                    match command {
                        ":help" => {
                            print_help();
                            continue;
                        }
                        ":env" => {
                            print_environment(interpreter.environment());
                            continue;
                        }
                        ":quit" | ":exit" => {
                            println!("Goodbye!");
                            break;
                        }
                        _ => {}
                    }
                } else {
                    let _ = rl.add_history_entry(line.trim());
                }

                pending.push_str(&line);
                pending.push('\n');

                let program = match parse_program_with_config(&pending, config) {
                    Ok(program) => program,
                    // Keep reading until the expression is complete
                    Err(schemexp::Error::ParseError(e)) if e.kind == ParseErrorKind::Incomplete => {
                        continue;
                    }
                    Err(e) => {
                        println!("Error: {e}");
                        pending.clear();
                        continue;
                    }
                };
                pending.clear();

                // An error ends this input only; the session and its definitions survive
                for expr in &program {
                    match interpreter.eval(expr) {
                        Ok(Value::Void) => {}
                        Ok(value) => println!("{value}"),
                        Err(e) => {
                            println!("Error: {e}");
                            break;
                        }
                    }
                }
                // Output from display may lack a trailing newline
                let _ = io::stdout().flush();
            }
            Err(ReadlineError::Interrupted) if !pending.is_empty() => {
                // Ctrl+C abandons a partial expression
                pending.clear();
            }
            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                println!("Error: {err:?}");
                break;
            }
        }
    }
}

fn print_help() {
    println!("Commands:");
    println!("  :help      - Show this help message");
    println!("  :env       - Show current environment bindings");
    println!("  :quit      - Exit the interpreter");
    println!("  :exit      - Exit the interpreter");
    println!("  Ctrl+D     - Exit the interpreter");
    println!();
    println!("Special forms: if, let, when, unless, quote ('x), lambda, define, display");
    println!("Procedures: + - * / = < > car cdr cons list append null? eq? equal? not");
    println!();
    println!("Examples:");
    println!("  (+ 1 2 3)");
    println!("  (let ((x 2) (y 3)) (* x y))");
    println!("  (define (fact n) (if (< n 1) 1 (* n (fact (- n 1)))))");
    println!("  (append '(1 2) '(3) 4)");
    println!();
}

fn print_environment(env: &Environment) {
    let bindings = env.get_all_bindings();

    if bindings.is_empty() {
        println!("Environment is empty.");
        return;
    }

    println!("Environment bindings ({} total):", bindings.len());
    println!();

    // Separate built-in procedures from user-defined values
    let (builtins, user_defined): (Vec<_>, Vec<_>) = bindings
        .iter()
        .partition(|(_, value)| matches!(value, Value::Primitive { .. }));

    // Procedures print opaquely, so only their names are listed
    let (procedures, values): (Vec<_>, Vec<_>) =
        user_defined.into_iter().partition(|(_, value)| value.is_procedure());

    if !procedures.is_empty() {
        let names: Vec<&str> = procedures.iter().map(|(name, _)| name.as_str()).collect();
        println!("User-defined procedures:");
        println!("  {}", names.join(" "));
        println!();
    }

    if !values.is_empty() {
        println!("User-defined values:");
        for (name, value) in &values {
            println!("  {name} = {value}");
        }
        println!();
    }

    let names: Vec<&str> = builtins.iter().map(|(name, _)| name.as_str()).collect();
    println!("Built-in procedures ({}):", names.len());
    println!("  {}", names.join(" "));
}
