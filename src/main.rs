// File: src/main.rs
//
// Command-line entry point for the Ape interpreter.
// Evaluates inline code with -e, runs a script file (remaining positionals
// become the global `args` array), or drops into the REPL.

use ape::repl::Repl;
use ape::{Context, Value};
use clap::Parser;

#[derive(Parser)]
#[command(
    name = "ape",
    about = "Ape: an embeddable scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    /// Evaluate an inline string of code
    #[arg(short = 'e', long = "eval", value_name = "CODE")]
    eval: Option<String>,

    /// Dump compiled bytecode before executing
    #[arg(short = 'd', long = "dump-bytecode")]
    dump_bytecode: bool,

    /// Script file to run; remaining values are passed to the script as
    /// the global `args` array
    #[arg(value_name = "FILE", trailing_var_arg = true, allow_hyphen_values = true)]
    files: Vec<String>,
}

fn print_errors(ctx: &Context) {
    for ix in 0..ctx.error_count() {
        if let Some(error) = ctx.get_error(ix) {
            eprint!("{}", error);
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let mut ctx = Context::new();
    ctx.set_dump_bytecode(cli.dump_bytecode);
    ctx.set_native_function("exit", |_vm, args| {
        let code = match args.first() {
            Some(Value::Number(n)) => *n as i32,
            _ => 0,
        };
        std::process::exit(code);
    });

    if !cli.files.is_empty() {
        let arg_values: Vec<Value> =
            cli.files.iter().map(|arg| ctx.make_string(arg.clone())).collect();
        let args_array = ctx.make_array(arg_values);
        ctx.set_global("args", args_array);
    }

    if let Some(code) = cli.eval {
        ctx.execute_source(&code);
        if ctx.has_errors() {
            print_errors(&ctx);
        }
    } else if let Some(file) = cli.files.first().cloned() {
        ctx.execute_file(&file);
        if ctx.has_errors() {
            print_errors(&ctx);
        }
    } else {
        match Repl::new() {
            Ok(mut repl) => {
                if let Err(err) = repl.run() {
                    eprintln!("REPL error: {}", err);
                    std::process::exit(1);
                }
            }
            Err(err) => {
                eprintln!("failed to start REPL: {}", err);
                std::process::exit(1);
            }
        }
    }
}
