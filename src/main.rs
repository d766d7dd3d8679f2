//! crudtx - nested transaction scopes over an ORM-style session
//!
//! This is the main entry point for the crudtx interactive shell.

use std::process::ExitCode;

use crudtx::config::Config;
use crudtx::db::{Outcome, Repl};
use crudtx::transaction::{ErrorPolicy, ExistingTxnPolicy};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    // Parse simple command line args.
    let mut config = Config::new();
    let mut verbose = false;
    let mut execute: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-v" | "--verbose" => {
                verbose = true;
            }
            "-p" | "--error-policy" => {
                i += 1;
                match args.get(i).map(|s| s.parse::<ErrorPolicy>()) {
                    Some(Ok(policy)) => config = config.error_policy(policy),
                    Some(Err(e)) => {
                        eprintln!("{}", e);
                        return ExitCode::FAILURE;
                    }
                    None => {
                        eprintln!("--error-policy needs a value");
                        return ExitCode::FAILURE;
                    }
                }
            }
            "-x" | "--existing-txn" => {
                i += 1;
                match args.get(i).map(|s| s.parse::<ExistingTxnPolicy>()) {
                    Some(Ok(policy)) => config = config.existing_txn_policy(policy),
                    Some(Err(e)) => {
                        eprintln!("{}", e);
                        return ExitCode::FAILURE;
                    }
                    None => {
                        eprintln!("--existing-txn needs a value");
                        return ExitCode::FAILURE;
                    }
                }
            }
            "-e" | "--execute" => {
                i += 1;
                if i < args.len() {
                    execute = Some(args[i].clone());
                }
            }
            "-h" | "--help" => {
                print_help();
                return ExitCode::SUCCESS;
            }
            "--version" => {
                println!("crudtx v{}", env!("CARGO_PKG_VERSION"));
                return ExitCode::SUCCESS;
            }
            arg => {
                eprintln!("Unknown option: {}", arg);
                return ExitCode::FAILURE;
            }
        }
        i += 1;
    }

    // RUST_LOG wins over -v.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("crudtx=debug")
        } else {
            EnvFilter::new("warn")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut repl = Repl::new(config);

    // Execute a script or run the REPL.
    if let Some(script) = execute {
        run_script(&mut repl, &script)
    } else {
        match repl.run() {
            Ok(_) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {}", e);
                ExitCode::FAILURE
            }
        }
    }
}

/// Run `;`-separated commands, stopping at the first error.
fn run_script(repl: &mut Repl, script: &str) -> ExitCode {
    for line in script.split(';').map(str::trim).filter(|l| !l.is_empty()) {
        match repl.execute(line) {
            Ok(Outcome::Continue(output)) => {
                if !output.is_empty() {
                    println!("{}", output);
                }
            }
            Ok(Outcome::Quit) => break,
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}

fn print_help() {
    println!("crudtx - nested transaction scopes over an ORM-style session");
    println!();
    println!("Usage: crudtx [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -p, --error-policy POLICY   Default error policy: raise | swallow (default: raise)");
    println!("  -x, --existing-txn POLICY   Unmanaged transactions: error | adopt_autobegin | adopt");
    println!("  -e, --execute SCRIPT        Run ';'-separated commands and exit");
    println!("  -v, --verbose               Log scope transitions (RUST_LOG overrides)");
    println!("  -h, --help                  Show this help message");
    println!("  --version                   Show version");
    println!();
    println!("Examples:");
    println!("  crudtx");
    println!("  crudtx -v -e '.model users email:text!*; open users; add {{\"email\": \"a@x.com\"}}; close; .journal'");
}
