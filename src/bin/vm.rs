//! `vm <file>` — assemble and run a source file (spec §6)
//!
//! Grounded on the teacher's `src/main.rs` CLI shape (manual
//! `env::args()` parsing, a usage message on stderr, `process::exit`
//! with a non-zero code on failure) rather than a clap-based parser,
//! since the teacher never reaches for one.

use std::process::ExitCode;

use stackvm::assembler::{self, AssembleError};
use stackvm::trampoline::X64HostCaller;
use stackvm::vm::Vm;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        eprintln!("usage: {} <file>", args.first().map(String::as_str).unwrap_or("vm"));
        return ExitCode::FAILURE;
    }

    let path = &args[1];
    let code = match assembler::assemble_from_file(path) {
        Ok(code) => code,
        Err(AssembleError::Failed) => return ExitCode::FAILURE,
        Err(error) => {
            stackvm::logging::error(error.to_string());
            return ExitCode::FAILURE;
        }
    };

    let mut vm = Vm::new(&code, Box::new(X64HostCaller::new()));
    match vm.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            stackvm::logging::error(error.to_string());
            ExitCode::FAILURE
        }
    }
}
