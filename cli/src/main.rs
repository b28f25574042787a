//! Command-line entry point for hammer.
// Good defaults
#![forbid(unused_must_use)]
#![deny(unsafe_code)]

use anyhow::Result;

fn run() -> Result<()> {
    hammer_utils::initialize_tracing();
    tracing::trace!("starting");
    hammer_lib::cli::run_from_iter(std::env::args())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}
