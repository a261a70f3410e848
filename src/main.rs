// Purpose: Binary entry for the kpm CLI.
// Inputs/Outputs: Reads process args and exits with the CLI dispatcher's code.
// Invariants: Main must not bypass centralized CLI argument/error handling.

fn main() {
    let code = kpm::cli::run_cli(std::env::args());
    std::process::exit(code);
}
