// Purpose: Define crate-level module surface for the KCL package manager.
// Inputs/Outputs: Exposes package operations for the binary and for library callers.
// Invariants: Library code reports through `Reporter` and returns `PkgError`; only `cli` prints errors.
// Gotchas: Keep module wiring consistent with src/main.rs.

pub mod cli;
pub mod error;
pub mod pkg;
pub mod reporter;
pub mod settings;
