// Purpose: Package-management module root: sources, manifests, fetchers, resolution and client ops.
// Inputs/Outputs: Exposes the package workflow used by the CLI and by embedding callers.
// Invariants: Only `client` combines settings, fetcher and reporter; lower modules take them as arguments.
// Gotchas: `visitor` and `resolve` must not hold the cache lock across callbacks.

pub mod cache;
pub mod client;
pub mod dependency;
pub mod fetch;
pub mod lockfile;
pub mod modfile;
pub mod oci;
pub mod package;
pub mod resolve;
pub mod source;
pub mod vcs;
pub mod version;
pub mod visitor;
