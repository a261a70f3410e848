// Purpose: Typed error surface for resolution, fetch, cache locking and package loading.
// Inputs/Outputs: Every public operation returns `Result<T, PkgError>`.
// Invariants: Only `VersionComparisonFailure` may be absorbed by callers; all others abort.
// Gotchas: Transport internals speak anyhow; convert with `PkgError::fetch` at the fetcher edge.

use std::path::{Path, PathBuf};

pub type Result<T, E = PkgError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum PkgError {
    #[error("malformed source `{input}`: {reason}")]
    MalformedSource { input: String, reason: String },

    #[error("failed to fetch {origin}: {detail}")]
    FetchFailure { origin: String, detail: String },

    #[error("package cache lock: {0}")]
    LockAcquisitionFailure(String),

    #[error("{file} has no dependencies section")]
    MissingDependencySection { file: String },

    #[error("cannot compare versions `{left}` and `{right}`")]
    VersionComparisonFailure { left: String, right: String },

    #[error("invalid {}: {message}", path.display())]
    InvalidManifest { path: PathBuf, message: String },

    #[error("invalid settings: {0}")]
    Config(String),

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("dependency `{name}` ({origin}): {inner}")]
    Dependency {
        name: String,
        origin: String,
        #[source]
        inner: Box<PkgError>,
    },
}

impl PkgError {
    pub fn malformed(input: &str, reason: impl Into<String>) -> Self {
        Self::MalformedSource {
            input: input.to_string(),
            reason: reason.into(),
        }
    }

    pub fn fetch(origin: impl Into<String>, err: anyhow::Error) -> Self {
        Self::FetchFailure {
            origin: origin.into(),
            detail: format!("{err:#}"),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn read(path: &Path, source: std::io::Error) -> Self {
        Self::io(format!("read {}", path.display()), source)
    }

    pub fn write(path: &Path, source: std::io::Error) -> Self {
        Self::io(format!("write {}", path.display()), source)
    }

    pub fn in_dependency(self, name: &str, origin: &str) -> Self {
        // Keep the innermost dependency context; outer frames only repeat it.
        if matches!(self, Self::Dependency { .. }) {
            return self;
        }
        Self::Dependency {
            name: name.to_string(),
            origin: origin.to_string(),
            inner: Box::new(self),
        }
    }
}
