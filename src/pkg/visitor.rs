// Purpose: Source -> files on disk -> loaded package -> caller continuation.
// Inputs/Outputs: A `Source`; the continuation receives the loaded `KclPkg` exactly once.
// Invariants: Cache writes happen only under the package cache lock; the lock is released before the continuation runs.
// Gotchas: With caching disabled the package lives in a temp dir that is deleted when `visit` returns.

use std::path::PathBuf;

use tempfile::TempDir;

use crate::error::{PkgError, Result};
use crate::pkg::fetch::{FetchOptions, Fetcher};
use crate::pkg::package::KclPkg;
use crate::pkg::source::Source;
use crate::reporter::Reporter;
use crate::settings::Settings;

pub struct Visitor<'a> {
    pub settings: &'a Settings,
    pub fetcher: &'a dyn Fetcher,
    pub reporter: Option<&'a Reporter>,
    pub cache_root: PathBuf,
    pub enable_cache: bool,
    pub insecure_skip_tls_verify: bool,
}

impl<'a> Visitor<'a> {
    fn fetch_options(&self, source: &Source) -> FetchOptions {
        FetchOptions {
            insecure_skip_tls_verify: self.insecure_skip_tls_verify
                || self.settings.insecure_skip_tls_verify(),
            plain_http: match source {
                Source::Oci(o) => self.settings.plain_http_for(&o.reg),
                _ => false,
            },
            credentials_file: Some(self.settings.credentials_file().to_path_buf()),
        }
    }

    fn scratch_dir() -> Result<TempDir> {
        tempfile::Builder::new()
            .prefix("kpm-")
            .tempdir()
            .map_err(|e| PkgError::io("create temporary directory", e))
    }

    fn fetch_remote(&self, source: &Source, dest: &std::path::Path) -> Result<()> {
        let _guard = self.settings.lock_package_cache()?;
        if self.enable_cache && source.is_pinned() && dest.is_dir() {
            tracing::debug!(source = %source, dest = %dest.display(), "package cache hit");
            return Ok(());
        }
        if let Some(r) = self.reporter {
            r.report(&format!("downloading {}", source.to_display_string()));
        }
        self.fetcher.fetch(source, dest, &self.fetch_options(source))
    }

    /// Materialise `source`, load it and hand it to `on_loaded`.
    pub fn visit<T, F>(&self, source: &Source, on_loaded: F) -> Result<T>
    where
        F: FnOnce(&KclPkg) -> Result<T>,
    {
        let mut _scratch: Option<TempDir> = None;
        let fetched_root = match source {
            Source::Local(l) if self.enable_cache => l.path.clone(),
            Source::Local(_) => {
                let tmp = Self::scratch_dir()?;
                let dest = tmp.path().join(source.to_path());
                self.fetcher.fetch(source, &dest, &self.fetch_options(source))?;
                _scratch = Some(tmp);
                dest
            }
            _ if self.enable_cache => {
                let dest = self.cache_root.join(source.to_path());
                self.fetch_remote(source, &dest)?;
                dest
            }
            _ => {
                let tmp = Self::scratch_dir()?;
                let dest = tmp.path().join(source.to_path());
                self.fetch_remote(source, &dest)?;
                _scratch = Some(tmp);
                dest
            }
        };

        let registry = self.settings.default_registry();
        let root = match source.mod_spec() {
            Some(m) => KclPkg::find_package_root(&fetched_root, &m.name, &registry)?,
            None => fetched_root,
        };
        let pkg = KclPkg::load_with_registry(&root, registry)?;
        tracing::debug!(
            name = pkg.name(),
            version = pkg.version(),
            root = %root.display(),
            "loaded package"
        );
        on_loaded(&pkg)
    }
}
