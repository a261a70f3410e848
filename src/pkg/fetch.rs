// Purpose: Fetch a source's files into a destination directory.
// Inputs/Outputs: `Source` + destination path; on success the destination holds the complete package.
// Invariants: Content is staged in a sibling `.partial` directory and renamed into place only when complete.
// Gotchas: Callers serialize cache writes with the package cache lock; fetchers do not lock.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, bail};

use crate::error::{PkgError, Result};
use crate::pkg::cache::ensure_dir;
use crate::pkg::source::Source;
use crate::pkg::{oci, vcs};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOptions {
    pub insecure_skip_tls_verify: bool,
    pub plain_http: bool,
    /// Docker-style `config.json` consulted for registry credentials.
    pub credentials_file: Option<PathBuf>,
}

pub trait Fetcher {
    fn fetch(&self, source: &Source, dest: &Path, opts: &FetchOptions) -> Result<()>;
}

/// Production fetcher: git CLI, OCI distribution API, or filesystem copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct DepDownloader;

impl Fetcher for DepDownloader {
    fn fetch(&self, source: &Source, dest: &Path, opts: &FetchOptions) -> Result<()> {
        tracing::debug!(source = %source, dest = %dest.display(), "fetching");
        staged(dest, |staging| match source {
            Source::Git(g) => vcs::fetch_git(g, staging, opts),
            Source::Oci(o) => oci::fetch_oci(o, staging, opts),
            Source::Local(l) => copy_dir_all(&l.path, staging),
        })
        .map_err(|e| PkgError::fetch(source.to_display_string(), e))
    }
}

fn staging_path(dest: &Path) -> anyhow::Result<PathBuf> {
    let name = dest
        .file_name()
        .with_context(|| format!("destination {} has no file name", dest.display()))?;
    let mut staged = name.to_os_string();
    staged.push(".partial");
    Ok(dest.with_file_name(staged))
}

/// Run `fill` against a fresh staging directory and move it onto `dest` when it succeeds.
pub fn staged<F>(dest: &Path, fill: F) -> anyhow::Result<()>
where
    F: FnOnce(&Path) -> anyhow::Result<()>,
{
    if let Some(parent) = dest.parent() {
        ensure_dir(parent)?;
    }
    let tmp = staging_path(dest)?;
    if tmp.exists() {
        fs::remove_dir_all(&tmp).with_context(|| format!("clear {}", tmp.display()))?;
    }
    ensure_dir(&tmp)?;
    if let Err(err) = fill(&tmp) {
        fs::remove_dir_all(&tmp).ok();
        return Err(err);
    }
    if dest.exists() {
        fs::remove_dir_all(dest).with_context(|| format!("replace {}", dest.display()))?;
    }
    fs::rename(&tmp, dest).with_context(|| format!("finalize {}", dest.display()))?;
    Ok(())
}

pub fn copy_dir_all(src: &Path, dst: &Path) -> anyhow::Result<()> {
    if !src.is_dir() {
        bail!("{} is not a directory", src.display());
    }
    ensure_dir(dst)?;
    for ent in fs::read_dir(src).with_context(|| format!("read_dir {}", src.display()))? {
        let ent = ent?;
        let from = ent.path();
        let to = dst.join(ent.file_name());
        let ty = ent.file_type()?;
        if ty.is_dir() {
            copy_dir_all(&from, &to)?;
        } else if ty.is_file() || (ty.is_symlink() && from.is_file()) {
            fs::copy(&from, &to)
                .with_context(|| format!("copy {} -> {}", from.display(), to.display()))?;
        } else if ty.is_symlink() {
            tracing::debug!(path = %from.display(), "skipping directory symlink");
        }
    }
    Ok(())
}

/// Reject absolute and parent-escaping paths from archives and annotations.
pub fn safe_rel_path(p: &Path) -> anyhow::Result<PathBuf> {
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::Normal(seg) => out.push(seg),
            Component::CurDir => {}
            Component::Prefix(_) | Component::RootDir | Component::ParentDir => {
                bail!("unsafe path in archive entry: {}", p.display())
            }
        }
    }
    Ok(out)
}
