// Purpose: Shared package-cache primitives: the cross-process cache lock and content checksums.
// Inputs/Outputs: Locks `<home>/.kpm/config/package-cache`; hashes package directories.
// Invariants: One holder at a time across threads and processes; a holder's whole critical section runs uninterrupted.
// Gotchas: The lock is not re-entrant; never hold it while running caller continuations.

use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::error::{PkgError, Result};

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p).map_err(|e| PkgError::io(format!("create {}", p.display()), e))
}

pub fn url_hash(url: &str) -> String {
    let mut h = Sha256::new();
    h.update(url.as_bytes());
    hex::encode(h.finalize())
}

fn collect_files(base: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir).map_err(|e| PkgError::read(dir, e))?;
    for ent in entries {
        let ent = ent.map_err(|e| PkgError::read(dir, e))?;
        let p = ent.path();
        let ty = ent.file_type().map_err(|e| PkgError::read(&p, e))?;
        if ty.is_symlink() {
            continue;
        }
        if ty.is_dir() {
            if p.file_name().and_then(|s| s.to_str()) == Some(".git") {
                continue;
            }
            collect_files(base, &p, out)?;
            continue;
        }
        if ty.is_file()
            && let Ok(rel) = p.strip_prefix(base)
        {
            out.push(rel.to_path_buf());
        }
    }
    Ok(())
}

/// Deterministic SHA-256 over relative paths and contents, ignoring `.git`.
pub fn dir_checksum_sha256(dir: &Path) -> Result<String> {
    let mut files = Vec::<PathBuf>::new();
    collect_files(dir, dir, &mut files)?;
    files.sort_by_key(|p| p.to_string_lossy().replace('\\', "/"));

    let mut hasher = Sha256::new();
    for rel in files {
        let rel_norm = rel.to_string_lossy().replace('\\', "/");
        hasher.update(b"F\0");
        hasher.update(rel_norm.as_bytes());
        hasher.update(b"\0");

        let full = dir.join(&rel);
        let mut f = File::open(&full).map_err(|e| PkgError::read(&full, e))?;
        let mut buf = [0u8; 8192];
        loop {
            let n = f.read(&mut buf).map_err(|e| PkgError::read(&full, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// File-backed exclusive lock over the whole package cache.
///
/// Each `acquire` opens its own descriptor, so the OS lock excludes other
/// threads of this process as well as other processes.
#[derive(Debug)]
pub struct CacheLock {
    path: PathBuf,
    held: Mutex<Option<File>>,
}

impl CacheLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            held: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // Precondition: the caller does not already hold this lock.
    // Postcondition: this caller is the only holder until `release`.
    // Side effects: creates the lock file and its parent directories.
    pub fn acquire(&self) -> Result<()> {
        let fail = |what: &str, e: std::io::Error| {
            PkgError::LockAcquisitionFailure(format!("{} {}: {}", what, self.path.display(), e))
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| fail("create parent of", e))?;
        }
        let f = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| fail("open", e))?;
        FileExt::lock_exclusive(&f).map_err(|e| fail("lock", e))?;

        let mut held = self.held.lock();
        if held.is_some() {
            return Err(PkgError::LockAcquisitionFailure(format!(
                "{} is already held by this handle",
                self.path.display()
            )));
        }
        *held = Some(f);
        tracing::debug!(lock = %self.path.display(), "acquired package cache lock");
        Ok(())
    }

    pub fn release(&self) -> Result<()> {
        let f = self.held.lock().take().ok_or_else(|| {
            PkgError::LockAcquisitionFailure(format!(
                "release of {} without a matching acquire",
                self.path.display()
            ))
        })?;
        FileExt::unlock(&f).map_err(|e| {
            PkgError::LockAcquisitionFailure(format!("unlock {}: {}", self.path.display(), e))
        })?;
        tracing::debug!(lock = %self.path.display(), "released package cache lock");
        Ok(())
    }

    /// Acquire and return a guard that releases on every exit path.
    pub fn lock(&self) -> Result<CacheLockGuard<'_>> {
        self.acquire()?;
        Ok(CacheLockGuard { lock: self })
    }
}

pub struct CacheLockGuard<'a> {
    lock: &'a CacheLock,
}

impl Drop for CacheLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.release() {
            tracing::warn!(%err, "failed to release package cache lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheLock, dir_checksum_sha256};
    use crate::error::PkgError;
    use parking_lot::Mutex;
    use std::fs;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn dir_checksum_is_stable_and_detects_content_change() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        fs::create_dir_all(root.join("sub")).expect("mkdir");
        fs::write(root.join("kcl.mod"), "[package]\nname = \"a\"\n").expect("write kcl.mod");
        fs::write(root.join("sub").join("main.k"), "a = 1").expect("write main.k");

        let c1 = dir_checksum_sha256(root).expect("checksum #1");
        let c2 = dir_checksum_sha256(root).expect("checksum #2");
        assert_eq!(c1, c2, "checksum should be deterministic for same content");

        fs::write(root.join("sub").join("main.k"), "a = 2").expect("rewrite main.k");
        let c3 = dir_checksum_sha256(root).expect("checksum #3");
        assert_ne!(c1, c3, "checksum must change when file content changes");
    }

    #[test]
    fn dir_checksum_ignores_git_directory() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        fs::create_dir_all(root.join(".git")).expect("mkdir .git");
        fs::write(root.join("kcl.mod"), "[package]\n").expect("write kcl.mod");
        fs::write(root.join(".git").join("HEAD"), "first").expect("write HEAD #1");

        let c1 = dir_checksum_sha256(root).expect("checksum #1");
        fs::write(root.join(".git").join("HEAD"), "second").expect("write HEAD #2");
        let c2 = dir_checksum_sha256(root).expect("checksum #2");
        assert_eq!(c1, c2, ".git content should not affect package checksum");
    }

    #[cfg(unix)]
    #[test]
    fn dir_checksum_skips_symlinks_instead_of_following_them() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        fs::write(root.join("kcl.mod"), "[package]\n").expect("write kcl.mod");
        let plain = dir_checksum_sha256(root).expect("checksum without links");

        std::os::unix::fs::symlink(root, root.join("loop")).expect("symlink");
        let linked = dir_checksum_sha256(root).expect("checksum terminates");
        assert_eq!(plain, linked);
    }

    #[test]
    fn release_without_acquire_fails() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let lock = CacheLock::new(tmp.path().join("package-cache"));
        let err = lock.release().expect_err("release must fail without acquire");
        assert!(matches!(err, PkgError::LockAcquisitionFailure(_)));

        lock.acquire().expect("acquire");
        lock.release().expect("release");
        assert!(lock.release().is_err(), "double release must fail");
    }

    fn run_two_sections<F>(acquire_release: F) -> Vec<String>
    where
        F: Fn(usize, &dyn Fn()) + Send + Sync + 'static,
    {
        let got = Arc::new(Mutex::new(Vec::<String>::new()));
        let section = Arc::new(acquire_release);
        let handles: Vec<_> = (1..=2)
            .map(|id| {
                let got = Arc::clone(&got);
                let section = Arc::clone(&section);
                thread::spawn(move || {
                    section(id, &|| {
                        for i in 0..10 {
                            got.lock().push(format!("section {id}: {i}"));
                            thread::sleep(Duration::from_millis(1));
                        }
                    });
                })
            })
            .collect();
        for h in handles {
            h.join().expect("worker panicked");
        }
        Arc::try_unwrap(got).expect("sole owner").into_inner()
    }

    fn expected_orders() -> (Vec<String>, Vec<String>) {
        let tagged = |id: usize| (0..10).map(move |i| format!("section {id}: {i}"));
        let one_first = tagged(1).chain(tagged(2)).collect();
        let two_first = tagged(2).chain(tagged(1)).collect();
        (one_first, two_first)
    }

    #[test]
    fn critical_sections_never_interleave_within_one_process() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let lock = Arc::new(CacheLock::new(tmp.path().join("package-cache")));
        let got = run_two_sections(move |_, body| {
            lock.acquire().expect("acquire");
            body();
            lock.release().expect("release");
        });
        let (one_first, two_first) = expected_orders();
        assert!(got == one_first || got == two_first, "interleaved: {got:?}");
    }

    #[test]
    fn critical_sections_never_interleave_across_independent_handles() {
        // Separate handles on one file behave like separate processes.
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join(".kpm").join("config").join("package-cache");
        let got = run_two_sections(move |_, body| {
            let lock = CacheLock::new(&path);
            let _guard = lock.lock().expect("lock");
            body();
        });
        let (one_first, two_first) = expected_orders();
        assert!(got == one_first || got == two_first, "interleaved: {got:?}");
    }
}
