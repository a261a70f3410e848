// Purpose: A KCL package on disk: its home directory, manifest and lock file.
// Inputs/Outputs: Loads `kcl.mod` + `kcl.mod.lock` from a directory; saves them back.
// Invariants: `home_path` is the directory containing `kcl.mod`.
// Gotchas: Local dependency paths in the manifest are relative to `home_path`.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{PkgError, Result};
use crate::pkg::lockfile::{LOCK_FILE, LockFile};
use crate::pkg::modfile::{MOD_FILE, ModFile};
use crate::settings::{DefaultRegistry, Settings};

#[derive(Debug, Clone, PartialEq)]
pub struct KclPkg {
    pub home_path: PathBuf,
    pub mod_file: ModFile,
    pub lock_file: LockFile,
    registry: DefaultRegistry,
}

impl KclPkg {
    pub fn load(home: &Path, settings: &Settings) -> Result<Self> {
        Self::load_with_registry(home, settings.default_registry())
    }

    pub fn load_with_registry(home: &Path, registry: DefaultRegistry) -> Result<Self> {
        let mod_path = home.join(MOD_FILE);
        if !mod_path.is_file() {
            return Err(PkgError::InvalidManifest {
                path: mod_path,
                message: "not found".into(),
            });
        }
        let mod_file = ModFile::load(&mod_path, &registry)?;
        let lock_file = LockFile::load(&home.join(LOCK_FILE))?;
        Ok(Self {
            home_path: home.to_path_buf(),
            mod_file,
            lock_file,
            registry,
        })
    }

    pub fn new(home: &Path, mod_file: ModFile, registry: DefaultRegistry) -> Self {
        Self {
            home_path: home.to_path_buf(),
            mod_file,
            lock_file: LockFile::empty(),
            registry,
        }
    }

    pub fn name(&self) -> &str {
        &self.mod_file.package.name
    }

    pub fn version(&self) -> &str {
        &self.mod_file.package.version
    }

    pub fn registry(&self) -> &DefaultRegistry {
        &self.registry
    }

    pub fn mod_file_path(&self) -> PathBuf {
        self.home_path.join(MOD_FILE)
    }

    pub fn lock_file_path(&self) -> PathBuf {
        self.home_path.join(LOCK_FILE)
    }

    pub fn save_mod_file(&self) -> Result<()> {
        self.mod_file.save(&self.mod_file_path(), &self.registry)
    }

    pub fn save_lock_file(&self) -> Result<()> {
        self.lock_file.save(&self.lock_file_path())
    }

    /// Find the directory under `root` whose `kcl.mod` names package `name`.
    pub fn find_package_root(
        root: &Path,
        name: &str,
        registry: &DefaultRegistry,
    ) -> Result<PathBuf> {
        let mut stack = vec![root.to_path_buf()];
        let mut seen = Vec::new();
        while let Some(dir) = stack.pop() {
            let manifest = dir.join(MOD_FILE);
            if manifest.is_file() {
                let m = ModFile::load(&manifest, registry)?;
                if m.package.name == name {
                    return Ok(dir);
                }
                seen.push(m.package.name);
            }
            let mut children: Vec<PathBuf> = fs::read_dir(&dir)
                .map_err(|e| PkgError::read(&dir, e))?
                .filter_map(|ent| ent.ok())
                .filter(|ent| ent.file_type().is_ok_and(|t| t.is_dir()))
                .map(|ent| ent.path())
                .filter(|p| p.file_name().and_then(|s| s.to_str()) != Some(".git"))
                .collect();
            // DirEntry::file_type does not follow links, so symlinked dirs are skipped.
            // Reverse so the stack visits children in name order.
            children.sort();
            children.reverse();
            stack.extend(children);
        }
        Err(PkgError::InvalidManifest {
            path: root.join(MOD_FILE),
            message: format!("no package named `{name}` found (saw: {})", seen.join(", ")),
        })
    }
}
