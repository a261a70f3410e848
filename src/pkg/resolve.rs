// Purpose: Walk a package's dependency graph and reconcile manifest and lock versions.
// Inputs/Outputs: A root source + resolve funcs; `update` rewrites kcl.mod / kcl.mod.lock in place.
// Invariants: Each (name, version) is expanded at most once per pass; versions only move forward.
// Gotchas: Funcs see every discovered edge, including repeats the visited set later prunes.

use std::cell::RefCell;
use std::collections::HashSet;
use std::path::PathBuf;

use crate::error::{PkgError, Result};
use crate::pkg::cache::dir_checksum_sha256;
use crate::pkg::dependency::{Dependency, DependencyMap};
use crate::pkg::fetch::Fetcher;
use crate::pkg::package::KclPkg;
use crate::pkg::source::Source;
use crate::pkg::version::version_less_than;
use crate::pkg::visitor::Visitor;
use crate::reporter::Reporter;
use crate::settings::Settings;

/// Called once per discovered edge with `(dependency, parent package)`.
pub type ResolveFunc<'a> = Box<dyn Fn(&Dependency, &KclPkg) -> Result<()> + 'a>;

pub struct ResolveOptions {
    pub source: Source,
    pub enable_cache: bool,
}

pub struct DepsResolver<'a> {
    pub default_cache_path: PathBuf,
    pub insecure_skip_tls_verify: bool,
    pub fetcher: &'a dyn Fetcher,
    pub settings: &'a Settings,
    pub reporter: &'a Reporter,
    pub resolve_funcs: Vec<ResolveFunc<'a>>,
}

type Visited = HashSet<(String, String)>;

impl<'a> DepsResolver<'a> {
    pub fn new(settings: &'a Settings, fetcher: &'a dyn Fetcher, reporter: &'a Reporter) -> Self {
        Self {
            default_cache_path: settings.home().to_path_buf(),
            insecure_skip_tls_verify: settings.insecure_skip_tls_verify(),
            fetcher,
            settings,
            reporter,
            resolve_funcs: Vec::new(),
        }
    }

    pub fn with_resolve_func<F>(mut self, f: F) -> Self
    where
        F: Fn(&Dependency, &KclPkg) -> Result<()> + 'a,
    {
        self.resolve_funcs.push(Box::new(f));
        self
    }

    fn visitor(&self, enable_cache: bool) -> Visitor<'_> {
        Visitor {
            settings: self.settings,
            fetcher: self.fetcher,
            reporter: Some(self.reporter),
            cache_root: self.default_cache_path.clone(),
            enable_cache,
            insecure_skip_tls_verify: self.insecure_skip_tls_verify,
        }
    }

    pub fn resolve(&self, opts: ResolveOptions) -> Result<()> {
        let mut visited = Visited::new();
        let visitor = self.visitor(opts.enable_cache);
        visitor.visit(&opts.source, |root| {
            visited.insert((root.name().to_string(), root.version().to_string()));
            self.resolve_deps_of(&visitor, root, &mut visited)
        })
    }

    fn resolve_deps_of(
        &self,
        visitor: &Visitor<'_>,
        parent: &KclPkg,
        visited: &mut Visited,
    ) -> Result<()> {
        let Some(deps) = &parent.mod_file.dependencies else {
            return Ok(());
        };
        for dep in deps.values() {
            let source = dep.source.rooted_at(&parent.home_path);
            let shown = source.to_display_string();
            visitor
                .visit(&source, |child| {
                    let version = if child.version().is_empty() {
                        dep.version.clone()
                    } else {
                        child.version().to_string()
                    };
                    let sum = dir_checksum_sha256(&child.home_path)?;
                    let discovered = Dependency::new(dep.name.clone(), version, source.clone())
                        .with_sum(Some(sum));
                    for f in &self.resolve_funcs {
                        f(&discovered, parent)?;
                    }
                    if visited.insert((discovered.name.clone(), discovered.version.clone())) {
                        self.resolve_deps_of(visitor, child, visited)?;
                    } else {
                        tracing::debug!(
                            name = %discovered.name,
                            version = %discovered.version,
                            "already expanded"
                        );
                    }
                    Ok(())
                })
                .map_err(|e| e.in_dependency(&dep.name, &shown))?;
        }
        Ok(())
    }
}

/// Advance `entry` to `candidate` when it is strictly older. Returns whether it moved.
fn advance_if_older(entry: &mut Dependency, candidate: &Dependency) -> Result<bool> {
    if version_less_than(&entry.version, &candidate.version)? {
        entry.advance_to(candidate);
        return Ok(true);
    }
    Ok(false)
}

fn skip_incomparable(outcome: Result<bool>, which: &str, dep: &Dependency) -> Result<()> {
    match outcome {
        Ok(_) => Ok(()),
        Err(PkgError::VersionComparisonFailure { left, right }) => {
            tracing::warn!(
                name = %dep.name,
                %left,
                %right,
                "skipping {which} update: versions are not comparable"
            );
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Maximum-version-wins reconciliation of one discovered dependency against both maps.
fn reconcile(
    mod_deps: &RefCell<DependencyMap>,
    lock_deps: &RefCell<DependencyMap>,
    dep: &Dependency,
) -> Result<()> {
    if let Some(entry) = mod_deps.borrow_mut().get_mut(&dep.name) {
        skip_incomparable(advance_if_older(entry, dep), "manifest", dep)?;
    }
    let mut lock = lock_deps.borrow_mut();
    match lock.get_mut(&dep.name) {
        Some(entry) => skip_incomparable(advance_if_older(entry, dep), "lock", dep)?,
        None => {
            lock.insert(dep.clone());
        }
    }
    Ok(())
}

/// Re-resolve every manifest dependency, moving manifest and lock entries forward.
pub fn update(
    kpkg: &KclPkg,
    settings: &Settings,
    fetcher: &dyn Fetcher,
    reporter: &Reporter,
    insecure_skip_tls_verify: bool,
) -> Result<KclPkg> {
    let mod_map = kpkg
        .mod_file
        .dependencies
        .clone()
        .ok_or_else(|| PkgError::MissingDependencySection {
            file: kpkg.mod_file_path().display().to_string(),
        })?;
    let lock_map = kpkg
        .lock_file
        .dependencies
        .clone()
        .ok_or_else(|| PkgError::MissingDependencySection {
            file: kpkg.lock_file_path().display().to_string(),
        })?;

    let mod_deps = RefCell::new(mod_map);
    let lock_deps = RefCell::new(lock_map);

    let mut resolver = DepsResolver::new(settings, fetcher, reporter)
        .with_resolve_func(|dep, _parent| reconcile(&mod_deps, &lock_deps, dep));
    resolver.insecure_skip_tls_verify |= insecure_skip_tls_verify;

    let names: Vec<String> = mod_deps.borrow().keys().cloned().collect();
    for name in names {
        let Some(declared) = mod_deps.borrow().get(&name).cloned() else {
            continue;
        };
        reconcile(&mod_deps, &lock_deps, &declared)?;
        let locked = lock_deps.borrow().get(&name).cloned();
        if let Some(locked) = locked {
            reconcile(&mod_deps, &lock_deps, &locked)?;
        }

        let Some(current) = mod_deps.borrow().get(&name).cloned() else {
            continue;
        };
        let source = current.source.rooted_at(&kpkg.home_path);
        let shown = source.to_display_string();
        resolver
            .resolve(ResolveOptions {
                source,
                enable_cache: true,
            })
            .map_err(|e| e.in_dependency(&name, &shown))?;
    }
    drop(resolver);

    let mut updated = kpkg.clone();
    let mod_map = mod_deps.into_inner();
    let lock_map = lock_deps.into_inner();
    let mod_changed = updated.mod_file.dependencies.as_ref() != Some(&mod_map);
    let lock_changed = updated.lock_file.dependencies.as_ref() != Some(&lock_map);
    updated.mod_file.dependencies = Some(mod_map);
    updated.lock_file.dependencies = Some(lock_map);

    if mod_changed {
        updated.save_mod_file()?;
        tracing::debug!(path = %updated.mod_file_path().display(), "manifest updated");
    }
    if lock_changed || !updated.lock_file_path().exists() {
        updated.save_lock_file()?;
        tracing::debug!(path = %updated.lock_file_path().display(), "lock file updated");
    }
    Ok(updated)
}
