// Purpose: Top-level package operations: init, pull, update, graph.
// Inputs/Outputs: Package directories and source strings in; files on disk and reporter lines out.
// Invariants: Every operation goes through one `Settings` and therefore one cache lock.
// Gotchas: `pull` always fetches fresh (cache disabled) and moves the result out of a scratch directory.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{PkgError, Result};
use crate::pkg::cache::ensure_dir;
use crate::pkg::dependency::Dependency;
use crate::pkg::fetch::{DepDownloader, Fetcher, copy_dir_all};
use crate::pkg::lockfile::LOCK_FILE;
use crate::pkg::modfile::{MOD_FILE, ModFile};
use crate::pkg::package::KclPkg;
use crate::pkg::resolve;
use crate::pkg::source::Source;
use crate::pkg::visitor::Visitor;
use crate::reporter::Reporter;
use crate::settings::Settings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullOptions {
    pub source: Source,
    pub local_path: PathBuf,
}

impl PullOptions {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            local_path: PathBuf::from("."),
        }
    }

    pub fn from_source_url(url: &str) -> Result<Self> {
        Ok(Self::new(Source::parse(url)?))
    }

    pub fn with_local_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_path = path.into();
        self
    }
}

pub struct KpmClient {
    settings: Settings,
    fetcher: Box<dyn Fetcher + Send + Sync>,
    reporter: Reporter,
    insecure_skip_tls_verify: bool,
}

impl KpmClient {
    pub fn new(settings: Settings) -> Self {
        Self {
            insecure_skip_tls_verify: settings.insecure_skip_tls_verify(),
            settings,
            fetcher: Box::new(DepDownloader),
            reporter: Reporter::default(),
        }
    }

    pub fn with_fetcher(mut self, fetcher: impl Fetcher + Send + Sync + 'static) -> Self {
        self.fetcher = Box::new(fetcher);
        self
    }

    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn set_insecure_skip_tls_verify(&mut self, insecure: bool) {
        self.insecure_skip_tls_verify = insecure;
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn load_package(&self, dir: &Path) -> Result<KclPkg> {
        KclPkg::load(dir, &self.settings)
    }

    fn visitor(&self, enable_cache: bool) -> Visitor<'_> {
        Visitor {
            settings: &self.settings,
            fetcher: self.fetcher.as_ref(),
            reporter: Some(&self.reporter),
            cache_root: self.settings.home().to_path_buf(),
            enable_cache,
            insecure_skip_tls_verify: self.insecure_skip_tls_verify,
        }
    }

    /// Create `kcl.mod` and an empty `kcl.mod.lock` in `dir`.
    pub fn init(&self, dir: &Path, name: Option<&str>) -> Result<KclPkg> {
        let mod_path = dir.join(MOD_FILE);
        if mod_path.exists() {
            return Err(PkgError::InvalidManifest {
                path: mod_path,
                message: "already exists".into(),
            });
        }
        ensure_dir(dir)?;
        let name = match name {
            Some(n) if !n.trim().is_empty() => n.trim().to_string(),
            _ => dir
                .canonicalize()
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
                .ok_or_else(|| {
                    PkgError::Config(format!(
                        "cannot infer a package name from {}",
                        dir.display()
                    ))
                })?,
        };
        let kpkg = KclPkg::new(dir, ModFile::new(&name), self.settings.default_registry());
        kpkg.save_mod_file()?;
        if !dir.join(LOCK_FILE).exists() {
            kpkg.save_lock_file()?;
        }
        self.reporter
            .report(&format!("package '{name}' initialized at {}", dir.display()));
        Ok(kpkg)
    }

    /// Fetch `opts.source` and place it under `opts.local_path/<source cache path>`.
    pub fn pull(&self, opts: &PullOptions) -> Result<KclPkg> {
        let source = &opts.source;
        let shown = source.to_display_string();
        self.reporter.report(&format!("start to pull {shown}"));

        let dest = opts.local_path.join(source.to_path());
        self.visitor(false).visit(source, |pkg| {
            let _guard = self.settings.lock_package_cache()?;
            if dest.exists() {
                fs::remove_dir_all(&dest)
                    .map_err(|e| PkgError::io(format!("replace {}", dest.display()), e))?;
            }
            if let Some(parent) = dest.parent() {
                ensure_dir(parent)?;
            }
            let moved = !source.is_local() && fs::rename(&pkg.home_path, &dest).is_ok();
            if !moved {
                copy_dir_all(&pkg.home_path, &dest).map_err(|e| PkgError::fetch(&shown, e))?;
            }
            self.reporter
                .report(&format!("pulled {} {} successfully", pkg.name(), pkg.version()));
            Ok(())
        })?;
        self.load_package(&dest)
    }

    /// Bring manifest and lock forward to the highest versions the graph asks for.
    pub fn update(&self, kpkg: &KclPkg) -> Result<KclPkg> {
        resolve::update(
            kpkg,
            &self.settings,
            self.fetcher.as_ref(),
            &self.reporter,
            self.insecure_skip_tls_verify,
        )
    }

    /// Text rendering of direct and transitive dependencies with cache status.
    pub fn graph(&self, kpkg: &KclPkg) -> String {
        let cache = self.settings.home();
        let line = |dep: &Dependency| {
            let cached = !dep.source.is_local() && cache.join(dep.source.to_path()).is_dir();
            format!(
                "  {} @ {} ({}) [cache: {}]",
                dep.name,
                if dep.version.is_empty() { "-" } else { dep.version.as_str() },
                dep.source.to_display_string(),
                if cached { "yes" } else { "no" }
            )
        };

        let mut out = String::new();
        let _ = writeln!(out, "main: {} {}", kpkg.name(), kpkg.version());
        let _ = writeln!(out, "direct:");
        let direct = kpkg.mod_file.dependencies.as_ref();
        match direct {
            Some(deps) if !deps.is_empty() => {
                for dep in deps.values() {
                    let shown = kpkg.lock_file.get(&dep.name).unwrap_or(dep);
                    let _ = writeln!(out, "{}", line(shown));
                }
            }
            _ => {
                let _ = writeln!(out, "  (none)");
            }
        }

        let _ = writeln!(out, "transitive:");
        let transitive: Vec<&Dependency> = kpkg
            .lock_file
            .dependencies
            .as_ref()
            .map(|lock| {
                lock.values()
                    .filter(|d| !direct.is_some_and(|m| m.contains(&d.name)))
                    .collect()
            })
            .unwrap_or_default();
        if transitive.is_empty() {
            let _ = writeln!(out, "  (none)");
        }
        for dep in transitive {
            let _ = writeln!(out, "{}", line(dep));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::fetch::testing::MemoryFetcher;
    use crate::reporter::testing::Captured;

    const HELLO: &str = "[package]\nname = \"helloworld\"\nedition = \"v0.9.0\"\n\
                         version = \"0.1.0\"\n\n[dependencies]\n";

    fn client(home: &Path, fetcher: MemoryFetcher, captured: &Captured) -> KpmClient {
        KpmClient::new(Settings::with_home(home).expect("settings"))
            .with_fetcher(fetcher)
            .with_reporter(Reporter::to_writer(captured.clone()))
    }

    #[test]
    fn pull_places_package_under_its_source_path() {
        let home = tempfile::tempdir().expect("home");
        let out = tempfile::tempdir().expect("out");
        let captured = Captured::default();
        let fetcher =
            MemoryFetcher::new().with_package("oci://ghcr.io/kcl-lang/helloworld?tag=0.1.0", HELLO);
        let kpm = client(home.path(), fetcher, &captured);

        let opts = PullOptions::from_source_url("oci://ghcr.io/kcl-lang/helloworld?tag=0.1.0")
            .expect("source")
            .with_local_path(out.path());
        let pkg = kpm.pull(&opts).expect("pull");

        let expected = out.path().join("ghcr.io").join("kcl-lang").join("helloworld").join("0.1.0");
        assert_eq!(pkg.home_path, expected);
        assert_eq!(pkg.name(), "helloworld");
        assert!(expected.join("kcl.mod").is_file());
        let lines = captured.lines();
        assert_eq!(
            lines.first().map(String::as_str),
            Some("start to pull oci://ghcr.io/kcl-lang/helloworld?tag=0.1.0")
        );
        assert_eq!(lines.last().map(String::as_str), Some("pulled helloworld 0.1.0 successfully"));
    }

    #[test]
    fn pull_copies_local_sources_and_leaves_them_intact() {
        let home = tempfile::tempdir().expect("home");
        let src = tempfile::tempdir().expect("src");
        let out = tempfile::tempdir().expect("out");
        fs::write(src.path().join("kcl.mod"), HELLO).expect("write kcl.mod");
        let captured = Captured::default();
        let kpm = client(home.path(), MemoryFetcher::new(), &captured);

        let opts = PullOptions::new(Source::parse(&src.path().to_string_lossy()).expect("source"))
            .with_local_path(out.path());
        let pkg = kpm.pull(&opts).expect("pull");
        assert!(pkg.home_path.starts_with(out.path()));
        assert!(src.path().join("kcl.mod").is_file());
    }

    #[test]
    fn init_writes_manifest_and_empty_lock_once() {
        let home = tempfile::tempdir().expect("home");
        let dir = tempfile::tempdir().expect("dir");
        let captured = Captured::default();
        let kpm = client(home.path(), MemoryFetcher::new(), &captured);

        let pkg = kpm.init(dir.path(), Some("demo")).expect("init");
        assert_eq!(pkg.name(), "demo");
        assert_eq!(pkg.version(), "0.0.1");
        assert!(dir.path().join("kcl.mod.lock").is_file());
        let loaded = kpm.load_package(dir.path()).expect("load");
        assert_eq!(loaded.mod_file.dependencies.map(|d| d.len()), Some(0));
        assert!(kpm.init(dir.path(), Some("demo")).is_err(), "second init must fail");
    }

    #[test]
    fn graph_lists_direct_then_transitive() {
        let home = tempfile::tempdir().expect("home");
        let dir = tempfile::tempdir().expect("dir");
        let captured = Captured::default();
        let fetcher = MemoryFetcher::new()
            .with_package(
                "localhost:5001/test/dep-a:1.0.0",
                "[package]\nname = \"dep-a\"\nversion = \"1.0.0\"\n\n[dependencies]\n\
                 dep-b = { oci = \"oci://localhost:5001/test/dep-b\", tag = \"2.0.0\" }\n",
            )
            .with_package(
                "localhost:5001/test/dep-b:2.0.0",
                "[package]\nname = \"dep-b\"\nversion = \"2.0.0\"\n\n[dependencies]\n",
            );
        let kpm = client(home.path(), fetcher, &captured);
        fs::write(
            dir.path().join("kcl.mod"),
            "[package]\nname = \"root\"\nversion = \"0.0.1\"\n\n[dependencies]\n\
             dep-a = { oci = \"oci://localhost:5001/test/dep-a\", tag = \"1.0.0\" }\n",
        )
        .expect("write kcl.mod");

        let pkg = kpm.load_package(dir.path()).expect("load");
        let updated = kpm.update(&pkg).expect("update");
        let graph = kpm.graph(&updated);
        assert_eq!(
            graph,
            "main: root 0.0.1\n\
             direct:\n  dep-a @ 1.0.0 (oci://localhost:5001/test/dep-a?tag=1.0.0) [cache: yes]\n\
             transitive:\n  \
             dep-b @ 2.0.0 (oci://localhost:5001/test/dep-b?tag=2.0.0) [cache: yes]\n"
        );
    }
}
