// Purpose: Read and write `kcl.mod.lock`, the resolved dependency set of a package.
// Inputs/Outputs: `[dependencies.<name>]` TOML tables <-> `DependencyMap`.
// Invariants: A missing lock file loads as an empty map; a present file without `[dependencies]` loads as `None`.
// Gotchas: Entries carry flattened source fields (git_tag, oci_tag, path, ...), not a nested descriptor.

use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{PkgError, Result};
use crate::pkg::dependency::{Dependency, DependencyMap};
use crate::pkg::source::{GitRef, GitSource, LocalSource, ModSpec, OciSource, Source};

pub const LOCK_FILE: &str = "kcl.mod.lock";

/// Lock file: every dependency of the package, direct and transitive, pinned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockFile {
    pub dependencies: Option<DependencyMap>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedDependency {
    pub name: String,
    pub full_name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, rename = "mod", skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RawLockFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dependencies: Option<IndexMap<String, LockedDependency>>,
}

impl LockedDependency {
    fn from_dependency(dep: &Dependency) -> Self {
        let mut out = Self {
            name: dep.name.clone(),
            full_name: dep.full_name.clone(),
            version: dep.version.clone(),
            sum: dep.sum.clone(),
            ..Default::default()
        };
        match &dep.source {
            Source::Git(g) => {
                out.url = Some(g.url.clone());
                match &g.reference {
                    GitRef::Tag(t) => out.git_tag = Some(t.clone()),
                    GitRef::Branch(b) => out.git_branch = Some(b.clone()),
                    GitRef::Commit(c) => out.git_commit = Some(c.clone()),
                    GitRef::Default => {}
                }
                out.module = g.mod_spec.as_ref().map(|m| m.to_string());
            }
            Source::Oci(o) => {
                out.reg = Some(o.reg.clone());
                out.repo = Some(o.repo.clone());
                out.oci_tag = o.tag.clone();
                out.module = o.mod_spec.as_ref().map(|m| m.to_string());
            }
            Source::Local(l) => {
                out.path = Some(l.path.to_string_lossy().replace('\\', "/"));
            }
        }
        out
    }

    fn into_dependency(self) -> Result<Dependency> {
        let mod_spec = match &self.module {
            Some(raw) => Some(
                ModSpec::parse(raw)
                    .ok_or_else(|| PkgError::malformed(raw, "empty module selector"))?,
            ),
            None => None,
        };
        let source = if let Some(url) = self.url {
            let reference = match (self.git_tag, self.git_branch, self.git_commit) {
                (Some(t), None, None) => GitRef::Tag(t),
                (None, Some(b), None) => GitRef::Branch(b),
                (None, None, Some(c)) => GitRef::Commit(c),
                (None, None, None) => GitRef::Default,
                _ => return Err(PkgError::malformed(&url, "more than one git reference locked")),
            };
            Source::Git(GitSource {
                url,
                reference,
                mod_spec,
            })
        } else if let (Some(reg), Some(repo)) = (self.reg, self.repo) {
            Source::Oci(OciSource {
                reg,
                repo,
                tag: self.oci_tag,
                mod_spec,
            })
        } else if let Some(path) = self.path {
            Source::Local(LocalSource {
                path: PathBuf::from(path),
            })
        } else {
            return Err(PkgError::malformed(&self.name, "locked dependency has no source"));
        };
        Ok(Dependency {
            name: self.name,
            full_name: self.full_name,
            version: self.version,
            sum: self.sum,
            source,
        })
    }
}

impl LockFile {
    pub fn empty() -> Self {
        Self {
            dependencies: Some(DependencyMap::new()),
        }
    }

    pub fn parse(toml_text: &str, origin: &Path) -> Result<Self> {
        let invalid = |message: String| PkgError::InvalidManifest {
            path: origin.to_path_buf(),
            message,
        };
        let raw: RawLockFile = toml::from_str(toml_text).map_err(|e| invalid(e.to_string()))?;
        let dependencies = match raw.dependencies {
            None => None,
            Some(locked) => {
                let mut map = DependencyMap::new();
                for (key, entry) in locked {
                    let dep = entry
                        .into_dependency()
                        .map_err(|e| invalid(format!("dependency `{key}`: {e}")))?;
                    if dep.name != key {
                        return Err(invalid(format!(
                            "dependency `{key}` is recorded under name `{}`",
                            dep.name
                        )));
                    }
                    map.insert(dep);
                }
                Some(map)
            }
        };
        Ok(Self { dependencies })
    }

    /// A missing lock file is an empty lock, not an absent section.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::empty());
        }
        let text = fs::read_to_string(path).map_err(|e| PkgError::read(path, e))?;
        Self::parse(&text, path)
    }

    pub fn to_toml(&self) -> Result<String> {
        let raw = RawLockFile {
            dependencies: self.dependencies.as_ref().map(|deps| {
                deps.iter()
                    .map(|(k, d)| (k.clone(), LockedDependency::from_dependency(d)))
                    .collect()
            }),
        };
        toml::to_string_pretty(&raw)
            .map_err(|e| PkgError::Config(format!("render {LOCK_FILE}: {e}")))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_toml()?).map_err(|e| PkgError::write(path, e))
    }

    pub fn get(&self, name: &str) -> Option<&Dependency> {
        self.dependencies.as_ref().and_then(|d| d.get(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCK: &str = r#"[dependencies.helloworld]
name = "helloworld"
full_name = "helloworld_0.1.0"
version = "0.1.0"
sum = "abc"
reg = "ghcr.io"
repo = "kcl-lang/helloworld"
oci_tag = "0.1.0"

[dependencies.konfig]
name = "konfig"
full_name = "konfig_v0.4.0"
version = "v0.4.0"
url = "https://github.com/kcl-lang/konfig.git"
git_tag = "v0.4.0"
"#;

    #[test]
    fn parses_locked_sources() {
        let lock = LockFile::parse(LOCK, Path::new(LOCK_FILE)).expect("parse");
        let hello = lock.get("helloworld").expect("helloworld");
        assert_eq!(hello.sum.as_deref(), Some("abc"));
        assert_eq!(hello.source.to_display_string(), "oci://ghcr.io/kcl-lang/helloworld?tag=0.1.0");
        let konfig = lock.get("konfig").expect("konfig");
        assert_eq!(
            konfig.source.to_display_string(),
            "https://github.com/kcl-lang/konfig.git?tag=v0.4.0"
        );
    }

    #[test]
    fn render_then_parse_keeps_order_and_content() {
        let lock = LockFile::parse(LOCK, Path::new(LOCK_FILE)).expect("parse");
        let text = lock.to_toml().expect("render");
        let again = LockFile::parse(&text, Path::new(LOCK_FILE)).expect("reparse");
        assert_eq!(again, lock);
        let names: Vec<&str> = again
            .dependencies
            .as_ref()
            .expect("dependencies")
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(names, ["helloworld", "konfig"]);
    }

    #[test]
    fn missing_file_is_empty_but_missing_section_is_absent() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let lock = LockFile::load(&tmp.path().join(LOCK_FILE)).expect("load missing");
        assert_eq!(lock.dependencies, Some(DependencyMap::new()));

        let absent = LockFile::parse("", Path::new(LOCK_FILE)).expect("parse empty text");
        assert!(absent.dependencies.is_none());
    }

    #[test]
    fn entry_without_source_is_rejected() {
        let text = "[dependencies.x]\nname = \"x\"\nfull_name = \"x_1\"\nversion = \"1\"\n";
        assert!(LockFile::parse(text, Path::new(LOCK_FILE)).is_err());
    }
}
