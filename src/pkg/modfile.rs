// Purpose: Read and write the `kcl.mod` package manifest.
// Inputs/Outputs: TOML text <-> `ModFile` with an ordered dependency map.
// Invariants: Dependency order is the order written in the file; a missing `[dependencies]` stays `None`.
// Gotchas: `name = "1.0.0"` expands against the default registry, so rendering needs the same registry.

use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{PkgError, Result};
use crate::pkg::dependency::{Dependency, DependencyMap};
use crate::pkg::source::{OciSource, Source, SourceDescriptor};
use crate::settings::DefaultRegistry;

pub const MOD_FILE: &str = "kcl.mod";
pub const DEFAULT_EDITION: &str = "v0.9.0";
pub const DEFAULT_VERSION: &str = "0.0.1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSection {
    pub name: String,
    #[serde(default)]
    pub edition: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModFile {
    pub package: PackageSection,
    pub dependencies: Option<DependencyMap>,
    pub profile: Option<toml::Table>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DependencySpec {
    Version(String),
    Detailed(SourceDescriptor),
}

#[derive(Deserialize)]
struct RawModFile {
    package: PackageSection,
    #[serde(default)]
    dependencies: Option<IndexMap<String, DependencySpec>>,
    #[serde(default)]
    profile: Option<toml::Table>,
}

#[derive(Serialize)]
struct ProfileSection<'a> {
    profile: &'a toml::Table,
}

fn default_registry_source(name: &str, version: &str, reg: &DefaultRegistry) -> Source {
    Source::Oci(OciSource {
        reg: reg.reg.clone(),
        repo: format!("{}/{}", reg.repo, name),
        tag: Some(version.to_string()),
        mod_spec: None,
    })
}

fn is_default_registry_shorthand(dep: &Dependency, reg: &DefaultRegistry) -> bool {
    match &dep.source {
        Source::Oci(o) => {
            o.mod_spec.is_none()
                && o.reg == reg.reg
                && o.repo == format!("{}/{}", reg.repo, dep.name)
                && o.tag.as_deref() == Some(dep.version.as_str())
        }
        _ => false,
    }
}

fn dependency_from_spec(
    name: &str,
    spec: DependencySpec,
    reg: &DefaultRegistry,
) -> Result<Dependency> {
    match spec {
        DependencySpec::Version(v) => {
            let v = v.trim();
            if v.is_empty() {
                return Err(PkgError::malformed(name, "empty version"));
            }
            Ok(Dependency::new(name, v, default_registry_source(name, v, reg)))
        }
        DependencySpec::Detailed(d) => {
            let source = Source::from_descriptor(&d)?;
            let version = d
                .version
                .clone()
                .or_else(|| match &source {
                    Source::Local(_) => None,
                    _ => d.tag.clone(),
                })
                .unwrap_or_default();
            Ok(Dependency::new(name, version, source))
        }
    }
}

fn quote(s: &str) -> String {
    toml::Value::String(s.to_string()).to_string()
}

fn inline_descriptor(dep: &Dependency) -> String {
    let mut d = dep.source.to_descriptor();
    let tag_is_version = d.tag.as_deref() == Some(dep.version.as_str());
    if !dep.version.is_empty() && !(d.oci.is_some() || tag_is_version) {
        d.version = Some(dep.version.clone());
    }
    let fields = [
        ("git", &d.git),
        ("oci", &d.oci),
        ("path", &d.path),
        ("tag", &d.tag),
        ("branch", &d.branch),
        ("commit", &d.commit),
        ("version", &d.version),
        ("mod", &d.module),
    ];
    let body: Vec<String> = fields
        .iter()
        .filter_map(|(k, v)| v.as_ref().map(|v| format!("{k} = {}", quote(v))))
        .collect();
    format!("{{ {} }}", body.join(", "))
}

impl ModFile {
    /// Manifest for a freshly initialised package.
    pub fn new(name: &str) -> Self {
        Self {
            package: PackageSection {
                name: name.to_string(),
                edition: DEFAULT_EDITION.to_string(),
                version: DEFAULT_VERSION.to_string(),
                description: None,
            },
            dependencies: Some(DependencyMap::new()),
            profile: None,
        }
    }

    pub fn parse(toml_text: &str, origin: &Path, reg: &DefaultRegistry) -> Result<Self> {
        let invalid = |message: String| PkgError::InvalidManifest {
            path: origin.to_path_buf(),
            message,
        };
        let raw: RawModFile = toml::from_str(toml_text).map_err(|e| invalid(e.to_string()))?;
        let dependencies = match raw.dependencies {
            None => None,
            Some(specs) => {
                let mut map = DependencyMap::new();
                for (name, spec) in specs {
                    let dep = dependency_from_spec(&name, spec, reg)
                        .map_err(|e| invalid(format!("dependency `{name}`: {e}")))?;
                    map.insert(dep);
                }
                Some(map)
            }
        };
        Ok(Self {
            package: raw.package,
            dependencies,
            profile: raw.profile,
        })
    }

    pub fn load(path: &Path, reg: &DefaultRegistry) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| PkgError::read(path, e))?;
        Self::parse(&text, path, reg)
    }

    pub fn save(&self, path: &Path, reg: &DefaultRegistry) -> Result<()> {
        fs::write(path, self.to_pretty_toml(reg)?).map_err(|e| PkgError::write(path, e))
    }

    pub fn to_pretty_toml(&self, reg: &DefaultRegistry) -> Result<String> {
        let mut out = String::new();
        out.push_str("[package]\n");
        out.push_str(&format!("name = {}\n", quote(&self.package.name)));
        out.push_str(&format!("edition = {}\n", quote(&self.package.edition)));
        out.push_str(&format!("version = {}\n", quote(&self.package.version)));
        if let Some(desc) = &self.package.description {
            out.push_str(&format!("description = {}\n", quote(desc)));
        }

        if let Some(deps) = &self.dependencies {
            out.push_str("\n[dependencies]\n");
            for dep in deps.values() {
                let value = if is_default_registry_shorthand(dep, reg) {
                    quote(&dep.version)
                } else {
                    inline_descriptor(dep)
                };
                out.push_str(&format!("{} = {}\n", toml_key(&dep.name), value));
            }
        }

        if let Some(profile) = &self.profile {
            let text = toml::to_string(&ProfileSection { profile })
                .map_err(|e| PkgError::Config(format!("render [profile]: {e}")))?;
            out.push('\n');
            out.push_str(&text);
        }

        if !out.ends_with('\n') {
            out.push('\n');
        }
        Ok(out)
    }
}

fn toml_key(name: &str) -> String {
    if !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
    {
        name.to_string()
    } else {
        quote(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::source::GitRef;
    use std::path::PathBuf;

    fn origin() -> PathBuf {
        PathBuf::from("kcl.mod")
    }

    const MANIFEST: &str = r#"[package]
name = "app"
edition = "v0.9.0"
version = "0.1.0"

[dependencies]
k8s = "1.28"
helloworld = { oci = "oci://localhost:5001/test/helloworld", tag = "0.1.0" }
konfig = { git = "https://github.com/kcl-lang/konfig.git", tag = "v0.4.0" }
helper = { path = "../helper", version = "0.0.2" }

[profile]
entries = ["main.k"]
"#;

    #[test]
    fn parses_every_dependency_form_in_file_order() {
        let m = ModFile::parse(MANIFEST, &origin(), &DefaultRegistry::default()).expect("parse");
        assert_eq!(m.package.name, "app");
        let deps = m.dependencies.as_ref().expect("dependencies");
        let names: Vec<&str> = deps.keys().map(String::as_str).collect();
        assert_eq!(names, ["k8s", "helloworld", "konfig", "helper"]);

        let k8s = deps.get("k8s").expect("k8s");
        assert_eq!(k8s.source.to_display_string(), "oci://ghcr.io/kcl-lang/k8s?tag=1.28");
        assert_eq!(k8s.full_name, "k8s_1.28");

        let konfig = deps.get("konfig").expect("konfig");
        assert_eq!(konfig.version, "v0.4.0");
        assert!(matches!(
            &konfig.source,
            Source::Git(g) if g.reference == GitRef::Tag("v0.4.0".into())
        ));

        let helper = deps.get("helper").expect("helper");
        assert_eq!(helper.version, "0.0.2");
        assert_eq!(helper.source.local_path(), Some(Path::new("../helper")));
    }

    #[test]
    fn rendering_reparses_to_the_same_manifest() {
        let reg = DefaultRegistry::default();
        let m = ModFile::parse(MANIFEST, &origin(), &reg).expect("parse");
        let text = m.to_pretty_toml(&reg).expect("render");
        assert!(text.contains("k8s = \"1.28\"\n"), "{text}");
        assert!(text.contains("[profile]"), "{text}");
        let again = ModFile::parse(&text, &origin(), &reg).expect("reparse");
        assert_eq!(again, m);
        assert_eq!(again.to_pretty_toml(&reg).expect("render again"), text);
    }

    #[test]
    fn missing_dependency_section_is_distinct_from_empty() {
        let reg = DefaultRegistry::default();
        let absent = ModFile::parse("[package]\nname = \"a\"\n", &origin(), &reg).expect("parse");
        assert!(absent.dependencies.is_none());
        let empty = ModFile::parse("[package]\nname = \"a\"\n\n[dependencies]\n", &origin(), &reg)
            .expect("parse");
        assert_eq!(empty.dependencies, Some(DependencyMap::new()));
    }

    #[test]
    fn malformed_dependency_names_the_file_and_dependency() {
        let text = "[package]\nname = \"a\"\n\n[dependencies]\n\
                    bad = { git = \"https://x/y.git\", path = \"../y\" }\n";
        let err =
            ModFile::parse(text, &origin(), &DefaultRegistry::default()).expect_err("must fail");
        match err {
            PkgError::InvalidManifest { message, .. } => {
                assert!(message.contains("`bad`"), "{message}")
            }
            other => panic!("expected invalid manifest, got {other:?}"),
        }
    }

    #[test]
    fn new_manifest_has_defaults_and_empty_dependencies() {
        let m = ModFile::new("demo");
        let text = m.to_pretty_toml(&DefaultRegistry::default()).expect("render");
        assert_eq!(
            text,
            "[package]\nname = \"demo\"\nedition = \"v0.9.0\"\nversion = \"0.0.1\"\n\n[dependencies]\n"
        );
    }
}
