// Purpose: Canonical identity of where a dependency's content comes from.
// Inputs/Outputs: Parses source strings / manifest descriptors; derives cache paths and display strings.
// Invariants: Exactly one backend per source; display strings never carry the module selector.
// Gotchas: Local paths stay as declared until `rooted_at` joins them against the owning package.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::{Url, form_urlencoded};

use crate::error::{PkgError, Result};
use crate::pkg::cache::url_hash;

/// Query key of the sub-package selector inside a git repository or OCI artifact.
pub const MOD_QUERY_KEY: &str = "mod";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModSpec {
    pub name: String,
    pub version: Option<String>,
}

impl ModSpec {
    pub fn parse(raw: &str) -> Option<Self> {
        let (name, version) = match raw.split_once(':') {
            Some((n, v)) => (n.trim(), Some(v.trim())),
            None => (raw.trim(), None),
        };
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            version: version.filter(|v| !v.is_empty()).map(str::to_string),
        })
    }
}

impl fmt::Display for ModSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}:{}", self.name, v),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitRef {
    Tag(String),
    Branch(String),
    Commit(String),
    Default,
}

impl GitRef {
    fn query_pair(&self) -> Option<(&'static str, &str)> {
        match self {
            GitRef::Tag(t) => Some(("tag", t)),
            GitRef::Branch(b) => Some(("branch", b)),
            GitRef::Commit(c) => Some(("commit", c)),
            GitRef::Default => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitSource {
    pub url: String,
    pub reference: GitRef,
    pub mod_spec: Option<ModSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OciSource {
    pub reg: String,
    pub repo: String,
    pub tag: Option<String>,
    pub mod_spec: Option<ModSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSource {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Git(GitSource),
    Oci(OciSource),
    Local(LocalSource),
}

/// Structured source as written in a `kcl.mod` dependency table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, rename = "mod", skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
}

fn git_ref_from(
    input: &str,
    tag: Option<&str>,
    branch: Option<&str>,
    commit: Option<&str>,
) -> Result<GitRef> {
    let given = [tag, branch, commit].iter().filter(|r| r.is_some()).count();
    if given > 1 {
        return Err(PkgError::malformed(
            input,
            "at most one of tag, branch and commit may be set",
        ));
    }
    let nonempty = |v: &str| -> Result<String> {
        if v.trim().is_empty() {
            return Err(PkgError::malformed(input, "empty git reference"));
        }
        if v.trim().starts_with('-') {
            return Err(PkgError::malformed(input, "git reference must not start with `-`"));
        }
        Ok(v.trim().to_string())
    };
    Ok(match (tag, branch, commit) {
        (Some(t), _, _) => GitRef::Tag(nonempty(t)?),
        (_, Some(b), _) => GitRef::Branch(nonempty(b)?),
        (_, _, Some(c)) => GitRef::Commit(nonempty(c)?),
        _ => GitRef::Default,
    })
}

fn mod_spec_from(input: &str, raw: Option<&str>) -> Result<Option<ModSpec>> {
    match raw {
        None => Ok(None),
        Some(r) => ModSpec::parse(r)
            .map(Some)
            .ok_or_else(|| PkgError::malformed(input, "empty module selector")),
    }
}

fn is_explicit_path(s: &str) -> bool {
    let b = s.as_bytes();
    let windows_drive = b.len() >= 2 && b[0].is_ascii_alphabetic() && b[1] == b':';
    s == "."
        || s == ".."
        || s.starts_with('/')
        || s.starts_with("./")
        || s.starts_with("../")
        || s.starts_with(".\\")
        || s.starts_with("..\\")
        || windows_drive
        || Path::new(s).is_absolute()
}

fn looks_like_registry_ref(s: &str) -> bool {
    match s.split_once('/') {
        Some((host, rest)) => {
            !rest.is_empty() && (host.contains('.') || host.contains(':') || host == "localhost")
        }
        None => false,
    }
}

/// Split `repo[:tag]` where only the last path segment may carry the tag.
fn split_repo_tag(repo: &str) -> (&str, Option<&str>) {
    let last_slash = repo.rfind('/').map(|i| i + 1).unwrap_or(0);
    match repo[last_slash..].rfind(':') {
        Some(i) => {
            let at = last_slash + i;
            (&repo[..at], Some(&repo[at + 1..]))
        }
        None => (repo, None),
    }
}

fn query_value<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

impl Source {
    /// Classify a single source string into exactly one backend.
    pub fn parse(input: &str) -> Result<Self> {
        let s = input.trim();
        if s.is_empty() {
            return Err(PkgError::malformed(input, "empty source"));
        }
        if s.contains("://") {
            let url = Url::parse(s).map_err(|e| PkgError::malformed(s, e.to_string()))?;
            return match url.scheme() {
                "oci" => Self::oci_from_url(s, &url),
                "http" | "https" | "git" | "ssh" => Self::git_from_url(s, &url),
                "file" => url
                    .to_file_path()
                    .map(|path| Source::Local(LocalSource { path }))
                    .map_err(|_| PkgError::malformed(s, "file URL is not a local path")),
                other => Err(PkgError::malformed(s, format!("unsupported scheme `{other}`"))),
            };
        }
        if s.starts_with("git@") {
            return Self::scp_git(s);
        }
        if s.contains('?') {
            return Err(PkgError::malformed(
                s,
                "query parameters are only accepted on URL sources",
            ));
        }
        if is_explicit_path(s) {
            return Ok(Source::Local(LocalSource {
                path: PathBuf::from(s),
            }));
        }
        if looks_like_registry_ref(s) {
            let (reg, rest) = s.split_once('/').unwrap_or((s, ""));
            let (repo, tag) = split_repo_tag(rest);
            return Self::oci(s, reg, repo, tag, None);
        }
        Ok(Source::Local(LocalSource {
            path: PathBuf::from(s),
        }))
    }

    /// Build a source from a manifest descriptor; exactly one of git/oci/path.
    pub fn from_descriptor(d: &SourceDescriptor) -> Result<Self> {
        let shown = format!("{d:?}");
        let backends = [&d.git, &d.oci, &d.path]
            .iter()
            .filter(|v| v.is_some())
            .count();
        if backends != 1 {
            return Err(PkgError::malformed(
                &shown,
                "exactly one of `git`, `oci` and `path` must be set",
            ));
        }
        if let Some(url) = &d.git {
            let mut src = match Source::parse(url)? {
                Source::Git(g) => g,
                _ => return Err(PkgError::malformed(&shown, "`git` is not a git URL")),
            };
            let reference = git_ref_from(
                &shown,
                d.tag.as_deref(),
                d.branch.as_deref(),
                d.commit.as_deref(),
            )?;
            if reference != GitRef::Default {
                if src.reference != GitRef::Default {
                    return Err(PkgError::malformed(&shown, "git reference given twice"));
                }
                src.reference = reference;
            }
            if d.module.is_some() {
                src.mod_spec = mod_spec_from(&shown, d.module.as_deref())?;
            }
            return Ok(Source::Git(src));
        }
        if let Some(oci) = &d.oci {
            if d.branch.is_some() || d.commit.is_some() {
                return Err(PkgError::malformed(
                    &shown,
                    "oci sources take a tag, not a branch or commit",
                ));
            }
            let mut src = match Source::parse(oci)? {
                Source::Oci(o) => o,
                _ => return Err(PkgError::malformed(&shown, "`oci` is not a registry reference")),
            };
            if let Some(tag) = &d.tag {
                src.tag = Some(tag.clone());
            }
            if d.module.is_some() {
                src.mod_spec = mod_spec_from(&shown, d.module.as_deref())?;
            }
            return Ok(Source::Oci(src));
        }
        let path = d.path.as_deref().unwrap_or_default();
        if path.trim().is_empty() {
            return Err(PkgError::malformed(&shown, "empty path"));
        }
        Ok(Source::Local(LocalSource {
            path: PathBuf::from(path),
        }))
    }

    fn oci(
        input: &str,
        reg: &str,
        repo: &str,
        tag: Option<&str>,
        mod_spec: Option<ModSpec>,
    ) -> Result<Self> {
        let repo = repo.trim_matches('/');
        if reg.is_empty() || repo.is_empty() {
            return Err(PkgError::malformed(input, "registry and repository are required"));
        }
        if tag.is_some_and(|t| t.is_empty()) {
            return Err(PkgError::malformed(input, "empty tag"));
        }
        Ok(Source::Oci(OciSource {
            reg: reg.to_string(),
            repo: repo.to_string(),
            tag: tag.map(str::to_string),
            mod_spec,
        }))
    }

    fn oci_from_url(input: &str, url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| PkgError::malformed(input, "missing registry host"))?;
        let reg = match url.port() {
            Some(p) => format!("{host}:{p}"),
            None => host.to_string(),
        };
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        let (repo, path_tag) = split_repo_tag(url.path().trim_matches('/'));
        let tag = match (path_tag, query_value(&pairs, "tag")) {
            (Some(a), Some(b)) if a != b => {
                return Err(PkgError::malformed(input, "conflicting tags"));
            }
            (a, b) => b.or(a),
        };
        let mod_spec = mod_spec_from(input, query_value(&pairs, MOD_QUERY_KEY))?;
        Self::oci(input, &reg, repo, tag, mod_spec)
    }

    fn git_from_url(input: &str, url: &Url) -> Result<Self> {
        if url.host_str().is_none() {
            return Err(PkgError::malformed(input, "missing git host"));
        }
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        let reference = git_ref_from(
            input,
            query_value(&pairs, "tag"),
            query_value(&pairs, "branch"),
            query_value(&pairs, "commit"),
        )?;
        let mod_spec = mod_spec_from(input, query_value(&pairs, MOD_QUERY_KEY))?;
        let mut base = url.clone();
        base.set_query(None);
        base.set_fragment(None);
        Ok(Source::Git(GitSource {
            url: base.to_string(),
            reference,
            mod_spec,
        }))
    }

    fn scp_git(input: &str) -> Result<Self> {
        let (base, query) = input.split_once('?').unwrap_or((input, ""));
        let Some((_, path)) = base.split_once(':') else {
            return Err(PkgError::malformed(input, "expected git@host:path"));
        };
        if path.trim_matches('/').is_empty() {
            return Err(PkgError::malformed(input, "missing repository path"));
        }
        let pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        Ok(Source::Git(GitSource {
            url: base.to_string(),
            reference: git_ref_from(
                input,
                query_value(&pairs, "tag"),
                query_value(&pairs, "branch"),
                query_value(&pairs, "commit"),
            )?,
            mod_spec: mod_spec_from(input, query_value(&pairs, MOD_QUERY_KEY))?,
        }))
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Source::Local(_))
    }

    pub fn local_path(&self) -> Option<&Path> {
        match self {
            Source::Local(l) => Some(&l.path),
            _ => None,
        }
    }

    /// Pinned sources name an immutable revision and may be served from cache.
    pub fn is_pinned(&self) -> bool {
        match self {
            Source::Git(g) => matches!(g.reference, GitRef::Tag(_) | GitRef::Commit(_)),
            Source::Oci(o) => o.tag.is_some(),
            Source::Local(_) => false,
        }
    }

    pub fn mod_spec(&self) -> Option<&ModSpec> {
        match self {
            Source::Git(g) => g.mod_spec.as_ref(),
            Source::Oci(o) => o.mod_spec.as_ref(),
            Source::Local(_) => None,
        }
    }

    /// Re-root a relative local path under `home`; other sources are returned as is.
    pub fn rooted_at(&self, home: &Path) -> Source {
        match self {
            Source::Local(l) if !l.path.is_absolute() => Source::Local(LocalSource {
                path: home.join(&l.path),
            }),
            other => other.clone(),
        }
    }

    /// Filesystem-safe path relative to the cache root.
    pub fn to_path(&self) -> PathBuf {
        let mut out = PathBuf::new();
        match self {
            Source::Git(g) => {
                let (host, path) = git_host_and_path(&g.url);
                out.push(escape_segment(&host));
                for seg in path.trim_end_matches(".git").split('/') {
                    if !seg.is_empty() {
                        out.push(escape_segment(seg));
                    }
                }
                out.push(match &g.reference {
                    GitRef::Tag(t) => escape_segment(t),
                    GitRef::Branch(b) => format!("branch-{}", escape_segment(b)),
                    GitRef::Commit(c) => {
                        let short: String = c.chars().take(12).collect();
                        format!("commit-{}", escape_segment(&short))
                    }
                    GitRef::Default => "HEAD".to_string(),
                });
            }
            Source::Oci(o) => {
                out.push(escape_segment(&o.reg));
                for seg in o.repo.split('/').filter(|s| !s.is_empty()) {
                    out.push(escape_segment(seg));
                }
                out.push(escape_segment(o.tag.as_deref().unwrap_or("latest")));
            }
            Source::Local(l) => {
                let name = l
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "root".to_string());
                let digest = url_hash(&l.path.to_string_lossy());
                out.push("local");
                out.push(format!("{}-{}", escape_segment(&name), &digest[..12]));
            }
        }
        out
    }

    /// Full source string, module selector included.
    pub fn to_source_string(&self) -> String {
        self.render(true)
    }

    /// Human-facing source string without the module selector.
    pub fn to_display_string(&self) -> String {
        self.render(false)
    }

    fn render(&self, with_mod: bool) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        let (base, mod_spec) = match self {
            Source::Git(g) => {
                if let Some((k, v)) = g.reference.query_pair() {
                    query.append_pair(k, v);
                }
                (g.url.clone(), g.mod_spec.as_ref())
            }
            Source::Oci(o) => {
                if let Some(tag) = &o.tag {
                    query.append_pair("tag", tag);
                }
                (format!("oci://{}/{}", o.reg, o.repo), o.mod_spec.as_ref())
            }
            Source::Local(l) => {
                let shown = if l.path.is_absolute() {
                    Url::from_file_path(&l.path)
                        .map(|u| u.to_string())
                        .unwrap_or_else(|_| l.path.display().to_string())
                } else {
                    l.path.display().to_string()
                };
                return shown;
            }
        };
        if with_mod && let Some(m) = mod_spec {
            query.append_pair(MOD_QUERY_KEY, &m.to_string());
        }
        let query = query.finish();
        if query.is_empty() {
            base
        } else {
            format!("{base}?{query}")
        }
    }

    /// Descriptor form used when writing the manifest.
    pub fn to_descriptor(&self) -> SourceDescriptor {
        let mut d = SourceDescriptor::default();
        match self {
            Source::Git(g) => {
                d.git = Some(g.url.clone());
                match &g.reference {
                    GitRef::Tag(t) => d.tag = Some(t.clone()),
                    GitRef::Branch(b) => d.branch = Some(b.clone()),
                    GitRef::Commit(c) => d.commit = Some(c.clone()),
                    GitRef::Default => {}
                }
                d.module = g.mod_spec.as_ref().map(|m| m.to_string());
            }
            Source::Oci(o) => {
                d.oci = Some(format!("oci://{}/{}", o.reg, o.repo));
                d.tag = o.tag.clone();
                d.module = o.mod_spec.as_ref().map(|m| m.to_string());
            }
            Source::Local(l) => {
                d.path = Some(l.path.to_string_lossy().replace('\\', "/"));
            }
        }
        d
    }
}

impl FromStr for Source {
    type Err = PkgError;

    fn from_str(s: &str) -> Result<Self> {
        Source::parse(s)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_string())
    }
}

fn git_host_and_path(url: &str) -> (String, String) {
    if let Ok(u) = Url::parse(url) {
        let host = match (u.host_str(), u.port()) {
            (Some(h), Some(p)) => format!("{h}:{p}"),
            (Some(h), None) => h.to_string(),
            (None, _) => "git".to_string(),
        };
        return (host, u.path().trim_matches('/').to_string());
    }
    // scp-like `git@host:org/repo.git`
    let rest = url.split_once('@').map(|(_, r)| r).unwrap_or(url);
    match rest.split_once(':') {
        Some((host, path)) => (host.to_string(), path.trim_matches('/').to_string()),
        None => ("git".to_string(), rest.to_string()),
    }
}

fn escape_segment(r: &str) -> String {
    let escaped: String = r
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '!'
            }
        })
        .collect();
    if escaped.is_empty() || escaped.chars().all(|c| c == '.') {
        return "!".repeat(escaped.len().max(1));
    }
    escaped
}
