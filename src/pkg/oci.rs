// Purpose: OCI distribution client for registry-backed dependency sources.
// Inputs/Outputs: `OciSource` + destination; pulls the manifest and unpacks every layer into the destination.
// Invariants: Every blob is checked against its sha256 digest before it touches the filesystem.
// Gotchas: Anonymous bearer tokens are fetched lazily on the first 401; untagged sources pick the greatest semver tag.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use flate2::read::GzDecoder;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::pkg::cache::ensure_dir;
use crate::pkg::fetch::{FetchOptions, safe_rel_path};
use crate::pkg::source::OciSource;
use crate::pkg::version::select_latest;

pub const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
                                   application/vnd.docker.distribution.manifest.v2+json";
const TITLE_ANNOTATION: &str = "org.opencontainers.image.title";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Deserialize)]
pub struct LayerDescriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageManifest {
    #[serde(default)]
    pub layers: Vec<LayerDescriptor>,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

/// Parse `Bearer realm="..",service="..",scope=".."` from a `WWW-Authenticate` header.
pub fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let rest = header.trim();
    let (scheme, params) = rest.split_once(char::is_whitespace)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let mut fields = BTreeMap::new();
    let mut s = params.trim();
    while !s.is_empty() {
        let (key, after) = s.split_once('=')?;
        let after = after.trim_start();
        let (value, tail) = if let Some(quoted) = after.strip_prefix('"') {
            let end = quoted.find('"')?;
            (&quoted[..end], &quoted[end + 1..])
        } else {
            let end = after.find(',').unwrap_or(after.len());
            (&after[..end], &after[end..])
        };
        fields.insert(key.trim().to_ascii_lowercase(), value.to_string());
        s = tail.trim_start().trim_start_matches(',').trim_start();
    }
    Some(BearerChallenge {
        realm: fields.remove("realm")?,
        service: fields.remove("service"),
        scope: fields.remove("scope"),
    })
}

#[derive(Debug, Default, Deserialize)]
struct CredentialsConfig {
    #[serde(default)]
    auths: BTreeMap<String, AuthEntry>,
}

#[derive(Debug, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
}

/// Stored base64 `user:password` for `reg` from a docker-style `config.json`, if any.
pub fn stored_auth(credentials_file: &Path, reg: &str) -> anyhow::Result<Option<String>> {
    if !credentials_file.is_file() {
        return Ok(None);
    }
    let text = fs::read_to_string(credentials_file)
        .with_context(|| format!("read {}", credentials_file.display()))?;
    let conf: CredentialsConfig = serde_json::from_str(&text)
        .with_context(|| format!("parse {}", credentials_file.display()))?;
    let entry = conf
        .auths
        .get(reg)
        .or_else(|| conf.auths.get(&format!("https://{reg}")));
    Ok(entry
        .and_then(|e| e.auth.as_deref())
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string))
}

pub fn verify_digest(digest: &str, bytes: &[u8]) -> anyhow::Result<()> {
    let expected = digest
        .strip_prefix("sha256:")
        .with_context(|| format!("unsupported digest algorithm in {digest}"))?;
    let actual = hex::encode(Sha256::digest(bytes));
    if !actual.eq_ignore_ascii_case(expected) {
        bail!("digest mismatch: expected {digest}, got sha256:{actual}");
    }
    Ok(())
}

fn is_gzip(bytes: &[u8]) -> bool {
    bytes.starts_with(&[0x1f, 0x8b])
}

fn looks_like_tar(layer: &LayerDescriptor) -> bool {
    let title = layer.annotations.get(TITLE_ANNOTATION).map(String::as_str).unwrap_or("");
    layer.media_type.contains("tar")
        || title.ends_with(".tar")
        || title.ends_with(".tgz")
        || title.ends_with(".tar.gz")
}

fn unpack_tar<R: Read>(reader: R, dest: &Path) -> anyhow::Result<()> {
    ensure_dir(dest)?;
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries().context("read tar entries")? {
        let mut entry = entry.context("read tar entry")?;
        let rel = safe_rel_path(&entry.path().context("tar entry path")?)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let kind = entry.header().entry_type();
        if kind.is_symlink() || kind.is_hard_link() {
            let target = entry
                .link_name()
                .context("tar link target")?
                .with_context(|| format!("link {} has no target", rel.display()))?;
            safe_rel_path(&target)
                .with_context(|| format!("unsafe link target for {}", rel.display()))?;
        }
        // unpack_in refuses to write through links that resolve outside `dest`.
        let placed = entry
            .unpack_in(dest)
            .with_context(|| format!("unpack {}", rel.display()))?;
        if !placed {
            bail!("unsafe path in archive entry: {}", rel.display());
        }
    }
    Ok(())
}

/// Verify and materialise one layer under `dest`.
pub fn unpack_layer(layer: &LayerDescriptor, bytes: &[u8], dest: &Path) -> anyhow::Result<()> {
    verify_digest(&layer.digest, bytes)?;
    if is_gzip(bytes) {
        return unpack_tar(GzDecoder::new(Cursor::new(bytes)), dest);
    }
    if looks_like_tar(layer) {
        return unpack_tar(Cursor::new(bytes), dest);
    }
    let name = match layer.annotations.get(TITLE_ANNOTATION) {
        Some(title) => safe_rel_path(Path::new(title))?,
        None => layer.digest.replace(':', "-").into(),
    };
    let out = dest.join(name);
    if let Some(parent) = out.parent() {
        ensure_dir(parent)?;
    }
    fs::write(&out, bytes).with_context(|| format!("write {}", out.display()))?;
    Ok(())
}

struct Registry<'a> {
    agent: ureq::Agent,
    base: String,
    repo: &'a str,
    basic_auth: Option<String>,
    token: Option<String>,
}

impl<'a> Registry<'a> {
    fn connect(src: &'a OciSource, opts: &FetchOptions) -> anyhow::Result<Self> {
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(opts.insecure_skip_tls_verify)
            .danger_accept_invalid_hostnames(opts.insecure_skip_tls_verify)
            .build()
            .context("build TLS connector")?;
        let agent = ureq::AgentBuilder::new()
            .timeout(REQUEST_TIMEOUT)
            .tls_connector(Arc::new(tls))
            .build();
        let scheme = if opts.plain_http { "http" } else { "https" };
        let basic_auth = match &opts.credentials_file {
            Some(path) => stored_auth(path, &src.reg).unwrap_or_else(|err| {
                tracing::warn!(%err, "ignoring unreadable registry credentials");
                None
            }),
            None => None,
        };
        Ok(Self {
            agent,
            base: format!("{scheme}://{}/v2/{}", src.reg, src.repo),
            repo: &src.repo,
            basic_auth,
            token: None,
        })
    }

    fn authenticate(&mut self, challenge: &str) -> anyhow::Result<()> {
        let c = parse_bearer_challenge(challenge)
            .with_context(|| format!("unsupported auth challenge `{challenge}`"))?;
        let mut req = self.agent.get(&c.realm);
        if let Some(service) = &c.service {
            req = req.query("service", service);
        }
        let scope = c
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull", self.repo));
        req = req.query("scope", &scope);
        if let Some(auth) = &self.basic_auth {
            req = req.set("Authorization", &format!("Basic {auth}"));
        }
        let resp: TokenResponse = req
            .call()
            .map_err(|e| anyhow!("token request to {} failed: {e}", c.realm))?
            .into_json()
            .context("decode token response")?;
        let token = resp
            .token
            .or(resp.access_token)
            .context("token response carried no token")?;
        self.token = Some(token);
        Ok(())
    }

    fn get(&mut self, path: &str, accept: Option<&str>) -> anyhow::Result<ureq::Response> {
        let url = format!("{}/{}", self.base, path);
        for attempt in 0..2 {
            let mut req = self.agent.get(&url);
            if let Some(a) = accept {
                req = req.set("Accept", a);
            }
            if let Some(t) = &self.token {
                req = req.set("Authorization", &format!("Bearer {t}"));
            }
            match req.call() {
                Ok(resp) => return Ok(resp),
                Err(ureq::Error::Status(401, resp)) if attempt == 0 && self.token.is_none() => {
                    let challenge = resp
                        .header("WWW-Authenticate")
                        .with_context(|| format!("GET {url}: 401 without challenge"))?
                        .to_string();
                    self.authenticate(&challenge)?;
                }
                Err(ureq::Error::Status(code, _)) => bail!("GET {url}: status {code}"),
                Err(e) => bail!("GET {url}: {e}"),
            }
        }
        bail!("GET {url}: unauthorized")
    }

    fn manifest(&mut self, tag: &str) -> anyhow::Result<ImageManifest> {
        self.get(&format!("manifests/{tag}"), Some(MANIFEST_ACCEPT))?
            .into_json()
            .with_context(|| format!("decode manifest {}:{tag}", self.repo))
    }

    fn blob(&mut self, digest: &str) -> anyhow::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.get(&format!("blobs/{digest}"), None)?
            .into_reader()
            .read_to_end(&mut buf)
            .with_context(|| format!("read blob {digest}"))?;
        Ok(buf)
    }

    fn tags(&mut self) -> anyhow::Result<Vec<String>> {
        let list: TagList = self
            .get("tags/list", None)?
            .into_json()
            .context("decode tag list")?;
        Ok(list.tags.unwrap_or_default())
    }
}

pub fn fetch_oci(src: &OciSource, dest: &Path, opts: &FetchOptions) -> anyhow::Result<()> {
    let mut registry = Registry::connect(src, opts)?;
    let tag = match &src.tag {
        Some(t) => t.clone(),
        None => {
            let tags = registry.tags()?;
            select_latest(tags.iter().map(String::as_str))
                .with_context(|| format!("{}/{} has no semver tags", src.reg, src.repo))?
        }
    };
    let manifest = registry.manifest(&tag)?;
    if manifest.layers.is_empty() {
        bail!("{}/{}:{tag} has no layers", src.reg, src.repo);
    }
    ensure_dir(dest)?;
    for layer in &manifest.layers {
        let bytes = registry.blob(&layer.digest)?;
        if layer.size != 0 && layer.size != bytes.len() as u64 {
            bail!(
                "layer {} size mismatch: expected {}, got {}",
                layer.digest,
                layer.size,
                bytes.len()
            );
        }
        unpack_layer(layer, &bytes, dest)?;
    }
    tracing::debug!(
        reg = %src.reg,
        repo = %src.repo,
        %tag,
        layers = manifest.layers.len(),
        "oci pull complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn tar_bytes(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, body) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, body.as_bytes())
                .expect("append tar entry");
        }
        builder.into_inner().expect("finish tar")
    }

    fn layer_for(bytes: &[u8], media_type: &str, title: Option<&str>) -> LayerDescriptor {
        let mut annotations = BTreeMap::new();
        if let Some(t) = title {
            annotations.insert(TITLE_ANNOTATION.to_string(), t.to_string());
        }
        LayerDescriptor {
            media_type: media_type.into(),
            digest: format!("sha256:{}", hex::encode(Sha256::digest(bytes))),
            size: bytes.len() as u64,
            annotations,
        }
    }

    #[test]
    fn unpacks_plain_and_gzipped_tar_layers() {
        let tar = tar_bytes(&[
            ("kcl.mod", "[package]\nname = \"helloworld\"\n"),
            ("main.k", "a = 1"),
        ]);
        let out = tempfile::tempdir().expect("out");
        unpack_layer(
            &layer_for(
                &tar,
                "application/vnd.oci.image.layer.v1.tar",
                Some("helloworld_0.1.0.tar"),
            ),
            &tar,
            out.path(),
        )
        .expect("unpack tar");
        assert!(out.path().join("kcl.mod").is_file());

        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&tar).expect("gzip");
        let gz = gz.finish().expect("finish gzip");
        let out2 = tempfile::tempdir().expect("out2");
        unpack_layer(&layer_for(&gz, "application/octet-stream", None), &gz, out2.path())
            .expect("unpack tar+gzip");
        assert_eq!(fs::read_to_string(out2.path().join("main.k")).expect("read"), "a = 1");
    }

    #[test]
    fn non_tar_layers_are_written_under_their_title() {
        let bytes = b"{\"name\":\"helloworld\"}";
        let out = tempfile::tempdir().expect("out");
        unpack_layer(
            &layer_for(bytes, "application/vnd.kcl.config.v1+json", Some("meta.json")),
            bytes,
            out.path(),
        )
        .expect("write raw layer");
        assert_eq!(fs::read(out.path().join("meta.json")).expect("read"), bytes);
    }

    #[test]
    fn digest_mismatch_is_rejected_before_writing() {
        let tar = tar_bytes(&[("kcl.mod", "x")]);
        let mut layer = layer_for(&tar, "application/vnd.oci.image.layer.v1.tar", None);
        layer.digest = format!("sha256:{}", "0".repeat(64));
        let out = tempfile::tempdir().expect("out");
        let err = unpack_layer(&layer, &tar, out.path()).expect_err("bad digest");
        assert!(err.to_string().contains("digest mismatch"), "{err}");
        assert!(!out.path().join("kcl.mod").exists());
    }

    #[test]
    fn tar_entries_escaping_the_destination_are_rejected() {
        // tar::Builder refuses `..`, so write the raw name into the header.
        let mut header = tar::Header::new_gnu();
        let body = b"pwned";
        header.as_gnu_mut().expect("gnu header").name[..12].copy_from_slice(b"../escape.k\0");
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        let mut builder = tar::Builder::new(Vec::new());
        builder.append(&header, &body[..]).expect("append raw");
        let tar = builder.into_inner().expect("finish");

        let out = tempfile::tempdir().expect("out");
        let nested = out.path().join("dest");
        let err = unpack_layer(
            &layer_for(&tar, "application/vnd.oci.image.layer.v1.tar", None),
            &tar,
            &nested,
        )
        .expect_err("escape rejected");
        assert!(err.to_string().contains("unsafe path"), "{err}");
        assert!(!out.path().join("escape.k").exists());
    }

    fn symlink_entry(name: &str, target: &Path) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_path(name).expect("link name");
        header.set_link_name(target).expect("link target");
        header.set_size(0);
        header.set_mode(0o777);
        header.set_cksum();
        header
    }

    #[test]
    fn symlinks_pointing_outside_the_destination_are_rejected() {
        let outside = tempfile::tempdir().expect("outside");
        let mut builder = tar::Builder::new(Vec::new());
        builder
            .append(&symlink_entry("link", outside.path()), std::io::empty())
            .expect("append link");
        let mut file = tar::Header::new_gnu();
        file.set_size(5);
        file.set_mode(0o644);
        file.set_cksum();
        builder
            .append_data(&mut file, "link/evil.k", &b"pwned"[..])
            .expect("append file");
        let tar = builder.into_inner().expect("finish");

        let out = tempfile::tempdir().expect("out");
        let err = unpack_layer(
            &layer_for(&tar, "application/vnd.oci.image.layer.v1.tar", None),
            &tar,
            out.path(),
        )
        .expect_err("absolute link target rejected");
        assert!(format!("{err:#}").contains("unsafe"), "{err:#}");
        assert!(!outside.path().join("evil.k").exists());
        assert!(!out.path().join("link").exists());
    }

    #[test]
    fn symlinks_inside_the_destination_are_kept() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut file = tar::Header::new_gnu();
        file.set_size(5);
        file.set_mode(0o644);
        file.set_cksum();
        builder
            .append_data(&mut file, "sub/main.k", &b"a = 1"[..])
            .expect("append file");
        builder
            .append(&symlink_entry("alias", Path::new("sub")), std::io::empty())
            .expect("append link");
        let tar = builder.into_inner().expect("finish");

        let out = tempfile::tempdir().expect("out");
        unpack_layer(
            &layer_for(&tar, "application/vnd.oci.image.layer.v1.tar", None),
            &tar,
            out.path(),
        )
        .expect("relative link inside dest");
        assert_eq!(
            fs::read_to_string(out.path().join("sub").join("main.k")).expect("read"),
            "a = 1"
        );
    }

    #[test]
    fn stored_auth_reads_docker_style_credentials() {
        let dir = tempfile::tempdir().expect("dir");
        let path = dir.path().join("config.json");
        assert_eq!(stored_auth(&path, "ghcr.io").expect("missing file"), None);

        fs::write(
            &path,
            r#"{"auths":{"ghcr.io":{"auth":"dXNlcjpwYXNz"},"https://localhost:5001":{"auth":"YTpi"},"empty.io":{}}}"#,
        )
        .expect("write config.json");
        assert_eq!(
            stored_auth(&path, "ghcr.io").expect("read"),
            Some("dXNlcjpwYXNz".to_string())
        );
        assert_eq!(
            stored_auth(&path, "localhost:5001").expect("read"),
            Some("YTpi".to_string())
        );
        assert_eq!(stored_auth(&path, "empty.io").expect("read"), None);
        assert_eq!(stored_auth(&path, "docker.io").expect("read"), None);

        fs::write(&path, "not json").expect("write");
        assert!(stored_auth(&path, "ghcr.io").is_err());
    }

    #[test]
    fn parses_bearer_challenges() {
        let c = parse_bearer_challenge(
            r#"Bearer realm="https://ghcr.io/token",service="ghcr.io",scope="repository:kcl-lang/helloworld:pull""#,
        )
        .expect("challenge");
        assert_eq!(
            c,
            BearerChallenge {
                realm: "https://ghcr.io/token".into(),
                service: Some("ghcr.io".into()),
                scope: Some("repository:kcl-lang/helloworld:pull".into()),
            }
        );
        assert!(parse_bearer_challenge(r#"Basic realm="x""#).is_none());
        assert!(parse_bearer_challenge(r#"Bearer service="x""#).is_none());
    }
}
