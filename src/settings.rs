// Purpose: Read-only configuration for the package engine: home, registry defaults, TLS policy, cache lock.
// Inputs/Outputs: Environment variables layered over `<home>/.kpm/config/kpm.json`.
// Invariants: One `Settings` owns one cache lock; all cache mutation goes through it.
// Gotchas: Tests should build settings with `Settings::with_home` instead of mutating process env.

use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{PkgError, Result};
use crate::pkg::cache::{CacheLock, CacheLockGuard, ensure_dir};

pub const PKG_PATH_ENV: &str = "KCL_PKG_PATH";
pub const REG_ENV: &str = "KPM_REG";
pub const REPO_ENV: &str = "KPM_REPO";
pub const INSECURE_ENV: &str = "KPM_INSECURE_SKIP_TLS_VERIFY";

pub const CONFIG_DIR: &str = ".kpm/config";
pub const KPM_CONF_FILE: &str = "kpm.json";
pub const CREDENTIALS_FILE: &str = "config.json";
pub const PACKAGE_CACHE_LOCK: &str = "package-cache";

pub const DEFAULT_OCI_REGISTRY: &str = "ghcr.io";
pub const DEFAULT_OCI_REPO: &str = "kcl-lang";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KpmConf {
    #[serde(rename = "DefaultOciRegistry")]
    pub default_oci_registry: String,
    #[serde(rename = "DefaultOciRepo")]
    pub default_oci_repo: String,
    #[serde(rename = "DefaultOciPlainHttp", default)]
    pub default_oci_plain_http: bool,
}

impl Default for KpmConf {
    fn default() -> Self {
        Self {
            default_oci_registry: DEFAULT_OCI_REGISTRY.to_string(),
            default_oci_repo: DEFAULT_OCI_REPO.to_string(),
            default_oci_plain_http: false,
        }
    }
}

/// Registry coordinates used to expand `name = "version"` shorthand dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRegistry {
    pub reg: String,
    pub repo: String,
}

impl Default for DefaultRegistry {
    fn default() -> Self {
        Self {
            reg: DEFAULT_OCI_REGISTRY.to_string(),
            repo: DEFAULT_OCI_REPO.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct Settings {
    home: PathBuf,
    conf: KpmConf,
    credentials_file: PathBuf,
    insecure_skip_tls_verify: bool,
    cache_lock: CacheLock,
}

/// Default package home: `$KCL_PKG_PATH`, else the platform data directory.
pub fn default_home() -> Result<PathBuf> {
    if let Ok(p) = std::env::var(PKG_PATH_ENV) {
        let p = p.trim();
        if !p.is_empty() {
            return Ok(PathBuf::from(p));
        }
    }
    let pd = ProjectDirs::from("io", "kcl-lang", "kpm")
        .ok_or_else(|| PkgError::Config("cannot determine a home directory for kpm".into()))?;
    Ok(pd.data_dir().to_path_buf())
}

fn env_flag(name: &str) -> Option<bool> {
    let v = std::env::var(name).ok()?;
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn load_or_create_kpm_conf(path: &Path) -> Result<KpmConf> {
    if path.exists() {
        let text = fs::read_to_string(path).map_err(|e| PkgError::read(path, e))?;
        return serde_json::from_str(&text).map_err(|e| PkgError::InvalidManifest {
            path: path.to_path_buf(),
            message: e.to_string(),
        });
    }
    let conf = KpmConf::default();
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let text = serde_json::to_string_pretty(&conf)
        .map_err(|e| PkgError::Config(format!("serialize {KPM_CONF_FILE}: {e}")))?;
    fs::write(path, text).map_err(|e| PkgError::write(path, e))?;
    tracing::debug!(path = %path.display(), "created default kpm.json");
    Ok(conf)
}

impl Settings {
    /// Settings for the default home, honouring the environment overrides.
    pub fn load() -> Result<Self> {
        let mut settings = Self::with_home(default_home()?)?;
        if let Some(reg) = env_nonempty(REG_ENV) {
            settings.conf.default_oci_registry = reg;
        }
        if let Some(repo) = env_nonempty(REPO_ENV) {
            settings.conf.default_oci_repo = repo;
        }
        if let Some(insecure) = env_flag(INSECURE_ENV) {
            settings.insecure_skip_tls_verify = insecure;
        }
        Ok(settings)
    }

    /// Settings rooted at an explicit home; reads or creates `kpm.json` there.
    pub fn with_home(home: impl Into<PathBuf>) -> Result<Self> {
        let home = home.into();
        let config_dir = home.join(CONFIG_DIR);
        let conf = load_or_create_kpm_conf(&config_dir.join(KPM_CONF_FILE))?;
        Ok(Self {
            credentials_file: config_dir.join(CREDENTIALS_FILE),
            cache_lock: CacheLock::new(config_dir.join(PACKAGE_CACHE_LOCK)),
            insecure_skip_tls_verify: false,
            conf,
            home,
        })
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn credentials_file(&self) -> &Path {
        &self.credentials_file
    }

    pub fn default_oci_registry(&self) -> &str {
        &self.conf.default_oci_registry
    }

    pub fn default_oci_repo(&self) -> &str {
        &self.conf.default_oci_repo
    }

    pub fn default_registry(&self) -> DefaultRegistry {
        DefaultRegistry {
            reg: self.conf.default_oci_registry.clone(),
            repo: self.conf.default_oci_repo.clone(),
        }
    }

    pub fn insecure_skip_tls_verify(&self) -> bool {
        self.insecure_skip_tls_verify
    }

    pub fn set_insecure_skip_tls_verify(&mut self, insecure: bool) {
        self.insecure_skip_tls_verify = insecure;
    }

    /// Plain HTTP for the configured default registry when requested, and always for localhost.
    pub fn plain_http_for(&self, reg: &str) -> bool {
        let host = reg.split(':').next().unwrap_or(reg);
        (self.conf.default_oci_plain_http && reg == self.conf.default_oci_registry)
            || host == "localhost"
            || host == "127.0.0.1"
    }

    pub fn acquire_package_cache_lock(&self) -> Result<()> {
        self.cache_lock.acquire()
    }

    pub fn release_package_cache_lock(&self) -> Result<()> {
        self.cache_lock.release()
    }

    pub fn lock_package_cache(&self) -> Result<CacheLockGuard<'_>> {
        self.cache_lock.lock()
    }
}
