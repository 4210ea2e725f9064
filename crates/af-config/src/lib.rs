//! Site and per-branch project configuration, plus the ambient logging
//! initializer shared by every binary in the workspace.

mod error;
pub mod logging;

pub use error::{ConfigError, Result};

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Deployment-wide configuration: not tied to any one project or branch.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// First id of the subordinate uid/gid range granted to this deployment.
    pub subid_base: u32,
    /// arch -> setarch personality name, e.g. `"armhf" -> "linux32"`.
    #[serde(default)]
    pub setarch: BTreeMap<String, String>,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
}

fn default_mqtt_port() -> u16 {
    1883
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    /// `(arch, identity-suffix)` pairs, e.g. from a site config line like
    /// `arches = x86_64:default, aarch64:default`.
    #[serde(default)]
    pub arches: Vec<(String, String)>,
    /// Topic masks this agent is willing to build for.
    #[serde(default)]
    pub mask: Vec<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Base directory for per-(project,arch) container directories.
    pub containers: Option<std::path::PathBuf>,
    /// Base directory for per-project aportsdir checkouts.
    pub jobs: Option<std::path::PathBuf>,
    /// Registered projects this agent is willing to build jobs for, keyed
    /// by the `project` slug carried on every `Job`/`Task`. A job for a
    /// project absent from this table is rejected rather than attempted,
    /// since the agent has no clone URL or project config to build it with.
    #[serde(default)]
    pub projects: BTreeMap<String, AgentProjectConfig>,
}

fn default_concurrency() -> usize {
    1
}

/// Per-project source location the agent needs to build a job: where to
/// fetch the recipe tree from, and the per-branch project config file
/// (§6.4's `af/config`) to load once it's checked out.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentProjectConfig {
    pub clone_url: String,
    pub project_config: std::path::PathBuf,
}

impl SiteConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnFailure {
    Stop,
    Recalculate,
    Ignore,
}

impl Default for OnFailure {
    fn default() -> Self {
        OnFailure::Recalculate
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RootfsSource {
    pub url: String,
    pub sha256: String,
}

/// Per-branch project configuration (`af/config` on disk, one file per
/// branch, each section keyed as described in the source project).
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    pub repo: RepoSection,
    #[serde(default)]
    pub build: BuildSection,
    /// arch -> rootfs tarball location + expected digest.
    #[serde(default)]
    pub rootfs: BTreeMap<String, RootfsSource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepoSection {
    pub arch: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildSection {
    #[serde(default)]
    pub on_failure: OnFailure,
    /// Packages (as `repo/pkg` or bare `pkg`) never built on any arch.
    #[serde(default)]
    pub skip: Vec<String>,
    /// Arches (or `repo/pkg:arch` pairs) for which the sandbox should be
    /// granted networking for the whole task, beyond the per-recipe
    /// `options=...net...` opt-in.
    #[serde(default)]
    pub networking: Vec<String>,
}

impl ProjectConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn is_skipped(&self, startdir: &str) -> bool {
        let pkg = startdir.rsplit('/').next().unwrap_or(startdir);
        self.build
            .skip
            .iter()
            .any(|s| s == startdir || s == pkg)
    }
}
