//! Configuration document loading and validation.
//!
//! The document is a single JSON file, loaded once at startup and immutable
//! afterwards. Resolution order for its path:
//!   1. `--config` CLI flag
//!   2. `REGILO_CONFIG` environment variable
//!   3. `/etc/regilo.json`
//!
//! The startup-marker directory resolves through `REGILO_STATE_PATH`, with
//! `/var/startup` as the default.

use anyhow::{Context, Result, bail};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/regilo.json";
pub const DEFAULT_STATE_PATH: &str = "/var/startup";

/// Resolve the configuration file path following the priority chain.
pub fn resolve_config_path(cli_config: Option<&str>) -> PathBuf {
    if let Some(path) = cli_config {
        return PathBuf::from(path);
    }
    if let Ok(path) = std::env::var("REGILO_CONFIG")
        && !path.is_empty()
    {
        return PathBuf::from(path);
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

/// Resolve the startup-marker directory.
pub fn resolve_state_path() -> PathBuf {
    if let Ok(path) = std::env::var("REGILO_STATE_PATH")
        && !path.is_empty()
    {
        return PathBuf::from(path);
    }
    PathBuf::from(DEFAULT_STATE_PATH)
}

/// Top-level configuration document.
///
/// The metadata keys (`title` through `contributors`) describe the container
/// image for humans; the supervision core only reads `environment`,
/// `startup`, `services`, and `periodic`. Mappings whose declared order is
/// significant deserialize into `IndexMap`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub description: Option<String>,
    pub repositories: Vec<String>,
    pub authors: Vec<String>,
    pub contributors: Vec<String>,
    /// Default environment values: used for template substitution and the
    /// generated `env` file. NOT injected into children.
    pub environment: IndexMap<String, String>,
    /// One-shot tasks executed in declared order before any service starts.
    pub startup: Vec<StartupTask>,
    /// Long-running services, keyed by name, in declared order.
    pub services: IndexMap<String, ServiceSpec>,
    /// Cron-scheduled transient tasks, keyed by name, in declared order.
    pub periodic: IndexMap<String, PeriodicSpec>,
}

/// A single startup task. The `type` tag selects the variant; a document
/// with an unknown type fails to deserialize, which is fatal.
///
/// `Serialize` is derived because the identity key (marker filename) is a
/// digest over the task's canonical JSON encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StartupTask {
    Exec(ExecTask),
    Template(TemplateTask),
    Tree(TreeTask),
}

impl StartupTask {
    pub fn description(&self) -> &str {
        match self {
            StartupTask::Exec(task) => &task.description,
            StartupTask::Template(task) => &task.description,
            StartupTask::Tree(task) => &task.description,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExecTask {
    pub description: String,
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default = "default_true")]
    pub output: bool,
    #[serde(default)]
    pub every_start: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TemplateTask {
    pub description: String,
    pub source: String,
    pub target: TemplateTarget,
    #[serde(default)]
    pub every_start: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateTarget {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Octal string, e.g. "0644".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeTask {
    pub description: String,
    pub tree: TreeSpec,
}

/// Nested directory specification: entry name to attributes.
pub type TreeSpec = IndexMap<String, TreeNode>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Octal string, e.g. "0750".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree: Option<TreeSpec>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServiceSpec {
    pub description: String,
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default = "default_true")]
    pub output: bool,
    /// Names of services that must be running before this one starts.
    #[serde(default)]
    pub needs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PeriodicSpec {
    pub description: String,
    /// Five-field cron expression; an empty string disables the entry.
    pub timing: String,
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default = "default_true")]
    pub output: bool,
    #[serde(default)]
    pub allow_multiple: bool,
}

fn default_true() -> bool {
    true
}

/// Load and validate the configuration document. Any failure here is fatal.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw =
        std::fs::read(path).with_context(|| format!("read configuration {}", path.display()))?;
    let config: Config = serde_json::from_slice(&raw)
        .with_context(|| format!("parse configuration {}", path.display()))?;
    validate(&config)?;
    Ok(config)
}

/// Structural checks beyond what serde enforces: dependency names resolve,
/// the dependency graph is acyclic, and every non-empty cron expression
/// parses.
pub fn validate(config: &Config) -> Result<()> {
    for (name, spec) in &config.services {
        for dep in &spec.needs {
            if !config.services.contains_key(dep) {
                bail!("service '{name}' needs undefined service '{dep}'");
            }
        }
    }

    let mut done = HashSet::new();
    for name in config.services.keys() {
        let mut visiting = Vec::new();
        check_cycle(name, &config.services, &mut visiting, &mut done)?;
    }

    for (name, spec) in &config.periodic {
        if spec.timing.is_empty() {
            continue;
        }
        crate::periodic::parse_schedule(&spec.timing)
            .with_context(|| format!("periodic '{name}'"))?;
    }

    Ok(())
}

fn check_cycle<'a>(
    name: &'a str,
    services: &'a IndexMap<String, ServiceSpec>,
    visiting: &mut Vec<&'a str>,
    done: &mut HashSet<&'a str>,
) -> Result<()> {
    if done.contains(name) {
        return Ok(());
    }
    if visiting.contains(&name) {
        bail!(
            "service dependency cycle: {} -> {name}",
            visiting.join(" -> ")
        );
    }
    visiting.push(name);
    if let Some(spec) = services.get(name) {
        for dep in &spec.needs {
            check_cycle(dep, services, visiting, done)?;
        }
    }
    visiting.pop();
    done.insert(name);
    Ok(())
}
