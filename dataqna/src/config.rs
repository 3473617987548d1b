//! Loop and sandbox configuration, stored as TOML.
//!
//! The allow-list and limits are built once at startup and passed by
//! reference into every validator and sandbox instance; nothing here is
//! ambient mutable state.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::sandbox::builtins;

/// Helper modules candidate programs may import with `use`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AllowList {
    pub modules: Vec<String>,
}

impl Default for AllowList {
    fn default() -> Self {
        Self {
            modules: builtins::KNOWN_MODULES
                .iter()
                .map(|m| m.to_string())
                .collect(),
        }
    }
}

impl AllowList {
    pub fn allows_module(&self, module: &str) -> bool {
        self.modules.iter().any(|m| m == module)
    }
}

/// Resource ceilings for one sandbox execution.
///
/// `max_ops` counts interpreter steps and iterated elements, so it bounds
/// both runtime and result size deterministically; the wall-clock timeout is
/// the backstop for pathological cases.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxLimits {
    pub timeout_ms: u64,
    pub max_ops: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_ops: 1_000_000,
        }
    }
}

impl SandboxLimits {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Configuration for one question-answering session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    /// Total candidate programs per session, the initial synthesis included.
    pub max_attempts: u32,

    /// Whether timeout/resource-exceeded outcomes are fed to the repairer
    /// like runtime errors. When false they end the session immediately.
    pub repair_limit_faults: bool,

    pub limits: SandboxLimits,

    pub allow: AllowList,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            repair_limit_faults: true,
            limits: SandboxLimits::default(),
            allow: AllowList::default(),
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.limits.timeout_ms == 0 {
            return Err(anyhow!("limits.timeout_ms must be > 0"));
        }
        if self.limits.max_ops == 0 {
            return Err(anyhow!("limits.max_ops must be > 0"));
        }
        for module in &self.allow.modules {
            if !builtins::is_known_module(module) {
                return Err(anyhow!("allow.modules contains unknown module '{module}'"));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        let cfg = LoopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LoopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, &buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
