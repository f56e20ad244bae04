//! Waypoint configuration stored in `waypoint.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::budget::Budgets;
use crate::io::atomic::write_atomic;
use crate::io::skills::SkillConfig;

/// Waypoint configuration (TOML).
///
/// Edited by humans; every section is optional and falls back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WaypointConfig {
    pub budgets: Budgets,
    pub gates: GatesConfig,
    pub agent: AgentConfig,
    pub runs: RunsConfig,
    /// Reference documents offered to the planner.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skills: Vec<SkillConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatesConfig {
    /// Gates run on every build, in this order.
    pub default: Vec<String>,
    /// Every known gate by name.
    pub optional: BTreeMap<String, GateSpecConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateSpecConfig {
    pub command: Vec<String>,
    #[serde(default = "default_gate_timeout")]
    pub timeout_seconds: u64,
}

fn default_gate_timeout() -> u64 {
    300
}

/// A resolved, runnable gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateSpec {
    pub name: String,
    pub command: Vec<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Argv of the planner/executor process; the prompt arrives on stdin.
    pub command: Vec<String>,
    pub timeout_seconds: u64,
    /// Truncate captured agent output beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string(), "-p".to_string()],
            timeout_seconds: 30 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunsConfig {
    /// Runs idle longer than this are reconciled as crashed.
    pub stale_timeout_secs: u64,
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            stale_timeout_secs: 15 * 60,
        }
    }
}

impl WaypointConfig {
    pub fn validate(&self) -> Result<()> {
        if self.budgets.max_iterations == 0 {
            return Err(anyhow!("budgets.max_iterations must be > 0"));
        }
        if self.budgets.max_minutes == 0 {
            return Err(anyhow!("budgets.max_minutes must be > 0"));
        }
        for name in &self.gates.default {
            if !self.gates.optional.contains_key(name) {
                return Err(anyhow!(
                    "gates.default names '{name}' but gates.optional.{name} is not defined"
                ));
            }
        }
        for (name, gate) in &self.gates.optional {
            if gate.command.is_empty() || gate.command[0].trim().is_empty() {
                return Err(anyhow!("gates.optional.{name}.command must be a non-empty array"));
            }
            if gate.timeout_seconds == 0 {
                return Err(anyhow!("gates.optional.{name}.timeout_seconds must be > 0"));
            }
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.timeout_seconds == 0 {
            return Err(anyhow!("agent.timeout_seconds must be > 0"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        for skill in &self.skills {
            if skill.name.trim().is_empty() {
                return Err(anyhow!("skills entries need a non-empty name"));
            }
        }
        Ok(())
    }

    /// Resolve the gates for a build: the defaults in order, then each extra
    /// name not already present.
    pub fn resolve_gates(&self, extra: &[String]) -> Result<Vec<GateSpec>> {
        let mut names: Vec<&String> = self.gates.default.iter().collect();
        for name in extra {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
            .into_iter()
            .map(|name| {
                let gate = self
                    .gates
                    .optional
                    .get(name)
                    .ok_or_else(|| anyhow!("unknown gate '{name}'"))?;
                Ok(GateSpec {
                    name: name.clone(),
                    command: gate.command.clone(),
                    timeout: Duration::from_secs(gate.timeout_seconds),
                })
            })
            .collect()
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `WaypointConfig::default()`.
pub fn load_config(path: &Path) -> Result<WaypointConfig> {
    if !path.exists() {
        let cfg = WaypointConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: WaypointConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk.
pub fn write_config(path: &Path, cfg: &WaypointConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
