//! Skill registry loaded once from `[[skills]]` in `waypoint.toml`.
//!
//! Skills are reference documents an agent may consult while planning. The
//! registry is plain data: entries come from config, paths are resolved
//! against the config's directory, and the list never changes after load.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One `[[skills]]` entry as written in config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkillConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Relative paths resolve against the config file's directory.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub source_path: PathBuf,
}

/// Immutable, cheaply cloned list of skills in config order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkillRegistry {
    skills: Arc<[Skill]>,
}

impl SkillRegistry {
    /// Build the registry, rejecting blank or duplicate names and missing
    /// source files.
    pub fn load(entries: &[SkillConfig], base_dir: &Path) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut skills = Vec::with_capacity(entries.len());
        for entry in entries {
            let name = entry.name.trim();
            if name.is_empty() {
                return Err(anyhow!("skills entry with path {} has an empty name", entry.path.display()));
            }
            if !seen.insert(name.to_string()) {
                return Err(anyhow!("skill '{name}' is defined more than once"));
            }
            let source_path = if entry.path.is_absolute() {
                entry.path.clone()
            } else {
                base_dir.join(&entry.path)
            };
            if !source_path.is_file() {
                return Err(anyhow!(
                    "skill '{name}' points at missing file {}",
                    source_path.display()
                ));
            }
            skills.push(Skill {
                name: name.to_string(),
                description: entry.description.trim().to_string(),
                source_path,
            });
        }
        debug!(count = skills.len(), "skills loaded");
        Ok(Self {
            skills: skills.into(),
        })
    }

    pub fn all(&self) -> &[Skill] {
        &self.skills
    }

    pub fn get(&self, name: &str) -> Option<&Skill> {
        self.skills.iter().find(|skill| skill.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }
}
