//! Analysis skills discovered on disk.
//!
//! A skill is a `SKILL.md` file with YAML frontmatter (`name`, `description`,
//! `triggers`) followed by a markdown body of instructions. The registry
//! exposes metadata first and only reads a body when a skill is loaded.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const SKILL_FILE: &str = "SKILL.md";

/// When a skill applies without asking a model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillTriggers {
    /// Input extensions, with or without a leading dot
    #[serde(default)]
    pub file_types: Vec<String>,
    #[serde(default)]
    pub output_formats: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SkillFrontmatter {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    triggers: SkillTriggers,
}

/// Skill metadata shown to planning prompts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkillInfo {
    pub name: String,
    pub description: String,
    pub triggers: SkillTriggers,
    #[serde(skip)]
    pub path: PathBuf,
}

/// A skill with its full instructions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadedSkill {
    pub name: String,
    pub description: String,
    pub content: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SkillError {
    #[error("Skill not found: {0}")]
    NotFound(String),

    #[error("Failed to read skill {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Split `---`-delimited YAML frontmatter from the body.
pub fn parse_frontmatter(content: &str) -> Option<(serde_yaml::Value, &str)> {
    let rest = content.strip_prefix("---")?;
    let end = rest.find("\n---")?;
    let yaml = &rest[..end];
    let body = rest[end + 4..].trim();
    serde_yaml::from_str(yaml).ok().map(|value| (value, body))
}

fn normalize_ext(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_lowercase()
}

#[derive(Debug, Clone, Default)]
pub struct SkillRegistry {
    dir: Option<PathBuf>,
    index: BTreeMap<String, SkillInfo>,
}

impl SkillRegistry {
    /// Registry with no skills.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Scan `dir` recursively for skills. A missing directory yields an empty registry.
    pub fn load(dir: impl Into<PathBuf>) -> Self {
        let mut registry = Self {
            dir: Some(dir.into()),
            index: BTreeMap::new(),
        };
        registry.scan();
        registry
    }

    /// Rebuild the index. Returns the number of skills found.
    pub fn scan(&mut self) -> usize {
        self.index.clear();
        let Some(dir) = self.dir.as_deref() else {
            return 0;
        };
        if !dir.exists() {
            tracing::warn!("Skills directory not found: {}", dir.display());
            return 0;
        }

        for entry in WalkDir::new(dir)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && e.file_name() == std::ffi::OsStr::new(SKILL_FILE))
        {
            match Self::index_file(entry.path()) {
                Some(info) => {
                    tracing::debug!("Indexed skill: {}", info.name);
                    self.index.insert(info.name.clone(), info);
                }
                None => tracing::warn!("Skipping invalid skill file {}", entry.path().display()),
            }
        }

        tracing::info!("Skill registry scanned: {} skills found", self.index.len());
        self.index.len()
    }

    fn index_file(path: &Path) -> Option<SkillInfo> {
        let content = std::fs::read_to_string(path).ok()?;
        let (yaml, _) = parse_frontmatter(&content)?;
        let meta: SkillFrontmatter = serde_yaml::from_value(yaml).ok()?;
        if meta.name.trim().is_empty() {
            return None;
        }
        Some(SkillInfo {
            name: meta.name.trim().to_string(),
            description: meta.description.trim().to_string(),
            triggers: meta.triggers,
            path: path.to_path_buf(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Metadata for every skill, ordered by name.
    pub fn list_skills(&self) -> Vec<&SkillInfo> {
        self.index.values().collect()
    }

    /// Read the full instructions for `name`.
    pub async fn load_skill(&self, name: &str) -> Result<LoadedSkill, SkillError> {
        let info = self
            .index
            .get(name)
            .ok_or_else(|| SkillError::NotFound(name.to_string()))?;
        let content = tokio::fs::read_to_string(&info.path)
            .await
            .map_err(|source| SkillError::Io {
                path: info.path.clone(),
                source,
            })?;
        let body = parse_frontmatter(&content)
            .map(|(_, body)| body.to_string())
            .unwrap_or_default();
        Ok(LoadedSkill {
            name: info.name.clone(),
            description: info.description.clone(),
            content: body,
        })
    }

    /// Skills whose triggers match the inputs or requested outputs, deduplicated.
    pub fn get_relevant_skills(
        &self,
        file_types: &HashSet<String>,
        output_formats: &[String],
    ) -> Vec<&SkillInfo> {
        let file_types: HashSet<String> = file_types.iter().map(|t| normalize_ext(t)).collect();
        let formats: HashSet<String> = output_formats.iter().map(|f| f.to_lowercase()).collect();

        self.index
            .values()
            .filter(|info| {
                info.triggers
                    .file_types
                    .iter()
                    .any(|t| file_types.contains(&normalize_ext(t)))
                    || info
                        .triggers
                        .output_formats
                        .iter()
                        .any(|f| formats.contains(&f.to_lowercase()))
            })
            .collect()
    }

    /// Catalog of all skills for a planning prompt, marking the relevant ones.
    pub fn catalog_prompt(&self, file_types: &HashSet<String>, output_formats: &[String]) -> String {
        if self.index.is_empty() {
            return String::new();
        }
        let relevant: HashSet<&str> = self
            .get_relevant_skills(file_types, output_formats)
            .into_iter()
            .map(|s| s.name.as_str())
            .collect();

        let mut lines = vec![
            "## Available Skills".to_string(),
            String::new(),
            "The following skills are available. Name the skills whose instructions should be applied."
                .to_string(),
            String::new(),
        ];
        for info in self.index.values() {
            let marker = if relevant.contains(info.name.as_str()) {
                " (recommended)"
            } else {
                ""
            };
            lines.push(format!("- **{}**{}: {}", info.name, marker, info.description));
        }
        lines.push(String::new());
        lines.push(
            "Choose skills that match the input file types and requested output formats.".to_string(),
        );
        lines.join("\n")
    }
}
