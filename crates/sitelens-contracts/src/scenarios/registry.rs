use std::path::Path;

use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::{LABELS_PLACEHOLDER, OBJECTS_PLACEHOLDER, TEXT_PLACEHOLDER};

const BUILTIN_SCENARIOS_JSON: &str = include_str!("../../resources/scenarios.json");

/// Instruction template for one analysis mode.
///
/// The body is rendered from structured fields so that every template
/// carries the same detected-signals block, whatever the scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioTemplate {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub role: String,
    #[serde(default)]
    pub deliverables: Vec<String>,
    #[serde(default)]
    pub output_format: String,
}

fn default_version() -> u32 {
    1
}

impl ScenarioTemplate {
    pub fn generic() -> Self {
        Self {
            id: "General Inspection".to_string(),
            version: 1,
            role: "You are a civil engineering expert. Analyze the image and provide detailed insights about the civil engineering structure.".to_string(),
            deliverables: Vec::new(),
            output_format: "Provide detailed insights in plain prose.".to_string(),
        }
    }

    pub fn instruction_body(&self) -> String {
        let mut body = String::new();
        body.push_str(self.role.trim());
        body.push('\n');
        for (idx, item) in self.deliverables.iter().enumerate() {
            body.push_str(&format!("{}. {}\n", idx + 1, item.trim_end()));
        }
        body.push('\n');
        body.push_str(&format!("Detected features:\n{LABELS_PLACEHOLDER}\n"));
        body.push_str(&format!("Detected objects:\n{OBJECTS_PLACEHOLDER}\n"));
        body.push_str(&format!("Detected text:\n{TEXT_PLACEHOLDER}\n"));
        if !self.output_format.trim().is_empty() {
            body.push('\n');
            body.push_str(self.output_format.trim());
            body.push('\n');
        }
        body
    }
}

#[derive(Debug, Default, Deserialize)]
struct ScenarioTable {
    #[serde(default)]
    fallback: Option<ScenarioTemplate>,
    #[serde(default)]
    scenarios: IndexMap<String, ScenarioTemplate>,
}

/// Read-only map from scenario id to template, with a fallback for unknown ids.
///
/// Built once at start-up and shared behind an `Arc`; lookups never lock.
#[derive(Debug, Clone)]
pub struct ScenarioRegistry {
    templates: IndexMap<String, ScenarioTemplate>,
    fallback: ScenarioTemplate,
}

impl Default for ScenarioRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ScenarioRegistry {
    /// `None` keeps the built-in templates. A malformed built-in table is
    /// logged and leaves only the generic fallback; use [`ScenarioRegistry::builtin`]
    /// to surface it as an error instead.
    pub fn new(templates: Option<IndexMap<String, ScenarioTemplate>>) -> Self {
        let builtin = builtin_table().unwrap_or_else(|err| {
            tracing::error!("{err:#}");
            ScenarioTable::default()
        });
        Self::from_table(builtin, templates)
    }

    pub fn builtin() -> anyhow::Result<Self> {
        Ok(Self::from_table(builtin_table()?, None))
    }

    fn from_table(
        builtin: ScenarioTable,
        templates: Option<IndexMap<String, ScenarioTemplate>>,
    ) -> Self {
        let fallback = builtin.fallback.unwrap_or_else(ScenarioTemplate::generic);
        Self {
            templates: templates.unwrap_or(builtin.scenarios),
            fallback,
        }
        .with_keyed_ids()
    }

    /// Built-in templates, optionally merged with an override file.
    pub fn load(override_path: Option<&Path>) -> anyhow::Result<Self> {
        let registry = Self::builtin()?;
        let Some(path) = override_path else {
            return Ok(registry);
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading scenario overrides {}", path.display()))?;
        registry
            .merge_json(&raw)
            .with_context(|| format!("invalid scenario overrides {}", path.display()))
    }

    /// Entries in `raw` replace templates with the same id; a `fallback`
    /// entry replaces the fallback template.
    pub fn merge_json(mut self, raw: &str) -> anyhow::Result<Self> {
        let table = parse_table(raw)?;
        if let Some(fallback) = table.fallback {
            self.fallback = fallback;
        }
        for (id, template) in table.scenarios {
            self.templates.insert(id, template);
        }
        Ok(self.with_keyed_ids())
    }

    pub fn get(&self, id: &str) -> Option<&ScenarioTemplate> {
        self.templates.get(id)
    }

    /// Total lookup: unknown ids resolve to the fallback template.
    pub fn resolve(&self, id: &str) -> &ScenarioTemplate {
        self.get(id).unwrap_or(&self.fallback)
    }

    pub fn fallback(&self) -> &ScenarioTemplate {
        &self.fallback
    }

    pub fn list(&self) -> impl Iterator<Item = &ScenarioTemplate> {
        self.templates.values()
    }

    pub fn ids(&self) -> Vec<String> {
        self.templates.keys().cloned().collect()
    }

    fn with_keyed_ids(mut self) -> Self {
        for (id, template) in self.templates.iter_mut() {
            template.id = id.clone();
        }
        if self.fallback.id.trim().is_empty() {
            self.fallback.id = ScenarioTemplate::generic().id;
        }
        self
    }
}

fn parse_table(raw: &str) -> anyhow::Result<ScenarioTable> {
    Ok(serde_json::from_str(raw)?)
}

fn builtin_table() -> anyhow::Result<ScenarioTable> {
    parse_table(BUILTIN_SCENARIOS_JSON).context("built-in scenario table is malformed")
}
