use super::registry::{ScenarioRegistry, ScenarioTemplate};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioSelection {
    pub template: ScenarioTemplate,
    pub requested: String,
    pub fallback_reason: Option<String>,
}

impl ScenarioSelection {
    pub fn used_fallback(&self) -> bool {
        self.fallback_reason.is_some()
    }
}

impl ScenarioRegistry {
    /// Like [`ScenarioRegistry::resolve`], but records why the fallback was used.
    pub fn select(&self, requested: &str) -> ScenarioSelection {
        if let Some(template) = self.get(requested) {
            return ScenarioSelection {
                template: template.clone(),
                requested: requested.to_string(),
                fallback_reason: None,
            };
        }
        ScenarioSelection {
            template: self.fallback().clone(),
            requested: requested.to_string(),
            fallback_reason: Some(format!(
                "Unknown scenario '{requested}'; using '{}'.",
                self.fallback().id
            )),
        }
    }
}
