mod registry;
mod selectors;

pub use registry::{ScenarioRegistry, ScenarioTemplate};
pub use selectors::ScenarioSelection;

pub const LABELS_PLACEHOLDER: &str = "{labels}";
pub const OBJECTS_PLACEHOLDER: &str = "{objects}";
pub const TEXT_PLACEHOLDER: &str = "{text}";

pub const DEFAULT_SINGLE_SCENARIO: &str = "Material Identification";
pub const DEFAULT_BATCH_SCENARIO: &str = "Project Documentation";
