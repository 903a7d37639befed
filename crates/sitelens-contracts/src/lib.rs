pub mod detection;
pub mod error;
pub mod events;
pub mod outcome;
pub mod prompt;
pub mod scenarios;

pub use detection::{DetectedObject, DetectionResult, Label, Vertex};
pub use error::AnalysisError;
pub use outcome::{AnalysisOutcome, BatchItemFailure, BatchOutcome, ImageUpload};
pub use prompt::{build_request, AnalysisRequest};
pub use scenarios::{ScenarioRegistry, ScenarioSelection, ScenarioTemplate};
