use serde::{Deserialize, Serialize};

/// Normalized image coordinate, both axes relative to the image size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vertex {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub description: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub name: String,
    pub confidence: f64,
    #[serde(default)]
    pub bounding_box: Vec<Vertex>,
}

/// Signals extracted from one image by the vision collaborator.
///
/// `raw_text[0]`, when present, is the full-text block; the remaining
/// entries are the individual snippets in detector order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DetectionResult {
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub objects: Vec<DetectedObject>,
    #[serde(default)]
    pub raw_text: Vec<String>,
}

impl DetectionResult {
    pub fn new(labels: Vec<Label>, objects: Vec<DetectedObject>, raw_text: Vec<String>) -> Self {
        Self {
            labels,
            objects,
            raw_text,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.objects.is_empty() && self.raw_text.is_empty()
    }

    /// Reports the first confidence or vertex coordinate outside `[0, 1]`.
    ///
    /// Values are never clamped: an out-of-range score means the detector
    /// broke its contract.
    pub fn validate(&self) -> Result<(), String> {
        for (idx, label) in self.labels.iter().enumerate() {
            if !is_unit(label.confidence) {
                return Err(format!(
                    "label #{idx} '{}' has confidence {} outside [0, 1]",
                    label.description, label.confidence
                ));
            }
        }
        for (idx, object) in self.objects.iter().enumerate() {
            if !is_unit(object.confidence) {
                return Err(format!(
                    "object #{idx} '{}' has confidence {} outside [0, 1]",
                    object.name, object.confidence
                ));
            }
            for vertex in &object.bounding_box {
                if !is_unit(vertex.x) || !is_unit(vertex.y) {
                    return Err(format!(
                        "object #{idx} '{}' has vertex ({}, {}) outside the normalized box",
                        object.name, vertex.x, vertex.y
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn full_text(&self) -> Option<&str> {
        self.raw_text.first().map(String::as_str)
    }
}

fn is_unit(value: f64) -> bool {
    (0.0..=1.0).contains(&value)
}
