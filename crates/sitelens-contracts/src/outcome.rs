use serde::Serialize;
use serde_json::{json, Value};

use crate::detection::DetectionResult;

/// One uploaded image. Owned by exactly one analysis task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUpload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl ImageUpload {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            bytes: bytes.into(),
        }
    }

    /// Final path component of the client-supplied name.
    pub fn basename(&self) -> &str {
        self.filename
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(self.filename.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisOutcome {
    pub scenario_id: String,
    pub filename: String,
    pub detection: DetectionResult,
    pub narrative_text: String,
    pub source_locator: String,
}

impl AnalysisOutcome {
    /// Body of a successful `POST /analyze`.
    pub fn to_response_json(&self) -> Value {
        json!({
            "success": true,
            "scenario": self.scenario_id,
            "detected_labels": self.detection.labels,
            "detected_objects": self.detection.objects,
            "detected_text": self.detection.raw_text,
            "ai_analysis": self.narrative_text,
            "image_uri": self.source_locator,
        })
    }

    fn to_batch_item_json(&self) -> Value {
        json!({
            "filename": self.filename,
            "detected_labels": self.detection.labels,
            "ai_analysis": self.narrative_text,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchItemFailure {
    pub index: usize,
    pub filename: String,
    pub error: String,
}

/// Per-item results of a batch, both lists in caller input order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub scenario_id: String,
    pub outcomes: Vec<AnalysisOutcome>,
    pub failures: Vec<BatchItemFailure>,
}

impl BatchOutcome {
    pub fn analyzed_images(&self) -> usize {
        self.outcomes.len()
    }

    pub fn attempted(&self) -> usize {
        self.outcomes.len() + self.failures.len()
    }

    /// Body of a successful `POST /batch-analyze`.
    pub fn to_response_json(&self) -> Value {
        json!({
            "success": true,
            "scenario": self.scenario_id,
            "analyzed_images": self.analyzed_images(),
            "results": self
                .outcomes
                .iter()
                .map(AnalysisOutcome::to_batch_item_json)
                .collect::<Vec<Value>>(),
            "failures": self.failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::detection::{DetectedObject, Label, Vertex};

    fn outcome(filename: &str) -> AnalysisOutcome {
        AnalysisOutcome {
            scenario_id: "Structural Analysis".to_string(),
            filename: filename.to_string(),
            detection: DetectionResult::new(
                vec![Label {
                    description: "bridge".to_string(),
                    confidence: 0.5,
                }],
                vec![DetectedObject {
                    name: "cable".to_string(),
                    confidence: 0.25,
                    bounding_box: vec![Vertex { x: 0.5, y: 0.75 }],
                }],
                vec!["NO ENTRY".to_string()],
            ),
            narrative_text: "Suspension bridge.".to_string(),
            source_locator: format!("gs://bucket/civil-eng/{filename}"),
        }
    }

    #[test]
    fn single_response_has_the_wire_field_names() {
        let body = outcome("deck.jpg").to_response_json();
        assert_eq!(
            body,
            json!({
                "success": true,
                "scenario": "Structural Analysis",
                "detected_labels": [{"description": "bridge", "confidence": 0.5}],
                "detected_objects": [{
                    "name": "cable",
                    "confidence": 0.25,
                    "bounding_box": [{"x": 0.5, "y": 0.75}]
                }],
                "detected_text": ["NO ENTRY"],
                "ai_analysis": "Suspension bridge.",
                "image_uri": "gs://bucket/civil-eng/deck.jpg"
            })
        );
    }

    #[test]
    fn batch_response_counts_successes_and_lists_failures() {
        let batch = BatchOutcome {
            scenario_id: "Project Documentation".to_string(),
            outcomes: vec![outcome("a.jpg"), outcome("c.jpg")],
            failures: vec![BatchItemFailure {
                index: 1,
                filename: "b.jpg".to_string(),
                error: "detection failed: unreadable".to_string(),
            }],
        };
        assert_eq!(batch.attempted(), 3);
        let body = batch.to_response_json();
        assert_eq!(body["analyzed_images"], json!(2));
        assert_eq!(body["results"][0]["filename"], json!("a.jpg"));
        assert_eq!(body["results"][1]["filename"], json!("c.jpg"));
        assert_eq!(body["results"][0]["ai_analysis"], json!("Suspension bridge."));
        assert!(body["results"][0].get("detected_objects").is_none());
        assert_eq!(
            body["failures"],
            json!([{"index": 1, "filename": "b.jpg", "error": "detection failed: unreadable"}])
        );
    }

    #[test]
    fn basename_strips_client_paths() {
        assert_eq!(ImageUpload::new("pier.png", Vec::new()).basename(), "pier.png");
        assert_eq!(ImageUpload::new("site/day1/pier.png", Vec::new()).basename(), "pier.png");
        assert_eq!(ImageUpload::new("C:\\photos\\pier.png", Vec::new()).basename(), "pier.png");
    }
}
