use serde_json::Value;
use sitelens_contracts::error::AnalysisResult;
use sitelens_contracts::{AnalysisError, DetectedObject, DetectionResult, Label, Vertex};

use crate::transport::error_chain_text;
use crate::VisionDetector;

const MAX_ERROR_CHARS: usize = 1024;

/// Runs label, text and object detection against `locator` and folds the
/// three responses into one validated [`DetectionResult`].
///
/// All three calls must succeed; any failure, malformed score or
/// out-of-range value surfaces as a single [`AnalysisError::Detection`].
pub async fn detect(vision: &dyn VisionDetector, locator: &str) -> AnalysisResult<DetectionResult> {
    let (labels, texts, objects) = tokio::try_join!(
        vision.label_detection(locator),
        vision.text_detection(locator),
        vision.object_localization(locator),
    )
    .map_err(|err| AnalysisError::detection(error_chain_text(&err, MAX_ERROR_CHARS)))?;

    let detection = DetectionResult::new(
        normalize_labels(&labels).map_err(AnalysisError::detection)?,
        normalize_objects(&objects).map_err(AnalysisError::detection)?,
        normalize_text(&texts),
    );
    detection.validate().map_err(AnalysisError::detection)?;
    Ok(detection)
}

pub fn normalize_labels(rows: &[Value]) -> Result<Vec<Label>, String> {
    rows.iter()
        .map(|row| -> Result<Label, String> {
            let description = string_field(row, "description");
            let confidence = coerce_score(row.get("score"))
                .map_err(|err| format!("label '{description}': {err}"))?;
            Ok(Label {
                description,
                confidence,
            })
        })
        .collect()
}

pub fn normalize_objects(rows: &[Value]) -> Result<Vec<DetectedObject>, String> {
    rows.iter()
        .map(|row| -> Result<DetectedObject, String> {
            let name = string_field(row, "name");
            let confidence =
                coerce_score(row.get("score")).map_err(|err| format!("object '{name}': {err}"))?;
            let bounding_box = row
                .get("boundingPoly")
                .or_else(|| row.get("bounding_poly"))
                .and_then(|poly| {
                    poly.get("normalizedVertices")
                        .or_else(|| poly.get("normalized_vertices"))
                })
                .and_then(Value::as_array)
                .map(|vertices| {
                    vertices
                        .iter()
                        .map(|vertex| -> Result<Vertex, String> {
                            Ok(Vertex {
                                x: coerce_score(vertex.get("x"))?,
                                y: coerce_score(vertex.get("y"))?,
                            })
                        })
                        .collect::<Result<Vec<Vertex>, String>>()
                })
                .transpose()
                .map_err(|err| format!("object '{name}' vertex: {err}"))?
                .unwrap_or_default();
            Ok(DetectedObject {
                name,
                confidence,
                bounding_box,
            })
        })
        .collect()
}

/// Text annotations in detector order; the first row is the full-text block.
pub fn normalize_text(rows: &[Value]) -> Vec<String> {
    rows.iter()
        .filter_map(|row| row.get("description").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

/// Coerces an integer, decimal or numeric-string score to `f64`.
///
/// Absent scores are zero: proto3 JSON drops default-valued fields.
pub fn coerce_score(value: Option<&Value>) -> Result<f64, String> {
    match value {
        None | Some(Value::Null) => Ok(0.0),
        Some(Value::Number(num)) => num
            .as_f64()
            .ok_or_else(|| format!("score {num} is not representable as f64")),
        Some(Value::String(text)) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("score '{text}' is not numeric")),
        Some(other) => Err(format!("score {other} is not numeric")),
    }
}

fn string_field(row: &Value, key: &str) -> String {
    row.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use sitelens_contracts::AnalysisError;

    use super::*;

    #[derive(Default)]
    struct StaticVision {
        labels: Vec<Value>,
        texts: Vec<Value>,
        objects: Vec<Value>,
        fail_objects: bool,
    }

    #[async_trait]
    impl VisionDetector for StaticVision {
        fn name(&self) -> &str {
            "static"
        }

        async fn label_detection(&self, _locator: &str) -> Result<Vec<Value>> {
            Ok(self.labels.clone())
        }

        async fn text_detection(&self, _locator: &str) -> Result<Vec<Value>> {
            Ok(self.texts.clone())
        }

        async fn object_localization(&self, _locator: &str) -> Result<Vec<Value>> {
            if self.fail_objects {
                bail!("object localization quota exceeded");
            }
            Ok(self.objects.clone())
        }
    }

    #[test]
    fn coerce_score_accepts_numeric_shapes() {
        assert_eq!(coerce_score(Some(&json!(1))), Ok(1.0));
        assert_eq!(coerce_score(Some(&json!(0.92))), Ok(0.92));
        assert_eq!(coerce_score(Some(&json!(" 0.5 "))), Ok(0.5));
        assert_eq!(coerce_score(None), Ok(0.0));
        assert_eq!(coerce_score(Some(&Value::Null)), Ok(0.0));
        assert!(coerce_score(Some(&json!(true))).is_err());
        assert!(coerce_score(Some(&json!("high"))).is_err());
    }

    #[test]
    fn normalize_objects_reads_normalized_vertices() -> std::result::Result<(), String> {
        let objects = normalize_objects(&[json!({
            "name": "Beam",
            "score": 0.81,
            "boundingPoly": {"normalizedVertices": [{"x": 0.1, "y": 0.2}, {"y": 0.4}, {}]}
        })])?;
        assert_eq!(objects[0].name, "Beam");
        assert_eq!(objects[0].bounding_box.len(), 3);
        assert_eq!(objects[0].bounding_box[1], Vertex { x: 0.0, y: 0.4 });
        assert_eq!(objects[0].bounding_box[2], Vertex { x: 0.0, y: 0.0 });
        Ok(())
    }

    #[test]
    fn normalize_objects_without_polygon_has_empty_box() -> std::result::Result<(), String> {
        let objects = normalize_objects(&[json!({"name": "Cable", "score": "0.3"})])?;
        assert!(objects[0].bounding_box.is_empty());
        assert_eq!(objects[0].confidence, 0.3);
        Ok(())
    }

    #[test]
    fn normalize_text_keeps_order_and_skips_rows_without_description() {
        let texts = normalize_text(&[
            json!({"description": "CAUTION\nWET"}),
            json!({"locale": "en"}),
            json!({"description": "CAUTION"}),
        ]);
        assert_eq!(texts, vec!["CAUTION\nWET", "CAUTION"]);
    }

    #[tokio::test]
    async fn detect_merges_three_capabilities() -> anyhow::Result<()> {
        let vision = StaticVision {
            labels: vec![json!({"description": "crack", "score": 0.92})],
            texts: vec![json!({"description": "CAUTION"})],
            ..Default::default()
        };
        let detection = detect(&vision, "gs://bucket/pier.png").await?;
        assert_eq!(detection.labels[0].description, "crack");
        assert_eq!(detection.labels[0].confidence, 0.92);
        assert!(detection.objects.is_empty());
        assert_eq!(detection.raw_text, vec!["CAUTION"]);
        Ok(())
    }

    #[tokio::test]
    async fn detect_allows_all_empty_signals() -> anyhow::Result<()> {
        let detection = detect(&StaticVision::default(), "gs://bucket/blank.png").await?;
        assert!(detection.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn detect_fails_as_a_whole_when_one_capability_fails() {
        let vision = StaticVision {
            labels: vec![json!({"description": "crack", "score": 0.92})],
            fail_objects: true,
            ..Default::default()
        };
        let err = detect(&vision, "gs://bucket/pier.png").await.err();
        assert_eq!(
            err,
            Some(AnalysisError::Detection(
                "object localization quota exceeded".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn detect_rejects_out_of_range_confidence() {
        let vision = StaticVision {
            labels: vec![json!({"description": "crack", "score": 92})],
            ..Default::default()
        };
        match detect(&vision, "gs://bucket/pier.png").await {
            Err(AnalysisError::Detection(message)) => assert!(message.contains("outside [0, 1]")),
            other => panic!("expected detection failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn detect_rejects_non_numeric_score() {
        let vision = StaticVision {
            labels: vec![json!({"description": "crack", "score": "very"})],
            ..Default::default()
        };
        assert!(matches!(
            detect(&vision, "gs://bucket/pier.png").await,
            Err(AnalysisError::Detection(_))
        ));
    }
}
