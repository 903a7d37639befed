use serde::Serialize;

use crate::detection::{DetectedObject, DetectionResult, Label};
use crate::scenarios::{
    ScenarioRegistry, LABELS_PLACEHOLDER, OBJECTS_PLACEHOLDER, TEXT_PLACEHOLDER,
};

const EMPTY_SIGNAL: &str = "(none)";

/// Rendered prompt for one image, consumed once by the generative call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalysisRequest {
    pub scenario_id: String,
    pub template_id: String,
    pub template_version: u32,
    pub rendered_prompt: String,
}

/// Merges detection signals into the template resolved for `scenario_id`.
///
/// Every detected item is rendered, one per line, in detector order.
pub fn build_request(
    registry: &ScenarioRegistry,
    scenario_id: &str,
    detection: &DetectionResult,
) -> AnalysisRequest {
    let template = registry.resolve(scenario_id);
    let labels = render_labels(&detection.labels);
    let objects = render_objects(&detection.objects);
    let text = render_text(&detection.raw_text);
    let rendered_prompt = substitute(
        &template.instruction_body(),
        &[
            (LABELS_PLACEHOLDER, labels.as_str()),
            (OBJECTS_PLACEHOLDER, objects.as_str()),
            (TEXT_PLACEHOLDER, text.as_str()),
        ],
    );
    AnalysisRequest {
        scenario_id: scenario_id.to_string(),
        template_id: template.id.clone(),
        template_version: template.version,
        rendered_prompt,
    }
}

pub fn render_labels(labels: &[Label]) -> String {
    render_lines(labels.iter().map(|label| {
        format!(
            "- {} ({})",
            single_line(&label.description),
            format_confidence(label.confidence)
        )
    }))
}

pub fn render_objects(objects: &[DetectedObject]) -> String {
    render_lines(objects.iter().map(|object| {
        let mut line = format!(
            "- {} ({})",
            single_line(&object.name),
            format_confidence(object.confidence)
        );
        if !object.bounding_box.is_empty() {
            let vertices = object
                .bounding_box
                .iter()
                .map(|vertex| format!("({:.2}, {:.2})", vertex.x, vertex.y))
                .collect::<Vec<String>>()
                .join(", ");
            line.push_str(&format!(" box [{vertices}]"));
        }
        line
    }))
}

/// Snippets are debug-quoted so multi-line text blocks stay on one line.
pub fn render_text(snippets: &[String]) -> String {
    render_lines(snippets.iter().map(|snippet| format!("- {snippet:?}")))
}

fn render_lines(lines: impl Iterator<Item = String>) -> String {
    let rows = lines.collect::<Vec<String>>();
    if rows.is_empty() {
        return EMPTY_SIGNAL.to_string();
    }
    rows.join("\n")
}

/// Escapes control characters (a newline becomes the two characters `\n`)
/// so one item never spans several prompt lines.
fn single_line(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if ch.is_control() {
            out.extend(ch.escape_default());
        } else {
            out.push(ch);
        }
    }
    out
}

fn format_confidence(value: f64) -> String {
    format!("{value:.2}")
}

// Single pass, so placeholder-looking text inside detected values is left alone.
fn substitute(body: &str, replacements: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;
    loop {
        let next = replacements
            .iter()
            .filter_map(|(key, value)| rest.find(key).map(|pos| (pos, *key, *value)))
            .min_by_key(|(pos, _, _)| *pos);
        let Some((pos, key, value)) = next else {
            out.push_str(rest);
            return out;
        };
        out.push_str(&rest[..pos]);
        out.push_str(value);
        rest = &rest[pos + key.len()..];
    }
}
