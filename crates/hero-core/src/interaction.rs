//! Detection of structured interactions in assistant output.
//!
//! Two surfaces are recognized: a fenced ```json block covering the
//! whole (trimmed) message, and inline executable elements within the
//! text stream. The detector is pure; malformed input passes through as
//! plain text.

use hero_schema::{Assertion, Interaction, Pipeline, PipelineMode};

use crate::markup::{extract_elements, ElementMatch};

/// Parse assistant text into zero or more pipelines of interactions.
pub fn detect_interactions(text: &str) -> Vec<Pipeline> {
    if let Some(pipelines) = parse_fenced_json(text) {
        return pipelines;
    }

    let inline = inline_interactions(text);
    if inline.is_empty() {
        return Vec::new();
    }
    vec![Pipeline {
        name: None,
        mode: PipelineMode::Sequential,
        items: inline,
    }]
}

/// A fenced block is only recognized when the trimmed content starts
/// with ```json and ends with ```. An array is one sequential pipeline;
/// an object maps pipeline names to arrays run in parallel.
fn parse_fenced_json(text: &str) -> Option<Vec<Pipeline>> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")?
        .strip_suffix("```")?
        .trim();

    let value: serde_json::Value = serde_json::from_str(body).ok()?;

    match value {
        serde_json::Value::Array(items) => {
            let items = parse_items(&items)?;
            Some(vec![Pipeline {
                name: None,
                mode: PipelineMode::Sequential,
                items,
            }])
        }
        serde_json::Value::Object(map) => {
            let mut pipelines = Vec::new();
            for (name, value) in map {
                let items = value.as_array().and_then(|arr| parse_items(arr))?;
                pipelines.push(Pipeline {
                    name: Some(name),
                    mode: PipelineMode::Parallel,
                    items,
                });
            }
            Some(pipelines)
        }
        _ => None,
    }
}

fn parse_items(items: &[serde_json::Value]) -> Option<Vec<Interaction>> {
    items.iter().map(parse_item).collect()
}

fn parse_item(value: &serde_json::Value) -> Option<Interaction> {
    let obj = value.as_object()?;

    let assertion = match obj.get("assertion").and_then(|a| a.as_str()) {
        Some("command") => Assertion::Command,
        Some("question") => Assertion::Question,
        Some("function") => Assertion::Function,
        Some(_) => return None,
        // Fall back on which key names the target.
        None if obj.contains_key("command") => Assertion::Command,
        None if obj.contains_key("function") => Assertion::Function,
        None => return None,
    };

    let name = obj
        .get("name")
        .or_else(|| obj.get("command"))
        .or_else(|| obj.get("function"))
        .and_then(|n| n.as_str())?
        .to_string();

    Some(Interaction {
        id: obj
            .get("id")
            .and_then(|i| i.as_str())
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        assertion,
        name,
        args: obj.get("args").cloned().unwrap_or(serde_json::Value::Null),
        message: obj
            .get("message")
            .and_then(|m| m.as_str())
            .map(ToOwned::to_owned),
        options: obj.get("options").and_then(|o| {
            o.as_array().map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(ToOwned::to_owned))
                    .collect()
            })
        }),
        timeout: obj.get("timeout").and_then(|t| t.as_u64()),
        mode: obj
            .get("mode")
            .and_then(|m| m.as_str())
            .map(ToOwned::to_owned),
    })
}

/// Map inline executable elements onto interactions, in order of
/// appearance. Unknown elements stay in the text.
fn inline_interactions(text: &str) -> Vec<Interaction> {
    extract_elements(text)
        .into_iter()
        .map(element_to_interaction)
        .collect()
}

fn element_to_interaction(element: ElementMatch) -> Interaction {
    let id = element
        .attributes
        .get("id")
        .cloned()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let timeout = element
        .attributes
        .get("timeout")
        .and_then(|t| t.parse().ok());

    match element.element_type.as_str() {
        "bash" => Interaction {
            id,
            assertion: Assertion::Command,
            name: "bash".into(),
            args: serde_json::json!({ "command": element.content.trim() }),
            message: None,
            options: None,
            timeout,
            mode: element.attributes.get("mode").cloned(),
        },
        "ask" => Interaction {
            id,
            assertion: Assertion::Question,
            name: "ask".into(),
            args: attributes_json(&element),
            message: Some(element.content.trim().to_string()),
            options: element.attributes.get("options").map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            }),
            timeout,
            mode: None,
        },
        // websearch and any future function-style elements
        _ => Interaction {
            id,
            assertion: Assertion::Function,
            name: element.element_type.clone(),
            args: {
                let mut args = attributes_json(&element);
                args["query"] = serde_json::Value::String(element.content.trim().to_string());
                args
            },
            message: None,
            options: None,
            timeout,
            mode: None,
        },
    }
}

fn attributes_json(element: &ElementMatch) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (key, value) in &element.attributes {
        if key == "id" {
            continue;
        }
        map.insert(key.clone(), serde_json::Value::String(value.clone()));
    }
    serde_json::Value::Object(map)
}

// ------------------------------------------------------------
// Display helpers
// ------------------------------------------------------------

/// Collapse consecutive identical paragraphs. The raw form stays in the
/// frame payload; this only affects display text.
pub fn dedup_paragraphs(text: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for paragraph in text.split("\n\n") {
        if out.last().map(|prev| prev.trim() == paragraph.trim()) != Some(true) {
            out.push(paragraph);
        }
    }
    out.join("\n\n")
}

/// Strip executable elements and fenced interaction blocks for display.
pub fn strip_interactions(text: &str) -> String {
    if parse_fenced_json(text).is_some() {
        return String::new();
    }

    let mut out = text.to_string();
    let mut elements = extract_elements(text);
    elements.sort_by(|a, b| b.index.cmp(&a.index));
    for element in elements {
        out.replace_range(element.index..element.index + element.length, "");
    }
    out.trim().to_string()
}
