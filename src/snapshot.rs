//! Config snapshot renderer (C8): turns the set of discovery messages the
//! HA egress would have published into a static YAML document equivalent to
//! the discovery stream. Grounded on
//! `examples/original_source/wb_to_ha/manual_config.py`.
//!
//! The renderer never talks to a broker: it reads a `topic -> last payload`
//! map captured by running the egress against
//! [`crate::router::Router::new_in_memory`] (the Rust analogue of the
//! original's `InmemMQTTClient.last_messages`).

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;

/// `homeassistant/<component>/<node_id>/<object_id>/config`.
fn config_topic_pattern() -> Regex {
    Regex::new(r"^homeassistant/([^/]+)/[^/]+/[^/]+/config$").expect("static pattern is valid")
}

/// Converts a captured `topic -> payload` map into the manual-config
/// document (spec.md §4.8). Only config topics are considered; everything
/// else (availability, state) is ignored, matching the original.
pub fn render(captured: &HashMap<String, String>) -> Result<String> {
    let pattern = config_topic_pattern();
    let mut by_component: BTreeMap<String, Vec<Value>> = BTreeMap::new();

    for (topic, payload) in captured {
        let Some(caps) = pattern.captures(topic) else {
            continue;
        };
        let component = caps[1].to_string();
        let mut msg: Value =
            serde_json::from_str(payload).with_context(|| format!("invalid discovery payload on {topic}"))?;
        preprocess(&component, &mut msg);
        by_component.entry(component).or_default().push(msg);
    }

    for entities in by_component.values_mut() {
        entities.sort_by(|a, b| unique_id_of(a).cmp(unique_id_of(b)));
    }

    let mut mqtt = serde_json::Map::new();
    for (component, entities) in by_component {
        mqtt.insert(component, Value::Array(entities));
    }
    let mut root = serde_json::Map::new();
    root.insert("mqtt".to_string(), Value::Object(mqtt));

    serde_yml::to_string(&Value::Object(root)).context("failed to render YAML snapshot")
}

fn unique_id_of(entity: &Value) -> &str {
    entity.get("unique_id").and_then(Value::as_str).unwrap_or_default()
}

/// Strips availability-related keys (cosmetically irrelevant once rendered
/// as static YAML, since HA reads the file once at startup rather than
/// tracking a retained availability topic) and forces `retain: true` on
/// `button`/`switch` entities, whose command topics are otherwise never
/// retained by the live discovery stream.
fn preprocess(component: &str, msg: &mut Value) {
    if let Value::Object(map) = msg {
        map.remove("availability_topic");
        map.remove("payload_available");
        map.remove("payload_not_available");
        if component == "button" || component == "switch" {
            map.insert("retain".to_string(), Value::Bool(true));
        }
    }
}
