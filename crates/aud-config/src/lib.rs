//! aud-config
//!
//! Layered YAML configuration for the reconciliation engine.
//!
//! Files are merged in the order given (base first, overlays after), the
//! merged tree is written out as canonical JSON, and the SHA-256 of that text
//! is the config hash logged at startup. Two layer sets that merge to the
//! same tree always hash the same, whatever their key order or file split.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fs;

mod engine;
mod unused;

pub use engine::*;
pub use unused::*;

/// Result of merging every layer.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Lowercase hex SHA-256 of `canonical_json`.
    pub config_hash: String,
    /// Compact JSON, keys sorted at every level.
    pub canonical_json: String,
    pub config_json: Value,
}

/// Read and merge YAML files. A missing or unreadable path is an error.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let layers = paths
        .iter()
        .map(|p| fs::read_to_string(p).with_context(|| format!("failed to read config layer: {p}")))
        .collect::<Result<Vec<String>>>()?;
    let layer_refs: Vec<&str> = layers.iter().map(String::as_str).collect();
    load_layered_yaml_from_strings(&layer_refs)
}

/// Merge YAML layers in order.
///
/// - mappings merge key by key, recursively
/// - any other value in a later layer replaces the earlier one wholesale
/// - an explicit `null` removes the key, so its typed default applies again
/// - an empty layer contributes nothing
pub fn load_layered_yaml_from_strings(layers: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Map::new());
    for (i, raw) in layers.iter().enumerate() {
        let yaml: serde_yaml::Value =
            serde_yaml::from_str(raw).with_context(|| format!("config layer {i} is not valid yaml"))?;
        let layer = serde_json::to_value(yaml)
            .with_context(|| format!("config layer {i} has no JSON form"))?;
        if layer.is_null() {
            continue;
        }
        merge_layer(&mut merged, layer);
    }

    let canonical_json = canonicalize_json(&merged)?;
    let config_hash = sha256_hex(canonical_json.as_bytes());
    Ok(LoadedConfig {
        config_hash,
        canonical_json,
        config_json: merged,
    })
}

fn merge_layer(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Object(base_map), Value::Object(layer_map)) => {
            for (key, value) in layer_map {
                if value.is_null() {
                    base_map.remove(&key);
                    continue;
                }
                match base_map.get_mut(&key) {
                    Some(slot) => merge_layer(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, other) => *slot = other,
    }
}

/// serde_json's default map is ordered by key, so plain compact
/// serialization is already canonical.
fn canonicalize_json(v: &Value) -> Result<String> {
    serde_json::to_string(v).context("canonical json serialize failed")
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_in_overlay_restores_the_default() {
        let base = "quota:\n  max_total: 10\n  max_per_owner: 5\n";
        let overlay = "quota:\n  max_total: ~\n";
        let loaded = load_layered_yaml_from_strings(&[base, overlay]).unwrap();
        assert_eq!(loaded.canonical_json, r#"{"quota":{"max_per_owner":5}}"#);

        let cfg = EngineConfig::from_loaded(&loaded).unwrap();
        assert_eq!(cfg.quota.max_total, EngineConfig::default().quota.max_total);
        assert_eq!(cfg.quota.max_per_owner, 5);
    }

    #[test]
    fn lists_are_replaced_not_concatenated() {
        let loaded =
            load_layered_yaml_from_strings(&["a: [1, 2]\n", "a: [3]\n"]).unwrap();
        assert_eq!(loaded.config_json, serde_json::json!({"a": [3]}));
    }
}
