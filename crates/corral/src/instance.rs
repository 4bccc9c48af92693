//! A single capture instance's configuration.
//!
//! Internally this is just the sanitized record map plus the invariants the
//! rest of the crate leans on: the record always carries a non-empty string
//! `id` and a full set of schema fields. Construction goes through
//! [`InstanceConfig::new`], which enforces both.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::schema;

/// Opaque instance identifier. A UUID v4 string pinned at creation; titles
/// may change and collide, ids never do.
pub type InstanceId = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceConfig {
    record: Map<String, Value>,
}

impl InstanceConfig {
    /// Build a config from an arbitrary record: sanitize it and assign a
    /// fresh id when none was supplied. Returns the config and the number
    /// of sanitizer changes (useful for startup logging).
    pub fn new(mut record: Map<String, Value>) -> (Self, usize) {
        let changed = schema::sanitize(&mut record);
        let missing_id = !matches!(record.get("id"), Some(Value::String(s)) if !s.is_empty());
        if missing_id {
            record.insert("id".to_string(), Value::String(fresh_id()));
        }
        (InstanceConfig { record }, changed)
    }

    /// A config with every field at its schema default.
    pub fn with_defaults() -> Self {
        InstanceConfig::new(schema::default_record()).0
    }

    pub fn id(&self) -> &str {
        self.record
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Re-key this config. Used when an incoming id would collide.
    pub fn regenerate_id(&mut self) -> &str {
        self.record
            .insert("id".to_string(), Value::String(fresh_id()));
        self.id()
    }

    pub fn title(&self) -> &str {
        self.string("title")
    }

    pub fn string(&self, key: &str) -> &str {
        self.record
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn number(&self, key: &str) -> f64 {
        self.record
            .get(key)
            .and_then(Value::as_f64)
            .unwrap_or_default()
    }

    pub fn flag(&self, key: &str) -> bool {
        self.record
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or_default()
    }

    pub fn auto_start(&self) -> bool {
        self.flag("auto")
    }

    /// Why this config may not be started, if anything. Valid means a
    /// non-empty title and output enabled.
    pub fn validity_error(&self) -> Option<String> {
        if self.title().trim().is_empty() {
            return Some("title is empty".to_string());
        }
        if !self.flag("out") {
            return Some("output is disabled".to_string());
        }
        None
    }

    pub fn is_valid(&self) -> bool {
        self.validity_error().is_none()
    }

    /// Replace the whole record, keeping this instance's id no matter what
    /// the incoming map claims. Returns the sanitizer change count.
    pub fn replace_record(&mut self, mut record: Map<String, Value>) -> usize {
        let id = self.id().to_string();
        let changed = schema::sanitize(&mut record);
        record.insert("id".to_string(), Value::String(id));
        self.record = record;
        changed
    }

    /// Merge a partial record over this one, then re-sanitize. The id key
    /// in the patch is ignored.
    pub fn merge_patch(&mut self, patch: &Map<String, Value>) -> usize {
        for (key, value) in patch {
            if key == "id" {
                continue;
            }
            self.record.insert(key.clone(), value.clone());
        }
        schema::sanitize(&mut self.record)
    }

    pub fn as_record(&self) -> &Map<String, Value> {
        &self.record
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.record.clone())
    }
}

fn fresh_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn test_new_assigns_id_when_absent() {
        let (config, _) = InstanceConfig::new(record(json!({"title": "Cam 1"})));
        assert!(!config.id().is_empty());
        assert_eq!(config.title(), "Cam 1");

        let (other, _) = InstanceConfig::new(record(json!({"title": "Cam 2"})));
        assert_ne!(config.id(), other.id());
    }

    #[test]
    fn test_new_keeps_supplied_id() {
        let (config, _) = InstanceConfig::new(record(json!({"id": "fixed", "title": "x"})));
        assert_eq!(config.id(), "fixed");
    }

    #[test]
    fn test_validity_needs_title_and_output() {
        let (config, _) = InstanceConfig::new(record(json!({"title": "ok"})));
        assert!(config.is_valid());

        let (config, _) = InstanceConfig::new(record(json!({"title": "  "})));
        assert_eq!(config.validity_error().as_deref(), Some("title is empty"));

        let (config, _) = InstanceConfig::new(record(json!({"title": "ok", "out": false})));
        assert_eq!(
            config.validity_error().as_deref(),
            Some("output is disabled")
        );
    }

    #[test]
    fn test_replace_record_pins_id() {
        let (mut config, _) = InstanceConfig::new(record(json!({"id": "keep", "title": "a"})));
        config.replace_record(record(json!({"id": "evil", "title": "b"})));
        assert_eq!(config.id(), "keep");
        assert_eq!(config.title(), "b");
    }

    #[test]
    fn test_merge_patch_sanitizes_result() {
        let (mut config, _) = InstanceConfig::new(record(json!({"title": "a"})));
        let changed = config.merge_patch(&record(json!({"w": "1920", "id": "evil", "junk": 1})));
        assert!(changed > 0);
        assert_eq!(config.number("w"), 1920.0);
        assert_ne!(config.id(), "evil");
        assert!(!config.as_record().contains_key("junk"));
    }

    #[test]
    fn test_serde_round_trip() {
        let (config, _) = InstanceConfig::new(record(json!({"title": "rt", "fps": 60})));
        let text = serde_json::to_string(&config).unwrap();
        let back: InstanceConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(config, back);
        assert_eq!(back.number("fps"), 60.0);
    }
}
