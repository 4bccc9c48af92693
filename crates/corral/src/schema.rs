//! Declarative instance-config schema.
//!
//! Every field an instance record may carry is declared once in [`SCHEMA`]
//! with its compact key, its long bundle-file name, its type, and its
//! default. Everything else in the crate (sanitizing, bundle render/parse,
//! the dashboard payloads) is driven off this table, so adding a field is a
//! one-line change here.
//!
//! [`sanitize`] is the single normalization pass applied to every record
//! that enters the system, no matter the door it came through: missing
//! fields get defaults, wrongly-typed values are coerced (best effort,
//! falling back to the default), unknown keys are dropped, and deprecated
//! enumerated values are migrated. It never fails and it is idempotent.

use serde_json::{Map, Value};

/// Declared value type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Boolean,
}

/// Compile-time default for a field.
#[derive(Debug, Clone, Copy)]
pub enum FieldDefault {
    Str(&'static str),
    Num(f64),
    Bool(bool),
}

impl FieldDefault {
    pub fn value(&self) -> Value {
        match self {
            FieldDefault::Str(s) => Value::String((*s).to_string()),
            FieldDefault::Num(n) => number_value(*n),
            FieldDefault::Bool(b) => Value::Bool(*b),
        }
    }
}

/// One field of the instance record.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    /// Compact key used in records, the JSON surfaces, and the state file.
    pub key: &'static str,
    /// Long name used in the portable bundle format.
    pub external: &'static str,
    pub kind: FieldKind,
    pub default: FieldDefault,
}

/// A deprecated enumerated value and its replacement, applied before
/// type coercion so legacy records converge in one pass.
#[derive(Debug, Clone, Copy)]
pub struct ValueMigration {
    pub key: &'static str,
    pub from: &'static str,
    pub to: &'static str,
}

/// The full instance-config schema, in canonical field order. Bundle files
/// and JSON payloads list fields in this order.
pub const SCHEMA: &[FieldSpec] = &[
    FieldSpec { key: "title", external: "Title", kind: FieldKind::String, default: FieldDefault::Str("") },
    FieldSpec { key: "input", external: "InputKind", kind: FieldKind::String, default: FieldDefault::Str("web") },
    FieldSpec { key: "url", external: "SourceUrl", kind: FieldKind::String, default: FieldDefault::Str("https://example.org/") },
    FieldSpec { key: "file", external: "SourceFile", kind: FieldKind::String, default: FieldDefault::Str("") },
    FieldSpec { key: "w", external: "CanvasWidth", kind: FieldKind::Number, default: FieldDefault::Num(1280.0) },
    FieldSpec { key: "h", external: "CanvasHeight", kind: FieldKind::Number, default: FieldDefault::Num(720.0) },
    FieldSpec { key: "fps", external: "FrameRate", kind: FieldKind::Number, default: FieldDefault::Num(30.0) },
    FieldSpec { key: "zoom", external: "PageZoom", kind: FieldKind::Number, default: FieldDefault::Num(1.0) },
    FieldSpec { key: "bg", external: "BackgroundColor", kind: FieldKind::String, default: FieldDefault::Str("#00000000") },
    FieldSpec { key: "trans", external: "TransparentBody", kind: FieldKind::Boolean, default: FieldDefault::Bool(true) },
    FieldSpec { key: "audio", external: "CaptureAudio", kind: FieldKind::Boolean, default: FieldDefault::Bool(true) },
    FieldSpec { key: "arate", external: "AudioSampleRate", kind: FieldKind::Number, default: FieldDefault::Num(48000.0) },
    FieldSpec { key: "ach", external: "AudioChannels", kind: FieldKind::Number, default: FieldDefault::Num(2.0) },
    FieldSpec { key: "out", external: "OutputEnabled", kind: FieldKind::Boolean, default: FieldDefault::Bool(true) },
    FieldSpec { key: "sink", external: "SinkKind", kind: FieldKind::String, default: FieldDefault::Str("stream") },
    FieldSpec { key: "sname", external: "StreamName", kind: FieldKind::String, default: FieldDefault::Str("") },
    FieldSpec { key: "sgroup", external: "StreamGroup", kind: FieldKind::String, default: FieldDefault::Str("") },
    FieldSpec { key: "alpha", external: "StreamAlpha", kind: FieldKind::Boolean, default: FieldDefault::Bool(true) },
    FieldSpec { key: "rec", external: "RecordEnabled", kind: FieldKind::Boolean, default: FieldDefault::Bool(false) },
    FieldSpec { key: "rdir", external: "RecordDirectory", kind: FieldKind::String, default: FieldDefault::Str("") },
    FieldSpec { key: "rfmt", external: "RecordFormat", kind: FieldKind::String, default: FieldDefault::Str("matroska") },
    FieldSpec { key: "vbr", external: "VideoBitrateKbps", kind: FieldKind::Number, default: FieldDefault::Num(8000.0) },
    FieldSpec { key: "abr", external: "AudioBitrateKbps", kind: FieldKind::Number, default: FieldDefault::Num(192.0) },
    FieldSpec { key: "gpu", external: "GpuRendering", kind: FieldKind::Boolean, default: FieldDefault::Bool(true) },
    FieldSpec { key: "delay", external: "StartDelayMs", kind: FieldKind::Number, default: FieldDefault::Num(0.0) },
    FieldSpec { key: "refresh", external: "RefreshIntervalSec", kind: FieldKind::Number, default: FieldDefault::Num(0.0) },
    FieldSpec { key: "ua", external: "UserAgent", kind: FieldKind::String, default: FieldDefault::Str("") },
    FieldSpec { key: "css", external: "InjectCss", kind: FieldKind::String, default: FieldDefault::Str("") },
    FieldSpec { key: "js", external: "InjectJs", kind: FieldKind::String, default: FieldDefault::Str("") },
    FieldSpec { key: "hdr", external: "ExtraHttpHeaders", kind: FieldKind::String, default: FieldDefault::Str("") },
    FieldSpec { key: "cache", external: "AllowCache", kind: FieldKind::Boolean, default: FieldDefault::Bool(true) },
    FieldSpec { key: "insec", external: "AllowInsecureTls", kind: FieldKind::Boolean, default: FieldDefault::Bool(false) },
    FieldSpec { key: "mute", external: "MuteLocalAudio", kind: FieldKind::Boolean, default: FieldDefault::Bool(true) },
    FieldSpec { key: "vol", external: "OutputVolumePct", kind: FieldKind::Number, default: FieldDefault::Num(100.0) },
    FieldSpec { key: "loop", external: "LoopMedia", kind: FieldKind::Boolean, default: FieldDefault::Bool(true) },
    FieldSpec { key: "prev", external: "PreviewEnabled", kind: FieldKind::Boolean, default: FieldDefault::Bool(false) },
    FieldSpec { key: "px", external: "PreviewX", kind: FieldKind::Number, default: FieldDefault::Num(0.0) },
    FieldSpec { key: "py", external: "PreviewY", kind: FieldKind::Number, default: FieldDefault::Num(0.0) },
    FieldSpec { key: "color", external: "AccentColor", kind: FieldKind::String, default: FieldDefault::Str("#2e7d32") },
    FieldSpec { key: "note", external: "OperatorNote", kind: FieldKind::String, default: FieldDefault::Str("") },
    FieldSpec { key: "auto", external: "AutoStart", kind: FieldKind::Boolean, default: FieldDefault::Bool(false) },
];

/// Long names that older releases wrote into bundles. They are recognized
/// on import and dropped without complaint.
pub const RETIRED_FIELDS: &[&str] = &[
    "FlashVersion",
    "SingleProcessMode",
    "FrameSkipping",
    "DirectXCapture",
    "PluginPath",
    "LegacyAudioMixer",
];

/// Enumerated values that changed meaning between releases.
pub const VALUE_MIGRATIONS: &[ValueMigration] = &[
    ValueMigration { key: "input", from: "swf", to: "web" },
];

/// Look up a field by its compact key.
pub fn field(key: &str) -> Option<&'static FieldSpec> {
    SCHEMA.iter().find(|f| f.key == key)
}

/// Look up a field by its long bundle name.
pub fn field_by_external(name: &str) -> Option<&'static FieldSpec> {
    SCHEMA.iter().find(|f| f.external == name)
}

pub fn is_retired(name: &str) -> bool {
    RETIRED_FIELDS.contains(&name)
}

/// A fresh record carrying every field at its default.
pub fn default_record() -> Map<String, Value> {
    let mut record = Map::new();
    for spec in SCHEMA {
        record.insert(spec.key.to_string(), spec.default.value());
    }
    record
}

/// Render a float as a JSON number, collapsing whole values to integers so
/// defaults like 1280 round-trip without a trailing `.0`.
pub fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < (i64::MAX as f64) {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

/// Normalize a record in place. Returns how many changes were made; zero
/// means the record was already canonical. Running it twice never changes
/// anything on the second pass.
///
/// The `id` key is never touched. Order of work: value migrations, then
/// per-field default/coerce, then unknown-key pruning.
pub fn sanitize(record: &mut Map<String, Value>) -> usize {
    let mut changed = 0;

    for mig in VALUE_MIGRATIONS {
        if record.get(mig.key).and_then(Value::as_str) == Some(mig.from) {
            record.insert(mig.key.to_string(), Value::String(mig.to.to_string()));
            changed += 1;
        }
    }

    for spec in SCHEMA {
        match record.get(spec.key) {
            None => {
                record.insert(spec.key.to_string(), spec.default.value());
                changed += 1;
            }
            Some(value) => {
                if let Some(fixed) = coerce(spec, value) {
                    record.insert(spec.key.to_string(), fixed);
                    changed += 1;
                }
            }
        }
    }

    let unknown: Vec<String> = record
        .keys()
        .filter(|k| k.as_str() != "id" && field(k).is_none())
        .cloned()
        .collect();
    for key in unknown {
        record.remove(&key);
        changed += 1;
    }

    changed
}

/// Fit `value` to the declared kind. `None` means it already fits; `Some`
/// is the replacement (a best-effort conversion, or the field default when
/// the value cannot be read as the declared type at all).
fn coerce(spec: &FieldSpec, value: &Value) -> Option<Value> {
    match spec.kind {
        FieldKind::String => match value {
            Value::String(_) => None,
            Value::Number(n) => Some(Value::String(n.to_string())),
            Value::Bool(b) => Some(Value::String(b.to_string())),
            _ => Some(spec.default.value()),
        },
        FieldKind::Number => match value {
            Value::Number(_) => None,
            Value::String(s) => match s.trim().parse::<f64>() {
                Ok(n) if n.is_finite() => Some(number_value(n)),
                _ => Some(spec.default.value()),
            },
            Value::Bool(b) => Some(number_value(if *b { 1.0 } else { 0.0 })),
            _ => Some(spec.default.value()),
        },
        FieldKind::Boolean => match value {
            Value::Bool(_) => None,
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Some(Value::Bool(true)),
                "false" | "0" | "no" | "off" => Some(Value::Bool(false)),
                _ => Some(spec.default.value()),
            },
            Value::Number(n) => Some(Value::Bool(n.as_f64().unwrap_or(0.0) != 0.0)),
            _ => Some(spec.default.value()),
        },
    }
}
