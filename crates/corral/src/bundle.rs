//! Portable instance-bundle format.
//!
//! A bundle is a line-oriented text file meant to be hand-editable and
//! diff-friendly: a comment header, then one `[[instance]]` block per
//! instance with `LongName = "value"` lines. Every value is quoted, whatever
//! its type, so a title like `123` cannot be mistaken for a number on the
//! way back in. Field names use the long external names from the schema so
//! the file stays readable without the crate's key table at hand.
//!
//! Rendering always writes fields in canonical schema order with `Id`
//! first. Parsing is strict about line structure (bad lines name their line
//! number) but tolerant about content: unknown and retired names are
//! dropped, types are fixed up by the sanitizer, and instances without an
//! `Id` get a fresh one.

use serde_json::{Map, Value};

use crate::error::ControlError;
use crate::instance::InstanceConfig;
use crate::schema;

/// Bumped when the on-disk shape changes. Format 1 was the pre-rewrite
/// layout that still carried the retired plugin-era fields.
pub const FORMAT_VERSION: u32 = 2;

const BLOCK_HEADER: &str = "[[instance]]";

/// Render a bundle for the given configs, in the order given.
pub fn render(configs: &[InstanceConfig]) -> String {
    let mut out = String::new();
    out.push_str(&format!("# corral instance bundle format {FORMAT_VERSION}\n"));
    out.push_str(&format!(
        "# generator: corral {}\n",
        env!("CARGO_PKG_VERSION")
    ));
    out.push_str(&format!(
        "# saved: {}\n",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    ));

    for config in configs {
        out.push('\n');
        out.push_str(BLOCK_HEADER);
        out.push('\n');
        push_field(&mut out, "Id", &Value::String(config.id().to_string()));
        for spec in schema::SCHEMA {
            if let Some(value) = config.as_record().get(spec.key) {
                push_field(&mut out, spec.external, value);
            }
        }
    }
    out
}

/// Parse a bundle. Returns configs in file order, sanitized, with ids
/// assigned where missing. Fails only on structural problems, never on
/// content, and a failure names the offending line.
pub fn parse(text: &str) -> Result<Vec<InstanceConfig>, ControlError> {
    let mut configs = Vec::new();
    let mut current: Option<Map<String, Value>> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if line.starts_with("[[") {
            if line != BLOCK_HEADER {
                return Err(parse_err(line_no, format!("unknown section {line}")));
            }
            if let Some(record) = current.take() {
                configs.push(InstanceConfig::new(record).0);
            }
            current = Some(Map::new());
            continue;
        }

        let Some((name, rest)) = line.split_once('=') else {
            return Err(parse_err(line_no, "expected Name = \"value\"".to_string()));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(parse_err(line_no, "missing field name".to_string()));
        }
        let value = unquote(rest.trim())
            .map_err(|reason| parse_err(line_no, reason))?;

        let Some(record) = current.as_mut() else {
            return Err(parse_err(line_no, "field outside instance block".to_string()));
        };

        if name == "Id" {
            record.insert("id".to_string(), Value::String(value));
        } else if let Some(spec) = schema::field_by_external(name) {
            // Values land as strings here; the sanitizer restores types.
            record.insert(spec.key.to_string(), Value::String(value));
        }
        // Retired and unknown names are dropped without complaint.
    }

    if let Some(record) = current.take() {
        configs.push(InstanceConfig::new(record).0);
    }
    Ok(configs)
}

fn parse_err(line: usize, reason: String) -> ControlError {
    ControlError::ImportParse { line, reason }
}

fn push_field(out: &mut String, name: &str, value: &Value) {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    };
    out.push_str(name);
    out.push_str(" = \"");
    out.push_str(&escape(&text));
    out.push_str("\"\n");
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

/// Strip the surrounding quotes and undo [`escape`]. The input must be a
/// complete quoted token with nothing trailing.
fn unquote(token: &str) -> Result<String, String> {
    let mut chars = token.chars();
    if chars.next() != Some('"') {
        return Err("value is not quoted".to_string());
    }
    let mut out = String::new();
    loop {
        match chars.next() {
            None => return Err("unclosed quote".to_string()),
            Some('"') => break,
            Some('\\') => match chars.next() {
                None => return Err("unclosed quote".to_string()),
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
            },
            Some(other) => out.push(other),
        }
    }
    if chars.next().is_some() {
        return Err("trailing characters after closing quote".to_string());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn config(v: serde_json::Value) -> InstanceConfig {
        match v {
            Value::Object(m) => InstanceConfig::new(m).0,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn test_round_trip_preserves_records() {
        let a = config(json!({"title": "Cam 1", "w": 1920, "h": 1080, "zoom": 1.25}));
        let b = config(json!({"title": "Overlay", "trans": true, "css": "body { color: red; }"}));
        let text = render(&[a.clone(), b.clone()]);

        let parsed = parse(&text).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], a);
        assert_eq!(parsed[1], b);
    }

    #[test]
    fn test_numeric_looking_title_stays_a_string() {
        let original = config(json!({"title": "123"}));
        let parsed = parse(&render(&[original])).unwrap();
        assert_eq!(parsed[0].as_record()["title"], json!("123"));
    }

    #[test]
    fn test_escapes_survive_round_trip() {
        let original = config(json!({
            "title": "quote \" backslash \\ done",
            "css": "line one\nline two\ttabbed",
        }));
        let parsed = parse(&render(&[original.clone()])).unwrap();
        assert_eq!(parsed[0], original);
    }

    #[test]
    fn test_retired_and_unknown_fields_are_dropped() {
        let mut text = String::from("[[instance]]\nId = \"abc\"\nTitle = \"legacy\"\n");
        for name in schema::RETIRED_FIELDS {
            text.push_str(&format!("{name} = \"leftover\"\n"));
        }
        text.push_str("NeverHeardOfIt = \"x\"\n");

        let parsed = parse(&text).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].id(), "abc");
        assert_eq!(parsed[0].title(), "legacy");
        let record = parsed[0].as_record();
        for name in schema::RETIRED_FIELDS {
            assert!(!record.contains_key(*name), "{name} survived the parse");
        }
        assert!(!record.contains_key("NeverHeardOfIt"));
    }

    #[test]
    fn test_missing_id_gets_assigned() {
        let text = "[[instance]]\nTitle = \"no id here\"\n";
        let parsed = parse(text).unwrap();
        assert!(!parsed[0].id().is_empty());
    }

    #[test]
    fn test_types_and_migrations_are_restored() {
        let text = "[[instance]]\n\
                    Title = \"typed\"\n\
                    CanvasWidth = \"1920\"\n\
                    TransparentBody = \"true\"\n\
                    InputKind = \"swf\"\n";
        let parsed = parse(text).unwrap();
        let record = parsed[0].as_record();
        assert_eq!(record["w"], json!(1920));
        assert_eq!(record["trans"], json!(true));
        assert_eq!(record["input"], json!("web"));
    }

    #[test]
    fn test_parse_errors_name_the_line() {
        let text = "# header\n\n[[instance]]\nTitle = \"ok\"\nBareWord\n";
        match parse(text) {
            Err(ControlError::ImportParse { line, .. }) => assert_eq!(line, 5),
            other => panic!("expected parse error, got {other:?}"),
        }

        let text = "Title = \"orphan\"\n";
        match parse(text) {
            Err(ControlError::ImportParse { line, reason }) => {
                assert_eq!(line, 1);
                assert!(reason.contains("outside instance block"));
            }
            other => panic!("expected parse error, got {other:?}"),
        }

        let text = "[[instance]]\nTitle = unquoted\n";
        match parse(text) {
            Err(ControlError::ImportParse { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_header_comments_are_ignored() {
        let rendered = render(&[config(json!({"title": "x"}))]);
        assert!(rendered.starts_with(&format!(
            "# corral instance bundle format {FORMAT_VERSION}\n"
        )));
        // A parser that choked on its own header would be useless.
        assert!(parse(&rendered).is_ok());
    }

    #[test]
    fn test_empty_input_is_an_empty_set() {
        assert!(parse("").unwrap().is_empty());
        assert!(parse("# only comments\n\n").unwrap().is_empty());
    }
}
