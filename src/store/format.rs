//! Line encodings for task records.
//!
//! The current format (version 4) is one record per line:
//!
//! ```text
//! [description:"buy milk" entry:"1700000000" status:"pending" uuid:"…"]
//! ```
//!
//! Values are JSON-string escaped, then `[` and `]` are replaced with
//! `&open;` and `&close;` so a value can never terminate the record early.
//! JSON object lines are accepted on input as well. Formats 1 through 3 are
//! recognised only so they can be rejected with a clear message.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::task::Task;

/// Version 2 and 3 lines open with a bare uuid followed by a status flag.
static LEGACY_UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12} [-+Xr]")
        .unwrap()
});

/// Version 3 adds an annotations group: `[tags] [atts] [annos] description`.
static FF3_GROUPS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\] \[.*\] \[.*\] ").unwrap());

/// The opening of a format 4 record: a bracket, then `name:"`. Version 1
/// attributes were never quoted, so a line cut short after this is still 4.
static F4_HEAD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"^\[[^\s:\[\]"]+:""#).unwrap());

/// Why a single line could not become a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineError {
    Malformed(String),
    Obsolete(u8),
}

/// Parse one stored line into a task.
pub fn parse_line(line: &str) -> Result<Task, LineError> {
    let line = line.trim_end_matches(['\n', '\r']);

    let parsed = if line.starts_with('[') {
        parse_f4(line)
    } else if line.starts_with('{') {
        parse_json(line)
    } else {
        Err("Record not recognized as format 4".to_string())
    };

    match parsed {
        Ok(data) => {
            if !data.contains_key("uuid") {
                return Err(LineError::Malformed("Record has no uuid".into()));
            }
            Ok(Task::from_data(data))
        }
        Err(message) => match determine_version(line) {
            version @ 1..=3 => Err(LineError::Obsolete(version)),
            4 => Err(LineError::Malformed(message)),
            _ => Err(LineError::Malformed(
                "Unrecognized file format or blank line in data".into(),
            )),
        },
    }
}

/// Identify which historical file format a line resembles. Zero means unknown.
pub fn determine_version(line: &str) -> u8 {
    if LEGACY_UUID_RE.is_match(line) {
        return if FF3_GROUPS_RE.is_match(&line[36..]) { 3 } else { 2 };
    }

    if line.starts_with('[') && line.ends_with(']') && line.contains("uuid:\"") {
        return 4;
    }

    // A write cut short loses the closing bracket.
    if F4_HEAD_RE.is_match(line) {
        return 4;
    }

    if line.starts_with("X [") || (line.starts_with('[') && !line.ends_with(']') && line.len() > 3) {
        return 1;
    }

    0
}

fn parse_f4(line: &str) -> Result<BTreeMap<String, String>, String> {
    let inner = line
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(|| "Record is not enclosed in brackets".to_string())?;

    if inner.is_empty() {
        return Err("Empty record in input".into());
    }

    let mut data = BTreeMap::new();
    let bytes = inner.as_bytes();
    let mut pos = 0;

    while pos < bytes.len() {
        let colon = inner[pos..]
            .find(':')
            .map(|offset| pos + offset)
            .ok_or_else(|| "Unrecognized characters at end of line".to_string())?;
        let name = &inner[pos..colon];
        if name.is_empty() || name.contains(' ') || bytes.get(colon + 1) != Some(&b'"') {
            return Err("Unrecognized characters at end of line".into());
        }

        // Scan to the closing quote, honouring backslash escapes.
        let start = colon + 2;
        let mut end = start;
        let mut escaped = false;
        loop {
            match bytes.get(end) {
                None => return Err(format!("Unterminated value for attribute '{name}'")),
                Some(b'\\') if !escaped => escaped = true,
                Some(b'"') if !escaped => break,
                Some(_) => escaped = false,
            }
            end += 1;
        }

        data.insert(name.to_string(), decode_value(&inner[start..end])?);

        pos = end + 1;
        if bytes.get(pos) == Some(&b' ') {
            pos += 1;
        }
    }

    Ok(data)
}

fn parse_json(line: &str) -> Result<BTreeMap<String, String>, String> {
    let value: serde_json::Value = serde_json::from_str(line).map_err(|e| e.to_string())?;
    let object = value
        .as_object()
        .ok_or_else(|| "JSON record is not an object".to_string())?;

    let mut data = BTreeMap::new();
    for (name, value) in object {
        let text = match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Array(items) => items
                .iter()
                .filter_map(|i| i.as_str())
                .collect::<Vec<_>>()
                .join(","),
            _ => continue,
        };
        data.insert(name.clone(), text);
    }
    Ok(data)
}

/// Compose the format 4 line for a task. Empty values are omitted.
pub fn compose_f4(task: &Task) -> String {
    let attrs: Vec<String> = task
        .data
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(name, value)| format!("{name}:\"{}\"", encode_value(value)))
        .collect();
    format!("[{}]", attrs.join(" "))
}

/// Compose the JSON object line used by the backlog.
pub fn compose_json(task: &Task) -> String {
    let object: serde_json::Map<String, serde_json::Value> = task
        .data
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(name, value)| (name.clone(), serde_json::Value::String(value.clone())))
        .collect();
    serde_json::Value::Object(object).to_string()
}

fn encode_value(value: &str) -> String {
    let quoted = serde_json::Value::String(value.to_string()).to_string();
    let escaped = &quoted[1..quoted.len() - 1];
    escaped.replace('[', "&open;").replace(']', "&close;")
}

/// Inverse of `encode_value`. A value that literally contained `&open;` or
/// `&close;` comes back as a bracket; that loss is accepted.
fn decode_value(raw: &str) -> Result<String, String> {
    let raw = raw.replace("&open;", "[").replace("&close;", "]");
    if !raw.contains('\\') {
        return Ok(raw);
    }
    serde_json::from_str::<String>(&format!("\"{raw}\"")).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: &str = "550e8400-e29b-41d4-a716-446655440000";

    #[test]
    fn parse_simple_record() {
        let line = format!("[description:\"buy milk\" status:\"pending\" uuid:\"{UUID}\"]");
        let task = parse_line(&line).unwrap();
        assert_eq!(task.description(), "buy milk");
        assert_eq!(task.get("uuid"), Some(UUID));
    }

    #[test]
    fn special_characters_survive() {
        let mut task = Task::new("say \"hi\" [loudly] \\ then\nleave");
        task.set("uuid", UUID);
        let line = compose_f4(&task);
        assert!(!line[1..line.len() - 1].contains('['));
        assert!(line.contains("&open;loudly&close;"));
        assert_eq!(parse_line(&line).unwrap(), task);
    }

    #[test]
    fn compose_sorts_and_skips_empty() {
        let mut task = Task::new("x");
        task.set("uuid", UUID);
        task.set("project", "");
        assert_eq!(compose_f4(&task), format!("[description:\"x\" uuid:\"{UUID}\"]"));
    }

    #[test]
    fn json_lines_are_accepted() {
        let line = format!(r#"{{"uuid":"{UUID}","description":"from json","urgency":4.5,"tags":["a","b"]}}"#);
        let task = parse_line(&line).unwrap();
        assert_eq!(task.description(), "from json");
        assert_eq!(task.get("urgency"), Some("4.5"));
        assert_eq!(task.tags(), vec!["a", "b"]);
    }

    #[test]
    fn compose_json_is_parseable() {
        let mut task = Task::new("queued");
        task.set("uuid", UUID);
        let json = compose_json(&task);
        assert_eq!(parse_line(&json).unwrap(), task);
    }

    #[test]
    fn trailing_garbage_is_malformed() {
        let line = format!("[uuid:\"{UUID}\" oops]");
        assert!(matches!(parse_line(&line), Err(LineError::Malformed(_))));
    }

    #[test]
    fn missing_uuid_is_malformed() {
        assert_eq!(
            parse_line("[description:\"orphan\"]"),
            Err(LineError::Malformed("Record has no uuid".into()))
        );
    }

    #[test]
    fn obsolete_formats_are_detected() {
        let ff2 = format!("{UUID} - [home] [pri:H] fix the sink");
        assert_eq!(parse_line(&ff2), Err(LineError::Obsolete(2)));

        let ff3 = format!("{UUID} - [home] [pri:H] [1234:note] fix the sink");
        assert_eq!(parse_line(&ff3), Err(LineError::Obsolete(3)));

        assert_eq!(parse_line("X [home] [pri:H] fix the sink"), Err(LineError::Obsolete(1)));
    }

    #[test]
    fn truncated_record_is_format_4() {
        let line = "[description:\"half writ";
        assert_eq!(determine_version(line), 4);
        assert!(matches!(parse_line(line), Err(LineError::Malformed(_))));
        let cut = format!("[description:\"x\" uuid:\"{}", &UUID[..10]);
        assert!(matches!(parse_line(&cut), Err(LineError::Malformed(_))));
    }

    #[test]
    fn bracket_entities_decode_to_brackets() {
        let mut task = Task::new("literal &open; text");
        task.set("uuid", UUID);
        let back = parse_line(&compose_f4(&task)).unwrap();
        assert_eq!(back.description(), "literal [ text");
    }

    #[test]
    fn garbage_is_unrecognized() {
        assert!(matches!(parse_line("hello world"), Err(LineError::Malformed(_))));
    }
}
