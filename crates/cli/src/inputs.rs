//! Parsing of `--parameters` values.
//!
//! Each value is a JSON object, a path to a file holding one, or
//! `key=value` pairs separated by `;`. Values are merged left to right.

use anyhow::{bail, Context, Result};
use std::path::Path;
use topograph_core::types::Parameters;

pub fn parse_all(values: &[String]) -> Result<Parameters> {
    let mut merged = Parameters::new();
    for value in values {
        merged.extend(parse(value)?);
    }
    Ok(merged)
}

pub fn parse(value: &str) -> Result<Parameters> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(Parameters::new());
    }

    if trimmed.starts_with('{') {
        return parse_object(trimmed).context("Failed to parse parameters as JSON");
    }

    let path = Path::new(trimmed);
    if path.is_file() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read parameters file {}", path.display()))?;
        return parse_object(&content)
            .with_context(|| format!("Failed to parse parameters file {}", path.display()));
    }

    parse_pairs(trimmed)
}

fn parse_object(content: &str) -> Result<Parameters> {
    match serde_json::from_str(content)? {
        serde_json::Value::Object(map) => Ok(map),
        other => bail!("parameters must be a JSON object, got {}", other),
    }
}

/// `k=v;k2=v2`; values that parse as JSON keep their type
fn parse_pairs(content: &str) -> Result<Parameters> {
    let mut parameters = Parameters::new();
    for pair in content.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("invalid parameter '{}', expected key=value", pair);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("invalid parameter '{}', key is empty", pair);
        }
        let raw = raw.trim();
        let value = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        parameters.insert(key.to_string(), value);
    }
    Ok(parameters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_each_format() {
        let parsed = parse(r#"{"operation": "builtin.log", "node_ids": ["vm"]}"#).unwrap();
        assert_eq!(parsed["node_ids"], json!(["vm"]));

        let parsed = parse("operation=builtin.log; run_by_dependency_order=true;count=3").unwrap();
        assert_eq!(parsed["operation"], json!("builtin.log"));
        assert_eq!(parsed["run_by_dependency_order"], json!(true));
        assert_eq!(parsed["count"], json!(3));

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("params.json");
        std::fs::write(&file, r#"{"operation_kwargs": {"force": true}}"#).unwrap();
        let parsed = parse(file.to_str().unwrap()).unwrap();
        assert_eq!(parsed["operation_kwargs"], json!({"force": true}));
    }

    #[test]
    fn later_values_win() {
        let merged = parse_all(&[
            "operation=a.one;extra=1".to_string(),
            r#"{"operation": "b.two"}"#.to_string(),
        ])
        .unwrap();
        assert_eq!(merged["operation"], json!("b.two"));
        assert_eq!(merged["extra"], json!(1));
    }

    #[test]
    fn rejects_malformed_values() {
        assert!(parse("no_equals_sign").is_err());
        assert!(parse("=value").is_err());
        assert!(parse("[1, 2]").is_err());
        assert!(parse("{not json").is_err());
    }
}
