//! Validation of execution parameters against a workflow's declarations.

use crate::error::ParameterError;
use crate::model::ParameterDeclaration;
use crate::types::Parameters;
use std::collections::BTreeMap;

/// Merge provided parameters with declared defaults.
///
/// Fails when a parameter without a default is missing or when an undeclared
/// parameter is provided. Both lists are reported sorted.
pub fn merge_and_validate(
    workflow: &str,
    declared: &BTreeMap<String, ParameterDeclaration>,
    provided: &Parameters,
) -> Result<Parameters, ParameterError> {
    let mut unexpected: Vec<String> = provided
        .keys()
        .filter(|name| !declared.contains_key(*name))
        .cloned()
        .collect();
    if !unexpected.is_empty() {
        unexpected.sort();
        return Err(ParameterError::Unexpected {
            workflow: workflow.to_string(),
            names: unexpected,
        });
    }

    let mut merged = Parameters::new();
    let mut missing = Vec::new();
    for (name, declaration) in declared {
        match (provided.get(name), &declaration.default) {
            (Some(value), _) => {
                merged.insert(name.clone(), value.clone());
            }
            (None, Some(default)) => {
                merged.insert(name.clone(), default.clone());
            }
            (None, None) => missing.push(name.clone()),
        }
    }

    if !missing.is_empty() {
        return Err(ParameterError::Missing {
            workflow: workflow.to_string(),
            names: missing,
        });
    }

    Ok(merged)
}

/// Read a required string parameter
pub fn required_str<'a>(parameters: &'a Parameters, name: &str) -> Result<&'a str, ParameterError> {
    parameters
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ParameterError::Invalid {
            name: name.to_string(),
            reason: "expected a string".to_string(),
        })
}

/// Read an optional boolean parameter; `null` counts as absent
pub fn optional_bool(parameters: &Parameters, name: &str) -> Result<Option<bool>, ParameterError> {
    match parameters.get(name) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(ParameterError::Invalid {
            name: name.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

/// Read an optional object parameter; `null` counts as empty
pub fn optional_object(parameters: &Parameters, name: &str) -> Result<Parameters, ParameterError> {
    match parameters.get(name) {
        None | Some(serde_json::Value::Null) => Ok(Parameters::new()),
        Some(serde_json::Value::Object(map)) => Ok(map.clone()),
        Some(_) => Err(ParameterError::Invalid {
            name: name.to_string(),
            reason: "expected an object".to_string(),
        }),
    }
}

/// Read an optional list of strings; `null` counts as empty
pub fn optional_str_list(
    parameters: &Parameters,
    name: &str,
) -> Result<Vec<String>, ParameterError> {
    let invalid = || ParameterError::Invalid {
        name: name.to_string(),
        reason: "expected a list of strings".to_string(),
    };
    match parameters.get(name) {
        None | Some(serde_json::Value::Null) => Ok(Vec::new()),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string).ok_or_else(invalid))
            .collect(),
        Some(_) => Err(invalid()),
    }
}
