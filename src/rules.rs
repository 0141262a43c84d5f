//! Runtime evaluation rules attached to rollouts.
//!
//! A rollout may restrict itself to subjects whose `custom_properties` satisfy either a flat
//! equality map (legacy) or a [JSON Logic](https://jsonlogic.com) document. Both kinds compare
//! strings case-insensitively.
use std::collections::HashMap;

use datalogic_rs::DataLogic;
use serde_json::{json, Map, Value};

/// Runtime rule of a rollout. Which kind of rule a rollout has is decided when the definitions
/// are parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeRule {
    /// Every property must equal the given value.
    Legacy(HashMap<String, Value>),
    /// A JSON Logic expression that must evaluate to a truthy value.
    Declarative(Value),
}

/// Error evaluating a runtime rule.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RuleError {
    /// The JSON Logic engine rejected the rule, e.g. an unknown operator or malformed arguments.
    #[error("failed to evaluate runtime rule: {0}")]
    Evaluation(String),
}

impl RuntimeRule {
    /// Check the rule against the subject's custom properties.
    ///
    /// Missing `custom_properties` never satisfy a rule.
    pub fn eval(&self, custom_properties: Option<&Map<String, Value>>) -> Result<bool, RuleError> {
        let Some(custom_properties) = custom_properties else {
            return Ok(false);
        };

        match self {
            RuntimeRule::Legacy(definition) => {
                let properties: HashMap<String, String> = custom_properties
                    .iter()
                    .map(|(key, value)| (key.to_lowercase(), to_js_string(value).to_lowercase()))
                    .collect();
                Ok(definition.iter().all(|(key, expected)| {
                    properties.get(&key.to_lowercase()).is_some_and(|actual| {
                        *actual == to_js_string(expected).to_lowercase()
                    })
                }))
            }
            RuntimeRule::Declarative(rule) => {
                let data = lowercase_keys_and_values(&Value::Object(custom_properties.clone()));
                // `!!` makes the engine apply its own truthiness rules to the result.
                let rule = json!({"!!": [lowercase_leaves(rule)]});
                // The engine allocates into an arena owned by the instance, so each evaluation
                // gets its own.
                let result = DataLogic::new()
                    .evaluate_json(&rule, &data, None)
                    .map_err(|err| RuleError::Evaluation(err.to_string()))?;
                Ok(result == Value::Bool(true))
            }
        }
    }
}

fn lowercase_keys_and_values(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.to_lowercase()),
        Value::Array(items) => Value::Array(items.iter().map(lowercase_keys_and_values).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.to_lowercase(), lowercase_keys_and_values(value)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Lowercase string leaves only. Object keys are operator names and stay untouched.
fn lowercase_leaves(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.to_lowercase()),
        Value::Array(items) => Value::Array(items.iter().map(lowercase_leaves).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), lowercase_leaves(value)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// String form of a value as JavaScript's `String()` would produce it.
pub(crate) fn to_js_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_owned(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e21 => format!("{f}"),
            _ => n.to_string(),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Null => String::new(),
                item => to_js_string(item),
            })
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => "[object Object]".to_owned(),
    }
}
