//! The structured-output contract for skin analysis: the instructions and
//! schema sent to the provider, and the validation applied to its reply.

use log::warn;
use serde_json::{ json, Map, Value as JsonValue };
use thiserror::Error;

use crate::models::report::{ clamp_confidence, PossibleCondition };

pub const MAX_CONDITIONS: usize = 3;

pub const ANALYSIS_INSTRUCTIONS: &str =
    "You are an expert dermatological AI assistant. Analyze the provided image of a skin condition. \
Your response must be a valid JSON object, without any markdown formatting. \
Identify up to 3 possible conditions with their respective details. \
Provide a confidence score between 0 and 100 for each. \
Include general, non-prescriptive treatment suggestions and common symptoms.";

pub fn response_schema() -> JsonValue {
    json!({
        "type": "object",
        "properties": {
            "possible_conditions": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": {
                            "type": "string",
                            "description": "Name of the potential skin condition."
                        },
                        "confidence_score": {
                            "type": "number",
                            "description": "A score from 0 to 100 representing confidence."
                        },
                        "description": {
                            "type": "string",
                            "description": "A detailed description of the condition."
                        },
                        "symptoms": {
                            "type": "array",
                            "items": { "type": "string" },
                            "description": "Common symptoms associated with the condition."
                        },
                        "treatment_suggestions": {
                            "type": "string",
                            "description": "General, non-prescriptive advice. Start with 'General advice:'"
                        }
                    },
                    "required": ["name", "confidence_score", "description"]
                }
            },
            "disclaimer": {
                "type": "string",
                "description": "A mandatory disclaimer about consulting a healthcare professional."
            }
        },
        "required": ["possible_conditions", "disclaimer"]
    })
}

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("reply is not JSON: {0}")]
    NotJson(#[from] serde_json::Error),

    #[error("reply is not a JSON object")]
    NotAnObject,

    #[error("missing field `{0}`")]
    MissingField(String),

    #[error("field `{field}` should be {expected}")]
    WrongType {
        field: String,
        expected: &'static str,
    },
}

/// The provider-supplied part of a report, validated and normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportBody {
    pub possible_conditions: Vec<PossibleCondition>,
    pub disclaimer: String,
}

/// Providers occasionally wrap JSON in a markdown fence despite being told not to.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn wrong_type(field: impl Into<String>, expected: &'static str) -> ContractError {
    ContractError::WrongType { field: field.into(), expected }
}

fn required_string(obj: &Map<String, JsonValue>, field: &str, path: &str) -> Result<String, ContractError> {
    match obj.get(field) {
        Some(JsonValue::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(JsonValue::String(_)) | Some(JsonValue::Null) | None => {
            Err(ContractError::MissingField(format!("{}{}", path, field)))
        }
        Some(_) => Err(wrong_type(format!("{}{}", path, field), "a string")),
    }
}

fn optional_string(obj: &Map<String, JsonValue>, field: &str, path: &str) -> Result<Option<String>, ContractError> {
    match obj.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) if s.trim().is_empty() => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s.trim().to_string())),
        Some(_) => Err(wrong_type(format!("{}{}", path, field), "a string")),
    }
}

fn optional_string_list(
    obj: &Map<String, JsonValue>,
    field: &str,
    path: &str
) -> Result<Option<Vec<String>>, ContractError> {
    match obj.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    JsonValue::String(s) if !s.trim().is_empty() => out.push(s.trim().to_string()),
                    JsonValue::String(_) => {}
                    _ => {
                        return Err(wrong_type(format!("{}{}", path, field), "a list of strings"));
                    }
                }
            }
            Ok(Some(out))
        }
        Some(_) => Err(wrong_type(format!("{}{}", path, field), "a list of strings")),
    }
}

fn parse_condition(index: usize, value: &JsonValue) -> Result<PossibleCondition, ContractError> {
    let path = format!("possible_conditions[{}].", index);
    let obj = value
        .as_object()
        .ok_or_else(|| wrong_type(format!("possible_conditions[{}]", index), "an object"))?;

    let confidence_score = match obj.get("confidence_score") {
        Some(JsonValue::Number(n)) => {
            n.as_f64().ok_or_else(|| wrong_type(format!("{}confidence_score", path), "a number"))?
        }
        None | Some(JsonValue::Null) => {
            return Err(ContractError::MissingField(format!("{}confidence_score", path)));
        }
        Some(_) => {
            return Err(wrong_type(format!("{}confidence_score", path), "a number"));
        }
    };

    Ok(PossibleCondition {
        name: required_string(obj, "name", &path)?,
        confidence_score: clamp_confidence(confidence_score),
        description: required_string(obj, "description", &path)?,
        symptoms: optional_string_list(obj, "symptoms", &path)?,
        treatment_suggestions: optional_string(obj, "treatment_suggestions", &path)?,
    })
}

/// Validates a provider reply against the contract. Scores are clamped into
/// `[0, 100]` and anything past the third condition is dropped.
pub fn parse_report_body(text: &str) -> Result<ReportBody, ContractError> {
    let value: JsonValue = serde_json::from_str(strip_code_fence(text))?;
    let root = value.as_object().ok_or(ContractError::NotAnObject)?;

    let conditions = match root.get("possible_conditions") {
        Some(JsonValue::Array(items)) => items,
        None | Some(JsonValue::Null) => {
            return Err(ContractError::MissingField("possible_conditions".to_string()));
        }
        Some(_) => {
            return Err(wrong_type("possible_conditions", "a list"));
        }
    };
    if conditions.len() > MAX_CONDITIONS {
        warn!(
            "Provider returned {} conditions, keeping the first {}",
            conditions.len(),
            MAX_CONDITIONS
        );
    }

    let possible_conditions = conditions
        .iter()
        .take(MAX_CONDITIONS)
        .enumerate()
        .map(|(index, value)| parse_condition(index, value))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ReportBody {
        possible_conditions,
        disclaimer: required_string(root, "disclaimer", "")?,
    })
}
