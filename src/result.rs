//! The tagged outcome of one evaluation.

use crate::error::EvalError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of a job: a value, or exactly one [`EvalError`].
///
/// Serializes as `{"success": true, "value": ...}` or
/// `{"success": false, "error": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireResult", try_from = "WireResult")]
pub enum EvalResult {
    Success(Value),
    Failure(EvalError),
}

impl EvalResult {
    pub fn is_success(&self) -> bool {
        matches!(self, EvalResult::Success(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            EvalResult::Success(value) => Some(value),
            EvalResult::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&EvalError> {
        match self {
            EvalResult::Success(_) => None,
            EvalResult::Failure(err) => Some(err),
        }
    }

    pub fn into_result(self) -> Result<Value, EvalError> {
        match self {
            EvalResult::Success(value) => Ok(value),
            EvalResult::Failure(err) => Err(err),
        }
    }
}

impl From<Result<Value, EvalError>> for EvalResult {
    fn from(result: Result<Value, EvalError>) -> Self {
        match result {
            Ok(value) => EvalResult::Success(value),
            Err(err) => EvalResult::Failure(err),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireResult {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<EvalError>,
}

impl From<EvalResult> for WireResult {
    fn from(result: EvalResult) -> Self {
        match result {
            // `null` must still be emitted for a successful `null`/`undefined` export.
            EvalResult::Success(value) => WireResult {
                success: true,
                value: Some(value),
                error: None,
            },
            EvalResult::Failure(err) => WireResult {
                success: false,
                value: None,
                error: Some(err),
            },
        }
    }
}

impl TryFrom<WireResult> for EvalResult {
    type Error = String;

    fn try_from(wire: WireResult) -> Result<Self, Self::Error> {
        match (wire.success, wire.error) {
            (true, None) => Ok(EvalResult::Success(wire.value.unwrap_or(Value::Null))),
            (false, Some(err)) => Ok(EvalResult::Failure(err)),
            (true, Some(_)) => Err("successful result must not carry an error".into()),
            (false, None) => Err("failed result must carry an error".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_shape() {
        let result = EvalResult::Success(json!("hello world"));
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({"success": true, "value": "hello world"})
        );
    }

    #[test]
    fn test_null_value_is_emitted() {
        let result = EvalResult::Success(Value::Null);
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({"success": true, "value": null})
        );
    }

    #[test]
    fn test_failure_shape() {
        let result = EvalResult::Failure(EvalError::Timeout);
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({"success": false, "error": {"kind": "error-eval-timeout"}})
        );
    }

    #[test]
    fn test_rejects_contradictory_wire_form() {
        let raw = json!({"success": false});
        assert!(serde_json::from_value::<EvalResult>(raw).is_err());
    }
}
