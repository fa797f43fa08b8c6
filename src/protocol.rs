//! Messages exchanged between the context manager and an isolation context.
//!
//! Outbound: one [`DispatchRequest`] per job. Inbound: the guest posts one
//! [`GuestMessage`] as JSON through `op_initminal_post_message`.

use crate::error::{ErrorPayload, EvalError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One evaluation request sent into a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    /// Loadable location of the rewritten guest module.
    pub code_url: String,
    /// JSON text of the call argument; `None` passes `undefined`.
    pub arg: Option<String>,
    /// Export to call (if a function) or read.
    pub call_target: String,
}

/// The guest's reply to a [`DispatchRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum GuestMessage {
    Success {
        #[serde(default)]
        result: Value,
    },
    Error {
        message: ErrorPayload,
    },
}

impl GuestMessage {
    /// Parse the JSON the bootstrap posted. Malformed replies become runtime
    /// errors carrying the raw text.
    pub fn from_json(json: &str) -> Self {
        serde_json::from_str(json).unwrap_or_else(|_| GuestMessage::Error {
            message: ErrorPayload::Message(json.to_string()),
        })
    }

    pub fn into_outcome(self) -> Result<Value, EvalError> {
        match self {
            GuestMessage::Success { result } => Ok(result),
            GuestMessage::Error { message } => Err(EvalError::Runtime { error: message }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GuestError;
    use serde_json::json;

    #[test]
    fn test_success_without_result_is_null() {
        let msg = GuestMessage::from_json(r#"{"kind":"success"}"#);
        assert_eq!(msg.into_outcome().unwrap(), Value::Null);
    }

    #[test]
    fn test_error_object_reply() {
        let msg = GuestMessage::from_json(
            r#"{"kind":"error","message":{"name":"ReferenceError","message":"B is not defined"}}"#,
        );
        assert_eq!(
            msg.into_outcome().unwrap_err(),
            EvalError::runtime(GuestError {
                name: "ReferenceError".into(),
                message: "B is not defined".into(),
                stack: None,
            })
        );
    }

    #[test]
    fn test_string_error_reply() {
        let msg = GuestMessage::from_json(r#"{"kind":"error","message":"unknown value"}"#);
        assert_eq!(msg.into_outcome().unwrap_err(), EvalError::runtime("unknown value"));
    }

    #[test]
    fn test_malformed_reply_is_runtime_error() {
        let msg = GuestMessage::from_json("not json");
        assert_eq!(msg.into_outcome().unwrap_err(), EvalError::runtime("not json"));
    }

    #[test]
    fn test_nested_result_value() {
        let msg = GuestMessage::from_json(r#"{"kind":"success","result":[["a","b"],["c","d"]]}"#);
        assert_eq!(msg.into_outcome().unwrap(), json!([["a", "b"], ["c", "d"]]));
    }
}
