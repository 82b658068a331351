//! Stage-two C2 wire ABI.
//!
//! The Windows stage-two accepts newline-terminated JSON arrays of the form
//! `["ClassName", "method_name", arg1, arg2, ...]` and answers with a single
//! JSON object line `{"error": int, "result": any, "message": string?}`.
//! Binary file reads and writes use a length-prefixed raw byte window between
//! two JSON envelopes (see [`crate::wire`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single static-method invocation sent to stage two.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    /// The type name where the target method resides (e.g. `"File"`).
    pub class: String,
    /// The method to invoke.
    pub method: String,
    /// Positional arguments; anything JSON-serializable.
    pub args: Vec<Value>,
}

impl MethodCall {
    pub fn new(class: &str, method: &str, args: Vec<Value>) -> Self {
        MethodCall {
            class: class.to_string(),
            method: method.to_string(),
            args,
        }
    }

    /// Encode as a single newline-terminated JSON array line.
    pub fn encode(&self) -> Vec<u8> {
        let mut array = Vec::with_capacity(self.args.len() + 2);
        array.push(Value::String(self.class.clone()));
        array.push(Value::String(self.method.clone()));
        array.extend(self.args.iter().cloned());

        // serde_json cannot fail on Value input
        let mut line = serde_json::to_vec(&Value::Array(array)).unwrap_or_default();
        line.push(b'\n');
        line
    }
}

/// A response envelope from stage two.
///
/// `error` zero means success; any other value is a failure code with an
/// optional human readable `message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodResponse {
    pub error: i64,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl MethodResponse {
    /// Parse a single response line. The trailing newline may be present.
    pub fn decode(line: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(line)
    }

    pub fn ok(result: Value) -> Self {
        MethodResponse {
            error: 0,
            result,
            message: None,
        }
    }

    pub fn failure(error: i64, message: &str) -> Self {
        MethodResponse {
            error,
            result: Value::Null,
            message: Some(message.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error == 0
    }
}

/// Well-known stage-two failure codes, mirroring the Win32 errors the C2
/// forwards for file and process operations.
pub mod code {
    pub const FILE_NOT_FOUND: i64 = 2;
    pub const PATH_NOT_FOUND: i64 = 3;
    pub const ACCESS_DENIED: i64 = 5;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_encodes_as_json_array_line() {
        let call = MethodCall::new("Process", "process", vec![json!("whoami"), json!(1)]);
        let line = call.encode();
        assert_eq!(line.last(), Some(&b'\n'));
        let parsed: Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(parsed, json!(["Process", "process", "whoami", 1]));
    }

    #[test]
    fn response_decodes_with_optional_message() {
        let resp = MethodResponse::decode(br#"{"error":0,"result":{"pid":42}}"#).unwrap();
        assert!(resp.is_success());
        assert_eq!(resp.result["pid"], 42);
        assert!(resp.message.is_none());

        let resp =
            MethodResponse::decode(br#"{"error":5,"result":null,"message":"denied"}"#).unwrap();
        assert!(!resp.is_success());
        assert_eq!(resp.error, code::ACCESS_DENIED);
        assert_eq!(resp.message.as_deref(), Some("denied"));
    }

    #[test]
    fn response_missing_result_defaults_to_null() {
        let resp = MethodResponse::decode(br#"{"error":1}"#).unwrap();
        assert_eq!(resp.result, Value::Null);
    }
}
