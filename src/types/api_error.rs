use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The error object the endpoint returns on failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ApiErrorDetail {
    /// Human-readable description.
    #[serde(default)]
    pub message: Option<String>,

    /// Error category, e.g. `invalid_request_error` or `insufficient_quota`.
    #[serde(rename = "type", default)]
    pub error_type: Option<String>,

    /// The request parameter at fault, if any.
    #[serde(default)]
    pub param: Option<String>,

    /// Machine-readable code.  Usually a string, occasionally a number.
    #[serde(default)]
    pub code: Option<Value>,
}

impl ApiErrorDetail {
    /// The code rendered as a string, whatever its JSON type.
    pub fn code_str(&self) -> Option<String> {
        match &self.code {
            Some(Value::String(code)) => Some(code.clone()),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        }
    }

    /// True when the error reports that the account has no quota left.
    pub fn is_quota_exhausted(&self) -> bool {
        self.error_type.as_deref() == Some("insufficient_quota")
            || self.code_str().as_deref() == Some("insufficient_quota")
    }
}

/// Envelope around [`ApiErrorDetail`] as found in error response bodies.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ApiErrorBody {
    /// The error, when the body follows the documented shape.
    #[serde(default)]
    pub error: Option<ApiErrorDetail>,
}
