use serde::{Deserialize, Serialize};

use crate::types::{ApiErrorDetail, Usage};

/// The message inside a batch completion choice.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChoiceMessage {
    /// Role reported by the endpoint, normally `assistant`.
    #[serde(default)]
    pub role: Option<String>,

    /// The reply text.  The endpoint sends `null` when it produced no text.
    #[serde(default)]
    pub content: Option<String>,
}

/// One alternative in a batch completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Choice {
    /// Position of the choice.
    #[serde(default)]
    pub index: u32,

    /// The generated message.
    #[serde(default)]
    pub message: ChoiceMessage,

    /// Why generation stopped (`stop`, `length`, ...).
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// A batch (non-streamed) chat completion response body.
///
/// `error` is populated instead of `choices` when an otherwise successful HTTP exchange
/// carries an API error object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletion {
    /// Completion identifier.
    #[serde(default)]
    pub id: Option<String>,

    /// The model that served the request.
    #[serde(default)]
    pub model: Option<String>,

    /// Generated alternatives.
    #[serde(default)]
    pub choices: Vec<Choice>,

    /// Token accounting.
    #[serde(default)]
    pub usage: Option<Usage>,

    /// Embedded API error.
    #[serde(default)]
    pub error: Option<ApiErrorDetail>,
}
