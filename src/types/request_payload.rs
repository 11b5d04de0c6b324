use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Turn;

/// Extra options for streamed completions.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamOptions {
    /// Ask the endpoint to send a final chunk carrying token usage.
    pub include_usage: bool,
}

/// The body of one chat-completion request.
///
/// A payload is a point-in-time copy of (a suffix of) the conversation plus the generation
/// options.  It has no setters; build a new one instead.  The field order here is the order on
/// the wire, so serializing the same payload twice yields identical bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestPayload {
    model: String,
    messages: Vec<Turn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(default)]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

impl RequestPayload {
    /// Create a new payload.
    pub fn new(
        model: impl Into<String>,
        messages: Vec<Turn>,
        temperature: Option<f32>,
        top_p: Option<f32>,
        max_tokens: Option<u32>,
        stream: bool,
    ) -> Self {
        let stream_options = if stream {
            Some(StreamOptions {
                include_usage: true,
            })
        } else {
            None
        };
        Self {
            model: model.into(),
            messages,
            temperature,
            top_p,
            max_tokens,
            stream,
            stream_options,
        }
    }

    /// The model identifier.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// The conversation sent with this request.
    pub fn messages(&self) -> &[Turn] {
        &self.messages
    }

    /// The sampling temperature, if set.
    pub fn temperature(&self) -> Option<f32> {
        self.temperature
    }

    /// The top-p value, if set.
    pub fn top_p(&self) -> Option<f32> {
        self.top_p
    }

    /// The output token limit, if set.
    pub fn max_tokens(&self) -> Option<u32> {
        self.max_tokens
    }

    /// True when the reply is requested as a server-sent event stream.
    pub fn stream(&self) -> bool {
        self.stream
    }

    /// Serialize the payload to its wire bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|err| {
            Error::serialization(
                format!("failed to serialize request payload: {err}"),
                Some(Box::new(err)),
            )
        })
    }

    /// Parse wire bytes back into a payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|err| {
            Error::serialization(
                format!("failed to parse request payload: {err}"),
                Some(Box::new(err)),
            )
        })
    }
}
