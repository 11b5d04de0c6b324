use std::time::Duration;

use crate::error::Error;
use crate::types::Usage;

/// A fully assembled assistant reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// The reply text, exactly as delivered.
    pub text: String,

    /// Token accounting, when the endpoint reported it.
    pub usage: Option<Usage>,

    /// Why generation stopped, when reported.
    pub finish_reason: Option<String>,

    /// The model that served the request, when reported.
    pub model: Option<String>,
}

impl Reply {
    /// Create a reply carrying only text.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
            finish_reason: None,
            model: None,
        }
    }

    /// Set the token usage.
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Set the finish reason.
    pub fn with_finish_reason(mut self, reason: impl Into<String>) -> Self {
        self.finish_reason = Some(reason.into());
        self
    }

    /// True when generation stopped at the output token limit.
    pub fn is_cut_off(&self) -> bool {
        self.finish_reason.as_deref() == Some("length")
    }
}

/// What the endpoint said about when to come back.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitHint {
    /// The server's requested wait, from the `retry-after` header.
    pub retry_after: Option<Duration>,

    /// Human-readable message from the error body.
    pub message: String,
}

impl RateLimitHint {
    /// Convert the hint into the error reported once retries are exhausted.
    pub fn into_error(self) -> Error {
        Error::rate_limit(self.message, self.retry_after.map(|d| d.as_secs()))
    }
}

/// Outcome of one round trip to the completion endpoint.
///
/// Produced by the transport client, consumed once by the chat session, never stored.
#[derive(Debug, Clone)]
pub enum ReplyResult {
    /// The reply was received and decoded.
    Success(Reply),

    /// The endpoint asked the client to slow down.
    RateLimited(RateLimitHint),

    /// A condition that may clear on its own (overload, timeout, network).
    TransientFailure(Error),

    /// The request cannot succeed as constructed (invalid, unauthorized, undecodable).
    FatalFailure(Error),
}

impl ReplyResult {
    /// True for [`ReplyResult::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, ReplyResult::Success(_))
    }

    /// True for outcomes that the retry loop should attempt again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReplyResult::RateLimited(_) | ReplyResult::TransientFailure(_)
        )
    }

    /// Classify an error by its retryability.
    pub fn from_error(err: Error) -> Self {
        if err.is_retryable() {
            ReplyResult::TransientFailure(err)
        } else {
            ReplyResult::FatalFailure(err)
        }
    }

    /// The reply, if this is a success.
    pub fn reply(&self) -> Option<&Reply> {
        match self {
            ReplyResult::Success(reply) => Some(reply),
            _ => None,
        }
    }

    /// The failure cause, if this is a failure.
    pub fn error(&self) -> Option<&Error> {
        match self {
            ReplyResult::TransientFailure(err) | ReplyResult::FatalFailure(err) => Some(err),
            _ => None,
        }
    }
}
