//! Response decoding.
//!
//! Turns a [`RawResponse`] into a [`ReplyResult`].  Batch bodies are parsed as a single chat
//! completion; streamed bodies are fed through a [`StreamAssembler`], which understands the
//! server-sent-events framing used by the completion endpoint.

use std::time::Duration;

use tracing::debug;

use crate::error::Error;
use crate::observability::{STREAM_BYTES, STREAM_ERRORS, STREAM_EVENTS};
use crate::transport::{RawBody, RawResponse};
use crate::types::{
    ApiErrorBody, ApiErrorDetail, ChatCompletion, ChatCompletionChunk, RateLimitHint, Reply,
    ReplyResult, Usage,
};

/// Decode a complete response.
pub fn decode(raw: RawResponse) -> ReplyResult {
    let RawResponse {
        status,
        retry_after,
        request_id,
        body,
    } = raw;
    if !(200..300).contains(&status) {
        let bytes = match &body {
            RawBody::Complete(bytes) => bytes.to_vec(),
            RawBody::Streamed(chunks) => chunks.iter().flat_map(|c| c.iter().copied()).collect(),
        };
        return classify_status(status, &bytes, retry_after, request_id);
    }
    match body {
        RawBody::Complete(bytes) => decode_completion(&bytes, retry_after, request_id),
        RawBody::Streamed(chunks) => {
            let mut assembler = StreamAssembler::new();
            for chunk in &chunks {
                if let Some(result) = assembler.push(chunk) {
                    return result;
                }
            }
            assembler.finish()
        }
    }
}

/// Classify a non-success HTTP status and its error body.
pub fn classify_status(
    status: u16,
    body: &[u8],
    retry_after: Option<Duration>,
    request_id: Option<String>,
) -> ReplyResult {
    let detail = serde_json::from_slice::<ApiErrorBody>(body)
        .ok()
        .and_then(|body| body.error)
        .unwrap_or_default();
    let message = error_message(&detail, body, status);
    let retry_secs = retry_after.map(|d| d.as_secs());
    match status {
        400 | 413 | 422 => ReplyResult::FatalFailure(Error::bad_request(message, detail.param)),
        401 => ReplyResult::FatalFailure(Error::authentication(message)),
        403 => ReplyResult::FatalFailure(Error::permission(message)),
        404 => ReplyResult::FatalFailure(Error::not_found(message)),
        408 => ReplyResult::TransientFailure(Error::timeout(message, None)),
        409 => ReplyResult::TransientFailure(Error::api(
            status,
            detail.error_type,
            message,
            request_id,
        )),
        429 if detail.is_quota_exhausted() => {
            ReplyResult::FatalFailure(Error::quota_exceeded(message))
        }
        429 => ReplyResult::RateLimited(RateLimitHint {
            retry_after,
            message,
        }),
        500 => ReplyResult::TransientFailure(Error::internal_server(message, request_id)),
        502..=504 | 529 => {
            ReplyResult::TransientFailure(Error::service_unavailable(message, retry_secs))
        }
        500..=599 => ReplyResult::TransientFailure(Error::api(
            status,
            detail.error_type,
            message,
            request_id,
        )),
        _ => ReplyResult::FatalFailure(Error::api(
            status,
            detail.error_type,
            message,
            request_id,
        )),
    }
}

fn error_message(detail: &ApiErrorDetail, body: &[u8], status: u16) -> String {
    if let Some(message) = detail.message.as_ref().filter(|m| !m.is_empty()) {
        return message.clone();
    }
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        format!("HTTP status {status}")
    } else {
        text.to_string()
    }
}

/// Classify an error object delivered inside an otherwise successful exchange.
fn classify_embedded(
    detail: ApiErrorDetail,
    retry_after: Option<Duration>,
    request_id: Option<String>,
) -> ReplyResult {
    let message = detail
        .message
        .clone()
        .unwrap_or_else(|| "error reported by endpoint".to_string());
    if detail.is_quota_exhausted() {
        return ReplyResult::FatalFailure(Error::quota_exceeded(message));
    }
    let kind = detail
        .code_str()
        .or_else(|| detail.error_type.clone())
        .unwrap_or_default();
    match kind.as_str() {
        "rate_limit_exceeded" | "rate_limit_error" | "requests" | "tokens" => {
            ReplyResult::RateLimited(RateLimitHint {
                retry_after,
                message,
            })
        }
        "server_error" => ReplyResult::TransientFailure(Error::internal_server(message, request_id)),
        "overloaded" | "overloaded_error" | "service_unavailable" => {
            ReplyResult::TransientFailure(Error::service_unavailable(message, None))
        }
        _ => ReplyResult::FatalFailure(Error::api(200, detail.error_type, message, request_id)),
    }
}

fn decode_completion(
    body: &[u8],
    retry_after: Option<Duration>,
    request_id: Option<String>,
) -> ReplyResult {
    let completion: ChatCompletion = match serde_json::from_slice(body) {
        Ok(completion) => completion,
        Err(err) => {
            return ReplyResult::FatalFailure(Error::serialization(
                format!("invalid completion body: {err}"),
                Some(Box::new(err)),
            ));
        }
    };
    if let Some(detail) = completion.error {
        return classify_embedded(detail, retry_after, request_id);
    }
    let Some(choice) = completion.choices.into_iter().next() else {
        return ReplyResult::FatalFailure(Error::serialization(
            "completion carried no choices",
            None,
        ));
    };
    let Some(text) = choice.message.content else {
        return ReplyResult::FatalFailure(Error::serialization(
            "completion carried no message content",
            None,
        ));
    };
    ReplyResult::Success(Reply {
        text,
        usage: completion.usage,
        finish_reason: choice.finish_reason,
        model: completion.model,
    })
}

/// Incremental assembler for a server-sent-events completion stream.
///
/// Bytes are buffered until a blank line completes an event, so chunk boundaries may fall
/// anywhere, including inside a multi-byte character.  Content deltas are concatenated in the
/// order they arrive.  Nothing after the `[DONE]` marker is read.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    buffer: Vec<u8>,
    text: String,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    model: Option<String>,
    done: bool,
}

impl StreamAssembler {
    /// Create an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of bytes.
    ///
    /// Returns `Some` only when the stream produced a conclusive failure; the caller should stop
    /// feeding and use that result.
    pub fn push(&mut self, chunk: &[u8]) -> Option<ReplyResult> {
        if self.done {
            return None;
        }
        STREAM_BYTES.count(chunk.len() as u64);
        self.buffer.extend_from_slice(chunk);
        while let Some((end, separator)) = event_boundary(&self.buffer) {
            let event: Vec<u8> = self.buffer.drain(..end + separator).collect();
            if let Some(result) = self.process_event(&event[..end]) {
                STREAM_ERRORS.click();
                return Some(result);
            }
            if self.done {
                self.buffer.clear();
                break;
            }
        }
        None
    }

    /// Conclude the stream.
    ///
    /// A trailing event without its closing blank line is still processed.  A stream that ends
    /// without the `[DONE]` marker is a fatal failure: the reply may be incomplete and is not
    /// recorded.
    pub fn finish(mut self) -> ReplyResult {
        if !self.done {
            let rest = std::mem::take(&mut self.buffer);
            if !rest.iter().all(u8::is_ascii_whitespace) {
                if let Some(result) = self.process_event(&rest) {
                    STREAM_ERRORS.click();
                    return result;
                }
            }
        }
        if !self.done {
            STREAM_ERRORS.click();
            return ReplyResult::FatalFailure(Error::streaming(
                "stream ended before [DONE]",
                None,
            ));
        }
        ReplyResult::Success(Reply {
            text: self.text,
            usage: self.usage,
            finish_reason: self.finish_reason,
            model: self.model,
        })
    }

    fn process_event(&mut self, event: &[u8]) -> Option<ReplyResult> {
        let event = match std::str::from_utf8(event) {
            Ok(event) => event,
            Err(err) => {
                return Some(ReplyResult::FatalFailure(Error::encoding(
                    format!("invalid UTF-8 in stream: {err}"),
                    Some(Box::new(err)),
                )));
            }
        };
        let data: Vec<&str> = event
            .lines()
            .filter(|line| !line.starts_with(':'))
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|value| value.strip_prefix(' ').unwrap_or(value))
            .collect();
        if data.is_empty() {
            return None;
        }
        let data = data.join("\n");
        STREAM_EVENTS.click();
        if data.trim() == "[DONE]" {
            debug!("stream complete");
            self.done = true;
            return None;
        }
        let chunk: ChatCompletionChunk = match serde_json::from_str(&data) {
            Ok(chunk) => chunk,
            Err(err) => {
                return Some(ReplyResult::FatalFailure(Error::serialization(
                    format!("malformed stream event: {err}"),
                    Some(Box::new(err)),
                )));
            }
        };
        if let Some(detail) = chunk.error {
            return Some(classify_embedded(detail, None, None));
        }
        if self.model.is_none() {
            self.model = chunk.model;
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
        for choice in chunk.choices.into_iter().filter(|c| c.index == 0) {
            if let Some(content) = choice.delta.content {
                self.text.push_str(&content);
            }
            if choice.finish_reason.is_some() {
                self.finish_reason = choice.finish_reason;
            }
        }
        None
    }
}

/// Finds the earliest blank-line separator, returning the event length and separator length.
fn event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = find(buffer, b"\n\n").map(|at| (at, 2));
    let crlf = find(buffer, b"\r\n\r\n").map(|at| (at, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
