// Public modules
pub mod api_error;
pub mod chat_completion;
pub mod chat_completion_chunk;
pub mod reply_result;
pub mod request_payload;
pub mod turn;
pub mod usage;

// Re-exports
pub use api_error::{ApiErrorBody, ApiErrorDetail};
pub use chat_completion::{ChatCompletion, Choice, ChoiceMessage};
pub use chat_completion_chunk::{ChatCompletionChunk, ChunkChoice, ChunkDelta};
pub use reply_result::{RateLimitHint, Reply, ReplyResult};
pub use request_payload::{RequestPayload, StreamOptions};
pub use turn::{Role, Turn};
pub use usage::Usage;
