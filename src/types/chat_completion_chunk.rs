use serde::{Deserialize, Serialize};

use crate::types::{ApiErrorDetail, Usage};

/// The incremental part of a streamed choice.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChunkDelta {
    /// Role, sent on the first chunk only.
    #[serde(default)]
    pub role: Option<String>,

    /// Next fragment of the reply text.
    #[serde(default)]
    pub content: Option<String>,
}

/// One alternative inside a streamed chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkChoice {
    /// Position of the choice.
    #[serde(default)]
    pub index: u32,

    /// The fragment carried by this chunk.
    #[serde(default)]
    pub delta: ChunkDelta,

    /// Why generation stopped; set on the last content chunk.
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// The JSON carried in one `data:` line of a streamed completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletionChunk {
    /// The model that served the request.
    #[serde(default)]
    pub model: Option<String>,

    /// Fragments for each alternative.  Empty on the trailing usage chunk.
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,

    /// Token accounting, present on the trailing chunk when requested.
    #[serde(default)]
    pub usage: Option<Usage>,

    /// An error reported mid-stream.
    #[serde(default)]
    pub error: Option<ApiErrorDetail>,
}
