// Public modules
pub mod chat;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod inject;
pub mod render;
pub mod store;
pub mod transport;
pub mod types;

mod observability;

// Re-exports
pub use decoder::{StreamAssembler, classify_status, decode};
pub use encoder::{Encoded, EncoderOptions, PayloadEncoder, Truncation};
pub use error::{Error, Result};
pub use inject::{
    HttpPageFetcher, Injection, PageFetcher, PageText, extract_injection, html_to_text,
    truncate_page,
};
pub use observability::register_biometrics;
pub use render::{AnsiHighlighter, Highlighter, PlainTextRenderer, Renderer, render_reply};
pub use store::MessageStore;
pub use transport::{
    HttpTransport, RawBody, RawResponse, RetryPolicy, Transport, TransportClient,
    parse_retry_after,
};
pub use types::*;
