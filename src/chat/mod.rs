//! The interactive chat loop.
//!
//! - [`config`]: command-line arguments, the optional YAML file and the resolved configuration
//! - [`commands`]: slash command parsing
//! - [`session`]: the session controller that owns the conversation and drives round trips

mod commands;
mod config;
mod session;

pub use crate::render::{PlainTextRenderer, Renderer};
pub use commands::{ChatCommand, help_text, parse_command};
pub use config::{
    ChatArgs, ChatArgsError, ChatConfig, ConfigFile, DEFAULT_MAX_PAGE_CHARS, DEFAULT_MODEL,
    DEFAULT_SYSTEM_PROMPT, DEFAULT_TEMPERATURE, DEFAULT_TOP_P,
};
pub use session::{ChatSession, Flow, RoundOutcome, SessionState, SessionStats};
