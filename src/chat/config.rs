//! Configuration types for the chat application.
//!
//! [`ChatArgs`] holds command-line arguments parsed by `arrrg`.  An optional YAML
//! [`ConfigFile`] supplies defaults beneath them.  Both resolve into a [`ChatConfig`], the single
//! value the session and the client are built from.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use arrrg_derive::CommandLine;
use serde::Deserialize;

use crate::encoder::EncoderOptions;
use crate::transport::RetryPolicy;

/// Default model identifier.
pub const DEFAULT_MODEL: &str = "gpt-4";

/// Default sampling temperature.
pub const DEFAULT_TEMPERATURE: f32 = 0.2;

/// Default nucleus sampling value.
pub const DEFAULT_TOP_P: f32 = 0.1;

/// Default limit on injected page text, in characters.
pub const DEFAULT_MAX_PAGE_CHARS: usize = 20_000;

/// Default system preamble.
pub const DEFAULT_SYSTEM_PROMPT: &str = "The following is a conversation with an AI assistant. \
The assistant is helpful, creative, friendly. Its answers are polite but brief, only rarely \
exceeding a single paragraph when really necessary to explain a point. The assistant labels all \
markdown code snippets with the code language. Mathematical answers and expressions written by \
the assistant are always formatted in unicode characters rather than latex, using full \
mathematical notation rather than programming notation. The assistant only very occasionally \
uses emojis to show enthusiasm.";

/// Command-line arguments for the chatloop tool.
#[derive(CommandLine, Debug, Default, PartialEq, Eq)]
pub struct ChatArgs {
    /// YAML file with default settings.
    #[arrrg(optional, "YAML configuration file", "PATH")]
    pub config: Option<String>,

    /// Model to use for chat.
    #[arrrg(optional, "Model to use (default: gpt-4)", "MODEL")]
    pub model: Option<String>,

    /// System prompt to set context for the conversation.
    #[arrrg(optional, "System prompt (empty string for none)", "PROMPT")]
    pub system: Option<String>,

    /// Sampling temperature, kept as text until validated.
    #[arrrg(optional, "Sampling temperature 0.0-2.0 (default: 0.2)", "TEMP")]
    pub temperature: Option<String>,

    /// Nucleus sampling value, kept as text until validated.
    #[arrrg(optional, "Top-p 0.0-1.0 (default: 0.1)", "P")]
    pub top_p: Option<String>,

    /// Maximum tokens per reply.
    #[arrrg(optional, "Max tokens per reply (default: endpoint limit)", "TOKENS")]
    pub max_tokens: Option<u32>,

    /// Retries after a transient failure.
    #[arrrg(optional, "Retries after a transient failure (default: 3)", "N")]
    pub retries: Option<u32>,

    /// Per-attempt timeout.
    #[arrrg(optional, "Seconds to wait for each attempt (default: 60)", "SECS")]
    pub timeout_secs: Option<u64>,

    /// Context budget.
    #[arrrg(optional, "Characters of history sent per request (default: all)", "CHARS")]
    pub context_chars: Option<usize>,

    /// Injected page limit.
    #[arrrg(optional, "Characters of an injected page to keep (default: 20000)", "CHARS")]
    pub max_page_chars: Option<usize>,

    /// Endpoint base URL.
    #[arrrg(optional, "API base URL (default: https://api.openai.com/v1/)", "URL")]
    pub base_url: Option<String>,

    /// Line history file.
    #[arrrg(optional, "Line history file (default: ~/.chatloop_history)", "PATH")]
    pub history_file: Option<String>,

    /// Request batch replies.
    #[arrrg(flag, "Request whole replies instead of streams")]
    pub no_stream: bool,

    /// Disable ANSI colors and styles.
    #[arrrg(flag, "Disable ANSI colors/styles")]
    pub no_color: bool,

    /// Disable `<<URL>>` page injection.
    #[arrrg(flag, "Disable <<URL>> page injection")]
    pub no_injections: bool,

    /// Verbose logging.
    #[arrrg(flag, "Log at debug level to stderr")]
    pub debug: bool,
}

/// Errors raised while resolving arguments into a configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatArgsError {
    /// A numeric option did not parse.
    InvalidFloat {
        /// The option name.
        option: &'static str,
        /// The text given.
        value: String,
    },
    /// A numeric option was outside its allowed range.
    OutOfRange {
        /// The option name.
        option: &'static str,
        /// The value given.
        value: f64,
        /// Smallest allowed value.
        min: f64,
        /// Largest allowed value.
        max: f64,
    },
    /// The configuration file could not be parsed.
    ConfigFile(String),
}

impl fmt::Display for ChatArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatArgsError::InvalidFloat { option, value } => {
                write!(f, "--{option} expects a number, got {value:?}")
            }
            ChatArgsError::OutOfRange {
                option,
                value,
                min,
                max,
            } => write!(f, "--{option} must be between {min} and {max}, got {value}"),
            ChatArgsError::ConfigFile(message) => write!(f, "invalid config file: {message}"),
        }
    }
}

impl std::error::Error for ChatArgsError {}

/// Settings read from a YAML file.
///
/// Every field is optional; command-line arguments take precedence.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Model identifier.
    pub model: Option<String>,
    /// System preamble.
    pub system: Option<String>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Nucleus sampling value.
    pub top_p: Option<f32>,
    /// Reply token limit.
    pub max_tokens: Option<u32>,
    /// Streamed replies.
    pub stream: Option<bool>,
    /// Retries after a transient failure.
    pub retries: Option<u32>,
    /// Per-attempt timeout in seconds.
    pub timeout_secs: Option<u64>,
    /// Context budget in characters.
    pub context_chars: Option<usize>,
    /// Injected page limit in characters.
    pub max_page_chars: Option<usize>,
    /// Page injection.
    pub allow_injections: Option<bool>,
    /// Endpoint base URL.
    pub base_url: Option<String>,
    /// Line history file.
    pub history_file: Option<String>,
    /// ANSI colors.
    pub color: Option<bool>,
}

impl ConfigFile {
    /// Parse YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, ChatArgsError> {
        serde_yaml::from_str(text).map_err(|e| ChatArgsError::ConfigFile(e.to_string()))
    }
}

/// Configuration for a chat session.
///
/// This struct holds the resolved configuration values after processing
/// command-line arguments with appropriate defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    /// The model to use for generating replies.
    pub model: String,

    /// Optional system preamble.
    pub system_prompt: Option<String>,

    /// Optional sampling temperature.
    pub temperature: Option<f32>,

    /// Optional top-p nucleus sampling value.
    pub top_p: Option<f32>,

    /// Optional maximum tokens per reply.
    pub max_tokens: Option<u32>,

    /// Whether replies are requested as streams.
    pub stream: bool,

    /// Retries after the first attempt.
    pub max_retries: u32,

    /// Deadline for each attempt.
    pub attempt_timeout: Duration,

    /// First retry wait.
    pub base_backoff: Duration,

    /// Longest retry wait.
    pub max_backoff: Duration,

    /// Characters of context sent per request, unlimited when `None`.
    pub context_budget_chars: Option<usize>,

    /// Characters of an injected page to keep.
    pub max_page_chars: usize,

    /// Whether `<<URL>>` markers are expanded.
    pub allow_injections: bool,

    /// Whether to use ANSI colors and styles in output.
    pub use_color: bool,

    /// Endpoint base URL, the default endpoint when `None`.
    pub base_url: Option<String>,

    /// Line history file, the default location when `None`.
    pub history_file: Option<PathBuf>,
}

impl ChatConfig {
    /// Creates a new ChatConfig with default values.
    ///
    /// Defaults:
    /// - Model: gpt-4
    /// - Temperature: 0.2, top-p: 0.1
    /// - The default system preamble
    /// - 3 retries, 60 second attempts, 500ms to 30s backoff
    /// - Streaming, color and page injection enabled
    pub fn new() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            system_prompt: Some(DEFAULT_SYSTEM_PROMPT.to_string()),
            temperature: Some(DEFAULT_TEMPERATURE),
            top_p: Some(DEFAULT_TOP_P),
            max_tokens: None,
            stream: true,
            max_retries: 3,
            attempt_timeout: Duration::from_secs(60),
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            context_budget_chars: None,
            max_page_chars: DEFAULT_MAX_PAGE_CHARS,
            allow_injections: true,
            use_color: true,
            base_url: None,
            history_file: None,
        }
    }

    /// Sets the model to use.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sets or clears the system prompt.
    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    /// Sets the sampling temperature.
    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    /// Sets the top-p value.
    pub fn with_top_p(mut self, top_p: Option<f32>) -> Self {
        self.top_p = top_p;
        self
    }

    /// Sets the maximum tokens per reply.
    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Sets whether replies are streamed.
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Sets the retry bound.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the per-attempt timeout.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Sets the backoff range.
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    /// Sets the context budget.
    pub fn with_context_budget(mut self, chars: Option<usize>) -> Self {
        self.context_budget_chars = chars;
        self
    }

    /// Sets the injected page limit.
    pub fn with_max_page_chars(mut self, chars: usize) -> Self {
        self.max_page_chars = chars;
        self
    }

    /// Sets whether page injection is allowed.
    pub fn with_injections(mut self, allow: bool) -> Self {
        self.allow_injections = allow;
        self
    }

    /// Disables ANSI color output.
    pub fn without_color(mut self) -> Self {
        self.use_color = false;
        self
    }

    /// Sets the endpoint base URL.
    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url;
        self
    }

    /// Sets the line history file.
    pub fn with_history_file(mut self, path: Option<PathBuf>) -> Self {
        self.history_file = path;
        self
    }

    /// The encoder options this configuration implies.
    pub fn encoder_options(&self) -> EncoderOptions {
        EncoderOptions {
            model: self.model.clone(),
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
            stream: self.stream,
            context_budget_chars: self.context_budget_chars,
        }
    }

    /// The retry policy this configuration implies.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.base_backoff, self.max_backoff)
    }

    /// Generation parameters as shown in the intro banner and `/config`.
    pub fn describe(&self) -> String {
        let opt = |v: Option<String>| v.unwrap_or_else(|| "default".to_string());
        format!(
            "model: {}, temperature: {}, top_p: {}, max_tokens: {}, stream: {}, \
             retries: {}, timeout: {}s, context: {}, max_page_chars: {}, injections: {}",
            self.model,
            opt(self.temperature.map(|v| v.to_string())),
            opt(self.top_p.map(|v| v.to_string())),
            opt(self.max_tokens.map(|v| v.to_string())),
            self.stream,
            self.max_retries,
            self.attempt_timeout.as_secs(),
            self.context_budget_chars
                .map(|c| format!("{c} chars"))
                .unwrap_or_else(|| "unlimited".to_string()),
            self.max_page_chars,
            self.allow_injections,
        )
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_float(
    option: &'static str,
    value: &str,
    min: f32,
    max: f32,
) -> Result<f32, ChatArgsError> {
    let parsed: f32 = value.trim().parse().map_err(|_| ChatArgsError::InvalidFloat {
        option,
        value: value.to_string(),
    })?;
    check_range(option, parsed, min, max)
}

fn check_range(option: &'static str, value: f32, min: f32, max: f32) -> Result<f32, ChatArgsError> {
    if value.is_finite() && value >= min && value <= max {
        Ok(value)
    } else {
        Err(ChatArgsError::OutOfRange {
            option,
            value: value as f64,
            min: min as f64,
            max: max as f64,
        })
    }
}

fn non_empty(text: String) -> Option<String> {
    if text.trim().is_empty() { None } else { Some(text) }
}

impl ChatArgs {
    /// Resolve into a configuration, with `file` supplying values the arguments leave unset.
    pub fn into_config(self, file: Option<ConfigFile>) -> Result<ChatConfig, ChatArgsError> {
        let file = file.unwrap_or_default();
        let defaults = ChatConfig::new();

        let temperature = match (&self.temperature, file.temperature) {
            (Some(text), _) => Some(parse_float("temperature", text, 0.0, 2.0)?),
            (None, Some(value)) => Some(check_range("temperature", value, 0.0, 2.0)?),
            (None, None) => defaults.temperature,
        };
        let top_p = match (&self.top_p, file.top_p) {
            (Some(text), _) => Some(parse_float("top-p", text, 0.0, 1.0)?),
            (None, Some(value)) => Some(check_range("top-p", value, 0.0, 1.0)?),
            (None, None) => defaults.top_p,
        };
        let system_prompt = match self.system.or(file.system) {
            Some(text) => non_empty(text),
            None => defaults.system_prompt,
        };
        let attempt_timeout = self
            .timeout_secs
            .or(file.timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.attempt_timeout);
        let max_tokens = self.max_tokens.or(file.max_tokens);
        if max_tokens == Some(0) {
            return Err(ChatArgsError::OutOfRange {
                option: "max-tokens",
                value: 0.0,
                min: 1.0,
                max: f64::from(u32::MAX),
            });
        }
        if attempt_timeout.is_zero() {
            return Err(ChatArgsError::OutOfRange {
                option: "timeout-secs",
                value: 0.0,
                min: 1.0,
                max: f64::from(u32::MAX),
            });
        }

        Ok(ChatConfig {
            model: self
                .model
                .or(file.model)
                .and_then(non_empty)
                .unwrap_or(defaults.model),
            system_prompt,
            temperature,
            top_p,
            max_tokens,
            stream: !self.no_stream && file.stream.unwrap_or(defaults.stream),
            max_retries: self.retries.or(file.retries).unwrap_or(defaults.max_retries),
            attempt_timeout,
            context_budget_chars: self.context_chars.or(file.context_chars),
            max_page_chars: self
                .max_page_chars
                .or(file.max_page_chars)
                .unwrap_or(defaults.max_page_chars),
            allow_injections: !self.no_injections
                && file.allow_injections.unwrap_or(defaults.allow_injections),
            use_color: !self.no_color && file.color.unwrap_or(defaults.use_color),
            base_url: self.base_url.or(file.base_url).and_then(non_empty),
            history_file: self
                .history_file
                .or(file.history_file)
                .and_then(non_empty)
                .map(PathBuf::from),
            base_backoff: defaults.base_backoff,
            max_backoff: defaults.max_backoff,
        })
    }
}

impl TryFrom<ChatArgs> for ChatConfig {
    type Error = ChatArgsError;

    fn try_from(args: ChatArgs) -> Result<Self, Self::Error> {
        args.into_config(None)
    }
}
