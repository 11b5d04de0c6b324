//! Command parsing for the chat loop.
//!
//! Lines starting with a known `/word` are commands, as are the bare words `quit`, `exit` and
//! `q`.  Commands control the session and are never sent to the model.  A line that merely starts
//! with `/`, such as a path followed by a question, is an ordinary message.

/// A parsed chat command.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatCommand {
    /// End the session.
    Quit,

    /// Return the conversation to the system preamble.
    Reset,

    /// Resend the conversation after a failed round.
    Retry,

    /// Display help information.
    Help,

    /// Display session statistics.
    Stats,

    /// Show the current configuration.
    ShowConfig,

    /// Change the model.
    Model(String),

    /// Set the sampling temperature.
    Temperature(f32),

    /// Clear the sampling temperature (use the endpoint default).
    ClearTemperature,

    /// Set the top-p value.
    TopP(f32),

    /// Clear the top-p value.
    ClearTopP,

    /// Set the maximum tokens per reply.
    MaxTokens(u32),

    /// Clear the reply token limit.
    ClearMaxTokens,

    /// Report a parsing error back to the caller.
    Invalid(String),
}

/// Parses user input for commands.
///
/// Returns `Some(ChatCommand)` if the input is a command, or `None` if it should be sent to the
/// model as a message.
///
/// # Examples
///
/// ```
/// # use chatloop::chat::{parse_command, ChatCommand};
/// assert_eq!(parse_command("quit"), Some(ChatCommand::Quit));
/// assert_eq!(parse_command("/reset"), Some(ChatCommand::Reset));
/// assert!(parse_command("/model gpt-4o").is_some());
/// assert!(parse_command("List files using *.py").is_none());
/// ```
pub fn parse_command(input: &str) -> Option<ChatCommand> {
    let input = input.trim();

    if matches!(input, "quit" | "exit" | "q") {
        return Some(ChatCommand::Quit);
    }
    let rest = input.strip_prefix('/')?;

    let mut parts = rest.splitn(2, char::is_whitespace);
    let command = parts.next()?.to_lowercase();
    let argument = parts.next().map(str::trim).filter(|s| !s.is_empty());

    let result = match command.as_str() {
        "quit" | "exit" | "q" => ChatCommand::Quit,
        "reset" | "new" | "clear" => ChatCommand::Reset,
        "retry" => ChatCommand::Retry,
        "help" | "?" => ChatCommand::Help,
        "stats" | "status" => ChatCommand::Stats,
        "config" => ChatCommand::ShowConfig,
        "model" => match argument {
            Some(model) => ChatCommand::Model(model.to_string()),
            None => ChatCommand::Invalid("/model requires a model name".to_string()),
        },
        "temperature" => match argument {
            Some(arg) if arg.eq_ignore_ascii_case("clear") => ChatCommand::ClearTemperature,
            Some(arg) => match parse_f32_in_range(arg, 0.0, 2.0) {
                Ok(value) => ChatCommand::Temperature(value),
                Err(err) => ChatCommand::Invalid(format!("/temperature {err}")),
            },
            None => ChatCommand::Invalid("/temperature requires a value".to_string()),
        },
        "top_p" => match argument {
            Some(arg) if arg.eq_ignore_ascii_case("clear") => ChatCommand::ClearTopP,
            Some(arg) => match parse_f32_in_range(arg, 0.0, 1.0) {
                Ok(value) => ChatCommand::TopP(value),
                Err(err) => ChatCommand::Invalid(format!("/top_p {err}")),
            },
            None => ChatCommand::Invalid("/top_p requires a value".to_string()),
        },
        "max_tokens" => match argument {
            Some(arg) if arg.eq_ignore_ascii_case("clear") => ChatCommand::ClearMaxTokens,
            Some(arg) => match arg.parse::<u32>() {
                Ok(value) if value > 0 => ChatCommand::MaxTokens(value),
                _ => ChatCommand::Invalid("/max_tokens expects a positive integer".to_string()),
            },
            None => ChatCommand::Invalid("/max_tokens requires a value".to_string()),
        },
        _ if argument.is_none() && !command.contains('/') => {
            ChatCommand::Invalid(format!("Unknown command: /{command} (try /help)"))
        }
        _ => return None,
    };

    Some(result)
}

fn parse_f32_in_range(value: &str, min: f32, max: f32) -> Result<f32, String> {
    let parsed: f32 = value
        .parse()
        .map_err(|_| format!("expects a value between {min} and {max}"))?;
    if parsed.is_finite() && parsed >= min && parsed <= max {
        Ok(parsed)
    } else {
        Err(format!("expects a value between {min} and {max}"))
    }
}

/// Returns help text describing available commands.
pub fn help_text() -> &'static str {
    r#"Available commands:
  /reset                 Start over from the system prompt (aliases: /new, /clear)
  /retry                 Resend the conversation after a failed reply
  /model <name>          Change the model (e.g., /model gpt-4o)
  /temperature <v>       Set temperature 0.0-2.0 (use 'clear' to reset)
  /top_p <v>             Set top-p 0.0-1.0 (use 'clear' to reset)
  /max_tokens <n>        Set maximum reply tokens (use 'clear' to reset)
  /stats                 Show session statistics
  /config                Show current configuration
  /help                  Show this help message
  /quit                  Exit (also: quit, exit, q, Ctrl-D)

Put a web address in double chevrons, like <<https://example.com>>, to include
the text of that page with your message."#
}
