//! Core chat session management.
//!
//! [`ChatSession`] is the controller of the chat loop.  It owns the conversation log and the
//! transport client, turns each input line into either a command or a round trip, and keeps the
//! log consistent whatever the round trip's outcome:
//!
//! - a reply appends exactly one assistant turn;
//! - a failure leaves the user turn in place for `/retry`;
//! - an interrupt abandons the attempt and appends nothing.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::chat::commands::{ChatCommand, help_text, parse_command};
use crate::chat::config::ChatConfig;
use crate::encoder::PayloadEncoder;
use crate::inject::{PageFetcher, extract_injection, truncate_page};
use crate::observability::{
    SESSION_INJECTIONS, SESSION_INTERRUPTS, SESSION_RESETS, SESSION_ROUNDS, SESSION_TRUNCATIONS,
};
use crate::render::Renderer;
use crate::store::MessageStore;
use crate::transport::{Transport, TransportClient};
use crate::types::{ReplyResult, Turn, Usage};

/// How often an in-flight round checks the interrupt flag.
const INTERRUPT_POLL: Duration = Duration::from_millis(50);

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for input.
    Idle,
    /// A round trip is in flight.
    AwaitingReply,
    /// The session has ended; all further input is ignored.
    Terminated,
}

/// Whether the input loop should keep reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Read the next line.
    Continue,
    /// Stop reading and exit.
    Exit,
}

/// How a round trip ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// A reply was recorded and rendered.
    Replied,
    /// The request failed; the user turn awaits `/retry`.
    Failed,
    /// The user abandoned the request.
    Interrupted,
    /// Nothing was sent.
    Skipped,
}

/// Aggregated stats for a chat session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStats {
    /// The model in use.
    pub model: String,
    /// Turns in the conversation, system preamble included.
    pub turn_count: usize,
    /// Round trips attempted.
    pub total_requests: u64,
    /// Token usage summed over every reply.
    pub total_usage: Usage,
    /// Token usage of the latest reply, if reported.
    pub last_usage: Option<Usage>,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "model: {}", self.model)?;
        writeln!(f, "turns: {}", self.turn_count)?;
        writeln!(f, "requests: {}", self.total_requests)?;
        write!(
            f,
            "tokens: prompt {}, completion {}, total {}",
            self.total_usage.prompt_tokens,
            self.total_usage.completion_tokens,
            self.total_usage.total_tokens
        )?;
        if let Some(last) = &self.last_usage {
            write!(
                f,
                "\nlast reply: prompt {}, completion {}",
                last.prompt_tokens, last.completion_tokens
            )?;
        }
        Ok(())
    }
}

/// A chat session that manages conversation state and round trips.
pub struct ChatSession<T: Transport> {
    config: ChatConfig,
    store: MessageStore,
    client: TransportClient<T>,
    fetcher: Option<Box<dyn PageFetcher>>,
    interrupt: Arc<AtomicBool>,
    state: SessionState,
    pending_input: Option<String>,
    truncation_noticed: bool,
    usage_totals: Usage,
    last_usage: Option<Usage>,
    request_count: u64,
}

impl<T: Transport> ChatSession<T> {
    /// Creates a new chat session over the given transport.
    pub fn new(transport: T, config: ChatConfig) -> Self {
        let client = TransportClient::new(transport)
            .with_retry_policy(config.retry_policy())
            .with_attempt_timeout(config.attempt_timeout);
        let store = MessageStore::new(config.system_prompt.clone());
        Self {
            config,
            store,
            client,
            fetcher: None,
            interrupt: Arc::new(AtomicBool::new(false)),
            state: SessionState::Idle,
            pending_input: None,
            truncation_noticed: false,
            usage_totals: Usage::default(),
            last_usage: None,
            request_count: 0,
        }
    }

    /// Enables `<<URL>>` expansion with the given fetcher.
    pub fn with_page_fetcher(mut self, fetcher: impl PageFetcher + 'static) -> Self {
        self.fetcher = Some(Box::new(fetcher));
        self
    }

    /// Shares an interrupt flag with the caller, typically a Ctrl-C handler.
    pub fn with_interrupt(mut self, interrupt: Arc<AtomicBool>) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// The flag that abandons an in-flight round when set.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// The current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The conversation log.
    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// The active configuration.
    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Returns the current model.
    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Handle one line of input.
    pub async fn handle_line(&mut self, line: &str, renderer: &mut dyn Renderer) -> Flow {
        if self.state == SessionState::Terminated {
            return Flow::Exit;
        }
        if line.trim().is_empty() {
            return Flow::Continue;
        }
        if let Some(command) = parse_command(line) {
            return self.handle_command(command, renderer).await;
        }
        self.submit(line, renderer).await;
        Flow::Continue
    }

    /// Handle the end of input.
    pub fn handle_eof(&mut self, renderer: &mut dyn Renderer) -> Flow {
        if self.state != SessionState::Terminated {
            self.terminate(renderer);
        }
        Flow::Exit
    }

    /// Apply a parsed command.
    pub async fn handle_command(
        &mut self,
        command: ChatCommand,
        renderer: &mut dyn Renderer,
    ) -> Flow {
        if self.state == SessionState::Terminated {
            return Flow::Exit;
        }
        match command {
            ChatCommand::Quit => {
                self.terminate(renderer);
                return Flow::Exit;
            }
            ChatCommand::Reset => {
                self.reset();
                renderer.print_info("Conversation reset.");
            }
            ChatCommand::Retry => {
                self.retry_pending(renderer).await;
            }
            ChatCommand::Help => renderer.print_info(help_text()),
            ChatCommand::Stats => renderer.print_info(&self.stats().to_string()),
            ChatCommand::ShowConfig => {
                renderer.print_info(&self.config.describe());
                match &self.config.system_prompt {
                    Some(prompt) => renderer.print_info(&format!("system prompt: {prompt}")),
                    None => renderer.print_info("system prompt: none"),
                }
            }
            ChatCommand::Model(model) => {
                renderer.print_info(&format!("Model changed to: {model}"));
                self.config.model = model;
            }
            ChatCommand::Temperature(value) => {
                self.config.temperature = Some(value);
                renderer.print_info(&format!("temperature set to {value}"));
            }
            ChatCommand::ClearTemperature => {
                self.config.temperature = None;
                renderer.print_info("temperature cleared (endpoint default)");
            }
            ChatCommand::TopP(value) => {
                self.config.top_p = Some(value);
                renderer.print_info(&format!("top_p set to {value}"));
            }
            ChatCommand::ClearTopP => {
                self.config.top_p = None;
                renderer.print_info("top_p cleared (endpoint default)");
            }
            ChatCommand::MaxTokens(value) => {
                self.config.max_tokens = Some(value);
                renderer.print_info(&format!("max_tokens set to {value}"));
            }
            ChatCommand::ClearMaxTokens => {
                self.config.max_tokens = None;
                renderer.print_info("max_tokens cleared (endpoint default)");
            }
            ChatCommand::Invalid(message) => renderer.print_error(&message),
        }
        Flow::Continue
    }

    /// Send `input` as the next user turn and wait for the reply.
    ///
    /// When the previous round failed, the same text again resends the pending turn; any other
    /// text is refused until the pending turn is retried or the conversation is reset.
    pub async fn submit(&mut self, input: &str, renderer: &mut dyn Renderer) -> RoundOutcome {
        if self.state == SessionState::Terminated {
            return RoundOutcome::Skipped;
        }
        if self.store.pending_user().is_some() {
            if self.pending_input.as_deref() == Some(input) {
                return self.retry_pending(renderer).await;
            }
            renderer.print_notice(
                "the previous message has no reply yet; use /retry to resend it or /reset to start over",
            );
            return RoundOutcome::Skipped;
        }
        let Some(content) = self.prepare_content(input, renderer).await else {
            return RoundOutcome::Skipped;
        };
        if let Err(err) = self.store.append(Turn::user(content)) {
            renderer.print_error(&err.to_string());
            return RoundOutcome::Skipped;
        }
        self.pending_input = Some(input.to_string());
        self.dispatch(renderer).await
    }

    /// Resend the conversation when its last turn is an unanswered user turn.
    pub async fn retry_pending(&mut self, renderer: &mut dyn Renderer) -> RoundOutcome {
        if self.state == SessionState::Terminated {
            return RoundOutcome::Skipped;
        }
        if self.store.pending_user().is_none() {
            renderer.print_notice("nothing to retry");
            return RoundOutcome::Skipped;
        }
        self.dispatch(renderer).await
    }

    /// Return the conversation to the system preamble.
    pub fn reset(&mut self) {
        self.store.reset();
        self.pending_input = None;
        self.truncation_noticed = false;
        SESSION_RESETS.click();
        info!("conversation reset");
    }

    /// Returns the current session statistics snapshot.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            model: self.config.model.clone(),
            turn_count: self.store.len(),
            total_requests: self.request_count,
            total_usage: self.usage_totals,
            last_usage: self.last_usage,
        }
    }

    fn terminate(&mut self, renderer: &mut dyn Renderer) {
        self.state = SessionState::Terminated;
        renderer.print_info("Ok, goodbye...");
    }

    async fn prepare_content(&mut self, input: &str, renderer: &mut dyn Renderer) -> Option<String> {
        if !self.config.allow_injections {
            return Some(input.to_string());
        }
        let Some(injection) = extract_injection(input) else {
            return Some(input.to_string());
        };
        let Some(fetcher) = self.fetcher.as_deref() else {
            renderer.print_error("page injection is not available in this session");
            return None;
        };
        SESSION_INJECTIONS.click();
        self.interrupt.store(false, Ordering::Relaxed);
        let fetched = race_interrupt(&self.interrupt, fetcher.fetch(&injection.url)).await;
        match fetched {
            None => {
                SESSION_INTERRUPTS.click();
                renderer.print_interrupted();
                None
            }
            Some(Err(err)) => {
                renderer.print_error(&format!("could not fetch {}: {err}", injection.url));
                None
            }
            Some(Ok(text)) => {
                let page = truncate_page(&text, self.config.max_page_chars);
                debug!(
                    chars = page.original_chars,
                    truncated = page.truncated,
                    "injecting page"
                );
                if page.truncated {
                    renderer.print_notice(&format!(
                        "the page has {} characters; only the first {} are sent",
                        page.original_chars, self.config.max_page_chars
                    ));
                }
                Some(injection.compose(&page.text))
            }
        }
    }

    async fn dispatch(&mut self, renderer: &mut dyn Renderer) -> RoundOutcome {
        let encoder = PayloadEncoder::new(self.config.encoder_options());
        let encoded = match encoder.encode(self.store.snapshot()) {
            Ok(encoded) => encoded,
            Err(err) => {
                renderer.print_error(&err.to_string());
                return RoundOutcome::Failed;
            }
        };
        if let Some(truncation) = encoded.truncation {
            if !self.truncation_noticed {
                self.truncation_noticed = true;
                SESSION_TRUNCATIONS.click();
                renderer.print_notice(&format!(
                    "the conversation exceeds the {}-character context budget; \
                     the oldest {} turns are no longer sent",
                    truncation.budget_chars, truncation.dropped_turns
                ));
            }
        }

        self.state = SessionState::AwaitingReply;
        self.request_count = self.request_count.saturating_add(1);
        SESSION_ROUNDS.click();
        self.interrupt.store(false, Ordering::Relaxed);
        let result = race_interrupt(&self.interrupt, self.client.send(&encoded.payload)).await;
        self.state = SessionState::Idle;

        match result {
            None => {
                SESSION_INTERRUPTS.click();
                info!("round interrupted");
                renderer.print_interrupted();
                RoundOutcome::Interrupted
            }
            Some(ReplyResult::Success(reply)) => {
                if let Err(err) = self.store.append(Turn::assistant(reply.text.clone())) {
                    renderer.print_error(&err.to_string());
                    return RoundOutcome::Failed;
                }
                self.pending_input = None;
                renderer.print_reply(&reply);
                if let Some(usage) = reply.usage {
                    self.last_usage = Some(usage);
                    self.usage_totals = self.usage_totals + usage;
                    renderer.print_usage(&usage);
                }
                RoundOutcome::Replied
            }
            Some(ReplyResult::RateLimited(hint)) => {
                let err = hint.into_error();
                renderer.print_error(&format!("{err} (use /retry to try again)"));
                RoundOutcome::Failed
            }
            Some(ReplyResult::TransientFailure(err)) => {
                warn!(request_id = err.request_id().unwrap_or("none"), "round failed");
                renderer.print_error(&format!("{err} (use /retry to try again)"));
                RoundOutcome::Failed
            }
            Some(ReplyResult::FatalFailure(err)) => {
                warn!(request_id = err.request_id().unwrap_or("none"), "round failed");
                renderer.print_error(&err.to_string());
                RoundOutcome::Failed
            }
        }
    }
}

/// Runs `fut` to completion unless `flag` is raised first.
async fn race_interrupt<F: Future>(flag: &AtomicBool, fut: F) -> Option<F::Output> {
    tokio::select! {
        output = fut => Some(output),
        _ = wait_for_interrupt(flag) => None,
    }
}

async fn wait_for_interrupt(flag: &AtomicBool) {
    let mut ticker = tokio::time::interval(INTERRUPT_POLL);
    loop {
        ticker.tick().await;
        if flag.load(Ordering::Relaxed) {
            return;
        }
    }
}
