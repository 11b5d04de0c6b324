//! Interactive chat against an OpenAI-compatible chat-completions endpoint.
//!
//! # Usage
//!
//! ```bash
//! # Basic usage with default settings
//! OPENAI_API_KEY=... chatloop
//!
//! # Specify a model and a different preamble
//! chatloop --model gpt-4o --system "You are a terse assistant"
//!
//! # Read defaults from a file, then disable colors
//! chatloop --config ~/.chatloop.yaml --no-color
//! ```
//!
//! Type `/help` at the prompt for the commands.  A web address in double chevrons,
//! `<<https://example.com>>`, includes the text of that page with the message.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arrrg::CommandLine;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing_subscriber::EnvFilter;

use chatloop::chat::{ChatArgs, ChatSession, ConfigFile, Flow, PlainTextRenderer, Renderer};
use chatloop::render::{AnsiHighlighter, DEFAULT_WIDTH};
use chatloop::{HttpPageFetcher, HttpTransport};

const HISTORY_FILE: &str = ".chatloop_history";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (args, _) = ChatArgs::from_command_line_relaxed("chatloop [OPTIONS]");
    init_logging(args.debug);

    let file = match args.config.as_deref() {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("could not read config file {path}: {e}"))?;
            Some(ConfigFile::from_yaml(&text)?)
        }
        None => None,
    };
    let config = args.into_config(file)?;

    let api_key = std::env::var("OPENAI_API_KEY")
        .map_err(|_| "OPENAI_API_KEY must be set to your API key")?;
    let transport = HttpTransport::with_options(api_key, config.base_url.clone())?;

    let width = crossterm::terminal::size()
        .map(|(columns, _)| usize::from(columns))
        .ok()
        .filter(|columns| *columns > 0)
        .unwrap_or(DEFAULT_WIDTH);
    let mut renderer = PlainTextRenderer::with_color(config.use_color).with_width(width);
    if config.use_color {
        renderer = renderer.with_highlighter(Some(Box::new(AnsiHighlighter)));
    }

    let history_path = config
        .history_file
        .clone()
        .or_else(|| dirs::home_dir().map(|home| home.join(HISTORY_FILE)));
    let banner = config.describe();

    let interrupted = Arc::new(AtomicBool::new(false));
    let mut session = ChatSession::new(transport, config).with_interrupt(Arc::clone(&interrupted));
    if session.config().allow_injections {
        session = session.with_page_fetcher(HttpPageFetcher::new()?);
    }

    let interrupted_clone = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        interrupted_clone.store(true, Ordering::Relaxed);
    })?;

    let mut rl = DefaultEditor::new()?;
    load_history(&mut rl, history_path.as_ref());

    println!("chatloop ({banner})");
    println!("Type /help for commands, /quit to exit.");
    println!("Include a web page with <<https://example.com>>.\n");

    loop {
        interrupted.store(false, Ordering::Relaxed);
        match rl.readline("You: ") {
            Ok(line) => {
                if !line.trim().is_empty() {
                    let _ = rl.add_history_entry(line.as_str());
                }
                if session.handle_line(&line, &mut renderer).await == Flow::Exit {
                    break;
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!();
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!();
                session.handle_eof(&mut renderer);
                break;
            }
            Err(err) => {
                renderer.print_error(&format!("Input error: {err}"));
                break;
            }
        }
    }

    if let Some(path) = history_path.as_ref() {
        if let Err(err) = rl.save_history(path) {
            tracing::warn!(error = %err, "could not save line history");
        }
    }
    Ok(())
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("chatloop=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_history(rl: &mut DefaultEditor, path: Option<&PathBuf>) {
    let Some(path) = path else {
        return;
    };
    if path.exists() {
        if let Err(err) = rl.load_history(path) {
            tracing::warn!(error = %err, "could not load line history");
        }
    }
}
