//! Output rendering for assistant replies.
//!
//! [`render_reply`] is a pure function that lays a reply out for a terminal of a given width:
//! prose is word-wrapped, while fenced code, indented blocks and table rows are left exactly as
//! the model wrote them.  Styling is delegated to an optional [`Highlighter`] and applied after
//! layout, so highlighted and plain output carry the same visible text.
//!
//! The [`Renderer`] trait is the sink the chat session writes to.

use std::io::{self, Stdout, Write};

use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::types::{Reply, Usage};

/// ANSI escape code for bold text (used for headings).
const ANSI_BOLD: &str = "\x1b[1m";

/// ANSI escape code for dim text (used for fences and notices).
const ANSI_DIM: &str = "\x1b[2m";

/// ANSI escape code for italic text (used for block quotes).
const ANSI_ITALIC: &str = "\x1b[3m";

/// ANSI escape code to reset all styling.
const ANSI_RESET: &str = "\x1b[0m";

/// ANSI escape code for cyan text (used for inline code and labels).
const ANSI_CYAN: &str = "\x1b[36m";

/// ANSI escape code for yellow text (used for code blocks).
const ANSI_YELLOW: &str = "\x1b[33m";

/// ANSI escape code for red text (used for errors).
const ANSI_RED: &str = "\x1b[31m";

/// Width used when the terminal size is unknown.
pub const DEFAULT_WIDTH: usize = 80;

/// Styles lines of a reply after layout.
///
/// Implementations may only add non-printing decoration (escape sequences); the visible
/// characters of each line must be returned unchanged.
pub trait Highlighter: Send + Sync {
    /// Style one line of prose.
    fn style_prose(&self, line: &str) -> String;

    /// Style one line inside a code block, with the block's language tag if it had one.
    fn style_code(&self, lang: Option<&str>, line: &str) -> String;

    /// Style a fence line that opens or closes a code block.
    fn style_fence(&self, line: &str) -> String;
}

/// Highlighter using ANSI escape sequences.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnsiHighlighter;

impl Highlighter for AnsiHighlighter {
    fn style_prose(&self, line: &str) -> String {
        let body = line.trim_start();
        if is_heading(body) {
            return format!("{ANSI_BOLD}{line}{ANSI_RESET}");
        }
        if body.starts_with('>') {
            return format!("{ANSI_ITALIC}{line}{ANSI_RESET}");
        }
        if !line.contains('`') {
            return line.to_string();
        }
        let mut out = String::with_capacity(line.len() + 16);
        let mut in_code = false;
        for ch in line.chars() {
            if ch == '`' {
                if in_code {
                    out.push(ch);
                    out.push_str(ANSI_RESET);
                } else {
                    out.push_str(ANSI_CYAN);
                    out.push(ch);
                }
                in_code = !in_code;
            } else {
                out.push(ch);
            }
        }
        if in_code {
            out.push_str(ANSI_RESET);
        }
        out
    }

    fn style_code(&self, _lang: Option<&str>, line: &str) -> String {
        if line.is_empty() {
            String::new()
        } else {
            format!("{ANSI_YELLOW}{line}{ANSI_RESET}")
        }
    }

    fn style_fence(&self, line: &str) -> String {
        format!("{ANSI_DIM}{line}{ANSI_RESET}")
    }
}

fn is_heading(body: &str) -> bool {
    let hashes = body.chars().take_while(|c| *c == '#').count();
    (1..=6).contains(&hashes) && body[hashes..].starts_with(' ')
}

struct Fence {
    marker: char,
    len: usize,
    lang: Option<String>,
}

/// Opens or closes a fence: returns the marker character and run length.
fn fence_marker(line: &str) -> Option<(char, usize, &str)> {
    let body = line.trim_start_matches(' ');
    if line.len() - body.len() > 3 {
        return None;
    }
    let marker = body.chars().next().filter(|c| *c == '`' || *c == '~')?;
    let len = body.chars().take_while(|c| *c == marker).count();
    if len < 3 {
        return None;
    }
    Some((marker, len, body[len..].trim()))
}

fn is_preformatted(line: &str) -> bool {
    line.starts_with("    ") || line.starts_with('\t')
}

/// Lay out a reply for a terminal `width` columns wide.
///
/// Every prose line of the result is at most `width` display columns.  Source line breaks are
/// kept; lines are never joined.  Lines inside fenced code blocks, lines indented by four
/// spaces or a tab, and table rows are passed through unbroken.
pub fn render_reply(text: &str, width: usize, highlighter: Option<&dyn Highlighter>) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut fence: Option<Fence> = None;
    for raw in text.split('\n') {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(open) = &fence {
            let closes = fence_marker(line).is_some_and(|(marker, len, rest)| {
                marker == open.marker && len >= open.len && rest.is_empty()
            });
            if closes {
                out.push(styled_fence(highlighter, line));
                fence = None;
            } else {
                let lang = open.lang.as_deref();
                out.push(match highlighter {
                    Some(h) => h.style_code(lang, line),
                    None => line.to_string(),
                });
            }
            continue;
        }
        if let Some((marker, len, rest)) = fence_marker(line) {
            if marker == '~' || !rest.contains('`') {
                let lang = rest.split_whitespace().next().map(String::from);
                fence = Some(Fence { marker, len, lang });
                out.push(styled_fence(highlighter, line));
                continue;
            }
        }
        if is_preformatted(line) {
            out.push(match highlighter {
                Some(h) => h.style_code(None, line),
                None => line.to_string(),
            });
            continue;
        }
        let pieces = if line.trim_start().starts_with('|') {
            vec![line.to_string()]
        } else {
            wrap_line(line, width)
        };
        for piece in pieces {
            out.push(match highlighter {
                Some(h) => h.style_prose(&piece),
                None => piece,
            });
        }
    }
    out.join("\n")
}

fn styled_fence(highlighter: Option<&dyn Highlighter>, line: &str) -> String {
    match highlighter {
        Some(h) => h.style_fence(line),
        None => line.to_string(),
    }
}

fn list_marker_width(body: &str) -> usize {
    if body.starts_with("- ") || body.starts_with("* ") || body.starts_with("+ ") {
        return 2;
    }
    let digits = body.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 && (body[digits..].starts_with(". ") || body[digits..].starts_with(") ")) {
        return digits + 2;
    }
    0
}

/// Greedy word wrap of one source line.
fn wrap_line(line: &str, width: usize) -> Vec<String> {
    if width == 0 || line.width() <= width {
        return vec![line.to_string()];
    }
    let body = line.trim_start_matches(' ');
    if body.is_empty() {
        return vec![String::new()];
    }
    let mut indent = &line[..line.len() - body.len()];
    if indent.len() * 2 >= width {
        indent = "";
    }
    let hang_width = indent.len() + list_marker_width(body);
    let hang = if hang_width * 2 < width {
        " ".repeat(hang_width)
    } else {
        indent.to_string()
    };

    let mut lines = Vec::new();
    let mut current = indent.to_string();
    let mut current_width = indent.len();
    let mut has_content = false;
    for word in body.split(' ').filter(|w| !w.is_empty()) {
        let word_width = word.width();
        if has_content && current_width + 1 + word_width <= width {
            current.push(' ');
            current.push_str(word);
            current_width += 1 + word_width;
            continue;
        }
        if has_content {
            lines.push(std::mem::replace(&mut current, hang.clone()));
            current_width = hang.len();
        }
        if current_width + word_width <= width {
            current.push_str(word);
            current_width += word_width;
            has_content = true;
            continue;
        }
        // Longer than a whole line: break between characters.
        let mut piece_started = false;
        for ch in word.chars() {
            let ch_width = ch.width().unwrap_or(0);
            if piece_started && current_width + ch_width > width {
                lines.push(std::mem::replace(&mut current, hang.clone()));
                current_width = hang.len();
            }
            current.push(ch);
            current_width += ch_width;
            piece_started = true;
        }
        has_content = true;
    }
    lines.push(current);
    lines
}

/// Trait for rendering chat output.
///
/// Replies, usage and information go to the primary channel; errors go to a distinct one.
pub trait Renderer: Send {
    /// Print a complete assistant reply.
    fn print_reply(&mut self, reply: &Reply);

    /// Print token usage for the last round.
    fn print_usage(&mut self, usage: &Usage);

    /// Print an informational message.
    fn print_info(&mut self, info: &str);

    /// Print a notice about something the user should know but need not act on.
    fn print_notice(&mut self, notice: &str);

    /// Print an error message.
    fn print_error(&mut self, error: &str);

    /// Called when a round trip is abandoned by the user.
    fn print_interrupted(&mut self);
}

/// Plain text renderer with optional ANSI styling.
///
/// Writes replies to stdout and errors to stderr.
pub struct PlainTextRenderer {
    stdout: Stdout,
    use_color: bool,
    width: usize,
    highlighter: Option<Box<dyn Highlighter>>,
}

impl PlainTextRenderer {
    /// Creates a new PlainTextRenderer with ANSI colors enabled.
    pub fn new() -> Self {
        Self::with_color(true)
    }

    /// Creates a new PlainTextRenderer with specified color setting.
    pub fn with_color(use_color: bool) -> Self {
        let highlighter: Option<Box<dyn Highlighter>> = if use_color {
            Some(Box::new(AnsiHighlighter))
        } else {
            None
        };
        Self {
            stdout: io::stdout(),
            use_color,
            width: DEFAULT_WIDTH,
            highlighter,
        }
    }

    /// Set the wrap width.
    pub fn with_width(mut self, width: usize) -> Self {
        self.width = width;
        self
    }

    /// Replace the highlighter.
    pub fn with_highlighter(mut self, highlighter: Option<Box<dyn Highlighter>>) -> Self {
        self.highlighter = highlighter;
        self
    }

    /// The wrap width.
    pub fn width(&self) -> usize {
        self.width
    }

    fn flush(&mut self) {
        let _ = self.stdout.flush();
    }
}

impl Default for PlainTextRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for PlainTextRenderer {
    fn print_reply(&mut self, reply: &Reply) {
        let label = reply.model.as_deref().unwrap_or("assistant");
        if self.use_color {
            println!("\n{ANSI_CYAN}[{label}]{ANSI_RESET}");
        } else {
            println!("\n[{label}]");
        }
        let rendered = render_reply(&reply.text, self.width, self.highlighter.as_deref());
        println!("{rendered}");
        if reply.is_cut_off() {
            self.print_notice("reply stopped at the output token limit");
        }
        self.flush();
    }

    fn print_usage(&mut self, usage: &Usage) {
        let line = format!(
            "tokens: prompt {}, completion {}, total {}",
            usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
        );
        if self.use_color {
            println!("{ANSI_DIM}{line}{ANSI_RESET}");
        } else {
            println!("{line}");
        }
        self.flush();
    }

    fn print_info(&mut self, info: &str) {
        println!("{info}");
        self.flush();
    }

    fn print_notice(&mut self, notice: &str) {
        if self.use_color {
            println!("{ANSI_DIM}{ANSI_ITALIC}note: {notice}{ANSI_RESET}");
        } else {
            println!("note: {notice}");
        }
        self.flush();
    }

    fn print_error(&mut self, error: &str) {
        if self.use_color {
            eprintln!("\n{ANSI_RED}Error:{ANSI_RESET} {error}");
        } else {
            eprintln!("\nError: {error}");
        }
    }

    fn print_interrupted(&mut self) {
        println!("\n[interrupted]");
        self.flush();
    }
}
