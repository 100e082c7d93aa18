//! Plain stdin/stdout front end

use async_trait::async_trait;
use shai_agent::{Prompter, SessionDisplay};
use shai_llm::TokenUsage;
use std::io::{self, IsTerminal, Write};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::Mutex;

use crate::tools::CommandApproval;

struct Console {
    lines: Lines<Box<dyn AsyncBufRead + Send + Unpin>>,
    out: Box<dyn Write + Send>,
}

/// Line reader over stdin, shared by the session prompt and command approval
#[derive(Clone)]
pub struct StdinReader {
    console: Arc<Mutex<Console>>,
}

impl StdinReader {
    pub fn new() -> Self {
        Self::with_io(BufReader::new(tokio::io::stdin()), io::stdout())
    }

    fn with_io(
        input: impl AsyncBufRead + Send + Unpin + 'static,
        out: impl Write + Send + 'static,
    ) -> Self {
        let input: Box<dyn AsyncBufRead + Send + Unpin> = Box::new(input);
        Self {
            console: Arc::new(Mutex::new(Console {
                lines: input.lines(),
                out: Box::new(out),
            })),
        }
    }

    /// Show `prompt` and read the answer to it.
    ///
    /// The prompt is printed only once the console is held, so concurrent
    /// questions are asked and answered one at a time.
    pub async fn prompt(&self, prompt: &str) -> io::Result<Option<String>> {
        let mut console = self.console.lock().await;
        let Console { lines, out } = &mut *console;
        write!(out, "{}", prompt)?;
        out.flush()?;
        lines.next_line().await
    }
}

impl Default for StdinReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Prompter that replays the command-line request before reading stdin
pub struct InitialInput {
    first: Option<String>,
    reader: StdinReader,
}

impl InitialInput {
    pub fn new(first: Option<String>, reader: StdinReader) -> Self {
        Self { first, reader }
    }
}

#[async_trait]
impl Prompter for InitialInput {
    async fn read_line(&mut self, prompt: &str) -> io::Result<Option<String>> {
        match self.first.take() {
            Some(line) => {
                println!("{}{}", prompt, line);
                Ok(Some(line))
            }
            None => self.reader.prompt(prompt).await,
        }
    }
}

#[async_trait]
impl CommandApproval for StdinReader {
    async fn approve(&self, command: &str) -> bool {
        let question = format!("Run `{}`? [y/N] ", command);
        match self.prompt(&question).await {
            Ok(Some(answer)) => is_yes(&answer),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!("Failed to read confirmation: {}", e);
                false
            }
        }
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

/// Streams replies to stdout; notices and errors go to stderr
pub struct TerminalDisplay {
    /// Whether anything was printed since the last newline
    mid_line: bool,
    is_tty: bool,
}

impl TerminalDisplay {
    pub fn new() -> Self {
        Self {
            mid_line: false,
            is_tty: io::stdout().is_terminal(),
        }
    }

    fn finish_line(&mut self) {
        if self.mid_line {
            println!();
            self.mid_line = false;
        }
    }
}

impl Default for TerminalDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionDisplay for TerminalDisplay {
    fn token(&mut self, text: &str) {
        print!("{}", text);
        io::stdout().flush().ok();
        self.mid_line = !text.ends_with('\n');
    }

    fn end_of_reply(&mut self) {
        self.finish_line();
    }

    fn help(&mut self, text: &str) {
        println!("{}", text);
    }

    fn notice(&mut self, message: &str) {
        self.finish_line();
        eprintln!("{}", message);
    }

    fn error(&mut self, message: &str) {
        self.finish_line();
        eprintln!("Error: {}", message);
    }

    fn exchange_cost(&mut self, usage: &TokenUsage, cost: f64) {
        // Keep piped output clean
        if self.is_tty {
            println!("{}", format_cost(usage, cost));
        }
    }

    fn session_cost(&mut self, usage: &TokenUsage, cost: f64) {
        self.finish_line();
        println!("Session total {}", format_cost(usage, cost));
    }
}

pub fn format_cost(usage: &TokenUsage, cost: f64) -> String {
    format!(
        "[{} in, {} out | ${:.4}]",
        usage.input_tokens, usage.output_tokens, cost
    )
}
