//! A capability-restricted calculator for the agent's code tool.
//!
//! Snippets are written in a small expression language (assignments,
//! arithmetic, lists, `if`/`for` blocks) and may only call the builtins
//! listed in [`builtins::NAMES`]. There is no file, network, process or
//! environment access. Each call runs in a fresh scope under a wall-clock
//! timeout, a step budget and an output cap.

use std::fmt;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use thiserror::Error;

pub mod builtins;
pub mod interp;
pub mod lexer;
pub mod parser;
pub mod value;

pub use value::{Table, Value};

pub const NO_OUTPUT: &str = "Code executed successfully (no output).";
pub const TRUNCATED_MARKER: &str = "... [output truncated]";
const ERROR_PREFIX: &str = "Error executing code: ";
/// Deepest nesting of blocks, expressions or container values a snippet may build.
pub const MAX_NESTING: usize = 64;
const SANDBOX_STACK_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Syntax,
    Name,
    Type,
    Argument,
    Index,
    Math,
    StepLimit,
    Timeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Syntax => "SyntaxError",
            ErrorKind::Name => "NameError",
            ErrorKind::Type => "TypeError",
            ErrorKind::Argument => "ArgumentError",
            ErrorKind::Index => "IndexError",
            ErrorKind::Math => "MathError",
            ErrorKind::StepLimit => "StepLimitExceeded",
            ErrorKind::Timeout => "Timeout",
        })
    }
}

/// A failure while running a snippet. `trace` lists the line numbers of the
/// statements that were executing, outermost first.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct ExecError {
    pub kind: ErrorKind,
    pub message: String,
    pub trace: Vec<usize>,
}

impl ExecError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), trace: Vec::new() }
    }

    pub fn at(kind: ErrorKind, line: usize, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), trace: vec![line] }
    }

    /// Renders the error and its traceback against the snippet's source.
    pub fn render(&self, source: &str) -> String {
        let mut out = format!("{}{}", ERROR_PREFIX, self);
        if !self.trace.is_empty() {
            let lines: Vec<&str> = source.lines().collect();
            out.push_str("\nTraceback (most recent statement last):");
            for line in &self.trace {
                let text = lines.get(line.saturating_sub(1)).map_or("", |l| l.trim());
                out.push_str(&format!("\n  line {}: {}", line, text));
            }
        }
        out
    }
}

/// Resource limits for one execution.
#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub timeout: Duration,
    pub max_steps: u64,
    /// Maximum captured output, in bytes.
    pub max_output: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5_000),
            max_steps: 1_000_000,
            max_output: 16 * 1024,
        }
    }
}

/// Runs snippets and reports the captured output, or a descriptive error, as
/// a string. Never panics and never returns an error to the caller.
#[derive(Debug, Clone, Default)]
pub struct CodeExecutor {
    limits: SandboxLimits,
}

impl CodeExecutor {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    pub fn execute(&self, code: &str) -> String {
        let started = Instant::now();
        let limits = self.limits;
        let source = code.to_string();
        let (tx, rx) = mpsc::channel();

        let spawned = thread::Builder::new()
            .name("finrag-sandbox".to_string())
            .stack_size(SANDBOX_STACK_BYTES)
            .spawn(move || {
                let deadline = Instant::now() + limits.timeout;
                let outcome = interp::Interpreter::new(limits, deadline).run(&source);
                let _ = tx.send(outcome);
            });
        if let Err(e) = spawned {
            warn!("Could not start the sandbox thread: {}", e);
            return format!("{}could not start the interpreter", ERROR_PREFIX);
        }

        let result = match rx.recv_timeout(self.limits.timeout) {
            Ok(Ok(output)) => render_output(output, self.limits.max_output),
            Ok(Err(err)) if err.kind == ErrorKind::Timeout => timeout_message(self.limits.timeout),
            Ok(Err(err)) => err.render(code),
            // The interpreter checks the same deadline and stops on its own.
            Err(mpsc::RecvTimeoutError::Timeout) => timeout_message(self.limits.timeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                format!("{}interpreter stopped unexpectedly", ERROR_PREFIX)
            }
        };
        debug!("Code tool finished in {:?}", started.elapsed());
        result
    }
}

pub(crate) fn timeout_message(timeout: Duration) -> String {
    format!(
        "{}{}: execution exceeded {} ms",
        ERROR_PREFIX,
        ErrorKind::Timeout,
        timeout.as_millis()
    )
}

fn render_output(output: interp::Output, max_output: usize) -> String {
    if output.text.is_empty() && !output.truncated {
        return NO_OUTPUT.to_string();
    }
    if output.truncated || output.text.len() > max_output {
        let mut text = output.text;
        let mut cut = max_output.min(text.len());
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        if !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(TRUNCATED_MARKER);
        return text;
    }
    output.text
}
