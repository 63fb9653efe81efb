//! The output sink: a single serialization point for child output lines.
//!
//! Every captured child's pump thread writes through one shared sink, so
//! lines from distinct children may interleave but no line is ever split.
//! Records are formatted as `"{prefix:>7} | {text}"`; the prefix is
//! colorized only when stdout is a terminal.

use std::io::Write;
use std::sync::{Arc, Mutex};

/// Width the prefix column is truncated and padded to.
pub const PREFIX_WIDTH: usize = 7;

const PALETTE: [&str; 6] = [
    "\x1b[36m", // cyan
    "\x1b[33m", // yellow
    "\x1b[32m", // green
    "\x1b[35m", // magenta
    "\x1b[34m", // blue
    "\x1b[31m", // red
];
const RESET: &str = "\x1b[0m";

/// Thread-safe, line-atomic writer shared by the supervisor and all pumps.
#[derive(Clone)]
pub struct OutputSink {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    color: bool,
}

impl OutputSink {
    /// Sink writing to the supervisor's stdout, color gated on a tty.
    pub fn stdout() -> Self {
        // SAFETY: isatty(2) only inspects the descriptor.
        let color = unsafe { libc::isatty(libc::STDOUT_FILENO) } == 1;
        Self::with_writer(Box::new(std::io::stdout()), color)
    }

    pub fn with_writer(writer: Box<dyn Write + Send>, color: bool) -> Self {
        OutputSink {
            writer: Arc::new(Mutex::new(writer)),
            color,
        }
    }

    /// Write one record. The write is atomic at line granularity; a poisoned
    /// lock (a panicked pump) silently drops the line rather than taking the
    /// supervisor down.
    pub fn write_line(&self, prefix: &str, text: &str) {
        let padded = format!("{:>width$}", truncate(prefix), width = PREFIX_WIDTH);
        let line = if self.color {
            format!("{}{padded}{RESET} | {text}\n", color_for(prefix))
        } else {
            format!("{padded} | {text}\n")
        };
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writer.write_all(line.as_bytes());
            let _ = writer.flush();
        }
    }
}

fn truncate(prefix: &str) -> &str {
    match prefix.char_indices().nth(PREFIX_WIDTH) {
        Some((idx, _)) => &prefix[..idx],
        None => prefix,
    }
}

/// Stable per-prefix color so a service keeps its color across restarts.
fn color_for(prefix: &str) -> &'static str {
    let sum: usize = prefix.bytes().map(usize::from).sum();
    PALETTE[sum % PALETTE.len()]
}
