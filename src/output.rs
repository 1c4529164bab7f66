use std::io::{self, Write};

use crossterm::cursor::MoveToColumn;
use crossterm::style::Print;
use crossterm::terminal::{Clear, ClearType};
use crossterm::{QueueableCommand, tty::IsTty};
use serde::Serialize;

use crate::app::{EnrichResult, ExportResult, ImportResult, LoadResult, ResolveResult, StatusResult};
use crate::progress::{ProgressEvent, ProgressSink};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_load(result: &LoadResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_enrich(result: &EnrichResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_import(result: &ImportResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_resolve(result: &ResolveResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_status(result: &StatusResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_export(result: &ExportResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Rewrites a single status line on stderr. Percentage updates overwrite
/// each other; plain messages end the line.
pub struct ConsoleProgress {
    tty: bool,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self {
            tty: io::stderr().is_tty(),
        }
    }

    /// Moves past a dangling progress line before other output.
    pub fn finish_line(&self) {
        if self.tty {
            let _ = writeln!(io::stderr());
        }
    }

    fn write_event(&self, event: &ProgressEvent) -> io::Result<()> {
        let mut stderr = io::stderr().lock();
        let line = format!("   {}", event.message);
        if self.tty && event.percent.is_some() {
            stderr
                .queue(MoveToColumn(0))?
                .queue(Clear(ClearType::CurrentLine))?
                .queue(Print(line))?;
        } else if self.tty {
            stderr
                .queue(MoveToColumn(0))?
                .queue(Clear(ClearType::CurrentLine))?
                .queue(Print(format!("{}\n", event.message)))?;
        } else {
            writeln!(stderr, "{line}")?;
        }
        stderr.flush()
    }
}

impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ConsoleProgress {
    fn event(&self, event: ProgressEvent) {
        // Reporting must never fail the pipeline.
        let _ = self.write_event(&event);
    }
}
