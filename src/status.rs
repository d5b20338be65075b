// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::io;
use std::io::Write;

use crate::policy::Action;
use crate::sensor::SystemStatus;

const CLEAR_LINE: &str = "\x1b[2K";

pub fn format_status(status: Option<&SystemStatus>, nr_workers: usize, action: &Action) -> String {
    match status {
        Some(s) => format!(
            "Temp: {:.1}°C | CPU: {:.1}% | Memory: {:.1}% | Workers: {} | Runtime: {}s | Action: {}",
            s.temperature, s.cpu_percent, s.memory_percent, nr_workers, s.runtime, action.kind
        ),
        None => format!(
            "Temp: --.-°C | CPU: --% | Memory: --% | Workers: {} | Runtime: --s | Action: {}",
            nr_workers, action.kind
        ),
    }
}

/// A single status line re-rendered in place.
pub struct StatusLine {
    out: Box<dyn Write + Send>,
    open: bool,
}

impl StatusLine {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out, open: false }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    pub fn sink() -> Self {
        Self::new(Box::new(io::sink()))
    }

    pub fn render(&mut self, line: &str) -> io::Result<()> {
        write!(self.out, "\r{}{}", CLEAR_LINE, line)?;
        self.out.flush()?;
        self.open = true;
        Ok(())
    }

    /// Terminate the current line so following log output starts clean.
    pub fn break_line(&mut self) {
        if self.open {
            let _ = writeln!(self.out);
            let _ = self.out.flush();
            self.open = false;
        }
    }
}

impl Drop for StatusLine {
    fn drop(&mut self) {
        self.break_line();
    }
}
