//! Shared console sink that child output is echoed to.
//!
//! A `Console` is created once and cloned into every process it serves. Each
//! call writes one whole line under a mutex, so concurrent pumps interleave at
//! line boundaries only.
use std::{
    io::{self, Write},
    sync::{Arc, Mutex},
};

use crossterm::{cursor::MoveTo, terminal::Clear, terminal::ClearType};
use tracing::debug;

/// Which standard stream a line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Out,
    Err,
}

#[derive(Debug)]
enum Sink {
    Stdio,
    Memory(Captured),
}

/// Everything written to an in-memory console.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Captured {
    pub stdout: String,
    pub stderr: String,
    /// Number of clear requests received.
    pub clears: usize,
}

/// Cloneable handle to the process-wide output sink.
#[derive(Debug, Clone)]
pub struct Console {
    sink: Arc<Mutex<Sink>>,
}

impl Default for Console {
    fn default() -> Self {
        Self::stdio()
    }
}

impl Console {
    /// Console that writes to this process's stdout/stderr.
    pub fn stdio() -> Self {
        Self {
            sink: Arc::new(Mutex::new(Sink::Stdio)),
        }
    }

    /// Console that records output in memory instead of printing it.
    pub fn memory() -> Self {
        Self {
            sink: Arc::new(Mutex::new(Sink::Memory(Captured::default()))),
        }
    }

    /// Writes one line (a trailing newline is added when missing).
    pub fn write_line(&self, stream: Stream, line: &str) {
        let Ok(mut sink) = self.sink.lock() else {
            return;
        };
        let newline = if line.ends_with('\n') { "" } else { "\n" };

        match &mut *sink {
            Sink::Stdio => {
                let result = match stream {
                    Stream::Out => {
                        let mut out = io::stdout().lock();
                        write!(out, "{line}{newline}").and_then(|_| out.flush())
                    }
                    Stream::Err => {
                        let mut err = io::stderr().lock();
                        write!(err, "{line}{newline}").and_then(|_| err.flush())
                    }
                };
                if let Err(err) = result {
                    debug!("Console write failed: {err}");
                }
            }
            Sink::Memory(captured) => {
                let target = match stream {
                    Stream::Out => &mut captured.stdout,
                    Stream::Err => &mut captured.stderr,
                };
                target.push_str(line);
                target.push_str(newline);
            }
        }
    }

    /// Clears the terminal window.
    pub fn clear(&self) {
        let Ok(mut sink) = self.sink.lock() else {
            return;
        };

        match &mut *sink {
            Sink::Stdio => {
                let mut out = io::stdout().lock();
                if let Err(err) = crossterm::execute!(out, Clear(ClearType::All), MoveTo(0, 0))
                {
                    debug!("Console clear failed: {err}");
                }
            }
            Sink::Memory(captured) => {
                captured.stdout.clear();
                captured.clears += 1;
            }
        }
    }

    /// Snapshot of an in-memory console; `None` for a stdio console.
    pub fn captured(&self) -> Option<Captured> {
        let sink = self.sink.lock().ok()?;
        match &*sink {
            Sink::Stdio => None,
            Sink::Memory(captured) => Some(captured.clone()),
        }
    }
}
