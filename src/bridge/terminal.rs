//! How a child's standard streams are attached: one interface, two backends.

use super::StreamKind;
use crate::error::StartError;
use serde::Serialize;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

pub type OutputReader = Box<dyn AsyncRead + Send + Unpin>;
pub type InputWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Stream wiring for spawned processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// One pseudo-terminal: stdout and stderr merged, resizable.
    Pty,
    /// Separate stdin/stdout/stderr pipes.
    Pipes,
}

impl StreamMode {
    /// Pick the best mode the host supports.
    pub fn probe() -> Self {
        #[cfg(unix)]
        {
            if super::pty::available() {
                return StreamMode::Pty;
            }
        }
        StreamMode::Pipes
    }

    pub(crate) fn backend(self, size: WindowSize) -> Box<dyn Terminal> {
        match self {
            #[cfg(unix)]
            StreamMode::Pty => Box::new(super::pty::PtyTerminal::new(size)),
            #[cfg(not(unix))]
            StreamMode::Pty => {
                let _ = size;
                Box::new(super::pipes::PipeTerminal)
            }
            StreamMode::Pipes => Box::new(super::pipes::PipeTerminal),
        }
    }
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for WindowSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// What a hang-up is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HangupScope {
    /// The child alone; its session's terminal takes care of the rest.
    Process,
    /// The child's whole process group, led by the child.
    Group,
}

/// A spawned child with its streams detached from the `Child` handle.
pub(crate) struct Attached {
    pub child: Child,
    pub stdin: InputWriter,
    pub outputs: Vec<(StreamKind, OutputReader)>,
    pub control: Box<dyn WindowControl>,
    pub hangup: HangupScope,
}

/// Spawns a command with its standard streams wired up.
pub(crate) trait Terminal: Send + Sync {
    fn mode(&self) -> StreamMode;

    fn spawn(&self, command: Command) -> Result<Attached, StartError>;
}

/// Out-of-band terminal control for a live process.
pub(crate) trait WindowControl: Send {
    fn resize(&self, size: WindowSize) -> io::Result<()>;
}

/// Resizing a pipe has no meaning.
pub(crate) struct NoWindow;

impl WindowControl for NoWindow {
    fn resize(&self, _size: WindowSize) -> io::Result<()> {
        Ok(())
    }
}
