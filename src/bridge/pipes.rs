//! Pipe-backed streams: the fallback where no pty is available.

use super::terminal::{Attached, HangupScope, NoWindow, OutputReader, StreamMode, Terminal};
use super::StreamKind;
use crate::error::StartError;
use std::process::Stdio;
use tokio::process::Command;

pub(crate) struct PipeTerminal;

impl Terminal for PipeTerminal {
    fn mode(&self) -> StreamMode {
        StreamMode::Pipes
    }

    fn spawn(&self, mut command: Command) -> Result<Attached, StartError> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // No terminal to hang up: lead a group so a hang-up reaches the
        // child's jobs too.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(StartError::Spawn)?;
        let stdin = child.stdin.take().ok_or(StartError::Streams("stdin"))?;
        let stdout = child.stdout.take().ok_or(StartError::Streams("stdout"))?;
        let stderr = child.stderr.take().ok_or(StartError::Streams("stderr"))?;

        Ok(Attached {
            child,
            stdin: Box::new(stdin),
            outputs: vec![
                (StreamKind::Stdout, Box::new(stdout) as OutputReader),
                (StreamKind::Stderr, Box::new(stderr) as OutputReader),
            ],
            control: Box::new(NoWindow),
            hangup: if cfg!(unix) {
                HangupScope::Group
            } else {
                HangupScope::Process
            },
        })
    }
}
