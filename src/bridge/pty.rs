//! Pseudo-terminal backed streams.
//!
//! The child gets the slave side as stdin/stdout/stderr and its controlling
//! terminal; we keep the master. Reads on the master fail with `EIO` once the
//! last slave holder exits, which the reader treats as end of stream.

use super::terminal::{
    Attached, HangupScope, OutputReader, StreamMode, Terminal, WindowControl, WindowSize,
};
use super::StreamKind;
use crate::error::StartError;
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::termios::Termios;
use nix::unistd::setsid;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;
use tokio::fs::File;
use tokio::process::Command;
use tracing::debug;

/// Whether the host can hand out pseudo-terminals at all.
pub(crate) fn available() -> bool {
    match openpty(None::<&Winsize>, None::<&Termios>) {
        Ok(_) => true,
        Err(e) => {
            debug!("openpty unavailable, falling back to pipes: {}", e);
            false
        }
    }
}

pub(crate) struct PtyTerminal {
    size: WindowSize,
}

impl PtyTerminal {
    pub(crate) fn new(size: WindowSize) -> Self {
        Self { size }
    }
}

impl Terminal for PtyTerminal {
    fn mode(&self) -> StreamMode {
        StreamMode::Pty
    }

    fn spawn(&self, mut command: Command) -> Result<Attached, StartError> {
        let winsize = winsize(self.size);
        let OpenptyResult { master, slave } =
            openpty(Some(&winsize), None::<&Termios>).map_err(|e| StartError::Pty(e.into()))?;

        let slave_in = slave.try_clone().map_err(StartError::Pty)?;
        let slave_out = slave.try_clone().map_err(StartError::Pty)?;
        command
            .stdin(Stdio::from(slave_in))
            .stdout(Stdio::from(slave_out))
            .stderr(Stdio::from(slave))
            .env("TERM", "xterm-256color");

        // SAFETY: setsid and ioctl are async-signal-safe; nothing else runs
        // between fork and exec.
        unsafe {
            command.pre_exec(|| {
                setsid()?;
                if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(StartError::Spawn)?;
        // Our copies of the slave must close or the master never sees EOF.
        drop(command);

        let reader = master.try_clone().map_err(StartError::Pty)?;
        let writer = master.try_clone().map_err(StartError::Pty)?;

        Ok(Attached {
            child,
            stdin: Box::new(File::from_std(std::fs::File::from(writer))),
            outputs: vec![(
                StreamKind::Stdout,
                Box::new(File::from_std(std::fs::File::from(reader))) as OutputReader,
            )],
            control: Box::new(PtyWindow { master }),
            hangup: HangupScope::Process,
        })
    }
}

struct PtyWindow {
    master: OwnedFd,
}

impl WindowControl for PtyWindow {
    fn resize(&self, size: WindowSize) -> io::Result<()> {
        let winsize = winsize(size);
        // SAFETY: TIOCSWINSZ reads a winsize struct from a valid pointer.
        let result = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &winsize) };
        if result < 0 {
            Err(io::Error::last_os_error())
        } else {
            debug!(rows = size.rows, cols = size.cols, "Resized pty");
            Ok(())
        }
    }
}

fn winsize(size: WindowSize) -> Winsize {
    Winsize {
        ws_row: size.rows,
        ws_col: size.cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}
