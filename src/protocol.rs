//! Wire messages for the execution and shell sessions.
//!
//! Each session decodes client frames once into a closed enum and matches on
//! it exhaustively. Frames that fail to decode are ignored by the caller.

use serde::{Deserialize, Serialize};

/// Client → server, execution session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Run `file` (relative to the root), or the default script when absent.
    Execute {
        #[serde(default)]
        file: Option<String>,
    },
    Input {
        #[serde(default)]
        input: String,
    },
    Ping,
    Pong,
}

/// Server → client, execution session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Stdout { content: String },
    Stderr { content: String },
    Error { content: String },
    Completed { content: String },
    Pong,
}

impl ServerMessage {
    pub fn completed(code: i32) -> Self {
        ServerMessage::Completed {
            content: exit_summary(code),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Stdout { .. } => "stdout",
            ServerMessage::Stderr { .. } => "stderr",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Completed { .. } => "completed",
            ServerMessage::Pong => "pong",
        }
    }
}

/// How a process exit is described to the client.
pub fn exit_summary(code: i32) -> String {
    format!("Exit code: {}", code)
}

/// Client → server, shell session. Server → client is raw pty bytes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ShellMessage {
    Resize { rows: u16, cols: u16 },
    Input { data: String },
}
