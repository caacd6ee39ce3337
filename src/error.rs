//! Error types shared across the crate.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Why a bridge could not start. Rendered once into an `error` message.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("No file specified")]
    EmptyTarget,

    #[error("Invalid path '{0}': outside the working directory")]
    OutsideRoot(String),

    #[error("File '{0}' not found")]
    Missing(String),

    #[error("'{0}' is not a regular file")]
    NotAFile(String),

    #[error("No Python 3 interpreter available to run '{0}'")]
    NoInterpreter(String),

    #[error("Failed to allocate pseudo-terminal: {0}")]
    Pty(#[source] io::Error),

    #[error("Failed to start command: {0}")]
    Spawn(#[source] io::Error),

    #[error("Failed to attach process streams: {0}")]
    Streams(&'static str),
}

/// Startup configuration failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("working directory {path}: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("default script '{0}' not found")]
    DefaultScript(String),

    #[error("no suitable Python 3 interpreter found. Tried: {0:?}")]
    NoPython(Vec<&'static str>),
}
