//! Webterm - a browser-driven remote terminal.
//!
//! A client opens a WebSocket, asks the server to run a script (or attaches
//! to an interactive shell), and the process's standard streams are bridged
//! onto that connection in real time.

pub mod bridge;
pub mod config;
pub mod connection;
pub mod error;
pub mod http_server;
pub mod outbound;
pub mod protocol;
pub mod security;
pub mod state;
