#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use webterm::config::Config;
use webterm::http_server;
use webterm::state::AppState;

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(10);

/// A temp root holding the given scripts, and a pipe-mode config for it.
pub fn script_root(scripts: &[(&str, &str)]) -> (TempDir, Config) {
    let dir = tempfile::tempdir().unwrap();
    for (name, body) in scripts {
        fs::write(dir.path().join(name), body).unwrap();
    }
    let config = Config::for_root(dir.path()).unwrap();
    (dir, config)
}

/// Serve `config` on an ephemeral local port for the rest of the test.
pub async fn start_server(config: Config) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = AppState::new(config);
    tokio::spawn(http_server::serve(listener, state, std::future::pending()));
    addr
}

pub async fn connect(
    addr: SocketAddr,
    path: &str,
    cookie: Option<&str>,
) -> Result<Client, tungstenite::Error> {
    let mut request = format!("ws://{}{}", addr, path).into_client_request()?;
    if let Some(cookie) = cookie {
        request
            .headers_mut()
            .insert(COOKIE, HeaderValue::from_str(cookie).unwrap());
    }
    let (ws, _) = tokio_tungstenite::connect_async(request).await?;
    Ok(ws)
}

pub async fn send_json(ws: &mut Client, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Next JSON message, skipping control frames.
pub async fn next_json(ws: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("connection ended")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Messages up to and including the next `completed` or `error`.
pub async fn until_finished(ws: &mut Client) -> Vec<Value> {
    let mut seen = Vec::new();
    loop {
        let message = next_json(ws).await;
        let done = matches!(message["type"].as_str(), Some("completed") | Some("error"));
        seen.push(message);
        if done {
            return seen;
        }
    }
}

pub fn stream_text(messages: &[Value], kind: &str) -> String {
    messages
        .iter()
        .filter(|m| m["type"] == kind)
        .filter_map(|m| m["content"].as_str())
        .collect()
}
