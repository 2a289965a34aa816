//! `parlor chat`: a line-oriented terminal client for a running relay.
//!
//! Logs in over HTTP, opens the WebSocket with the returned ticket, joins a
//! room, then sends every stdin line as `send_message` and prints each
//! `new_message` it receives.

use anyhow::{Context, Result};
use clap::Parser;
use futures::{Sink, SinkExt, StreamExt};
use std::fmt::Display;
use reqwest::StatusCode;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_tungstenite::tungstenite;
use tracing::debug;

use crate::handlers::login::LoginResponse;
use crate::ws::protocol::{
    ChangeRoomPayload, EVENT_CHANGE_ROOM, EVENT_NEW_MESSAGE, EVENT_SEND_MESSAGE, Event,
    NewMessagePayload, SendMessagePayload,
};

#[derive(Parser, Debug, Clone)]
pub struct ChatArgs {
    /// Relay base URL
    #[arg(short, long, default_value = "http://127.0.0.1:8080")]
    pub server: String,

    #[arg(short, long, default_value = "percy")]
    pub username: String,

    #[arg(short, long, default_value = "123")]
    pub password: String,

    /// Room to join after connecting
    #[arg(short, long, default_value = "lobby")]
    pub room: String,

    /// Name shown next to your messages (defaults to the username)
    #[arg(short, long)]
    pub name: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("relay is unavailable")]
    Unavailable,

    #[error("login rejected")]
    LoginRejected,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ChatError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Unavailable
        } else {
            Self::Other(err.into())
        }
    }

    fn from_tungstenite(err: tungstenite::Error) -> Self {
        match &err {
            tungstenite::Error::Io(io_err)
                if matches!(
                    io_err.kind(),
                    std::io::ErrorKind::ConnectionRefused
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted
                ) =>
            {
                Self::Unavailable
            }
            _ => Self::Other(err.into()),
        }
    }
}

pub async fn chat_command(args: ChatArgs) -> Result<()> {
    let name = args.name.clone().unwrap_or_else(|| args.username.clone());

    let ticket = match login(&args.server, &args.username, &args.password).await {
        Ok(ticket) => ticket,
        Err(ChatError::Unavailable) => {
            eprintln!("[parlor: relay at {} is not reachable]", args.server);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let url = ws_url(&args.server, &ticket);
    let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
        Ok(conn) => conn,
        Err(e) => match ChatError::from_tungstenite(e) {
            ChatError::Unavailable => {
                eprintln!("[parlor: relay at {} is not reachable]", args.server);
                return Ok(());
            }
            other => return Err(other.into()),
        },
    };
    let (mut ws_write, mut ws_read) = ws_stream.split();

    let join = Event::new(
        EVENT_CHANGE_ROOM,
        ChangeRoomPayload {
            name: args.room.clone(),
        },
    )?;
    ws_write
        .send(tungstenite::Message::Text(join.to_json()?.into()))
        .await
        .context("Failed to join room")?;
    eprintln!("[parlor: joined {} as {}]", args.room, name);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                let message = line.trim();
                if message.is_empty() {
                    continue;
                }
                let event = Event::new(
                    EVENT_SEND_MESSAGE,
                    SendMessagePayload {
                        message: message.to_string(),
                        from: name.clone(),
                    },
                )?;
                ws_write
                    .send(tungstenite::Message::Text(event.to_json()?.into()))
                    .await
                    .context("Failed to send message")?;
            }
            frame = ws_read.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        if let Some(line) = render_frame(text.as_bytes()) {
                            println!("{line}");
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(_))) | None => {
                        eprintln!("[parlor: connection closed]");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        eprintln!("[parlor: connection lost: {e}]");
                        return Ok(());
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    send_close(&mut ws_write).await;
    Ok(())
}

/// Best-effort close frame on the way out. Returns whether it was written.
async fn send_close<Si>(sink: &mut Si) -> bool
where
    Si: Sink<tungstenite::Message> + Unpin,
    Si::Error: Display,
{
    match sink.send(tungstenite::Message::Close(None)).await {
        Ok(()) => true,
        Err(e) => {
            debug!("Close frame not delivered: {}", e);
            false
        }
    }
}

async fn login(server: &str, username: &str, password: &str) -> Result<String, ChatError> {
    let url = format!("{}/login", server.trim_end_matches('/'));
    let resp = reqwest::Client::new()
        .post(&url)
        .json(&serde_json::json!({
            "username": username,
            "password": password,
        }))
        .send()
        .await
        .map_err(ChatError::from_reqwest)?;

    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(ChatError::LoginRejected);
    }
    if !status.is_success() {
        return Err(anyhow::anyhow!("Login request failed: {}", status).into());
    }

    let body: LoginResponse = resp
        .json()
        .await
        .context("Failed to parse login response")?;
    Ok(body.ticket)
}

/// Turn an `http(s)://host` base URL into the relay's WebSocket endpoint.
fn ws_url(server: &str, ticket: &str) -> String {
    let base = server.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        format!("ws://{base}")
    };
    format!("{base}/ws?ticket={ticket}")
}

/// Render a `new_message` frame for the terminal. Anything else is skipped.
fn render_frame(frame: &[u8]) -> Option<String> {
    let event = match Event::from_frame(frame) {
        Ok(event) => event,
        Err(e) => {
            debug!("Ignoring unreadable frame: {}", e);
            return None;
        }
    };
    if event.kind != EVENT_NEW_MESSAGE {
        return None;
    }
    let msg: NewMessagePayload = event.decode_payload().ok()?;
    Some(format!(
        "[{}] {}: {}",
        msg.sent.format("%H:%M:%S"),
        msg.from,
        msg.message
    ))
}
