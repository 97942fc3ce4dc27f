//! `/api/downloads/events`: a WebSocket that mirrors the scheduler's broadcast channel,
//! one `Task` snapshot per state transition or progress tick.

use std::time::Duration;

use anyhow::Context;
use axum::extract::ws::{self, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;

use crate::app_state::AppState;
use crate::model::Task;

const SEND_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum WsMessage {
    Connected,
    TaskUpdate { task: Task },
}

struct Connection {
    socket: WebSocket,
}

impl Connection {
    fn new(socket: WebSocket) -> Self {
        Connection { socket }
    }

    async fn send(&mut self, msg: WsMessage) -> anyhow::Result<()> {
        let text = serde_json::to_string(&msg).expect("serialization is infallible");
        tokio::time::timeout(SEND_TIMEOUT, self.socket.send(ws::Message::Text(text.into())))
            .await
            .context("send timed out")??;
        Ok(())
    }
}

pub async fn ws(ws: WebSocketUpgrade, State(app_state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| ws_handler(socket, app_state))
}

async fn ws_handler(socket: WebSocket, app_state: AppState) {
    tracing::debug!("opened downloads events connection");
    if let Err(e) = ws_handler_inner(socket, app_state).await {
        tracing::debug!("downloads events connection closed: {e}");
    } else {
        tracing::debug!("downloads events connection closed");
    }
}

async fn ws_handler_inner(socket: WebSocket, app_state: AppState) -> anyhow::Result<()> {
    let mut events = app_state.scheduler.subscribe();
    let mut connection = Connection::new(socket);
    connection.send(WsMessage::Connected).await?;

    loop {
        tokio::select! {
            incoming = connection.socket.recv() => {
                match incoming {
                    Some(Ok(ws::Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }
            task = events.recv() => {
                let task = task?;
                connection.send(WsMessage::TaskUpdate { task }).await?;
            }
        }
    }
}
