//! One connected WebSocket client

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info, warn};

use super::GatewayState;
use super::protocol::{ClientEvent, ServerEvent};
use super::sessions::SessionId;

/// Drive one client until it leaves or the gateway closes.
pub(super) async fn run(socket: WebSocket, state: GatewayState) {
    let (id, frames) = state.sessions.register().await;
    info!(session = id, "Client connected");

    if let Err(e) = serve(socket, &state, id, frames).await {
        debug!(session = id, "Session ended with error: {}", e);
    }

    state.sessions.remove(id).await;
    info!(session = id, "Client disconnected");
}

async fn serve(
    mut socket: WebSocket,
    state: &GatewayState,
    id: SessionId,
    mut frames: tokio::sync::mpsc::Receiver<Bytes>,
) -> Result<(), axum::Error> {
    // Subscribe before the snapshot so no transition falls between them
    let mut status = BroadcastStream::new(state.link.status_events());
    send_event(&mut socket, &ServerEvent::TcpStatus(state.link.status())).await?;
    if let Some(frame) = state.link.current_frame() {
        socket.send(Message::Binary(frame)).await?;
    }

    let mut ping = ping_interval(state.ping_interval);

    loop {
        tokio::select! {
            _ = state.closing.cancelled() => {
                let reason = "relay shutting down".into();
                let frame = CloseFrame { code: close_code::AWAY, reason };
                let _ = socket.send(Message::Close(Some(frame))).await;
                return Ok(());
            }
            Some(event) = status.next() => {
                let current = match event {
                    Ok(current) => current,
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        debug!(session = id, missed, "Status events lagged, sending latest");
                        state.link.status()
                    }
                };
                send_event(&mut socket, &ServerEvent::TcpStatus(current)).await?;
            }
            Some(frame) = frames.recv() => {
                socket.send(Message::Binary(frame)).await?;
            }
            _ = ping.tick() => {
                socket.send(Message::Ping(Bytes::new())).await?;
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Binary(payload))) => {
                    forward(&mut socket, state, id, payload).await?;
                }
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientEvent>(text.as_str()) {
                        Ok(ClientEvent::ClientMsg(data)) => {
                            forward(&mut socket, state, id, Bytes::from(data)).await?;
                        }
                        Err(e) => debug!(session = id, "Ignoring client text: {}", e),
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
            },
        }
    }
}

/// Pass a client message upstream, or tell the client why not.
async fn forward(
    socket: &mut WebSocket,
    state: &GatewayState,
    id: SessionId,
    payload: Bytes,
) -> Result<(), axum::Error> {
    match state.link.send(payload).await {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(session = id, "Client message not forwarded: {}", e);
            send_event(socket, &ServerEvent::error(e.to_string())).await
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), axum::Error> {
    match event.to_message() {
        Ok(message) => socket.send(message).await,
        Err(e) => {
            warn!("Failed to encode {:?}: {}", event, e);
            Ok(())
        }
    }
}

fn ping_interval(period: Duration) -> tokio::time::Interval {
    let mut ping = tokio::time::interval_at(Instant::now() + period, period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping
}
