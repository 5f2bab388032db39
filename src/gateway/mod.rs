//! WebSocket gateway for downstream clients.
//!
//! | Path | Description |
//! |------|-------------|
//! | `/ws` | Session endpoint |
//! | `/socket` | Alias of `/ws` |
//!
//! Each session receives the current `tcp-status` on connect and again on
//! every transition. It also gets the latest controller frame on connect and
//! later frames as binary messages, plus an `error` event when one of its
//! messages cannot be forwarded.

mod link;
mod protocol;
mod session;
mod sessions;

pub use link::UpstreamLink;
pub use protocol::{ClientEvent, ServerEvent};
pub use sessions::{BroadcastReport, SESSION_QUEUE_DEPTH, SessionId, SessionSet};

use axum::Router;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::GatewayConfig;
use crate::{RelayError, Result};

/// Shared state passed to all request handlers.
#[derive(Clone)]
pub(crate) struct GatewayState {
    link: Arc<dyn UpstreamLink>,
    sessions: SessionSet,
    closing: CancellationToken,
    ping_interval: Duration,
}

/// Accepts WebSocket sessions and bridges them to the upstream.
#[derive(Clone)]
pub struct Gateway {
    state: GatewayState,
}

impl Gateway {
    pub fn new(link: Arc<dyn UpstreamLink>, config: &GatewayConfig) -> Self {
        Self {
            state: GatewayState {
                link,
                sessions: SessionSet::new(),
                closing: CancellationToken::new(),
                ping_interval: config.ping_interval(),
            },
        }
    }

    /// Sessions the relay broadcasts to
    pub fn sessions(&self) -> SessionSet {
        self.state.sessions.clone()
    }

    pub fn is_closing(&self) -> bool {
        self.state.closing.is_cancelled()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(upgrade))
            .route("/socket", get(upgrade))
            .with_state(self.state.clone())
    }

    /// Bind the listener named in `config`.
    pub async fn bind(config: &GatewayConfig) -> Result<TcpListener> {
        TcpListener::bind(config.bind)
            .await
            .map_err(|e| RelayError::io(format!("binding gateway on {}", config.bind), e))
    }

    /// Serve sessions on `listener` until `shutdown` is cancelled.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let addr: Option<SocketAddr> = listener.local_addr().ok();
        info!(addr = ?addr, "Gateway listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| RelayError::io("serving WebSocket gateway", e))?;

        info!("Gateway listener stopped");
        Ok(())
    }

    /// Refuse new sessions, ask connected ones to leave, and wait until they have.
    pub async fn close(&self) {
        if !self.state.closing.is_cancelled() {
            let sessions = self.state.sessions.len().await;
            info!(sessions, "Closing gateway");
            self.state.closing.cancel();
        }
        self.state.sessions.drained().await;
        debug!("All sessions drained");
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> Response {
    if state.closing.is_cancelled() {
        return (StatusCode::SERVICE_UNAVAILABLE, "relay shutting down").into_response();
    }
    ws.on_upgrade(move |socket| session::run(socket, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TcpStatus;
    use bytes::Bytes;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::{broadcast, watch};

    const OP_TEXT: u8 = 0x1;
    const OP_BINARY: u8 = 0x2;
    const OP_CLOSE: u8 = 0x8;
    const OP_PING: u8 = 0x9;

    struct FakeLink {
        status: watch::Sender<TcpStatus>,
        events: broadcast::Sender<TcpStatus>,
        frame: Mutex<Option<Bytes>>,
        sent: Mutex<Vec<Bytes>>,
    }

    impl FakeLink {
        fn new(status: TcpStatus) -> Arc<Self> {
            Arc::new(Self {
                status: watch::channel(status).0,
                events: broadcast::channel(16).0,
                frame: Mutex::new(None),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn set_status(&self, status: TcpStatus) {
            self.status.send_replace(status.clone());
            let _ = self.events.send(status);
        }

        fn sent(&self) -> Vec<Bytes> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl UpstreamLink for FakeLink {
        fn status(&self) -> TcpStatus {
            self.status.borrow().clone()
        }

        fn current_frame(&self) -> Option<Bytes> {
            self.frame.lock().unwrap().clone()
        }

        fn status_events(&self) -> broadcast::Receiver<TcpStatus> {
            self.events.subscribe()
        }

        async fn send(&self, payload: Bytes) -> crate::Result<()> {
            if !self.status.borrow().connected {
                return Err(RelayError::WriteWhileDisconnected);
            }
            self.sent.lock().unwrap().push(payload);
            Ok(())
        }
    }

    async fn start(link: Arc<FakeLink>) -> (Gateway, SocketAddr, CancellationToken) {
        let gateway = Gateway::new(link, &GatewayConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = CancellationToken::new();

        let server = gateway.clone();
        let token = stop.clone();
        tokio::spawn(async move { server.serve(listener, token).await });
        (gateway, addr, stop)
    }

    /// Minimal client side of the WebSocket handshake; returns the status code.
    async fn connect(addr: SocketAddr, path: &str) -> (TcpStream, u16) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {path} HTTP/1.1\r\nHost: {addr}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            head.push(stream.read_u8().await.unwrap());
        }
        let head = String::from_utf8(head).unwrap();
        let code = head.split_whitespace().nth(1).unwrap().parse().unwrap();
        (stream, code)
    }

    /// Next non-ping frame from the server as (opcode, payload).
    async fn read_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        loop {
            let first = stream.read_u8().await.unwrap();
            let len = match stream.read_u8().await.unwrap() & 0x7f {
                126 => stream.read_u16().await.unwrap() as usize,
                127 => stream.read_u64().await.unwrap() as usize,
                n => n as usize,
            };
            let mut payload = vec![0; len];
            stream.read_exact(&mut payload).await.unwrap();

            if first & 0x0f != OP_PING {
                return (first & 0x0f, payload);
            }
        }
    }

    async fn read_json(stream: &mut TcpStream) -> serde_json::Value {
        let (opcode, payload) = read_frame(stream).await;
        assert_eq!(opcode, OP_TEXT);
        serde_json::from_slice(&payload).unwrap()
    }

    /// Client frames must be masked; an all-zero mask leaves the payload as is.
    async fn write_frame(stream: &mut TcpStream, opcode: u8, payload: &[u8]) {
        assert!(payload.len() < 126);
        let mut frame = vec![0x80 | opcode, 0x80 | payload.len() as u8, 0, 0, 0, 0];
        frame.extend_from_slice(payload);
        stream.write_all(&frame).await.unwrap();
    }

    #[tokio::test]
    async fn new_session_gets_current_status() {
        let link = FakeLink::new(TcpStatus::disconnected(None));
        let (_gateway, addr, _stop) = start(link).await;

        let (mut client, code) = connect(addr, "/ws").await;
        assert_eq!(code, 101);
        assert_eq!(
            read_json(&mut client).await,
            serde_json::json!({"event": "tcp-status", "data": {"connected": false}})
        );
    }

    #[tokio::test]
    async fn late_session_gets_the_current_frame_once() {
        let link = FakeLink::new(TcpStatus::connected());
        *link.frame.lock().unwrap() = Some(Bytes::from_static(&[0x11; 40]));
        let (_gateway, addr, _stop) = start(link).await;

        let (mut client, _) = connect(addr, "/ws").await;
        assert_eq!(read_json(&mut client).await["event"], "tcp-status");

        let (opcode, payload) = read_frame(&mut client).await;
        assert_eq!(opcode, OP_BINARY);
        assert_eq!(payload, vec![0x11; 40]);

        let quiet = tokio::time::timeout(Duration::from_millis(200), read_frame(&mut client));
        assert!(quiet.await.is_err());
    }

    #[tokio::test]
    async fn socket_path_is_an_alias() {
        let link = FakeLink::new(TcpStatus::connected());
        let (_gateway, addr, _stop) = start(link).await;

        let (mut client, code) = connect(addr, "/socket").await;
        assert_eq!(code, 101);
        assert_eq!(read_json(&mut client).await["data"]["connected"], true);
    }

    #[tokio::test]
    async fn client_message_while_disconnected_yields_error() {
        let link = FakeLink::new(TcpStatus::disconnected(None));
        let (_gateway, addr, _stop) = start(Arc::clone(&link)).await;
        let (mut client, _) = connect(addr, "/ws").await;
        read_json(&mut client).await;

        write_frame(&mut client, OP_BINARY, &[1, 2, 3]).await;
        assert_eq!(
            read_json(&mut client).await,
            serde_json::json!({"event": "error", "data": {"message": "TCP server not connected"}})
        );
        assert!(link.sent().is_empty());
    }

    #[tokio::test]
    async fn client_messages_are_forwarded_verbatim() {
        let link = FakeLink::new(TcpStatus::connected());
        let (_gateway, addr, _stop) = start(Arc::clone(&link)).await;
        let (mut client, _) = connect(addr, "/ws").await;
        read_json(&mut client).await;

        write_frame(&mut client, OP_BINARY, &[9, 8, 7]).await;
        write_frame(&mut client, OP_TEXT, br#"{"event":"client-msg","data":[4,5]}"#).await;

        for _ in 0..100 {
            if link.sent().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(link.sent(), vec![Bytes::from_static(&[9, 8, 7]), Bytes::from_static(&[4, 5])]);
    }

    #[tokio::test]
    async fn status_transitions_are_pushed() {
        let link = FakeLink::new(TcpStatus::disconnected(None));
        let (_gateway, addr, _stop) = start(Arc::clone(&link)).await;
        let (mut client, _) = connect(addr, "/ws").await;
        read_json(&mut client).await;

        link.set_status(TcpStatus::connected());
        assert_eq!(read_json(&mut client).await["data"]["connected"], true);
    }

    #[tokio::test]
    async fn back_to_back_transitions_each_reach_the_client() {
        let link = FakeLink::new(TcpStatus::disconnected(None));
        let (_gateway, addr, _stop) = start(Arc::clone(&link)).await;
        let (mut client, _) = connect(addr, "/ws").await;
        read_json(&mut client).await;

        link.set_status(TcpStatus::connected());
        link.set_status(TcpStatus::disconnected(Some("reset".into())));

        assert_eq!(
            read_json(&mut client).await,
            serde_json::json!({"event": "tcp-status", "data": {"connected": true}})
        );
        let closed = serde_json::json!({"connected": false, "error": "reset"});
        assert_eq!(
            read_json(&mut client).await,
            serde_json::json!({"event": "tcp-status", "data": closed})
        );
    }

    #[tokio::test]
    async fn broadcast_frames_arrive_as_binary() {
        let link = FakeLink::new(TcpStatus::connected());
        let (gateway, addr, _stop) = start(link).await;
        let (mut client, _) = connect(addr, "/ws").await;
        read_json(&mut client).await;

        let report = gateway.sessions().broadcast(Bytes::from_static(&[0xAB; 40])).await;
        assert_eq!(report.delivered, 1);

        let (opcode, payload) = read_frame(&mut client).await;
        assert_eq!(opcode, OP_BINARY);
        assert_eq!(payload, vec![0xAB; 40]);
    }

    #[test]
    fn close_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        let link = FakeLink::new(TcpStatus::connected());
        let gateway = Gateway::new(link, &GatewayConfig::default());
        assert_send(&gateway.close());
    }

    #[tokio::test]
    async fn close_notifies_sessions_and_rejects_new_ones() {
        let link = FakeLink::new(TcpStatus::connected());
        let (gateway, addr, _stop) = start(link).await;
        let (mut client, _) = connect(addr, "/ws").await;
        read_json(&mut client).await;

        tokio::time::timeout(Duration::from_secs(5), gateway.close()).await.unwrap();
        assert!(gateway.is_closing());
        assert!(gateway.sessions().is_empty().await);

        let (opcode, _) = read_frame(&mut client).await;
        assert_eq!(opcode, OP_CLOSE);

        let (_late, code) = connect(addr, "/ws").await;
        assert_eq!(code, 503);
    }
}
