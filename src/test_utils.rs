//! Test utilities: a loopback stand-in for the crane controller.
//!
//! [`FakeUpstream`] listens on `127.0.0.1:0` so tests can drive a real
//! [`UpstreamConnection`](crate::connection::UpstreamConnection) through
//! connect, data, close and reconnect without any hardware.

#![cfg(any(test, feature = "benchmark"))]

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::codec;
use crate::config::TimingConfig;
use crate::types::{FRAME_LEN, Message};

/// Listening side of a fake controller
#[derive(Debug)]
pub struct FakeUpstream {
    listener: TcpListener,
    addr: SocketAddr,
}

impl FakeUpstream {
    pub async fn bind() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        Ok(Self { listener, addr })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `host:port` for a target provider
    pub fn target(&self) -> String {
        self.addr.to_string()
    }

    pub async fn accept(&self) -> io::Result<FakePeer> {
        let (stream, _) = self.listener.accept().await?;
        Ok(FakePeer { stream })
    }

    /// Accept a connection if one arrives within `within`.
    pub async fn accept_within(&self, within: Duration) -> Option<FakePeer> {
        tokio::time::timeout(within, self.accept()).await.ok().and_then(Result::ok)
    }
}

/// The controller's end of one accepted connection
#[derive(Debug)]
pub struct FakePeer {
    stream: TcpStream,
}

impl FakePeer {
    pub async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await
    }

    pub async fn read_frame(&mut self) -> io::Result<[u8; FRAME_LEN]> {
        let mut frame = [0u8; FRAME_LEN];
        self.stream.read_exact(&mut frame).await?;
        Ok(frame)
    }

    pub async fn read_message(&mut self) -> io::Result<Message> {
        let frame = self.read_frame().await?;
        codec::decode(&frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Next message that is not a heartbeat.
    pub async fn read_non_heartbeat(&mut self) -> io::Result<Message> {
        loop {
            let message = self.read_message().await?;
            if !message.is_heartbeat() {
                return Ok(message);
            }
        }
    }

    /// Whether the relay closed its side within `within`.
    pub async fn closed_within(&mut self, within: Duration) -> bool {
        let mut scratch = [0u8; 256];
        let wait = async {
            loop {
                match self.stream.read(&mut scratch).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        };
        tokio::time::timeout(within, wait).await.is_ok()
    }
}

/// A non-heartbeat frame whose fields all derive from `n`.
pub fn sample_frame(n: u8) -> [u8; FRAME_LEN] {
    let v = i16::from(n);
    let f = f64::from(n);
    codec::encode(n, 1_700_000_000_000 + i64::from(n), 5, [v, v + 1, v + 2], [f, f + 0.5, f + 1.5])
}

/// Short periods for tests that run on the real clock.
pub fn fast_timing() -> TimingConfig {
    TimingConfig {
        heartbeat_interval_ms: 50,
        health_check_interval_ms: 200,
        stall_threshold_ms: 1_000,
        reconnect_delay_ms: 100,
        connect_timeout_ms: 1_000,
        broadcast_interval_ms: 10,
        shutdown_timeout_ms: 500,
    }
}

/// Install a test subscriber once; later calls are no-ops.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
