//! Transport abstraction over stream (TCP) and datagram (UDP) endpoints.
//!
//! The rest of the processor opens endpoints through this factory and reads
//! through a single interface, so the pipelines stay transport-agnostic.

use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("transport kind 'none' has no endpoint")]
    NoEndpoint,

    #[error("shutdown requested while connecting")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum TransportKind {
    #[serde(rename = "tcp")]
    Stream,
    #[serde(rename = "udp")]
    Datagram,
    #[serde(rename = "none")]
    None,
}

/// An open inbound byte source, either connect-and-read or bind-and-recvfrom
#[derive(Debug)]
pub enum InputEndpoint {
    Stream(TcpStream),
    Datagram(UdpSocket),
}

impl InputEndpoint {
    /// Read the next chunk of bytes. Returns 0 on stream EOF.
    pub async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            InputEndpoint::Stream(stream) => {
                use tokio::io::AsyncReadExt;
                stream.read(buf).await
            }
            InputEndpoint::Datagram(socket) => {
                let (n, _addr) = socket.recv_from(buf).await?;
                Ok(n)
            }
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            InputEndpoint::Stream(_) => TransportKind::Stream,
            InputEndpoint::Datagram(_) => TransportKind::Datagram,
        }
    }
}

fn parse_addr(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    format!("{}:{}", host, port)
        .parse()
        .map_err(|_| TransportError::InvalidAddress(format!("{}:{}", host, port)))
}

/// Open an input endpoint of the given kind.
///
/// Stream endpoints connect to `host:port`, retrying every second while the
/// peer refuses connections and `running` stays set. Datagram endpoints bind
/// `host:port` and receive from anyone.
pub async fn open_input(
    kind: TransportKind,
    host: &str,
    port: u16,
    running: &Arc<AtomicBool>,
) -> Result<InputEndpoint, TransportError> {
    match kind {
        TransportKind::Stream => {
            let addr = parse_addr(host, port)?;
            loop {
                if !running.load(Ordering::Relaxed) {
                    return Err(TransportError::Cancelled);
                }
                match TcpStream::connect(addr).await {
                    Ok(stream) => {
                        info!(%addr, "Connected to stream source");
                        return Ok(InputEndpoint::Stream(stream));
                    }
                    Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                        warn!(%addr, "Source not accepting connections yet, retrying in 1s");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    Err(e) => return Err(TransportError::Io(e)),
                }
            }
        }
        TransportKind::Datagram => {
            let addr = parse_addr(host, port)?;
            let socket = UdpSocket::bind(addr).await?;
            info!(%addr, "Datagram listener bound");
            Ok(InputEndpoint::Datagram(socket))
        }
        TransportKind::None => Err(TransportError::NoEndpoint),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn kind_parses_from_config_strings() {
        let kind: TransportKind = serde_json::from_str("\"tcp\"").unwrap();
        assert_eq!(kind, TransportKind::Stream);
        let kind: TransportKind = serde_json::from_str("\"udp\"").unwrap();
        assert_eq!(kind, TransportKind::Datagram);
        let kind: TransportKind = serde_json::from_str("\"none\"").unwrap();
        assert_eq!(kind, TransportKind::None);
    }

    #[tokio::test]
    async fn none_kind_yields_no_endpoint() {
        let running = Arc::new(AtomicBool::new(true));
        let err = open_input(TransportKind::None, "127.0.0.1", 0, &running)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NoEndpoint));
    }

    #[tokio::test]
    async fn stream_input_reads_from_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            peer.write_all(b"mpegts").await.unwrap();
        });

        let running = Arc::new(AtomicBool::new(true));
        let mut endpoint = open_input(TransportKind::Stream, "127.0.0.1", port, &running)
            .await
            .unwrap();
        assert_eq!(endpoint.kind(), TransportKind::Stream);

        let mut buf = [0u8; 16];
        let n = endpoint.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"mpegts");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn datagram_input_receives_packets() {
        let running = Arc::new(AtomicBool::new(true));
        let mut endpoint = open_input(TransportKind::Datagram, "127.0.0.1", 0, &running)
            .await
            .unwrap();
        let bound = match &endpoint {
            InputEndpoint::Datagram(socket) => socket.local_addr().unwrap(),
            _ => unreachable!(),
        };

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"packet", bound).await.unwrap();

        let mut buf = [0u8; 16];
        let n = endpoint.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"packet");
    }
}
