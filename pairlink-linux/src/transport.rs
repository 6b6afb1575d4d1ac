//! TCP transport: a connector that selects the service with a short preamble, and the
//! `serve` side that checks the preamble and echoes traffic back.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use pairlink_core::{BoxedStream, Connector, TransportAddress, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};
use uuid::Uuid;

const PREAMBLE_SIZE: usize = 1 + 16; // version + service id
const ACCEPT: u8 = 0x01;
const REJECT: u8 = 0x00;
const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connects to `ip:port` addresses produced by the UDP scanner.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        addr: &TransportAddress,
        service_id: Uuid,
    ) -> std::io::Result<BoxedStream> {
        let sock: SocketAddr = addr
            .as_str()
            .parse()
            .map_err(|e: std::net::AddrParseError| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
            })?;
        let mut stream = TcpStream::connect(sock).await?;
        stream.set_nodelay(true)?;
        stream.write_all(&preamble(service_id)).await?;
        stream.flush().await?;
        let mut ack = [0u8; 1];
        stream.read_exact(&mut ack).await?;
        if ack[0] != ACCEPT {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "service not offered by peer",
            ));
        }
        debug!(%sock, "service accepted");
        Ok(Box::new(stream))
    }
}

fn preamble(service_id: Uuid) -> [u8; PREAMBLE_SIZE] {
    let mut out = [0u8; PREAMBLE_SIZE];
    out[0] = PROTOCOL_VERSION;
    out[1..].copy_from_slice(service_id.as_bytes());
    out
}

/// Listen on `port` and echo for every peer that asks for `service_id`.
pub async fn run_echo_server(port: u16, service_id: Uuid) -> std::io::Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
    info!(port, "serving");
    serve(listener, service_id).await
}

pub async fn serve(listener: TcpListener, service_id: Uuid) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(async move {
            match handle_peer(stream, service_id).await {
                Ok(()) => debug!(%peer, "peer disconnected"),
                Err(e) => debug!(%peer, error = %e, "peer connection ended"),
            }
        });
    }
}

async fn handle_peer(mut stream: TcpStream, service_id: Uuid) -> std::io::Result<()> {
    let mut buf = [0u8; PREAMBLE_SIZE];
    tokio::time::timeout(PREAMBLE_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "no preamble"))??;
    if buf[0] != PROTOCOL_VERSION || buf[1..] != *service_id.as_bytes() {
        stream.write_all(&[REJECT]).await?;
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "unexpected service preamble",
        ));
    }
    stream.write_all(&[ACCEPT]).await?;
    info!(peer = ?stream.peer_addr().ok(), "peer connected");

    let mut data = vec![0u8; 1024];
    loop {
        let n = stream.read(&mut data).await?;
        if n == 0 {
            return Ok(());
        }
        let reply: &[u8] = if &data[..n] == b"PING" {
            b"PONG"
        } else {
            &data[..n]
        };
        stream.write_all(reply).await?;
    }
}
