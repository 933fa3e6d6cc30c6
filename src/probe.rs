// Copyright (c) Abstract Machines

//! Synthetic traffic for exercising the fleet's ports.

use crate::error::Result;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tracing::info;

pub const DEFAULT_MESSAGE: &[u8] = b"This is our test message.";

pub async fn send_udp(destination: SocketAddr, payload: &[u8]) -> Result<usize> {
    let bind = if destination.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };
    let socket = UdpSocket::bind(bind).await?;

    info!("Sending packet to {}", destination);
    let sent = socket.send_to(payload, destination).await?;
    info!("Sent {} bytes", sent);

    Ok(sent)
}

pub async fn send_tcp(destination: SocketAddr, payload: &[u8]) -> Result<usize> {
    let mut stream = TcpStream::connect(destination).await?;
    stream.write_all(payload).await?;
    stream.shutdown().await?;

    info!("Sent {} bytes over TCP to {}", payload.len(), destination);
    Ok(payload.len())
}

/// Waits for a single datagram on `bind`.
pub async fn listen_once(bind: SocketAddr, max_len: usize) -> Result<(Vec<u8>, SocketAddr)> {
    let socket = UdpSocket::bind(bind).await?;
    info!("Listening on {} for incoming packets...", socket.local_addr()?);

    let mut buf = vec![0u8; max_len];
    let (n, peer) = socket.recv_from(&mut buf).await?;
    buf.truncate(n);

    info!("Received {} bytes from {}", n, peer);
    Ok((buf, peer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_udp_round_trip() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap();

        let sent = send_udp(addr, DEFAULT_MESSAGE).await.unwrap();
        assert_eq!(sent, DEFAULT_MESSAGE.len());

        let mut buf = [0u8; 64];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], DEFAULT_MESSAGE);
    }

    #[tokio::test]
    async fn test_tcp_send() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let reader = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            received
        });

        send_tcp(addr, b"Hello from client").await.unwrap();
        assert_eq!(reader.await.unwrap(), b"Hello from client");
    }

    #[tokio::test]
    async fn test_listen_once_receives_datagram() {
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let listener = tokio::spawn(listen_once(addr, 4096));
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Keep sending until the listener has bound and picked one up.
        let result = loop {
            sender.send_to(DEFAULT_MESSAGE, addr).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if listener.is_finished() {
                break listener.await.unwrap().unwrap();
            }
        };

        assert_eq!(result.0, DEFAULT_MESSAGE);
        assert_eq!(result.1, sender.local_addr().unwrap());
    }
}
