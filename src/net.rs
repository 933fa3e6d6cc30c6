// Copyright (c) Abstract Machines

use crate::error::{HarnessError, Result};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{sleep, Instant};
use tracing::debug;

const PROBE_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Address of the interface the kernel would route public traffic through.
///
/// Connecting a UDP socket only selects a route; no packet is sent.
pub async fn resolve_outbound_ip() -> Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket
        .connect("8.8.8.8:80")
        .await
        .map_err(|e| HarnessError::AddressResolution(format!("no outbound route: {e}")))?;

    let ip = socket.local_addr()?.ip();
    if ip.is_unspecified() {
        return Err(HarnessError::AddressResolution(
            "kernel returned an unspecified local address".to_string(),
        ));
    }
    Ok(ip)
}

/// Polls `addr` until a TCP connection succeeds or `timeout` elapses.
/// Returns whether the port became reachable.
pub async fn wait_for_port(addr: SocketAddr, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }

        match tokio::time::timeout(remaining, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => return true,
            Ok(Err(e)) => debug!("{} not accepting yet: {}", addr, e),
            Err(_) => return false,
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        sleep(PROBE_RETRY_INTERVAL.min(remaining)).await;
    }
}
