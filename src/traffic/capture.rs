// Copyright (c) Abstract Machines

use super::PacketSource;
use crate::error::{HarnessError, Result};
use std::io;
use std::time::Duration;
use tracing::info;

#[cfg(target_os = "linux")]
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
#[cfg(target_os = "linux")]
use std::mem::MaybeUninit;

/// Raw `AF_PACKET` capture of every frame seen by the host, or by one
/// interface when bound. Needs `CAP_NET_RAW`.
///
/// Loopback frames are delivered to the socket twice, once outgoing and once
/// incoming; only the incoming copy is reported.
pub struct RawCapture {
    #[cfg(target_os = "linux")]
    socket: Socket,
}

impl RawCapture {
    #[cfg(target_os = "linux")]
    pub fn open(interface: Option<&str>, read_timeout: Duration) -> Result<Self> {
        let protocol = Protocol::from(i32::from((libc::ETH_P_ALL as u16).to_be()));

        let socket = Socket::new(Domain::PACKET, Type::RAW, Some(protocol))
            .map_err(|e| HarnessError::Capture(format!("failed to open raw socket: {e}")))?;

        if let Some(name) = interface {
            socket.bind_device(Some(name.as_bytes())).map_err(|e| {
                HarnessError::Capture(format!("failed to bind capture to {name}: {e}"))
            })?;
        }

        socket.set_read_timeout(Some(read_timeout))?;

        info!(
            "Packet capture opened on {}",
            interface.unwrap_or("all interfaces")
        );

        Ok(Self { socket })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn open(_interface: Option<&str>, _read_timeout: Duration) -> Result<Self> {
        Err(HarnessError::Capture(
            "raw packet capture is only supported on Linux".to_string(),
        ))
    }
}

impl PacketSource for RawCapture {
    fn next_frame(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        #[cfg(target_os = "linux")]
        {
            // SAFETY: `recv_from` only writes initialised bytes into the
            // buffer and never reads from it.
            let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
            match self.socket.recv_from(uninit) {
                Ok((_, addr)) if is_loopback_echo(&addr) => Ok(None),
                Ok((n, _)) => Ok(Some(n)),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    Ok(None)
                }
                Err(e) => Err(e),
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            let _ = buf;
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "raw packet capture is only supported on Linux",
            ))
        }
    }
}

/// The outgoing copy of a loopback frame; its incoming twin is counted instead.
#[cfg(target_os = "linux")]
fn is_loopback_echo(addr: &SockAddr) -> bool {
    if addr.family() != libc::AF_PACKET as libc::sa_family_t {
        return false;
    }
    // SAFETY: `SockAddr` is backed by a `sockaddr_storage`, which is large
    // enough and suitably aligned for a `sockaddr_ll`.
    let link = unsafe { &*(addr.as_ptr() as *const libc::sockaddr_ll) };
    is_duplicate_loopback(link.sll_pkttype, link.sll_hatype)
}

fn is_duplicate_loopback(pkttype: u8, hatype: u16) -> bool {
    pkttype == PACKET_OUTGOING && hatype == ARPHRD_LOOPBACK
}

const PACKET_OUTGOING: u8 = 4;
const ARPHRD_LOOPBACK: u16 = 772;
