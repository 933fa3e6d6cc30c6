// Copyright (c) Abstract Machines

pub mod capture;
pub mod packet;

use crate::error::Result;
use packet::{parse_ethernet, PacketSummary};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const MAX_FRAME_LEN: usize = 65536;
const CAPTURE_READ_TIMEOUT: Duration = Duration::from_millis(250);

/// Half-open port interval `[base, base + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    base: u16,
    len: usize,
}

impl PortRange {
    pub fn new(base: u16, len: usize) -> Self {
        Self { base, len }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.base && usize::from(port - self.base) < self.len
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Per-port byte counters shared between the capture thread and the sampler.
///
/// Both `record` and `drain` hold the lock for their whole operation, so a
/// drain never splits an increment.
#[derive(Debug, Clone)]
pub struct PortCounterTable {
    range: PortRange,
    counts: Arc<Mutex<HashMap<u16, u64>>>,
}

impl PortCounterTable {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Adds `bytes` to `port` if it is in range. Returns whether it was counted.
    pub fn add(&self, port: u16, bytes: u64) -> bool {
        if !self.range.contains(port) {
            return false;
        }
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        *counts.entry(port).or_insert(0) += bytes;
        true
    }

    /// Credits the frame length to each in-range endpoint of the packet.
    pub fn record(&self, packet: &PacketSummary) {
        let bytes = packet.length as u64;
        let src = self.range.contains(packet.src_port);
        let dst = self.range.contains(packet.dst_port);
        if !src && !dst {
            return;
        }

        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        if src {
            *counts.entry(packet.src_port).or_insert(0) += bytes;
        }
        if dst {
            *counts.entry(packet.dst_port).or_insert(0) += bytes;
        }
    }

    /// Takes the accumulated counts and leaves the table empty.
    pub fn drain(&self) -> BTreeMap<u16, u64> {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *counts).into_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }
}

/// Anything that yields captured link-layer frames.
pub trait PacketSource: Send {
    /// Copies the next frame into `buf`. `Ok(None)` means the read timed out
    /// with nothing to report.
    fn next_frame(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;
}

pub struct TrafficMonitor {
    counters: PortCounterTable,
}

impl TrafficMonitor {
    pub fn new(counters: PortCounterTable) -> Self {
        Self { counters }
    }

    /// Opens a raw capture and observes it on a blocking thread until
    /// `shutdown` flips to true.
    pub fn spawn(
        self,
        interface: Option<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>> {
        let source = capture::RawCapture::open(interface.as_deref(), CAPTURE_READ_TIMEOUT)?;
        Ok(self.spawn_with_source(source, shutdown))
    }

    pub fn spawn_with_source<S>(self, source: S, shutdown: watch::Receiver<bool>) -> JoinHandle<()>
    where
        S: PacketSource + 'static,
    {
        tokio::task::spawn_blocking(move || self.observe(source, shutdown))
    }

    fn observe<S: PacketSource>(&self, mut source: S, shutdown: watch::Receiver<bool>) {
        let range = self.counters.range();
        info!(
            "Traffic monitor counting ports {}..{}",
            range.base(),
            u32::from(range.base()) + range.len() as u32
        );

        let mut buf = vec![0u8; MAX_FRAME_LEN];
        let mut seen: u64 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match source.next_frame(&mut buf) {
                Ok(Some(n)) => {
                    if let Some(packet) = parse_ethernet(&buf[..n]) {
                        self.counters.record(&packet);
                        seen += 1;
                    }
                }
                Ok(None) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!("Packet source exhausted");
                    break;
                }
                Err(e) => {
                    error!("Packet capture failed: {}", e);
                    break;
                }
            }
        }

        if seen == 0 {
            warn!("Traffic monitor stopped without decoding any TCP/UDP packets");
        } else {
            info!("Traffic monitor stopped after {} packets", seen);
        }
    }
}
