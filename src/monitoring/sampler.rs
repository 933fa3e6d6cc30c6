// Copyright (c) Abstract Machines

use super::log::SharedMonitorLog;
use super::metrics::{ProcessSample, TelemetryRecord, TelemetrySample};
use super::HostProbe;
use crate::error::Result;
use crate::traffic::PortCounterTable;
use chrono::Local;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleTarget {
    Host,
    Process(u32),
}

/// Writes one telemetry record per tick to the monitoring log.
///
/// A failed OS query skips the tick and leaves the port counters untouched,
/// so their bytes are reported on the next successful tick.
pub struct TelemetrySampler<P: HostProbe> {
    probe: P,
    target: SampleTarget,
    log: SharedMonitorLog,
    counters: Option<PortCounterTable>,
    interval: Duration,
    last_disk: Option<(u64, u64)>,
    reported_missing: bool,
}

impl<P: HostProbe> TelemetrySampler<P> {
    pub fn host(probe: P, log: SharedMonitorLog, interval: Duration) -> Self {
        Self::new(probe, SampleTarget::Host, log, interval)
    }

    pub fn process(probe: P, pid: u32, log: SharedMonitorLog, interval: Duration) -> Self {
        Self::new(probe, SampleTarget::Process(pid), log, interval)
    }

    fn new(probe: P, target: SampleTarget, log: SharedMonitorLog, interval: Duration) -> Self {
        Self {
            probe,
            target,
            log,
            counters: None,
            interval,
            last_disk: None,
            reported_missing: false,
        }
    }

    pub fn with_counters(mut self, counters: PortCounterTable) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn target(&self) -> SampleTarget {
        self.target
    }

    /// Queries the OS and builds this tick's record.
    pub fn sample(&mut self) -> Result<TelemetryRecord> {
        match self.target {
            SampleTarget::Host => self.sample_host(),
            SampleTarget::Process(pid) => self.sample_process(pid),
        }
    }

    fn sample_host(&mut self) -> Result<TelemetryRecord> {
        let reading = self.probe.host()?;

        let (disk_read_delta_bytes, disk_write_delta_bytes) = match self.last_disk {
            Some((read, write)) => (
                reading.disk_read_bytes.saturating_sub(read),
                reading.disk_write_bytes.saturating_sub(write),
            ),
            None => (0, 0),
        };
        self.last_disk = Some((reading.disk_read_bytes, reading.disk_write_bytes));

        let port_bytes = self
            .counters
            .as_ref()
            .map(PortCounterTable::drain)
            .unwrap_or_else(BTreeMap::new);

        Ok(TelemetryRecord::Host(TelemetrySample {
            timestamp: Local::now(),
            cpu_percent: reading.cpu_percent,
            memory_percent: reading.memory_percent,
            disk_read_delta_bytes,
            disk_write_delta_bytes,
            port_bytes,
        }))
    }

    fn sample_process(&mut self, pid: u32) -> Result<TelemetryRecord> {
        match self.probe.process(pid)? {
            Some(reading) => {
                self.reported_missing = false;
                Ok(TelemetryRecord::Process(ProcessSample {
                    timestamp: Local::now(),
                    pid,
                    name: reading.name,
                    status: reading.status,
                    cpu_percent: reading.cpu_percent,
                    memory_bytes: reading.memory_bytes,
                    memory_percent: reading.memory_percent,
                    disk_read_delta_bytes: reading.disk_read_bytes,
                    disk_write_delta_bytes: reading.disk_write_bytes,
                }))
            }
            None => {
                if !self.reported_missing {
                    info!("Process {} not found, recording and continuing", pid);
                    self.reported_missing = true;
                }
                Ok(TelemetryRecord::ProcessNotFound {
                    timestamp: Local::now(),
                    pid,
                })
            }
        }
    }

    /// Runs one tick. Returns whether a record was written.
    pub async fn tick(&mut self) -> bool {
        let record = match self.sample() {
            Ok(record) => record,
            Err(e) => {
                warn!("Skipping telemetry tick: {}", e);
                return false;
            }
        };

        let mut log = self.log.lock().await;
        match log.write_record(&record).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to write telemetry record: {}", e);
                false
            }
        }
    }

    /// Ticks until `shutdown` flips to true, then flushes the log.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        // CPU usage is measured between refreshes, so the first record waits
        // one full interval after the probe's baseline.
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!("Telemetry sampler started for {:?}", self.target);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        debug!("Telemetry sampler stopping for {:?}", self.target);
        self.log.lock().await.close().await
    }
}
