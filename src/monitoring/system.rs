// Copyright (c) Abstract Machines

use super::{HostProbe, HostReading, ProcessReading};
use crate::error::{HarnessError, Result};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

const SECTOR_SIZE: u64 = 512;

pub struct SysinfoProbe {
    system: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is computed between two refreshes; take the baseline now.
        system.refresh_cpu_usage();
        system.refresh_memory();

        Self { system }
    }

    fn memory_percent(&self, bytes: u64) -> f64 {
        let total = self.system.total_memory();
        if total == 0 {
            return 0.0;
        }
        bytes as f64 / total as f64 * 100.0
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HostProbe for SysinfoProbe {
    fn host(&mut self) -> Result<HostReading> {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let cpus = self.system.cpus();
        if cpus.is_empty() {
            return Err(HarnessError::TelemetryQuery(
                "no CPU information available".to_string(),
            ));
        }
        let total_usage: f32 = cpus.iter().map(|cpu| cpu.cpu_usage()).sum();
        let cpu_percent = (total_usage / cpus.len() as f32) as f64;

        if self.system.total_memory() == 0 {
            return Err(HarnessError::TelemetryQuery(
                "total memory reported as zero".to_string(),
            ));
        }
        let memory_percent = self.memory_percent(self.system.used_memory());

        let (disk_read_bytes, disk_write_bytes) = read_disk_counters()?;

        Ok(HostReading {
            cpu_percent,
            memory_percent,
            disk_read_bytes,
            disk_write_bytes,
        })
    }

    fn process(&mut self, pid: u32) -> Result<Option<ProcessReading>> {
        let pid = Pid::from_u32(pid);

        self.system.refresh_memory();
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new()
                .with_cpu()
                .with_memory()
                .with_disk_usage(),
        );

        let Some(process) = self.system.process(pid) else {
            return Ok(None);
        };

        let disk_usage = process.disk_usage();
        let memory_bytes = process.memory();

        Ok(Some(ProcessReading {
            name: process.name().to_string_lossy().into_owned(),
            status: process.status().to_string(),
            cpu_percent: process.cpu_usage() as f64,
            memory_bytes,
            memory_percent: self.memory_percent(memory_bytes),
            disk_read_bytes: disk_usage.read_bytes,
            disk_write_bytes: disk_usage.written_bytes,
        }))
    }
}

#[cfg(target_os = "linux")]
fn read_disk_counters() -> Result<(u64, u64)> {
    use std::path::Path;

    let contents = std::fs::read_to_string("/proc/diskstats")
        .map_err(|e| HarnessError::TelemetryQuery(format!("reading /proc/diskstats: {e}")))?;

    Ok(parse_diskstats(&contents, |name| {
        !name.starts_with("loop")
            && !name.starts_with("ram")
            && Path::new("/sys/block").join(name.replace('/', "!")).exists()
    }))
}

#[cfg(not(target_os = "linux"))]
fn read_disk_counters() -> Result<(u64, u64)> {
    Ok((0, 0))
}

/// Sums sectors read/written over the devices accepted by `is_disk`,
/// converted to bytes. Malformed lines are skipped.
pub fn parse_diskstats(contents: &str, is_disk: impl Fn(&str) -> bool) -> (u64, u64) {
    let mut read = 0u64;
    let mut written = 0u64;

    for line in contents.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 || !is_disk(fields[2]) {
            continue;
        }
        let (Ok(sectors_read), Ok(sectors_written)) =
            (fields[5].parse::<u64>(), fields[9].parse::<u64>())
        else {
            continue;
        };
        read = read.saturating_add(sectors_read * SECTOR_SIZE);
        written = written.saturating_add(sectors_written * SECTOR_SIZE);
    }

    (read, written)
}
