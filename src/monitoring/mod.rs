// Copyright (c) Abstract Machines

pub mod log;
pub mod metrics;
pub mod sampler;
pub mod system;

use crate::error::Result;

/// Host-wide counters at one instant. Disk counters are cumulative since boot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostReading {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
}

/// One process at one instant. Disk figures are deltas since the previous
/// reading of the same process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessReading {
    pub name: String,
    pub status: String,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_percent: f64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
}

/// OS introspection used by the sampler.
pub trait HostProbe: Send {
    fn host(&mut self) -> Result<HostReading>;

    /// `Ok(None)` when no process with `pid` exists.
    fn process(&mut self, pid: u32) -> Result<Option<ProcessReading>>;
}

pub fn create_probe() -> Box<dyn HostProbe> {
    Box::new(system::SysinfoProbe::new())
}

impl<P: HostProbe + ?Sized> HostProbe for Box<P> {
    fn host(&mut self) -> Result<HostReading> {
        (**self).host()
    }

    fn process(&mut self, pid: u32) -> Result<Option<ProcessReading>> {
        (**self).process(pid)
    }
}
