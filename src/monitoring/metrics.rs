// Copyright (c) Abstract Machines

use crate::error::Result;
use crate::types::{ProcessState, RecordFormat};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Local>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_read_delta_bytes: u64,
    pub disk_write_delta_bytes: u64,
    pub port_bytes: BTreeMap<u16, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSample {
    pub timestamp: DateTime<Local>,
    pub pid: u32,
    pub name: String,
    pub status: String,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_percent: f64,
    pub disk_read_delta_bytes: u64,
    pub disk_write_delta_bytes: u64,
}

/// One line of the monitoring log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryRecord {
    Host(TelemetrySample),
    Process(ProcessSample),
    ProcessNotFound {
        timestamp: DateTime<Local>,
        pid: u32,
    },
    WorkerExited {
        timestamp: DateTime<Local>,
        port: u16,
        pid: Option<u32>,
        state: ProcessState,
    },
}

impl TelemetryRecord {
    pub fn render(&self, format: RecordFormat) -> Result<String> {
        match format {
            RecordFormat::Text => Ok(self.to_string()),
            RecordFormat::Json => Ok(serde_json::to_string(self)?),
        }
    }
}

impl fmt::Display for TelemetryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryRecord::Host(s) => {
                write!(
                    f,
                    "{} host cpu={:.1}% mem={:.1}% disk_read={}B disk_write={}B ports=[",
                    s.timestamp.format(TIMESTAMP_FORMAT),
                    s.cpu_percent,
                    s.memory_percent,
                    s.disk_read_delta_bytes,
                    s.disk_write_delta_bytes
                )?;
                for (i, (port, bytes)) in s.port_bytes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{port}:{bytes}")?;
                }
                f.write_str("]")
            }
            TelemetryRecord::Process(s) => write!(
                f,
                "{} proc pid={} name={} status={} cpu={:.1}% mem={:.1}% rss={}B disk_read={}B disk_write={}B",
                s.timestamp.format(TIMESTAMP_FORMAT),
                s.pid,
                s.name,
                s.status,
                s.cpu_percent,
                s.memory_percent,
                s.memory_bytes,
                s.disk_read_delta_bytes,
                s.disk_write_delta_bytes
            ),
            TelemetryRecord::ProcessNotFound { timestamp, pid } => write!(
                f,
                "{} proc pid={} process not found",
                timestamp.format(TIMESTAMP_FORMAT),
                pid
            ),
            TelemetryRecord::WorkerExited {
                timestamp,
                port,
                pid,
                state,
            } => {
                write!(f, "{} worker port={} pid=", timestamp.format(TIMESTAMP_FORMAT), port)?;
                match pid {
                    Some(pid) => write!(f, "{pid}")?,
                    None => f.write_str("-")?,
                }
                write!(f, " {state}")
            }
        }
    }
}
