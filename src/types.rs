// Copyright (c) Abstract Machines

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// One worker of the fleet: where it listens and which seed it joins through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub index: usize,
    pub listen: SocketAddr,
    pub seed: SocketAddr,
}

impl WorkerSpec {
    pub fn new(index: usize, listen: SocketAddr, seed: SocketAddr) -> Self {
        Self {
            index,
            listen,
            seed,
        }
    }

    pub fn is_seed(&self) -> bool {
        self.listen == self.seed
    }

    pub fn port(&self) -> u16 {
        self.listen.port()
    }

    pub fn log_file_name(&self) -> String {
        format!("rapid.{}", self.listen.port())
    }
}

impl fmt::Display for WorkerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "worker#{} listen={} seed={}",
            self.index, self.listen, self.seed
        )
    }
}

/// Lifecycle of a spawned worker as seen through a non-blocking poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Spawned,
    Running,
    Exited(Option<i32>),
}

impl ProcessState {
    pub fn is_exited(&self) -> bool {
        matches!(self, ProcessState::Exited(_))
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Spawned => write!(f, "spawned"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Exited(Some(code)) => write!(f, "exited({code})"),
            ProcessState::Exited(None) => write!(f, "exited(signal)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Init,
    SeedLaunched,
    FleetLaunching,
    SteadyState,
    Shutdown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Init => "INIT",
            SessionState::SeedLaunched => "SEED_LAUNCHED",
            SessionState::FleetLaunching => "FLEET_LAUNCHING",
            SessionState::SteadyState => "STEADY_STATE",
            SessionState::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// How the orchestrator decides the seed is ready for dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeedReadiness {
    /// Sleep the full grace period.
    #[default]
    Delay,
    /// Poll the seed's listen port; the grace period is only the timeout.
    Probe,
}

impl FromStr for SeedReadiness {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "delay" => Ok(SeedReadiness::Delay),
            "probe" => Ok(SeedReadiness::Probe),
            other => Err(format!("unknown seed readiness mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for RecordFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(RecordFormat::Text),
            "json" => Ok(RecordFormat::Json),
            other => Err(format!("unknown record format '{other}'")),
        }
    }
}
