// Copyright (c) Abstract Machines

//! rapid-harness - experiment harness for Rapid membership agents
//!
//! Launches a fleet of external agent processes with a staggered start,
//! samples host and per-process telemetry into an append-only monitoring log,
//! counts bytes per fleet port from passively captured packets, and injects
//! synthetic test traffic.

pub mod config;
pub mod error;
pub mod launcher;
pub mod monitoring;
pub mod net;
pub mod orchestrator;
pub mod probe;
pub mod traffic;
pub mod types;

// Re-export commonly used types
pub use config::HarnessConfig;
pub use error::{HarnessError, Result};
pub use launcher::{host::HostLauncher, FleetLaunch, Launcher, ProcessHandle};
pub use orchestrator::{Orchestrator, SessionReport};
pub use traffic::{PortCounterTable, PortRange};
pub use types::{ProcessState, SessionState, WorkerSpec};
