// Copyright (c) Abstract Machines

pub mod host;

use crate::error::{HarnessError, Result};
use crate::types::{ProcessState, WorkerSpec};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Child;
use tracing::{debug, warn};

#[async_trait]
pub trait Launcher: Send + Sync {
    /// Starts the worker described by `spec` and returns without waiting
    /// for it to exit.
    async fn launch(&self, spec: &WorkerSpec) -> Result<ProcessHandle>;
}

/// A launched worker. The child process is not killed when the handle is
/// dropped.
#[derive(Debug)]
pub struct ProcessHandle {
    spec: WorkerSpec,
    pid: Option<u32>,
    log_path: PathBuf,
    child: Option<Child>,
    state: ProcessState,
}

impl ProcessHandle {
    pub fn new(spec: WorkerSpec, log_path: PathBuf, child: Child) -> Self {
        Self {
            spec,
            pid: child.id(),
            log_path,
            child: Some(child),
            state: ProcessState::Spawned,
        }
    }

    /// A handle for a worker this harness does not own a child for, such as
    /// one started by another supervisor. Polling always reports it running.
    pub fn detached(spec: WorkerSpec, pid: Option<u32>, log_path: PathBuf) -> Self {
        Self {
            spec,
            pid,
            log_path,
            child: None,
            state: ProcessState::Running,
        }
    }

    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Non-blocking liveness check. Reaps the child if it has exited.
    pub fn poll(&mut self) -> ProcessState {
        if self.state.is_exited() {
            return self.state;
        }
        let Some(child) = self.child.as_mut() else {
            return self.state;
        };

        match child.try_wait() {
            Ok(Some(status)) => self.state = ProcessState::Exited(status.code()),
            Ok(None) => self.state = ProcessState::Running,
            Err(e) => warn!("Failed to poll worker on port {}: {}", self.spec.port(), e),
        }
        self.state
    }

    pub async fn terminate(&mut self) -> Result<()> {
        if self.poll().is_exited() {
            return Ok(());
        }
        if let Some(child) = self.child.as_mut() {
            child.kill().await?;
            let status = child.wait().await?;
            self.state = ProcessState::Exited(status.code());
            debug!("Worker on port {} terminated", self.spec.port());
        }
        Ok(())
    }
}

/// Outcome of launching a whole fleet.
#[derive(Debug, Default)]
pub struct FleetLaunch {
    pub handles: Vec<ProcessHandle>,
    pub failures: Vec<(WorkerSpec, HarnessError)>,
}

impl FleetLaunch {
    pub fn attempted(&self) -> usize {
        self.handles.len() + self.failures.len()
    }

    pub fn record(&mut self, spec: WorkerSpec, result: Result<ProcessHandle>) {
        match result {
            Ok(handle) => self.handles.push(handle),
            Err(e) => self.failures.push((spec, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn spec(port: u16) -> WorkerSpec {
        WorkerSpec::new(
            0,
            SocketAddr::from(([127, 0, 0, 1], port)),
            SocketAddr::from(([127, 0, 0, 1], 1234)),
        )
    }

    #[test]
    fn test_detached_handle_stays_running() {
        let mut handle = ProcessHandle::detached(spec(1235), Some(77), PathBuf::from("rapid.1235"));

        assert_eq!(handle.poll(), ProcessState::Running);
        assert_eq!(handle.pid(), Some(77));
        assert_eq!(handle.log_path(), Path::new("rapid.1235"));
    }

    #[test]
    fn test_fleet_launch_counts_attempts() {
        let mut fleet = FleetLaunch::default();
        fleet.record(
            spec(1234),
            Ok(ProcessHandle::detached(spec(1234), None, PathBuf::new())),
        );
        fleet.record(
            spec(1235),
            Err(HarnessError::Spawn {
                port: 1235,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
            }),
        );

        assert_eq!(fleet.attempted(), 2);
        assert_eq!(fleet.handles.len(), 1);
        assert_eq!(fleet.failures[0].0.port(), 1235);
    }
}
