// Copyright (c) Abstract Machines

use super::{Launcher, ProcessHandle};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::types::WorkerSpec;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};

/// Launches workers as host processes, each writing stdout and stderr to
/// `<log_dir>/rapid.<port>`.
pub struct HostLauncher {
    command: Vec<String>,
    listen_flag: String,
    seed_flag: String,
    log_dir: PathBuf,
}

impl HostLauncher {
    pub fn new(command: Vec<String>, log_dir: PathBuf) -> Self {
        Self {
            command,
            listen_flag: "--listenAddress".to_string(),
            seed_flag: "--seedAddress".to_string(),
            log_dir,
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            command: config.worker_command.clone(),
            listen_flag: config.listen_flag.clone(),
            seed_flag: config.seed_flag.clone(),
            log_dir: config.log_dir.clone(),
        }
    }

    /// Arguments after the executable: the configured command tail, then the
    /// listen address, then the seed address.
    pub fn build_args(&self, spec: &WorkerSpec) -> Vec<String> {
        let mut args: Vec<String> = self.command.iter().skip(1).cloned().collect();
        args.push(self.listen_flag.clone());
        args.push(spec.listen.to_string());
        args.push(self.seed_flag.clone());
        args.push(spec.seed.to_string());
        args
    }

    pub fn log_path(&self, spec: &WorkerSpec) -> PathBuf {
        self.log_dir.join(spec.log_file_name())
    }

    async fn open_log(&self, spec: &WorkerSpec) -> Result<(PathBuf, std::fs::File)> {
        let path = self.log_path(spec);
        let file = fs::File::create(&path)
            .await
            .map_err(|source| HarnessError::LogSink {
                path: path.clone(),
                source,
            })?;
        Ok((path, file.into_std().await))
    }
}

#[async_trait]
impl Launcher for HostLauncher {
    async fn launch(&self, spec: &WorkerSpec) -> Result<ProcessHandle> {
        let program = self
            .command
            .first()
            .ok_or_else(|| HarnessError::Config("worker command is empty".to_string()))?;

        let (log_path, stdout) = self.open_log(spec).await?;
        let stderr = stdout
            .try_clone()
            .map_err(|source| HarnessError::LogSink {
                path: log_path.clone(),
                source,
            })?;

        let args = self.build_args(spec);
        debug!("Command to execute: {} {:?}", program, args);

        let mut command = Command::new(program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        // Own process group, so a terminal ctrl-c reaches the harness only.
        #[cfg(unix)]
        command.process_group(0);

        let child = command
            .spawn()
            .map_err(|source| HarnessError::Spawn {
                port: spec.port(),
                source,
            })?;

        info!(
            "Launched worker on {} (seed {}) with PID {:?}, log {}",
            spec.listen,
            spec.seed,
            child.id(),
            log_path.display()
        );

        Ok(ProcessHandle::new(*spec, log_path, child))
    }
}
