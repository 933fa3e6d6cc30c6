// Copyright (c) Abstract Machines

use super::metrics::TelemetryRecord;
use crate::error::Result;
use crate::types::RecordFormat;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub type SharedMonitorLog = Arc<Mutex<MonitorLog>>;

/// Append-only monitoring log. Every record is flushed as soon as it is written.
pub struct MonitorLog {
    file: File,
    path: PathBuf,
    format: RecordFormat,
}

impl MonitorLog {
    pub async fn open<P: AsRef<Path>>(path: P, format: RecordFormat) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self { file, path, format })
    }

    pub fn shared(self) -> SharedMonitorLog {
        Arc::new(Mutex::new(self))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_record(&mut self, record: &TelemetryRecord) -> Result<()> {
        let line = record.render(self.format)?;
        self.append_line(&line).await
    }

    pub async fn append_line(&mut self, line: &str) -> Result<()> {
        self.file.write_all(line.as_bytes()).await?;
        self.file.write_all(b"\n").await?;
        self.file.flush().await?;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }
}
