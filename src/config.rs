// Copyright (c) Abstract Machines

use crate::error::{HarnessError, Result};
use crate::traffic::PortRange;
use crate::types::{RecordFormat, SeedReadiness};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_CONFIG_PATH: &str = "harness.toml";
const DEFAULT_CONFIG_SECTION: &str = "harness";
const CONFIG_FILE_ENV: &str = "RAPID_HARNESS_CONFIG_FILE";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub log_level: String,
    pub worker_command: Vec<String>,
    pub listen_flag: String,
    pub seed_flag: String,
    pub base_port: u16,
    pub n_proc: usize,
    pub ip_address: Option<IpAddr>,
    pub seed_address: Option<SocketAddr>,
    pub log_dir: PathBuf,
    pub monitor_log: PathBuf,
    pub sample_interval_ms: u64,
    pub grace_period_ms: u64,
    pub seed_readiness: SeedReadiness,
    pub pacing_ms: u64,
    pub pacing_step_ms: u64,
    pub pacing_floor_ms: u64,
    pub capture_traffic: bool,
    pub interface: Option<String>,
    pub monitor_workers: bool,
    pub supervise_interval_ms: u64,
    pub terminate_on_exit: bool,
    pub record_format: RecordFormat,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            worker_command: vec![
                "java".to_string(),
                "-jar".to_string(),
                "examples/target/standalone-agent.jar".to_string(),
            ],
            listen_flag: "--listenAddress".to_string(),
            seed_flag: "--seedAddress".to_string(),
            base_port: 1234,
            // Fleet size differs between experiments, so it has to be chosen explicitly.
            n_proc: 0,
            ip_address: None,
            seed_address: None,
            log_dir: PathBuf::from("./test_log"),
            monitor_log: PathBuf::from("./monitor.log"),
            sample_interval_ms: 1000,
            grace_period_ms: 3000,
            seed_readiness: SeedReadiness::Delay,
            pacing_ms: 200,
            pacing_step_ms: 0,
            pacing_floor_ms: 0,
            capture_traffic: true,
            interface: None,
            monitor_workers: false,
            supervise_interval_ms: 1000,
            terminate_on_exit: false,
            record_format: RecordFormat::Text,
        }
    }
}

impl HarnessConfig {
    /// Defaults, then the TOML file (if any), then `RAPID_HARNESS_*` variables.
    ///
    /// An explicitly named file must exist. The default `harness.toml` is
    /// optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path.map(Path::to_path_buf).or_else(|| {
            env::var(CONFIG_FILE_ENV)
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        });

        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(DEFAULT_CONFIG_PATH)?
            }
            None => {
                debug!("No config file found, using defaults");
                Self::default()
            }
        };

        config.apply_env();
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            HarnessError::Config(format!("config file '{}' not accessible: {e}", path.display()))
        })?;

        let tables: HashMap<String, toml::Value> = toml::from_str(&contents)?;

        let section = env::var("RAPID_HARNESS_CONFIG_SECTION")
            .unwrap_or_else(|_| DEFAULT_CONFIG_SECTION.to_string());

        let section_value = tables.get(&section).ok_or_else(|| {
            HarnessError::Config(format!("config section '{section}' not found in TOML file"))
        })?;

        let config: HarnessConfig = section_value.clone().try_into()?;
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(val) = env::var("RAPID_HARNESS_LOG_LEVEL") {
            if !val.is_empty() {
                self.log_level = val;
            }
        }

        if let Ok(val) = env::var("RAPID_HARNESS_WORKER_COMMAND") {
            let command: Vec<String> = val.split_whitespace().map(str::to_string).collect();
            if !command.is_empty() {
                self.worker_command = command;
            }
        }

        if let Ok(val) = env::var("RAPID_HARNESS_BASE_PORT") {
            if let Ok(port) = val.parse() {
                self.base_port = port;
            }
        }

        if let Ok(val) = env::var("RAPID_HARNESS_N_PROC") {
            if let Ok(n) = val.parse() {
                self.n_proc = n;
            }
        }

        if let Ok(val) = env::var("RAPID_HARNESS_IP_ADDRESS") {
            match val.parse() {
                Ok(ip) => self.ip_address = Some(ip),
                Err(_) if val.is_empty() => self.ip_address = None,
                Err(e) => warn!("Ignoring RAPID_HARNESS_IP_ADDRESS={}: {}", val, e),
            }
        }

        if let Ok(val) = env::var("RAPID_HARNESS_SEED_ADDRESS") {
            match val.parse() {
                Ok(addr) => self.seed_address = Some(addr),
                Err(_) if val.is_empty() => self.seed_address = None,
                Err(e) => warn!("Ignoring RAPID_HARNESS_SEED_ADDRESS={}: {}", val, e),
            }
        }

        if let Ok(val) = env::var("RAPID_HARNESS_LOG_DIR") {
            if !val.is_empty() {
                self.log_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("RAPID_HARNESS_MONITOR_LOG") {
            if !val.is_empty() {
                self.monitor_log = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("RAPID_HARNESS_SAMPLE_INTERVAL_MS") {
            if let Ok(ms) = val.parse() {
                self.sample_interval_ms = ms;
            }
        }

        if let Ok(val) = env::var("RAPID_HARNESS_GRACE_PERIOD_MS") {
            if let Ok(ms) = val.parse() {
                self.grace_period_ms = ms;
            }
        }

        if let Ok(val) = env::var("RAPID_HARNESS_SEED_READINESS") {
            match val.parse() {
                Ok(mode) => self.seed_readiness = mode,
                Err(e) => warn!("Ignoring RAPID_HARNESS_SEED_READINESS: {}", e),
            }
        }

        if let Ok(val) = env::var("RAPID_HARNESS_PACING_MS") {
            if let Ok(ms) = val.parse() {
                self.pacing_ms = ms;
            }
        }

        if let Ok(val) = env::var("RAPID_HARNESS_PACING_STEP_MS") {
            if let Ok(ms) = val.parse() {
                self.pacing_step_ms = ms;
            }
        }

        if let Ok(val) = env::var("RAPID_HARNESS_PACING_FLOOR_MS") {
            if let Ok(ms) = val.parse() {
                self.pacing_floor_ms = ms;
            }
        }

        if let Ok(val) = env::var("RAPID_HARNESS_CAPTURE_TRAFFIC") {
            self.capture_traffic = val.to_lowercase() == "true" || val == "1";
        }

        if let Ok(val) = env::var("RAPID_HARNESS_INTERFACE") {
            self.interface = if val.is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = env::var("RAPID_HARNESS_MONITOR_WORKERS") {
            self.monitor_workers = val.to_lowercase() == "true" || val == "1";
        }

        if let Ok(val) = env::var("RAPID_HARNESS_SUPERVISE_INTERVAL_MS") {
            if let Ok(ms) = val.parse() {
                self.supervise_interval_ms = ms;
            }
        }

        if let Ok(val) = env::var("RAPID_HARNESS_TERMINATE_ON_EXIT") {
            self.terminate_on_exit = val.to_lowercase() == "true" || val == "1";
        }

        if let Ok(val) = env::var("RAPID_HARNESS_RECORD_FORMAT") {
            match val.parse() {
                Ok(format) => self.record_format = format,
                Err(e) => warn!("Ignoring RAPID_HARNESS_RECORD_FORMAT: {}", e),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_proc == 0 {
            return Err(HarnessError::Config(
                "n_proc must be set to the fleet size (at least 1)".to_string(),
            ));
        }
        if self.worker_command.is_empty() || self.worker_command[0].is_empty() {
            return Err(HarnessError::Config(
                "worker_command must name an executable".to_string(),
            ));
        }
        if self.sample_interval_ms == 0 {
            return Err(HarnessError::Config(
                "sample_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.supervise_interval_ms == 0 {
            return Err(HarnessError::Config(
                "supervise_interval_ms must be greater than zero".to_string(),
            ));
        }
        let past_end = usize::from(self.base_port).checked_add(self.n_proc);
        if past_end.map_or(true, |end| end > usize::from(u16::MAX) + 1) {
            return Err(HarnessError::Config(format!(
                "port range {}+{} exceeds 65535",
                self.base_port, self.n_proc
            )));
        }
        Ok(())
    }

    pub fn port_range(&self) -> PortRange {
        PortRange::new(self.base_port, self.n_proc)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn supervise_interval(&self) -> Duration {
        Duration::from_millis(self.supervise_interval_ms)
    }
}
