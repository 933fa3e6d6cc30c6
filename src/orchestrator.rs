// Copyright (c) Abstract Machines

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::launcher::{FleetLaunch, Launcher, ProcessHandle};
use crate::monitoring::log::{MonitorLog, SharedMonitorLog};
use crate::monitoring::metrics::TelemetryRecord;
use crate::monitoring::sampler::TelemetrySampler;
use crate::monitoring::create_probe;
use crate::net::{resolve_outbound_ip, wait_for_port};
use crate::traffic::{PortCounterTable, TrafficMonitor};
use crate::types::{SeedReadiness, SessionState, WorkerSpec};
use chrono::Local;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Delays between consecutive dependent launches: starts at `initial` and
/// shrinks by `step` each launch, never going below `floor`.
#[derive(Debug, Clone)]
pub struct Pacing {
    next: Duration,
    step: Duration,
    floor: Duration,
}

impl Pacing {
    pub fn new(initial: Duration, step: Duration, floor: Duration) -> Self {
        Self {
            next: initial,
            step,
            floor: floor.min(initial),
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, Duration::ZERO, delay)
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(
            Duration::from_millis(config.pacing_ms),
            Duration::from_millis(config.pacing_step_ms),
            Duration::from_millis(config.pacing_floor_ms),
        )
    }
}

impl Iterator for Pacing {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        self.next = current.saturating_sub(self.step).max(self.floor);
        Some(current)
    }
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub workers: Vec<WorkerSpec>,
    pub launched: usize,
    pub failed: usize,
    /// Workers that exited on their own before shutdown.
    pub exited: usize,
    pub terminated: usize,
}

/// Drives one experiment session from log directory setup to shutdown.
pub struct Orchestrator {
    config: HarnessConfig,
    launcher: Arc<dyn Launcher>,
    state: SessionState,
    session_id: Uuid,
}

impl Orchestrator {
    pub fn new(config: HarnessConfig, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            config,
            launcher,
            state: SessionState::Init,
            session_id: Uuid::new_v4(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn transition(&mut self, next: SessionState) {
        info!("Session {}: {} -> {}", self.session_id, self.state, next);
        self.state = next;
    }

    /// One spec per port in `[base_port, base_port + n_proc)`. The first is
    /// the seed and joins through itself; the rest join through the seed, or
    /// through `seed_override` when given.
    pub fn plan_fleet(
        ip: IpAddr,
        base_port: u16,
        n_proc: usize,
        seed_override: Option<SocketAddr>,
    ) -> Vec<WorkerSpec> {
        let seed_listen = SocketAddr::new(ip, base_port);
        let seed = seed_override.unwrap_or(seed_listen);

        (0..n_proc)
            .map_while(|index| {
                let port = u16::try_from(usize::from(base_port) + index).ok()?;
                let listen = SocketAddr::new(ip, port);
                let spec_seed = if index == 0 && seed_override.is_none() {
                    listen
                } else {
                    seed
                };
                Some(WorkerSpec::new(index, listen, spec_seed))
            })
            .collect()
    }

    /// Removes any previous contents of `path` and recreates it empty.
    pub async fn prepare_log_dir(path: &Path) -> Result<()> {
        match fs::remove_dir_all(path).await {
            Ok(()) => debug!("Removed previous log directory {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(HarnessError::FilesystemSetup {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }

        fs::create_dir_all(path)
            .await
            .map_err(|source| HarnessError::FilesystemSetup {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Launches the seed, waits for it, then launches the remaining workers
    /// with pacing. Per-worker failures are collected, not propagated. Stops
    /// early if `shutdown` fires.
    pub async fn launch_fleet(
        &mut self,
        specs: &[WorkerSpec],
        shutdown: &mut watch::Receiver<bool>,
    ) -> FleetLaunch {
        let mut fleet = FleetLaunch::default();
        let Some((seed, members)) = specs.split_first() else {
            return fleet;
        };

        let result = self.launcher.launch(seed).await;
        if let Err(e) = &result {
            error!("Seed launch failed: {}", e);
        }
        fleet.record(*seed, result);
        self.transition(SessionState::SeedLaunched);

        if members.is_empty() {
            return fleet;
        }

        if !self.wait_for_seed(seed.listen, shutdown).await {
            return fleet;
        }

        self.transition(SessionState::FleetLaunching);

        let mut pacing = Pacing::from_config(&self.config);
        for (i, spec) in members.iter().enumerate() {
            if i > 0 {
                let delay = pacing.next().unwrap_or_default();
                if !pause(delay, shutdown).await {
                    info!("Shutdown requested, {} workers not launched", members.len() - i);
                    return fleet;
                }
            }

            let result = self.launcher.launch(spec).await;
            if let Err(e) = &result {
                error!("Launch of {} failed: {}", spec, e);
            }
            fleet.record(*spec, result);
        }

        info!(
            "Fleet launched: {} running, {} failed",
            fleet.handles.len(),
            fleet.failures.len()
        );
        fleet
    }

    /// Returns false if shutdown was requested while waiting.
    async fn wait_for_seed(
        &self,
        seed: SocketAddr,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let grace = self.config.grace_period();

        match self.config.seed_readiness {
            SeedReadiness::Delay => {
                debug!("Waiting {:?} for seed {}", grace, seed);
                pause(grace, shutdown).await
            }
            SeedReadiness::Probe => {
                tokio::select! {
                    ready = wait_for_port(seed, grace) => {
                        if ready {
                            info!("Seed {} is accepting connections", seed);
                        } else {
                            warn!("Seed {} not reachable after {:?}, launching fleet anyway", seed, grace);
                        }
                        true
                    }
                    _ = until_shutdown(shutdown) => false,
                }
            }
        }
    }

    /// Runs a whole session until `shutdown` flips to true.
    ///
    /// Configuration, address resolution, log directory and monitoring log
    /// errors abort before any worker is launched.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<SessionReport> {
        self.config.validate()?;

        let ip = match self.config.ip_address {
            Some(ip) => ip,
            None => {
                let ip = resolve_outbound_ip().await?;
                info!("Resolved local address {}", ip);
                ip
            }
        };

        Self::prepare_log_dir(&self.config.log_dir).await?;

        let log = MonitorLog::open(&self.config.monitor_log, self.config.record_format).await?;
        info!("Recording telemetry to {}", log.path().display());
        let log = log.shared();

        let specs = Self::plan_fleet(
            ip,
            self.config.base_port,
            self.config.n_proc,
            self.config.seed_address,
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let counters = PortCounterTable::new(self.config.port_range());
        let mut background: Vec<JoinHandle<()>> = Vec::new();

        if self.config.capture_traffic {
            match TrafficMonitor::new(counters.clone())
                .spawn(self.config.interface.clone(), stop_rx.clone())
            {
                Ok(handle) => background.push(handle),
                Err(e) => warn!("Traffic accounting disabled: {}", e),
            }
        }

        let sampler = TelemetrySampler::host(create_probe(), log.clone(), self.config.sample_interval())
            .with_counters(counters);
        let mut samplers = vec![tokio::spawn(sampler.run(stop_rx.clone()))];

        let mut fleet = self.launch_fleet(&specs, &mut shutdown).await;

        if self.config.monitor_workers {
            for pid in fleet.handles.iter().filter_map(ProcessHandle::pid) {
                let sampler = TelemetrySampler::process(
                    create_probe(),
                    pid,
                    log.clone(),
                    self.config.sample_interval(),
                );
                samplers.push(tokio::spawn(sampler.run(stop_rx.clone())));
            }
        }

        if !*shutdown.borrow() {
            self.transition(SessionState::SteadyState);
            self.supervise(&mut fleet.handles, &log, &mut shutdown).await;
        }

        self.transition(SessionState::Shutdown);
        let _ = stop_tx.send(true);

        for sampler in samplers {
            match sampler.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Sampler did not close cleanly: {}", e),
                Err(e) => warn!("Sampler task failed: {}", e),
            }
        }
        for handle in background {
            if let Err(e) = handle.await {
                warn!("Traffic monitor task failed: {}", e);
            }
        }

        let mut exited = 0;
        for handle in fleet.handles.iter_mut() {
            if handle.poll().is_exited() {
                exited += 1;
            }
        }

        let mut terminated = 0;
        if self.config.terminate_on_exit {
            for handle in fleet.handles.iter_mut().filter(|h| !h.state().is_exited()) {
                match handle.terminate().await {
                    Ok(()) => terminated += 1,
                    Err(e) => warn!(
                        "Failed to terminate worker on port {}: {}",
                        handle.spec().port(),
                        e
                    ),
                }
            }
        } else {
            info!("Leaving {} workers running", fleet.handles.len() - exited);
        }

        Ok(SessionReport {
            session_id: self.session_id,
            workers: specs,
            launched: fleet.handles.len(),
            failed: fleet.failures.len(),
            exited,
            terminated,
        })
    }

    /// Polls every worker each supervise interval and records exits once.
    async fn supervise(
        &self,
        handles: &mut [ProcessHandle],
        log: &SharedMonitorLog,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let mut ticker = interval(self.config.supervise_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for handle in handles.iter_mut() {
                        let before = handle.state();
                        let after = handle.poll();
                        if before.is_exited() || !after.is_exited() {
                            continue;
                        }

                        warn!(
                            "Worker on port {} {}, see {}",
                            handle.spec().port(),
                            after,
                            handle.log_path().display()
                        );
                        let record = TelemetryRecord::WorkerExited {
                            timestamp: Local::now(),
                            port: handle.spec().port(),
                            pid: handle.pid(),
                            state: after,
                        };
                        if let Err(e) = log.lock().await.write_record(&record).await {
                            warn!("Failed to record worker exit: {}", e);
                        }
                    }
                }
                _ = until_shutdown(shutdown) => break,
            }
        }
    }
}

/// Resolves once `shutdown` holds true. Never resolves if the sender is gone.
async fn until_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Sleeps for `duration`. Returns false if shutdown arrived first.
async fn pause(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = sleep(duration) => true,
        _ = until_shutdown(shutdown) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Records every launch call without starting anything.
    #[derive(Default)]
    struct RecordingLauncher {
        calls: Mutex<Vec<(WorkerSpec, Instant)>>,
        fail_ports: Vec<u16>,
        pid: Option<u32>,
    }

    impl RecordingLauncher {
        fn calls(&self) -> Vec<(WorkerSpec, Instant)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Launcher for RecordingLauncher {
        async fn launch(&self, spec: &WorkerSpec) -> Result<ProcessHandle> {
            self.calls.lock().unwrap().push((*spec, Instant::now()));
            if self.fail_ports.contains(&spec.port()) {
                return Err(HarnessError::Spawn {
                    port: spec.port(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
                });
            }
            Ok(ProcessHandle::detached(
                *spec,
                self.pid,
                PathBuf::from(spec.log_file_name()),
            ))
        }
    }

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    fn test_config(n_proc: usize) -> HarnessConfig {
        HarnessConfig {
            n_proc,
            ip_address: Some(localhost()),
            grace_period_ms: 2000,
            pacing_ms: 100,
            capture_traffic: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_fleet_seed_first() {
        let specs = Orchestrator::plan_fleet(localhost(), 1234, 3, None);

        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].listen.port(), 1234);
        assert_eq!(specs[0].seed.port(), 1234);
        assert!(specs[0].is_seed());
        for spec in &specs[1..] {
            assert_eq!(spec.seed, specs[0].listen);
            assert!(!spec.is_seed());
        }
        assert_eq!(specs[2].listen.port(), 1236);
    }

    #[test]
    fn test_plan_fleet_seed_override() {
        let external: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let specs = Orchestrator::plan_fleet(localhost(), 1234, 2, Some(external));

        assert!(specs.iter().all(|s| s.seed == external));
    }

    #[test]
    fn test_plan_fleet_single_worker() {
        let specs = Orchestrator::plan_fleet(localhost(), 5000, 1, None);

        assert_eq!(specs.len(), 1);
        assert!(specs[0].is_seed());
    }

    #[test]
    fn test_pacing_fixed() {
        let delays: Vec<_> = Pacing::fixed(Duration::from_millis(50)).take(3).collect();

        assert_eq!(delays, vec![Duration::from_millis(50); 3]);
    }

    #[test]
    fn test_pacing_shrinks_to_floor() {
        let delays: Vec<_> = Pacing::new(
            Duration::from_millis(500),
            Duration::from_millis(200),
            Duration::from_millis(150),
        )
        .take(4)
        .collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(300),
                Duration::from_millis(150),
                Duration::from_millis(150),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_count_and_seed_addressing() {
        for n in [1usize, 2, 5] {
            let launcher = Arc::new(RecordingLauncher::default());
            let mut orchestrator = Orchestrator::new(test_config(n), launcher.clone());
            let specs = Orchestrator::plan_fleet(localhost(), 1234, n, None);
            let (_tx, mut rx) = watch::channel(false);

            let fleet = orchestrator.launch_fleet(&specs, &mut rx).await;
            let calls = launcher.calls();

            assert_eq!(calls.len(), n);
            assert_eq!(fleet.handles.len(), n);
            assert!(calls[0].0.is_seed());
            for (spec, _) in &calls[1..] {
                assert_eq!(spec.seed, calls[0].0.listen);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_seed_precedes_fleet_by_grace_period() {
        let launcher = Arc::new(RecordingLauncher::default());
        let config = test_config(4);
        let grace = config.grace_period();
        let mut orchestrator = Orchestrator::new(config, launcher.clone());
        let specs = Orchestrator::plan_fleet(localhost(), 1234, 4, None);
        let (_tx, mut rx) = watch::channel(false);

        orchestrator.launch_fleet(&specs, &mut rx).await;

        let calls = launcher.calls();
        let seed_at = calls[0].1;
        for (_, at) in &calls[1..] {
            assert!(*at - seed_at >= grace);
        }
        // Pacing applies between dependents.
        assert!(calls[2].1 - calls[1].1 >= Duration::from_millis(100));
        assert_eq!(orchestrator.state(), SessionState::FleetLaunching);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_failures_do_not_abort_fleet() {
        let launcher = Arc::new(RecordingLauncher {
            fail_ports: vec![1234, 1235],
            ..Default::default()
        });
        let mut orchestrator = Orchestrator::new(test_config(3), launcher.clone());
        let specs = Orchestrator::plan_fleet(localhost(), 1234, 3, None);
        let (_tx, mut rx) = watch::channel(false);

        let fleet = orchestrator.launch_fleet(&specs, &mut rx).await;

        assert_eq!(launcher.calls().len(), 3);
        assert_eq!(fleet.failures.len(), 2);
        assert_eq!(fleet.handles.len(), 1);
        assert_eq!(fleet.handles[0].spec().port(), 1236);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_grace_period_stops_launches() {
        let launcher = Arc::new(RecordingLauncher::default());
        let mut orchestrator = Orchestrator::new(test_config(3), launcher.clone());
        let specs = Orchestrator::plan_fleet(localhost(), 1234, 3, None);
        let (tx, mut rx) = watch::channel(false);

        tokio::spawn(async move {
            sleep(Duration::from_millis(500)).await;
            tx.send(true).unwrap();
        });

        let fleet = orchestrator.launch_fleet(&specs, &mut rx).await;

        assert_eq!(launcher.calls().len(), 1);
        assert_eq!(fleet.attempted(), 1);
        assert_eq!(orchestrator.state(), SessionState::SeedLaunched);
    }

    #[tokio::test]
    async fn test_port_readiness_launches_once_seed_listens() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let seed_port = listener.local_addr().unwrap().port();

        let launcher = Arc::new(RecordingLauncher::default());
        let config = HarnessConfig {
            seed_readiness: SeedReadiness::Probe,
            grace_period_ms: 30_000,
            pacing_ms: 0,
            ..test_config(2)
        };
        let mut orchestrator = Orchestrator::new(config, launcher.clone());
        let specs = Orchestrator::plan_fleet(localhost(), seed_port, 2, None);
        let (_tx, mut rx) = watch::channel(false);

        let started = std::time::Instant::now();
        orchestrator.launch_fleet(&specs, &mut rx).await;

        assert_eq!(launcher.calls().len(), 2);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_port_readiness_falls_back_to_grace_period() {
        let seed_port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let launcher = Arc::new(RecordingLauncher::default());
        let config = HarnessConfig {
            seed_readiness: SeedReadiness::Probe,
            ..test_config(3)
        };
        let grace = config.grace_period();
        let mut orchestrator = Orchestrator::new(config, launcher.clone());
        let specs = Orchestrator::plan_fleet(localhost(), seed_port, 3, None);
        let (_tx, mut rx) = watch::channel(false);

        orchestrator.launch_fleet(&specs, &mut rx).await;

        let calls = launcher.calls();
        assert_eq!(calls.len(), 3);
        for (_, at) in &calls[1..] {
            assert!(*at - calls[0].1 >= grace);
        }
    }

    #[tokio::test]
    async fn test_monitor_workers_samples_each_worker() {
        let root = std::env::temp_dir().join(format!("harness-workers-{}", Uuid::new_v4()));
        let monitor_log = root.join("monitor.log");
        let pid = std::process::id();

        let launcher = Arc::new(RecordingLauncher {
            pid: Some(pid),
            ..Default::default()
        });
        let config = HarnessConfig {
            log_dir: root.join("test_log"),
            monitor_log: monitor_log.clone(),
            monitor_workers: true,
            sample_interval_ms: 20,
            grace_period_ms: 10,
            pacing_ms: 0,
            supervise_interval_ms: 20,
            ..test_config(2)
        };
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            sleep(Duration::from_millis(300)).await;
            tx.send(true).unwrap();
        });

        let report = Orchestrator::new(config, launcher.clone()).run(rx).await.unwrap();
        assert_eq!(report.launched, 2);

        let content = fs::read_to_string(&monitor_log).await.unwrap();
        let marker = format!(" proc pid={pid} name=");
        assert!(content.lines().any(|l| l.contains(&marker)));
        assert!(content.lines().any(|l| l.contains(" host cpu=")));

        fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn test_prepare_log_dir_clears_previous_run() {
        let dir = std::env::temp_dir().join(format!("harness-logs-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).await.unwrap();
        fs::write(dir.join("rapid.1234"), "old").await.unwrap();

        Orchestrator::prepare_log_dir(&dir).await.unwrap();

        let mut entries = fs::read_dir(&dir).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
        fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_log_dir_failure_aborts_before_spawn() {
        let blocker = std::env::temp_dir().join(format!("harness-blocker-{}", Uuid::new_v4()));
        fs::write(&blocker, "not a directory").await.unwrap();

        let launcher = Arc::new(RecordingLauncher::default());
        let config = HarnessConfig {
            log_dir: blocker.join("logs"),
            monitor_log: std::env::temp_dir().join(format!("monitor-{}.log", Uuid::new_v4())),
            ..test_config(3)
        };
        let (_tx, rx) = watch::channel(false);

        let result = Orchestrator::new(config, launcher.clone()).run(rx).await;

        assert!(matches!(result, Err(HarnessError::FilesystemSetup { .. })));
        assert!(launcher.calls().is_empty());
        fs::remove_file(&blocker).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_aborts_before_spawn() {
        let launcher = Arc::new(RecordingLauncher::default());
        let (_tx, rx) = watch::channel(false);

        let result = Orchestrator::new(test_config(0), launcher.clone()).run(rx).await;

        assert!(matches!(result, Err(HarnessError::Config(_))));
        assert!(launcher.calls().is_empty());
    }
}
