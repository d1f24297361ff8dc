//! Instance supervision.
//!
//! One [`Instance`] owns a single inference-server child process end to end:
//! spawning it in its own process group, draining stdout/stderr into the
//! per-instance log file, monitoring for exit, and applying the restart
//! policy with a cancelable delay. The cached reverse-proxy target the
//! router forwards through also lives here, invalidated on option changes.

use crate::backend::BackendOptions;
use crate::config::InstancesConfig;
use crate::proxy::ProxyTarget;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{RwLock, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Upper bound for `max_restarts`.
pub const MAX_RESTARTS_LIMIT: u32 = 100;

/// Bounds for `restart_delay_seconds`.
pub const RESTART_DELAY_MIN: u64 = 1;
pub const RESTART_DELAY_MAX: u64 = 300;

/// How long Stop waits after TERM before escalating to KILL.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("instance {0} is already running")]
    AlreadyRunning(String),

    #[error("instance {0} is not running")]
    NotRunning(String),

    #[error("failed to open log file for {name}: {source}")]
    Log {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn process for {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Immutable-per-update snapshot of an instance's configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceOptions {
    pub auto_restart: bool,
    pub max_restarts: u32,
    pub restart_delay_seconds: u64,
    /// Idle reaping threshold in minutes; 0 disables
    #[serde(default)]
    pub idle_timeout_minutes: u64,
    /// Address the child listens on; also the reverse-proxy target
    pub host: String,
    pub port: u16,
    #[serde(flatten)]
    pub backend: BackendOptions,
}

impl InstanceOptions {
    /// Clamp restart-policy values into their valid ranges, warning when a
    /// value had to be adjusted.
    pub fn clamped(mut self, name: &str) -> Self {
        if self.max_restarts > MAX_RESTARTS_LIMIT {
            warn!(
                instance = name,
                max_restarts = self.max_restarts,
                "max_restarts limited to {}",
                MAX_RESTARTS_LIMIT
            );
            self.max_restarts = MAX_RESTARTS_LIMIT;
        }
        if self.restart_delay_seconds < RESTART_DELAY_MIN {
            warn!(
                instance = name,
                restart_delay_seconds = self.restart_delay_seconds,
                "restart_delay_seconds too low, using {}",
                RESTART_DELAY_MIN
            );
            self.restart_delay_seconds = RESTART_DELAY_MIN;
        } else if self.restart_delay_seconds > RESTART_DELAY_MAX {
            warn!(
                instance = name,
                restart_delay_seconds = self.restart_delay_seconds,
                "restart_delay_seconds too high, limiting to {}",
                RESTART_DELAY_MAX
            );
            self.restart_delay_seconds = RESTART_DELAY_MAX;
        }
        self
    }
}

/// Options as submitted by a caller. Omitted restart-policy fields fall
/// back to the global defaults at resolution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceOptionsRequest {
    #[serde(default)]
    pub auto_restart: Option<bool>,
    #[serde(default)]
    pub max_restarts: Option<u32>,
    #[serde(default)]
    pub restart_delay_seconds: Option<u64>,
    #[serde(default)]
    pub idle_timeout_minutes: Option<u64>,
    #[serde(default)]
    pub host: Option<String>,
    pub port: u16,
    #[serde(flatten)]
    pub backend: BackendOptions,
}

impl InstanceOptionsRequest {
    /// Fill omitted fields from the global defaults and clamp the result.
    pub fn resolve(self, name: &str, defaults: &InstancesConfig) -> InstanceOptions {
        InstanceOptions {
            auto_restart: self.auto_restart.unwrap_or(defaults.default_auto_restart),
            max_restarts: self.max_restarts.unwrap_or(defaults.default_max_restarts),
            restart_delay_seconds: self
                .restart_delay_seconds
                .unwrap_or(defaults.default_restart_delay_seconds),
            idle_timeout_minutes: self
                .idle_timeout_minutes
                .unwrap_or(defaults.idle_timeout_minutes),
            host: self.host.unwrap_or_else(|| "127.0.0.1".to_string()),
            port: self.port,
            backend: self.backend,
        }
        .clamped(name)
    }
}

/// Persisted on-disk record for one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub name: String,
    pub options: InstanceOptions,
    /// Desired-running flag at the time of the last persist
    pub running: bool,
}

/// API-facing view of an instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub name: String,
    pub running: bool,
    pub restarts: u32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub options: InstanceOptions,
}

/// Append-mode log file shared between the two stdio drainers.
struct LogFile {
    file: std::sync::Mutex<std::fs::File>,
}

impl LogFile {
    fn open(path: &PathBuf) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: std::sync::Mutex::new(file),
        })
    }

    /// Write one line and flush it to disk.
    fn write_line(&self, line: &str) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{}", line);
            let _ = file.sync_data();
        }
    }

    fn write_started_marker(&self, name: &str) {
        let ts = Utc::now().format("%Y-%m-%d %H:%M:%S");
        self.write_line(&format!("\n=== Instance {} started at {} ===", name, ts));
    }

    fn write_stopped_marker(&self, name: &str) {
        let ts = Utc::now().format("%Y-%m-%d %H:%M:%S");
        self.write_line(&format!("=== Instance {} stopped at {} ===\n", name, ts));
    }
}

/// Mutable supervisor state, guarded by the per-instance lock.
struct InstanceState {
    options: InstanceOptions,
    running: bool,
    restarts: u32,
    pid: Option<u32>,
    log: Option<Arc<LogFile>>,
    proxy: Option<ProxyTarget>,
    /// Cancels a pending restart delay when fired or dropped
    restart_cancel: Option<oneshot::Sender<()>>,
    /// Becomes true when the monitor observes the current child's exit
    exited: Option<watch::Receiver<bool>>,
}

/// A managed inference-server instance.
pub struct Instance {
    name: String,
    settings: Arc<InstancesConfig>,
    state: RwLock<InstanceState>,
    /// Unix millis of the most recent routed request (0 = never).
    /// Updated with `fetch_max` so the value is monotone.
    last_used: AtomicI64,
    /// Set while a registry-level start (and its readiness wait) is in flight
    starting: AtomicBool,
}

/// Held for the duration of a registry-level start attempt; a second start
/// for the same instance while a guard is live is a conflict.
pub struct StartGuard {
    instance: Arc<Instance>,
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        self.instance.starting.store(false, Ordering::SeqCst);
    }
}

impl Instance {
    pub(crate) fn new(
        name: String,
        settings: Arc<InstancesConfig>,
        options: InstanceOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            settings,
            state: RwLock::new(InstanceState {
                options,
                running: false,
                restarts: 0,
                pid: None,
                log: None,
                proxy: None,
                restart_cancel: None,
                exited: None,
            }),
            last_used: AtomicI64::new(0),
            starting: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn options(&self) -> InstanceOptions {
        self.state.read().await.options.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.state.read().await.running
    }

    pub async fn restarts(&self) -> u32 {
        self.state.read().await.restarts
    }

    pub(crate) async fn pid(&self) -> Option<u32> {
        self.state.read().await.pid
    }

    /// Record a routed request now.
    pub fn touch(&self) {
        self.last_used
            .fetch_max(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    /// Test hook: backdate or advance the last-used time.
    #[cfg(test)]
    pub(crate) fn touch_at(&self, at: DateTime<Utc>) {
        self.last_used
            .fetch_max(at.timestamp_millis(), Ordering::SeqCst);
    }

    pub(crate) fn last_used_millis(&self) -> i64 {
        self.last_used.load(Ordering::SeqCst)
    }

    pub fn last_used_at(&self) -> Option<DateTime<Utc>> {
        match self.last_used.load(Ordering::SeqCst) {
            0 => None,
            millis => DateTime::from_timestamp_millis(millis),
        }
    }

    /// Claim the start-in-progress flag. Returns `None` if another start is
    /// already in flight for this instance.
    pub(crate) fn try_begin_start(self: &Arc<Self>) -> Option<StartGuard> {
        if self.starting.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(StartGuard {
            instance: Arc::clone(self),
        })
    }

    pub async fn status(&self) -> InstanceStatus {
        let st = self.state.read().await;
        InstanceStatus {
            name: self.name.clone(),
            running: st.running,
            restarts: st.restarts,
            last_used_at: self.last_used_at(),
            options: st.options.clone(),
        }
    }

    pub(crate) async fn snapshot(&self) -> InstanceSnapshot {
        let st = self.state.read().await;
        InstanceSnapshot {
            name: self.name.clone(),
            options: st.options.clone(),
            running: st.running,
        }
    }

    /// Start the child process. Resets the restart counter: this is the
    /// operator-facing entry point.
    pub async fn start(self: &Arc<Self>) -> Result<(), InstanceError> {
        self.start_inner(true).await
    }

    fn start_inner(
        self: &Arc<Self>,
        operator: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), InstanceError>> + Send>> {
        let this = Arc::clone(self);
        Box::pin(async move { this.start_inner_impl(operator).await })
    }

    async fn start_inner_impl(self: &Arc<Self>, operator: bool) -> Result<(), InstanceError> {
        let mut st = self.state.write().await;

        if st.running {
            return Err(InstanceError::AlreadyRunning(self.name.clone()));
        }
        if operator {
            st.restarts = 0;
        }

        let log_path = self.log_path();
        let log = Arc::new(LogFile::open(&log_path).map_err(|e| InstanceError::Log {
            name: self.name.clone(),
            source: e,
        })?);
        log.write_started_marker(&self.name);

        let executable = match st.options.backend.kind() {
            crate::backend::BackendKind::LlamaCpp => &self.settings.llama_executable,
            crate::backend::BackendKind::MlxLm => &self.settings.mlx_executable,
        };
        let args = st.options.backend.build_args(&st.options.host, st.options.port);
        debug!(instance = %self.name, executable = %executable, args = ?args, "Spawning instance process");

        let mut cmd = Command::new(executable);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // New process group so signals reach any helpers the child spawns
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                log.write_stopped_marker(&self.name);
                return Err(InstanceError::Spawn {
                    name: self.name.clone(),
                    source: e,
                });
            }
        };

        if let Some(stdout) = child.stdout.take() {
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                drain_output(stdout, log).await;
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                drain_output(stderr, log).await;
            });
        }

        let pid = child.id();
        let (exit_tx, exit_rx) = watch::channel(false);

        st.running = true;
        st.pid = pid;
        st.log = Some(log);
        st.exited = Some(exit_rx);
        drop(st);

        info!(instance = %self.name, pid, "Instance started");
        metrics::counter!("llamactl_instance_starts_total").increment(1);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.monitor(child, exit_tx).await;
        });

        Ok(())
    }

    /// Stop the child process: TERM the process group, wait up to the grace
    /// period, then KILL. Cancels any pending restart even when the instance
    /// is not running.
    pub async fn stop(&self) -> Result<(), InstanceError> {
        let mut st = self.state.write().await;

        if let Some(cancel) = st.restart_cancel.take() {
            let _ = cancel.send(());
            info!(instance = %self.name, "Cancelled pending restart");
        }

        if !st.running {
            return Err(InstanceError::NotRunning(self.name.clone()));
        }

        st.running = false;
        st.proxy = None;
        let pid = st.pid.take();
        let exited = st.exited.take();
        let log = st.log.take();
        drop(st);

        if let Some(pid) = pid {
            signal_process_group(pid, Signal::Term);
        }

        if let Some(mut rx) = exited {
            let exited_in_time = tokio::time::timeout(STOP_GRACE, rx.wait_for(|done| *done))
                .await
                .is_ok();
            if !exited_in_time {
                if let Some(pid) = pid {
                    warn!(
                        instance = %self.name,
                        pid,
                        "Instance did not exit within grace period, killing"
                    );
                    signal_process_group(pid, Signal::Kill);
                }
                // Let the monitor reap the killed child before we move on
                let _ = tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|done| *done))
                    .await
                    .is_ok();
            }
        }

        if let Some(log) = log {
            log.write_stopped_marker(&self.name);
        }

        info!(instance = %self.name, "Instance stopped");
        metrics::counter!("llamactl_instance_stops_total").increment(1);
        Ok(())
    }

    /// Stop then start, preserving options. Resets the restart counter.
    pub async fn restart(self: &Arc<Self>) -> Result<(), InstanceError> {
        match self.stop().await {
            Ok(()) | Err(InstanceError::NotRunning(_)) => {}
            Err(e) => return Err(e),
        }
        self.start().await
    }

    /// Replace the options with a validated, clamped copy and invalidate the
    /// cached proxy target. Does not stop or start the child; callers that
    /// change host or port must restart explicitly.
    pub async fn set_options(&self, options: InstanceOptions) {
        let options = options.clamped(&self.name);
        let mut st = self.state.write().await;
        st.options = options;
        st.proxy = None;
    }

    /// The reverse-proxy target for this instance, built lazily from the
    /// current host:port and cached until the options change.
    pub async fn proxy_target(&self) -> ProxyTarget {
        {
            let st = self.state.read().await;
            if let Some(proxy) = &st.proxy {
                return proxy.clone();
            }
        }

        let mut st = self.state.write().await;
        let options = &st.options;
        let (host, port) = (options.host.clone(), options.port);
        st.proxy
            .get_or_insert_with(|| ProxyTarget::new(&host, port))
            .clone()
    }

    /// Last `lines` lines of the instance log (whole file when `lines <= 0`).
    /// No instance lock is held across the file read.
    pub async fn logs(&self, lines: i64) -> Result<String, InstanceError> {
        let path = self.log_path();
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| InstanceError::Log {
                name: self.name.clone(),
                source: e,
            })?;

        if lines <= 0 {
            return Ok(content);
        }

        let all: Vec<&str> = content.lines().collect();
        let start = all.len().saturating_sub(lines as usize);
        Ok(all[start..].join("\n"))
    }

    fn log_path(&self) -> PathBuf {
        self.settings.log_dir.join(format!("{}.log", self.name))
    }

    /// Await the child's exit and apply the restart policy.
    async fn monitor(self: Arc<Self>, mut child: tokio::process::Child, exit_tx: watch::Sender<bool>) {
        let status = child.wait().await;
        let _ = exit_tx.send(true);

        let mut st = self.state.write().await;

        if !st.running {
            // Operator-initiated stop owns the cleanup
            return;
        }

        st.running = false;
        st.pid = None;
        // Keep the log handle so restart-policy decisions below land in the
        // instance log as well as the daemon log
        let log = st.log.take();
        if let Some(log) = &log {
            log.write_stopped_marker(&self.name);
        }

        match &status {
            Ok(s) if s.success() => {
                info!(instance = %self.name, "Instance exited cleanly");
                return;
            }
            Ok(s) => {
                warn!(instance = %self.name, status = %s, "Instance crashed");
            }
            Err(e) => {
                warn!(instance = %self.name, error = %e, "Failed to reap instance process");
            }
        }
        metrics::counter!("llamactl_instance_crashes_total").increment(1);

        if !st.options.auto_restart {
            info!(instance = %self.name, "Not restarting: auto restart is disabled");
            return;
        }
        if st.restarts >= st.options.max_restarts {
            error!(
                instance = %self.name,
                max_restarts = st.options.max_restarts,
                "Instance exceeded max restart attempts"
            );
            if let Some(log) = &log {
                log.write_line(&format!(
                    "Instance {} exceeded max restart attempts ({})",
                    self.name, st.options.max_restarts
                ));
            }
            return;
        }

        st.restarts += 1;
        let attempt = st.restarts;
        let max = st.options.max_restarts;
        let delay_seconds = st.options.restart_delay_seconds;
        let delay = Duration::from_secs(delay_seconds);
        info!(
            instance = %self.name,
            attempt,
            max,
            delay = ?delay,
            "Auto-restarting instance"
        );
        if let Some(log) = &log {
            log.write_line(&format!(
                "Auto-restarting instance {} (attempt {}/{}) in {}s",
                self.name, attempt, max, delay_seconds
            ));
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        st.restart_cancel = Some(cancel_tx);
        drop(st);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel_rx => {
                info!(instance = %self.name, "Restart cancelled");
                if let Some(log) = &log {
                    log.write_line(&format!(
                        "Restart cancelled for instance {}",
                        self.name
                    ));
                }
                return;
            }
        }

        match self.start_inner(false).await {
            Ok(()) => {
                info!(instance = %self.name, attempt, "Instance restarted");
                metrics::counter!("llamactl_instance_restarts_total").increment(1);
                let mut st = self.state.write().await;
                st.restart_cancel = None;
            }
            Err(e) => {
                error!(instance = %self.name, error = %e, "Failed to restart instance");
            }
        }
    }

    /// Test hook: mark the instance running without a child process.
    #[cfg(test)]
    pub(crate) async fn force_running(&self) {
        self.state.write().await.running = true;
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        // Kill any child still alive so dropped registries (tests, shutdown
        // paths) do not leak processes
        let st = self.state.get_mut();
        if st.running && let Some(pid) = st.pid {
            kill_process_group(pid);
        }
    }
}

/// Copy lines from a child stdio pipe into the log file, flushing each line.
async fn drain_output(reader: impl tokio::io::AsyncRead + Unpin, log: Arc<LogFile>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        log.write_line(&line);
    }
}

enum Signal {
    Term,
    Kill,
}

/// Signal an entire process group.
#[cfg(unix)]
fn signal_process_group(pid: u32, signal: Signal) {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: signalling a process group we spawned
    unsafe {
        libc::kill(-(pid as libc::pid_t), sig);
    }
}

/// Process groups are unix-only; helpers the child spawned may outlive it.
#[cfg(not(unix))]
fn signal_process_group(_pid: u32, _signal: Signal) {}

pub(crate) fn kill_process_group(pid: u32) {
    signal_process_group(pid, Signal::Kill);
}
