//! The instance entity and its per-instance supervisor: spawn, health-gate,
//! auto-restart, graceful shutdown.
//!
//! One supervisor per named instance, with explicit `Restarting`/`Failed`
//! states per the state diagram in §4.2, rather than a hostname-keyed flat
//! process table.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{self, HealthProbe};
use crate::config::{EngineConfig, InstanceOptions};
use crate::db::Db;
use crate::error::Error;
use crate::ports::PortAllocator;

/// Runtime status of an instance supervisor. Only `Stopped`/`Running`/
/// `Failed` are ever written to persistence (invariant 5 / §3.1); the rest
/// exist purely in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Stopped,
    Starting,
    Running,
    Restarting,
    ShuttingDown,
    Failed,
}

impl InstanceStatus {
    pub fn is_committable(self) -> bool {
        matches!(
            self,
            InstanceStatus::Stopped | InstanceStatus::Running | InstanceStatus::Failed
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Restarting => "restarting",
            InstanceStatus::ShuttingDown => "shutting_down",
            InstanceStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
enum ReadyEvent {
    Ready,
    Failed(String),
}

/// A point-in-time, serializable view of an instance, for the API and the
/// Manager's eviction bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub name: String,
    pub status: InstanceStatus,
    pub options: InstanceOptions,
    pub port: Option<u16>,
    pub created_at: i64,
    pub last_activity: i64,
    pub restart_count: u32,
}

struct RuntimeState {
    status: InstanceStatus,
    options: InstanceOptions,
    child: Option<Child>,
    port: Option<u16>,
    created_at: i64,
    last_activity: i64,
    restart_count: u32,
    ready_tx: broadcast::Sender<ReadyEvent>,
    log_file: Option<File>,
}

fn now_epoch() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// One named instance and its supervisor. `lifecycle` serializes start/
/// stop/restart against each other (held across awaits); `state` is a
/// short, synchronous critical section guarding the fields other tasks
/// read opportunistically (status, last_activity, snapshot).
pub struct Instance {
    name: String,
    config: Arc<EngineConfig>,
    ports: Arc<PortAllocator>,
    db: Arc<Db>,
    lifecycle: AsyncMutex<()>,
    state: parking_lot::Mutex<RuntimeState>,
    generation: AtomicU64,
}

impl Instance {
    pub fn new(
        name: String,
        options: InstanceOptions,
        initial_status: InstanceStatus,
        config: Arc<EngineConfig>,
        ports: Arc<PortAllocator>,
        db: Arc<Db>,
    ) -> Arc<Self> {
        let (ready_tx, _rx) = broadcast::channel(16);
        Arc::new(Self {
            name,
            config,
            ports,
            db,
            lifecycle: AsyncMutex::new(()),
            state: parking_lot::Mutex::new(RuntimeState {
                status: initial_status,
                options,
                child: None,
                port: None,
                created_at: now_epoch(),
                last_activity: now_epoch(),
                restart_count: 0,
                ready_tx,
                log_file: None,
            }),
            generation: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> InstanceStatus {
        self.state.lock().status
    }

    pub fn last_activity(&self) -> i64 {
        self.state.lock().last_activity
    }

    pub fn options(&self) -> InstanceOptions {
        self.state.lock().options.clone()
    }

    pub fn update_options(&self, options: InstanceOptions) {
        self.state.lock().options = options;
    }

    /// Records proxied activity. Called by the reverse proxy on completion
    /// of every forwarded request; read by the idle reaper.
    pub fn touch(&self) {
        self.state.lock().last_activity = now_epoch();
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let s = self.state.lock();
        InstanceSnapshot {
            name: self.name.clone(),
            status: s.status,
            options: s.options.clone(),
            port: s.port,
            created_at: s.created_at,
            last_activity: s.last_activity,
            restart_count: s.restart_count,
        }
    }

    fn subscribe_ready(&self) -> broadcast::Receiver<ReadyEvent> {
        self.state.lock().ready_tx.subscribe()
    }

    fn set_status(&self, status: InstanceStatus) {
        let mut s = self.state.lock();
        s.status = status;
        if status.is_committable() {
            let name = self.name.clone();
            let port = s.port;
            let restart_count = s.restart_count;
            drop(s);
            if let Err(e) = self.db.update_status(&name, status, port, restart_count) {
                warn!(instance = %name, error = %e, "failed to persist status transition");
            }
        }
    }

    /// Starts the instance if it is not already starting/running. Returns
    /// once the subprocess has been spawned and the health-poll task is
    /// running; callers that need to know the instance is actually serving
    /// traffic must call `wait_ready`.
    ///
    /// Boxed rather than a plain `async fn` because `start` and the
    /// supervisor (`supervise` -> `handle_unexpected_exit` -> `start`) call
    /// each other, and the compiler can't resolve `Send` for the resulting
    /// cyclic opaque future types without this indirection.
    pub fn start(
        self: &Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), Error>> + Send + '_>> {
        Box::pin(self.start_inner())
    }

    async fn start_inner(self: &Arc<Self>) -> Result<(), Error> {
        let _guard = self.lifecycle.lock().await;
        let current = self.status();
        if current == InstanceStatus::Running || current == InstanceStatus::Starting {
            return Ok(());
        }
        if self.options().is_remote() {
            self.set_status(InstanceStatus::Running);
            return Ok(());
        }

        let port = self.ports.allocate()?;
        let options = self.options();
        let api_key = Uuid::new_v4().to_string();
        let built = backend::build_command(&self.name, &options, port, &self.config.data_dir)?;
        let env = backend::build_environment(&options, &api_key);

        std::fs::create_dir_all(&built.working_dir).map_err(|e| Error::StartFailed {
            name: self.name.clone(),
            reason: format!("failed to create working dir: {e}"),
        })?;
        let log_path = self.log_path();
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| Error::StartFailed {
                name: self.name.clone(),
                reason: format!("failed to open log sink: {e}"),
            })?;
        let stdout_file = log_file.try_clone().map_err(|e| Error::StartFailed {
            name: self.name.clone(),
            reason: e.to_string(),
        })?;
        let stderr_file = log_file.try_clone().map_err(|e| Error::StartFailed {
            name: self.name.clone(),
            reason: e.to_string(),
        })?;

        let mut cmd = Command::new(&built.program);
        cmd.args(&built.args)
            .current_dir(&built.working_dir)
            .envs(env)
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file));
        #[cfg(unix)]
        {
            // Own process group so a SIGTERM aimed at this instance doesn't
            // also reach unrelated siblings that happen to share stdin.
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    libc::setsid();
                    Ok(())
                });
            }
        }

        let child = cmd.spawn().map_err(|e| Error::StartFailed {
            name: self.name.clone(),
            reason: format!("failed to spawn {}: {e}", built.program),
        })?;

        {
            let mut s = self.state.lock();
            s.child = Some(child);
            s.port = Some(port);
            s.log_file = Some(log_file);
        }
        self.set_status(InstanceStatus::Starting);
        info!(instance = %self.name, port, "instance starting");

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(supervise(Arc::clone(self), generation));

        Ok(())
    }

    /// Blocks until the instance reaches `Running` or the deadline passes,
    /// coalescing with any other caller waiting on the same start.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), Error> {
        if self.status() == InstanceStatus::Running {
            return Ok(());
        }
        let mut rx = self.subscribe_ready();
        let deadline = Instant::now() + timeout;
        loop {
            if self.status() == InstanceStatus::Running {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::StartTimeout {
                    name: self.name.clone(),
                });
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(ReadyEvent::Ready)) => return Ok(()),
                Ok(Ok(ReadyEvent::Failed(reason))) => {
                    return Err(Error::StartFailed {
                        name: self.name.clone(),
                        reason,
                    })
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => continue,
                Err(_) => {
                    return Err(Error::StartTimeout {
                        name: self.name.clone(),
                    })
                }
            }
        }
    }

    /// Graceful stop: SIGTERM, wait up to `grace_period`, then SIGKILL.
    /// Always releases the port, even if the process was already gone.
    pub async fn stop(self: &Arc<Self>, grace_period: Duration) -> Result<(), Error> {
        let _guard = self.lifecycle.lock().await;
        if self.options().is_remote() {
            self.set_status(InstanceStatus::Stopped);
            return Ok(());
        }
        if self.status() == InstanceStatus::Stopped {
            return Ok(());
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.set_status(InstanceStatus::ShuttingDown);

        let child = self.state.lock().child.take();
        if let Some(mut child) = child {
            if let Some(pid) = child.id() {
                #[cfg(unix)]
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
                #[cfg(not(unix))]
                let _ = child.start_kill();
            }
            match tokio::time::timeout(grace_period, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(instance = %self.name, "grace period elapsed, sending SIGKILL");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }

        let port = self.state.lock().port.take();
        if let Some(port) = port {
            self.ports.release(port);
        }
        self.state.lock().log_file = None;
        self.set_status(InstanceStatus::Stopped);
        info!(instance = %self.name, "instance stopped");
        Ok(())
    }

    fn log_path(&self) -> PathBuf {
        self.config.data_dir.join(&self.name).join("instance.log")
    }

    pub fn tail_log(&self, lines: usize) -> Result<String, Error> {
        let content = std::fs::read_to_string(self.log_path()).unwrap_or_default();
        let tail: Vec<&str> = content.lines().rev().take(lines).collect();
        Ok(tail.into_iter().rev().collect::<Vec<_>>().join("\n"))
    }

    fn host_and_port(&self) -> Option<(String, u16, HealthProbe)> {
        let s = self.state.lock();
        let port = s.port?;
        let cap = backend::capability(s.options.backend_type);
        Some((cap.default_host.to_string(), port, cap.health_probe))
    }
}

/// Background supervisor task: polls for readiness, then monitors health
/// and drives auto-restart, until superseded by a newer generation (a
/// fresh `start`/`stop` call) or the instance is torn down.
async fn supervise(instance: Arc<Instance>, generation: u64) {
    let startup_timeout = Duration::from_secs(120);
    let deadline = Instant::now() + startup_timeout;
    let mut backoff = Duration::from_millis(200);

    loop {
        if instance.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        if instance.status() != InstanceStatus::Starting {
            return;
        }
        if process_has_exited(&instance) {
            handle_unexpected_exit(&instance, generation, "process exited before becoming ready").await;
            return;
        }
        if probe_healthy(&instance).await {
            mark_ready(&instance);
            break;
        }
        if Instant::now() >= deadline {
            mark_failed(&instance, "startup timeout".into());
            return;
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_secs(2));
    }

    let health_check_interval = Duration::from_secs(5);
    let mut consecutive_failures = 0u32;
    const UNHEALTHY_THRESHOLD: u32 = 3;

    loop {
        tokio::time::sleep(health_check_interval).await;
        if instance.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        if instance.status() != InstanceStatus::Running {
            return;
        }
        if process_has_exited(&instance) {
            handle_unexpected_exit(&instance, generation, "process exited unexpectedly").await;
            return;
        }
        if probe_healthy(&instance).await {
            consecutive_failures = 0;
            continue;
        }
        consecutive_failures += 1;
        if consecutive_failures >= UNHEALTHY_THRESHOLD {
            handle_unexpected_exit(&instance, generation, "health checks failed repeatedly").await;
            return;
        }
    }
}

fn process_has_exited(instance: &Instance) -> bool {
    let mut s = instance.state.lock();
    match s.child.as_mut() {
        Some(child) => matches!(child.try_wait(), Ok(Some(_))),
        None => true,
    }
}

fn mark_ready(instance: &Instance) {
    instance.set_status(InstanceStatus::Running);
    let mut s = instance.state.lock();
    s.restart_count = 0;
    let _ = s.ready_tx.send(ReadyEvent::Ready);
    debug!(instance = %instance.name, "instance ready");
}

fn mark_failed(instance: &Instance, reason: String) {
    instance.set_status(InstanceStatus::Failed);
    let tx = instance.state.lock().ready_tx.clone();
    let _ = tx.send(ReadyEvent::Failed(reason.clone()));
    warn!(instance = %instance.name, reason, "instance failed");
}

async fn handle_unexpected_exit(instance: &Arc<Instance>, generation: u64, reason: &str) {
    warn!(instance = %instance.name, reason, "instance supervisor observed failure");
    let options = instance.options();
    let restart_count = {
        let mut s = instance.state.lock();
        s.restart_count += 1;
        s.restart_count
    };

    let port = instance.state.lock().port.take();
    if let Some(port) = port {
        instance.ports.release(port);
    }

    if !options.auto_restart || !options.restart_budget_remaining(restart_count - 1) {
        mark_failed(instance, reason.to_string());
        return;
    }

    instance.set_status(InstanceStatus::Restarting);
    tokio::time::sleep(Duration::from_secs(options.restart_delay_seconds)).await;

    if instance.generation.load(Ordering::SeqCst) != generation {
        return;
    }
    if let Err(e) = instance.start().await {
        mark_failed(instance, format!("auto-restart failed: {e}"));
    }
}

async fn probe_healthy(instance: &Instance) -> bool {
    let Some((host, port, probe)) = instance.host_and_port() else {
        return false;
    };
    check_health(&host, port, probe).await
}

/// Raw TCP HTTP GET, parsing only the status line for a 2xx code, to avoid
/// pulling in a full HTTP client just for a liveness probe.
async fn check_health(host: &str, port: u16, probe: HealthProbe) -> bool {
    let addr = format!("{host}:{port}");
    let stream = match tokio::time::timeout(Duration::from_secs(2), TcpStream::connect(&addr)).await
    {
        Ok(Ok(s)) => s,
        _ => return false,
    };
    let mut stream = stream;
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n",
        probe.method, probe.path
    );
    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }
    let mut buf = [0u8; 64];
    let n = match tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await {
        Ok(Ok(n)) => n,
        _ => return false,
    };
    let line = String::from_utf8_lossy(&buf[..n]);
    line.splitn(3, ' ')
        .nth(1)
        .map(|code| code.starts_with('2'))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendOptions, BackendType};
    use std::collections::{BTreeSet, HashMap};

    fn test_options() -> InstanceOptions {
        InstanceOptions {
            backend_type: BackendType::LlamaCpp,
            backend_options: BackendOptions::default(),
            auto_restart: true,
            max_restarts: 3,
            restart_delay_seconds: 0,
            on_demand_start: true,
            idle_timeout_minutes: 0,
            environment: HashMap::new(),
            docker_enabled: false,
            command_override: None,
            nodes: BTreeSet::new(),
        }
    }

    fn test_instance() -> Arc<Instance> {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(EngineConfig {
            data_dir: dir.path().to_path_buf(),
            db_path: dir.path().join("db.sqlite"),
            ..EngineConfig::default()
        });
        let ports = Arc::new(PortAllocator::new(19000, 19010));
        let db = Arc::new(Db::open_in_memory().unwrap());
        db.create_instance("svc", &test_options(), InstanceStatus::Stopped)
            .unwrap();
        Instance::new(
            "svc".into(),
            test_options(),
            InstanceStatus::Stopped,
            config,
            ports,
            db,
        )
    }

    #[test]
    fn committable_statuses_are_exactly_three() {
        assert!(InstanceStatus::Stopped.is_committable());
        assert!(InstanceStatus::Running.is_committable());
        assert!(InstanceStatus::Failed.is_committable());
        assert!(!InstanceStatus::Starting.is_committable());
        assert!(!InstanceStatus::Restarting.is_committable());
        assert!(!InstanceStatus::ShuttingDown.is_committable());
    }

    #[test]
    fn touch_updates_last_activity() {
        let instance = test_instance();
        let before = instance.last_activity();
        std::thread::sleep(Duration::from_millis(1100));
        instance.touch();
        assert!(instance.last_activity() >= before);
    }

    #[tokio::test]
    async fn wait_ready_returns_immediately_when_already_running() {
        let instance = test_instance();
        instance.set_status(InstanceStatus::Running);
        assert!(instance.wait_ready(Duration::from_millis(10)).await.is_ok());
    }

    #[tokio::test]
    async fn wait_ready_times_out_when_never_signaled() {
        let instance = test_instance();
        let result = instance.wait_ready(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::StartTimeout { .. })));
    }

    #[tokio::test]
    async fn remote_instance_start_and_stop_are_local_noops() {
        let mut opts = test_options();
        opts.nodes.insert("other-node".into());
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(EngineConfig {
            data_dir: dir.path().to_path_buf(),
            ..EngineConfig::default()
        });
        let ports = Arc::new(PortAllocator::new(19100, 19100));
        let db = Arc::new(Db::open_in_memory().unwrap());
        db.create_instance("remote", &opts, InstanceStatus::Stopped)
            .unwrap();
        let instance = Instance::new(
            "remote".into(),
            opts,
            InstanceStatus::Stopped,
            config,
            ports,
            db,
        );
        instance.start().await.unwrap();
        assert_eq!(instance.status(), InstanceStatus::Running);
        instance.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(instance.status(), InstanceStatus::Stopped);
    }
}
