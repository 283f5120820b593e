//! Shared harness for the daemon integration tests.
//!
//! [`FakeRuntime`] stands in for the container runtime. The first argument
//! of a container's command selects what its task does:
//!
//! - `true` / `false`: exit 0 / 1 right after start
//! - `echo ARGS..`: print `ARGS` on stdout, then exit 0
//! - `sleep`: run until signalled
//! - `stubborn`: run until `SIGKILL`, ignoring every other signal
//! - `flood N`: print `N` lines as fast as possible, then keep running

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use harbord_common::config::{BackoffConfig, DaemonConfig};
use harbord_common::error::{HarbordError, Result};
use harbord_common::types::{ContainerId, RestartPolicy};
use harbord_runtime::backend::{ContainerHandle, Runtime, RuntimeEvent, Task, TaskSpec};
use harbord_runtime::container::{ContainerConfig, HostConfig};
use harbord_runtime::mounts::{SecretProvider, VolumeDriver};
use harbord_runtime::signal::Signal;
use harbord_runtime::stats::ResourceUsage;
use harbord_runtime::stream::ProcessIo;
use harbord_runtime::view::ContainerSnapshot;
use harbord_runtime::{CreateOptions, Daemon, DaemonBuilder};
use tempfile::TempDir;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const PIPE_SIZE: usize = 64 * 1024;
const EVENT_CAPACITY: usize = 64;
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

// ── Fake runtime ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Behaviour {
    Exit { code: i32, output: Vec<u8> },
    Run,
    Stubborn,
    Flood { lines: usize },
}

impl Behaviour {
    fn from_args(args: &[String]) -> Self {
        match args.first().map(String::as_str) {
            Some("true") => Self::Exit {
                code: 0,
                output: Vec::new(),
            },
            Some("false") => Self::Exit {
                code: 1,
                output: Vec::new(),
            },
            Some("echo") => Self::Exit {
                code: 0,
                output: format!("{}\n", args[1..].join(" ")).into_bytes(),
            },
            Some("stubborn") => Self::Stubborn,
            Some("flood") => Self::Flood {
                lines: args.get(1).and_then(|n| n.parse().ok()).unwrap_or(10_000),
            },
            _ => Self::Run,
        }
    }
}

struct Shared {
    events: Mutex<mpsc::Sender<RuntimeEvent>>,
    tasks: Mutex<HashMap<ContainerId, Arc<FakeTask>>>,
    specs: Mutex<HashMap<ContainerId, TaskSpec>>,
    signals: Mutex<HashMap<ContainerId, Vec<Signal>>>,
    fail_next_create: AtomicBool,
    next_pid: AtomicU32,
    created: AtomicUsize,
}

impl Shared {
    fn sender(&self) -> mpsc::Sender<RuntimeEvent> {
        self.events.lock().unwrap().clone()
    }
}

/// In-memory runtime with scripted task behaviour.
pub struct FakeRuntime {
    shared: Arc<Shared>,
}

impl FakeRuntime {
    /// Creates a runtime and the receiver of its events.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<RuntimeEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let runtime = Arc::new(Self {
            shared: Arc::new(Shared {
                events: Mutex::new(tx),
                tasks: Mutex::new(HashMap::new()),
                specs: Mutex::new(HashMap::new()),
                signals: Mutex::new(HashMap::new()),
                fail_next_create: AtomicBool::new(false),
                next_pid: AtomicU32::new(1000),
                created: AtomicUsize::new(0),
            }),
        });
        (runtime, rx)
    }

    /// Routes future events to a fresh channel, as after a daemon restart.
    pub fn reconnect(&self) -> mpsc::Receiver<RuntimeEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        *self.shared.events.lock().unwrap() = tx;
        rx
    }

    /// Makes the next `create_task` call fail.
    pub fn fail_next_create(&self) {
        self.shared.fail_next_create.store(true, Ordering::SeqCst);
    }

    /// Number of tasks ever created.
    pub fn created(&self) -> usize {
        self.shared.created.load(Ordering::SeqCst)
    }

    /// Number of tasks not yet force-deleted.
    pub fn live_tasks(&self) -> usize {
        self.shared.tasks.lock().unwrap().len()
    }

    /// Forgets every task, as a runtime that lost its state would.
    pub fn forget_all(&self) {
        self.shared.tasks.lock().unwrap().clear();
    }

    /// The spec of the last task created for `id`.
    pub fn spec(&self, id: &ContainerId) -> Option<TaskSpec> {
        self.shared.specs.lock().unwrap().get(id).cloned()
    }

    /// Signals delivered to the tasks of `id`, in order.
    pub fn signals(&self, id: &ContainerId) -> Vec<Signal> {
        self.shared
            .signals
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Lines written so far by the live task of `id`.
    pub fn lines_written(&self, id: &ContainerId) -> u64 {
        self.shared
            .tasks
            .lock()
            .unwrap()
            .get(id)
            .map_or(0, |task| task.written.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl Runtime for FakeRuntime {
    async fn create_task(
        &self,
        id: &ContainerId,
        spec: &TaskSpec,
    ) -> Result<(Arc<dyn Task>, ProcessIo)> {
        if self.shared.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(HarbordError::system("runtime rejected the task spec"));
        }
        let (task_side, daemon_side) = tokio::io::duplex(PIPE_SIZE);
        let pid = self.shared.next_pid.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let task = Arc::new_cyclic(|this| FakeTask {
            this: this.clone(),
            id: id.clone(),
            pid,
            behaviour: Behaviour::from_args(&spec.args),
            shared,
            stdout: tokio::sync::Mutex::new(Some(task_side)),
            started: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            cpu_ns: AtomicU64::new(0),
            written: AtomicU64::new(0),
        });
        let _ = self
            .shared
            .tasks
            .lock()
            .unwrap()
            .insert(id.clone(), Arc::clone(&task));
        let _ = self
            .shared
            .specs
            .lock()
            .unwrap()
            .insert(id.clone(), spec.clone());
        let _ = self.shared.created.fetch_add(1, Ordering::SeqCst);
        let task: Arc<dyn Task> = task;
        let io = ProcessIo {
            stdout: Some(Box::new(daemon_side)),
            ..ProcessIo::default()
        };
        Ok((task, io))
    }

    async fn load_container(&self, id: &ContainerId) -> Result<Arc<dyn ContainerHandle>> {
        let task = self
            .shared
            .tasks
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| HarbordError::NotFound {
                kind: "task",
                id: id.to_string(),
            })?;
        Ok(Arc::new(FakeHandle { task }))
    }
}

struct FakeHandle {
    task: Arc<FakeTask>,
}

#[async_trait]
impl ContainerHandle for FakeHandle {
    async fn attach_task(&self) -> Result<(Arc<dyn Task>, ProcessIo)> {
        if self.task.exited.load(Ordering::SeqCst) {
            return Err(HarbordError::NotFound {
                kind: "task",
                id: self.task.id.to_string(),
            });
        }
        let (task_side, daemon_side) = tokio::io::duplex(PIPE_SIZE);
        *self.task.stdout.lock().await = Some(task_side);
        let io = ProcessIo {
            stdout: Some(Box::new(daemon_side)),
            ..ProcessIo::default()
        };
        Ok((Arc::clone(&self.task) as Arc<dyn Task>, io))
    }
}

/// A scripted task.
pub struct FakeTask {
    this: Weak<FakeTask>,
    id: ContainerId,
    pid: u32,
    behaviour: Behaviour,
    shared: Arc<Shared>,
    stdout: tokio::sync::Mutex<Option<DuplexStream>>,
    started: AtomicBool,
    exited: AtomicBool,
    paused: AtomicBool,
    cpu_ns: AtomicU64,
    written: AtomicU64,
}

impl FakeTask {
    async fn write(&self, data: &[u8]) -> bool {
        let mut stdout = self.stdout.lock().await;
        match stdout.as_mut() {
            Some(pipe) => pipe.write_all(data).await.is_ok(),
            None => false,
        }
    }

    async fn exit(&self, code: i32) {
        if self.exited.swap(true, Ordering::SeqCst) {
            return;
        }
        drop(self.stdout.lock().await.take());
        let event = RuntimeEvent::Exit {
            id: self.id.clone(),
            exit_code: code,
            exited_at: Utc::now(),
        };
        let _ = self.shared.sender().send(event).await;
    }

    fn spawn_exit(&self, code: i32) {
        if let Some(task) = self.this.upgrade() {
            drop(tokio::spawn(async move { task.exit(code).await }));
        }
    }

    fn not_running(&self) -> HarbordError {
        HarbordError::NotFound {
            kind: "process",
            id: self.id.to_string(),
        }
    }
}

#[async_trait]
impl Task for FakeTask {
    fn id(&self) -> &ContainerId {
        &self.id
    }

    fn pid(&self) -> u32 {
        if self.started.load(Ordering::SeqCst) {
            self.pid
        } else {
            0
        }
    }

    async fn start(&self) -> Result<u32> {
        self.started.store(true, Ordering::SeqCst);
        let Some(task) = self.this.upgrade() else {
            return Err(self.not_running());
        };
        match self.behaviour.clone() {
            Behaviour::Exit { code, output } => {
                drop(tokio::spawn(async move {
                    if !output.is_empty() {
                        let _ = task.write(&output).await;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    task.exit(code).await;
                }));
            }
            Behaviour::Flood { lines } => {
                drop(tokio::spawn(async move {
                    for n in 0..lines {
                        if !task.write(format!("line {n}\n").as_bytes()).await {
                            break;
                        }
                        let _ = task.written.fetch_add(1, Ordering::SeqCst);
                    }
                }));
            }
            Behaviour::Run | Behaviour::Stubborn => {}
        }
        Ok(self.pid)
    }

    async fn kill(&self, signal: Signal) -> Result<()> {
        if self.exited.load(Ordering::SeqCst) {
            return Err(self.not_running());
        }
        self.shared
            .signals
            .lock()
            .unwrap()
            .entry(self.id.clone())
            .or_default()
            .push(signal);
        if self.behaviour == Behaviour::Stubborn && signal != Signal::SIGKILL {
            return Ok(());
        }
        self.spawn_exit(128 + signal as i32);
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        if self.exited.load(Ordering::SeqCst) {
            return Err(self.not_running());
        }
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        if self.exited.load(Ordering::SeqCst) {
            return Err(self.not_running());
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn force_delete(&self) -> Result<()> {
        let _ = self.shared.tasks.lock().unwrap().remove(&self.id);
        Ok(())
    }

    async fn stats(&self) -> Result<ResourceUsage> {
        if self.exited.load(Ordering::SeqCst) {
            return Err(HarbordError::conflict(format!("task {} is not running", self.id)));
        }
        let cpu = self.cpu_ns.fetch_add(50_000_000, Ordering::SeqCst) + 50_000_000;
        Ok(ResourceUsage {
            cpu_total_ns: cpu,
            system_cpu_ns: cpu * 4,
            online_cpus: 2,
            memory_usage: 8 << 20,
            memory_limit: 512 << 20,
            pids: 1,
            io_read_bytes: 0,
            io_write_bytes: 0,
        })
    }
}

// ── Collaborators ────────────────────────────────────────────────

/// Volume driver recording every call.
#[derive(Default)]
pub struct RecordingVolumes {
    root: PathBuf,
    /// `mount`, `unmount` and `remove` calls in order.
    pub calls: Mutex<Vec<String>>,
}

impl RecordingVolumes {
    /// Creates a driver placing volumes under `root`.
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Calls recorded so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl VolumeDriver for RecordingVolumes {
    async fn mount(&self, name: &str, _container: &ContainerId) -> Result<PathBuf> {
        self.calls.lock().unwrap().push(format!("mount {name}"));
        Ok(self.root.join(name))
    }

    async fn unmount(&self, name: &str, _container: &ContainerId) -> Result<()> {
        self.calls.lock().unwrap().push(format!("unmount {name}"));
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("remove {name}"));
        Ok(())
    }
}

/// Secret provider backed by a fixed map.
#[derive(Default)]
pub struct StaticSecrets {
    /// Secret contents by ID.
    pub secrets: HashMap<String, Vec<u8>>,
}

#[async_trait]
impl SecretProvider for StaticSecrets {
    async fn secret(&self, secret_id: &str) -> Result<Vec<u8>> {
        self.secrets
            .get(secret_id)
            .cloned()
            .ok_or_else(|| HarbordError::NotFound {
                kind: "secret",
                id: secret_id.to_string(),
            })
    }

    async fn config(&self, config_id: &str) -> Result<Vec<u8>> {
        Err(HarbordError::NotFound {
            kind: "config",
            id: config_id.to_string(),
        })
    }
}

// ── Harness ──────────────────────────────────────────────────────

/// Daemon configuration with short timeouts and a fast restart backoff.
pub fn test_config(data_dir: &Path) -> DaemonConfig {
    let mut config = DaemonConfig::with_data_dir(data_dir);
    config.restart_backoff = BackoffConfig {
        base_delay_ms: 10,
        max_delay_ms: 40,
        reset_after_secs: 10,
    };
    config.runtime_timeout_secs = 5;
    config.default_stop_timeout_secs = 1;
    config.stats_interval_ms = 20;
    config.copier_drain_timeout_ms = 500;
    config
}

/// A daemon over a [`FakeRuntime`] rooted in a temporary directory.
pub struct Harness {
    /// Data directory; dropped with the harness.
    pub dir: TempDir,
    /// The fake runtime.
    pub runtime: Arc<FakeRuntime>,
    /// The daemon under test.
    pub daemon: Arc<Daemon>,
    events: JoinHandle<()>,
}

impl Harness {
    /// Builds a daemon with default collaborators.
    pub fn new() -> Self {
        Self::with(|builder| builder)
    }

    /// Builds a daemon, letting `configure` add collaborators.
    pub fn with(configure: impl FnOnce(DaemonBuilder) -> DaemonBuilder) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let (runtime, events) = FakeRuntime::new();
        let builder = DaemonBuilder::new(test_config(dir.path()), Arc::clone(&runtime) as Arc<dyn Runtime>);
        let daemon = configure(builder).build().expect("daemon should build");
        let events = daemon.spawn_event_loop(events);
        Self {
            dir,
            runtime,
            daemon,
            events,
        }
    }

    /// Simulates a daemon restart: the event loop is torn down and a new
    /// daemon restores every container from disk over the same runtime.
    pub async fn restart_daemon(self) -> Self {
        self.events.abort();
        let events = self.runtime.reconnect();
        let builder = DaemonBuilder::new(
            test_config(self.dir.path()),
            Arc::clone(&self.runtime) as Arc<dyn Runtime>,
        );
        let daemon = builder.build().expect("daemon should build");
        let events = daemon.spawn_event_loop(events);
        daemon.restore().await.expect("restore should succeed");
        Self {
            dir: self.dir,
            runtime: self.runtime,
            daemon,
            events,
        }
    }

    /// Directory holding the container directories.
    pub fn containers_root(&self) -> PathBuf {
        self.daemon.config().containers_root()
    }

    /// Creates a container running `cmd` under `policy`.
    pub async fn create(&self, name: &str, cmd: &[&str], policy: RestartPolicy) -> ContainerId {
        self.daemon
            .create(options(name, cmd, policy))
            .await
            .expect("create should succeed")
    }

    /// Creates and starts a container.
    pub async fn run(&self, name: &str, cmd: &[&str], policy: RestartPolicy) -> ContainerId {
        let id = self.create(name, cmd, policy).await;
        self.daemon
            .start(id.as_str())
            .await
            .expect("start should succeed");
        id
    }

    /// Snapshot of a container.
    pub fn inspect(&self, id: &ContainerId) -> ContainerSnapshot {
        self.daemon
            .inspect(id.as_str())
            .expect("container should exist")
    }

    /// Polls the snapshot of `id` until `done` holds.
    pub async fn wait_until(
        &self,
        id: &ContainerId,
        what: &str,
        done: impl Fn(&ContainerSnapshot) -> bool,
    ) -> ContainerSnapshot {
        let deadline = tokio::time::Instant::now() + POLL_TIMEOUT;
        loop {
            if let Ok(snapshot) = self.daemon.inspect(id.as_str()) {
                if done(&snapshot) {
                    return snapshot;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {what}"
            );
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Polls until `id` is no longer known to the daemon.
    pub async fn wait_gone(&self, id: &ContainerId) {
        let deadline = tokio::time::Instant::now() + POLL_TIMEOUT;
        while self.daemon.inspect(id.as_str()).is_ok() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for removal"
            );
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Create options for a container running `cmd` under `policy`.
pub fn options(name: &str, cmd: &[&str], policy: RestartPolicy) -> CreateOptions {
    CreateOptions {
        name: (!name.is_empty()).then(|| name.to_string()),
        config: ContainerConfig {
            image: "busybox".into(),
            cmd: cmd.iter().map(ToString::to_string).collect(),
            ..ContainerConfig::default()
        },
        host_config: HostConfig {
            restart_policy: policy,
            ..HostConfig::default()
        },
        ..CreateOptions::default()
    }
}

/// Directories under the containers root.
pub fn container_dirs(root: &Path) -> usize {
    std::fs::read_dir(root)
        .map(|entries| {
            entries
                .filter_map(std::result::Result::ok)
                .filter(|entry| entry.path().is_dir())
                .count()
        })
        .unwrap_or(0)
}
