//! Profile lifecycle and worker admission.
//!
//! An [`Orchestrator`] is a handle to a scheduler task that exclusively owns
//! the [`ProfileStore`], the FIFO queue of pending jobs and the set of
//! running workers. Callers talk to it through messages, so there is exactly
//! one place that promotes or stops a worker and the concurrency cap can
//! never be raced.
//!
//! ```text
//! add / unpause ──▶ pending (FIFO) ──admission tick, running < cap──▶ running
//! pause / remove ─────────────────────────────────────────────────▶ terminated
//! ```
//!
//! Every (profile, kind) pair is either pending, running or neither, never
//! both. Lowering the cap does not stop running workers; it only holds back
//! admissions until the running count falls below it.

use crate::config::{OutputKind, WatchConfig};
use crate::convert::Converter;
use crate::error::HotfolderError;
use crate::pipeline::encode::ImageEncoder;
use crate::pipeline::render::PageRenderer;
use crate::progress::Observer;
use crate::relocate::Relocator;
use crate::store::{ProfileRecord, ProfileStatus, ProfileStore};
use crate::watcher::{ProfileWatcher, WorkerControl};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Identity of a worker: one per profile and output kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobKey {
    pub profile: String,
    pub kind: OutputKind,
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.profile, self.kind)
    }
}

/// What a worker needs to start: a watch directory and an output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub key: JobKey,
    pub watch_dir: PathBuf,
    pub output_dir: PathBuf,
}

/// Starts workers for admitted jobs.
///
/// The returned handle must finish once `control` asks it to stop.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, spec: WorkerSpec, control: WorkerControl) -> JoinHandle<()>;
}

/// Runs each worker as an in-process [`ProfileWatcher`] task.
pub struct WatcherLauncher {
    config: WatchConfig,
    renderer: Arc<dyn PageRenderer>,
    encoder: Arc<dyn ImageEncoder>,
    relocator: Arc<Relocator>,
    observer: Option<Observer>,
}

impl WatcherLauncher {
    pub fn new(
        config: WatchConfig,
        renderer: Arc<dyn PageRenderer>,
        encoder: Arc<dyn ImageEncoder>,
    ) -> Self {
        // One relocator for every worker so merges into a shared COMPLETE
        // folder are serialised across profiles and kinds.
        let relocator = Arc::new(Relocator::new(config.move_retry));
        Self {
            config,
            renderer,
            encoder,
            relocator,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observer = Some(observer);
        self
    }
}

impl WorkerLauncher for WatcherLauncher {
    fn launch(&self, spec: WorkerSpec, control: WorkerControl) -> JoinHandle<()> {
        let mut converter = Converter::new(
            spec.key.kind,
            self.config.clone(),
            Arc::clone(&self.renderer),
            Arc::clone(&self.encoder),
        );
        if let Some(observer) = &self.observer {
            converter = converter.with_observer(Arc::clone(observer));
        }
        let watcher = ProfileWatcher::new(
            spec.watch_dir,
            spec.output_dir,
            Arc::new(converter),
            Arc::clone(&self.relocator),
        );
        let span = info_span!("worker", profile = %spec.key.profile, kind = %spec.key.kind);
        tokio::spawn(
            async move {
                if let Err(e) = watcher.run(control).await {
                    error!("Worker stopped: {}", e);
                }
            }
            .instrument(span),
        )
    }
}

/// How running workers are stopped on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Abort in-flight conversions.
    Terminate,
    /// Stop intake, let in-flight conversions finish.
    Drain,
}

/// Snapshot of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorStatus {
    pub cap: usize,
    pub running: Vec<JobKey>,
    /// In admission order.
    pub pending: Vec<JobKey>,
    /// Terminated, not yet finished. Each still holds a slot.
    pub stopping: Vec<JobKey>,
    pub profiles: BTreeMap<String, ProfileStatus>,
    pub network_folder: Option<PathBuf>,
}

/// Host parallelism, the cap used when none is configured.
pub fn host_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

type Reply<T> = oneshot::Sender<Result<T, HotfolderError>>;

enum Command {
    AddProfile {
        name: String,
        reply: Reply<ProfileRecord>,
    },
    RemoveProfile {
        name: String,
        reply: Reply<bool>,
    },
    /// `None` toggles.
    SetStatus {
        name: String,
        status: Option<ProfileStatus>,
        reply: Reply<ProfileStatus>,
    },
    SetCap {
        cap: usize,
        reply: Reply<()>,
    },
    SetNetworkFolder {
        path: PathBuf,
        reply: Reply<()>,
    },
    Status {
        reply: oneshot::Sender<OrchestratorStatus>,
    },
    Shutdown {
        mode: ShutdownMode,
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the scheduler task.
///
/// Operations are answered only after any configuration change has been
/// persisted. Must be started inside a Tokio runtime.
pub struct Orchestrator {
    tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
    default_shutdown: ShutdownMode,
}

impl Orchestrator {
    /// Start the scheduler. Active profiles from `store` are queued at once.
    pub fn start(
        store: ProfileStore,
        config: &WatchConfig,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        let cap = store.core_cap().unwrap_or_else(host_parallelism).max(1);
        let mut scheduler = Scheduler {
            store,
            launcher,
            cap,
            pending: VecDeque::new(),
            running: BTreeMap::new(),
            stopping: BTreeMap::new(),
        };
        let active: Vec<String> = scheduler
            .store
            .profiles()
            .iter()
            .filter(|(_, r)| r.status == ProfileStatus::Active)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &active {
            scheduler.enqueue(name);
        }
        info!(
            "Orchestrator starting: cap {}, {} profile(s), {} job(s) queued",
            cap,
            scheduler.store.profiles().len(),
            scheduler.pending.len()
        );

        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(scheduler.run(rx, config.admission_interval));
        let default_shutdown = if config.drain_on_shutdown {
            ShutdownMode::Drain
        } else {
            ShutdownMode::Terminate
        };
        Self {
            tx,
            task,
            default_shutdown,
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, HotfolderError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| HotfolderError::OrchestratorStopped)?;
        rx.await.map_err(|_| HotfolderError::OrchestratorStopped)?
    }

    /// Create a profile and queue one job per output kind.
    pub async fn add_profile(&self, name: &str) -> Result<ProfileRecord, HotfolderError> {
        let name = name.to_string();
        self.request(|reply| Command::AddProfile { name, reply }).await
    }

    /// Stop and forget a profile. Returns `false` if it did not exist.
    pub async fn remove_profile(&self, name: &str) -> Result<bool, HotfolderError> {
        let name = name.to_string();
        self.request(|reply| Command::RemoveProfile { name, reply })
            .await
    }

    pub async fn pause_profile(&self, name: &str) -> Result<ProfileStatus, HotfolderError> {
        self.set_status(name, Some(ProfileStatus::Paused)).await
    }

    pub async fn unpause_profile(&self, name: &str) -> Result<ProfileStatus, HotfolderError> {
        self.set_status(name, Some(ProfileStatus::Active)).await
    }

    /// Flip between active and paused; returns the new status.
    pub async fn toggle_profile(&self, name: &str) -> Result<ProfileStatus, HotfolderError> {
        self.set_status(name, None).await
    }

    async fn set_status(
        &self,
        name: &str,
        status: Option<ProfileStatus>,
    ) -> Result<ProfileStatus, HotfolderError> {
        let name = name.to_string();
        self.request(|reply| Command::SetStatus {
            name,
            status,
            reply,
        })
        .await
    }

    /// Change the cap. Applies from the next admission tick; running workers
    /// above the new cap are left alone.
    pub async fn set_concurrency_cap(&self, cap: usize) -> Result<(), HotfolderError> {
        if cap == 0 {
            return Err(HotfolderError::InvalidConfig(
                "concurrency cap must be at least 1".into(),
            ));
        }
        self.request(|reply| Command::SetCap { cap, reply }).await
    }

    pub async fn set_network_folder(&self, path: impl Into<PathBuf>) -> Result<(), HotfolderError> {
        let path = path.into();
        self.request(|reply| Command::SetNetworkFolder { path, reply })
            .await
    }

    pub async fn status(&self) -> Result<OrchestratorStatus, HotfolderError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Status { reply })
            .await
            .map_err(|_| HotfolderError::OrchestratorStopped)?;
        rx.await.map_err(|_| HotfolderError::OrchestratorStopped)
    }

    /// Stop admissions and every worker, using the configured mode.
    pub async fn shutdown(self) -> Result<(), HotfolderError> {
        let mode = self.default_shutdown;
        self.shutdown_with(mode).await
    }

    /// Stop admissions and every worker; returns once all have stopped.
    pub async fn shutdown_with(self, mode: ShutdownMode) -> Result<(), HotfolderError> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { mode, reply }).await.is_ok() {
            let _ = rx.await;
        }
        self.task
            .await
            .map_err(|e| HotfolderError::Internal(format!("scheduler task failed: {e}")))
    }
}

struct RunningWorker {
    control: WorkerControl,
    handle: JoinHandle<()>,
}

/// State owned by the scheduler task.
struct Scheduler {
    store: ProfileStore,
    launcher: Arc<dyn WorkerLauncher>,
    cap: usize,
    pending: VecDeque<WorkerSpec>,
    running: BTreeMap<JobKey, RunningWorker>,
    /// Terminated workers still winding down. They hold their slot and
    /// their key until they finish.
    stopping: BTreeMap<JobKey, JoinHandle<()>>,
}

impl Scheduler {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>, every: Duration) {
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Shutdown { mode, reply }) => {
                        self.stop_all(mode).await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(cmd) => self.handle(cmd).await,
                    None => {
                        debug!("Orchestrator handle dropped");
                        self.stop_all(ShutdownMode::Terminate).await;
                        return;
                    }
                },
                _ = tick.tick() => self.admit(),
            }
        }
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::AddProfile { name, reply } => {
                let result = self.store.add_profile(&name);
                if result.is_ok() {
                    self.enqueue(&name);
                }
                let _ = reply.send(result);
            }
            Command::RemoveProfile { name, reply } => {
                let _ = reply.send(self.remove(&name).await);
            }
            Command::SetStatus {
                name,
                status,
                reply,
            } => {
                let _ = reply.send(self.set_status(&name, status));
            }
            Command::SetCap { cap, reply } => {
                let result = self.store.set_core_cap(Some(cap));
                if result.is_ok() {
                    info!("Concurrency cap {} → {}", self.cap, cap);
                    self.cap = cap;
                }
                let _ = reply.send(result);
            }
            Command::SetNetworkFolder { path, reply } => {
                let _ = reply.send(self.store.set_network_folder(path));
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            // Intercepted by the run loop before it gets here.
            Command::Shutdown { reply, .. } => {
                let _ = reply.send(());
            }
        }
    }

    /// Promote pending jobs while below the cap. A job whose previous worker
    /// is still stopping waits its turn without blocking the ones behind it.
    fn admit(&mut self) {
        self.reap();
        while self.running.len() + self.stopping.len() < self.cap {
            let Some(next) = self
                .pending
                .iter()
                .position(|s| !self.stopping.contains_key(&s.key))
            else {
                break;
            };
            let Some(spec) = self.pending.remove(next) else {
                break;
            };
            let key = spec.key.clone();
            let control = WorkerControl::new();
            let handle = self.launcher.launch(spec, control.clone());
            info!("Admitted {} ({}/{} running)", key, self.running.len() + 1, self.cap);
            self.running.insert(key, RunningWorker { control, handle });
        }
    }

    /// Drop workers that ended on their own. They are not re-queued.
    fn reap(&mut self) {
        let finished: Vec<JobKey> = self
            .running
            .iter()
            .filter(|(_, w)| w.handle.is_finished())
            .map(|(k, _)| k.clone())
            .collect();
        for key in finished {
            self.running.remove(&key);
            warn!("Worker {} exited on its own", key);
        }
        self.stopping.retain(|_, h| !h.is_finished());
    }

    /// Queue one job per kind for `name`, skipping pairs already queued or
    /// running.
    fn enqueue(&mut self, name: &str) {
        let Some(record) = self.store.profile(name) else {
            return;
        };
        for kind in OutputKind::ALL {
            let key = JobKey {
                profile: name.to_string(),
                kind,
            };
            if self.running.contains_key(&key) || self.pending.iter().any(|s| s.key == key) {
                debug!("{} already scheduled", key);
                continue;
            }
            let spec = WorkerSpec {
                key,
                watch_dir: record.watch_dir(kind).to_path_buf(),
                output_dir: record.complete_dir.clone(),
            };
            debug!("Queued {}", spec.key);
            self.pending.push_back(spec);
        }
    }

    /// Cancel pending jobs and terminate running workers of `name`.
    fn stop_profile(&mut self, name: &str) -> Vec<(JobKey, JoinHandle<()>)> {
        self.pending.retain(|s| s.key.profile != name);
        let keys: Vec<JobKey> = self
            .running
            .keys()
            .filter(|k| k.profile == name)
            .cloned()
            .collect();
        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(worker) = self.running.remove(&key) {
                worker.control.terminate();
                info!("Terminated {}", key);
                handles.push((key, worker.handle));
            }
        }
        handles
    }

    async fn remove(&mut self, name: &str) -> Result<bool, HotfolderError> {
        if self.store.profile(name).is_none() {
            return Ok(false);
        }
        // Workers must be gone before their directories are deleted.
        let mut handles: Vec<JoinHandle<()>> =
            self.stop_profile(name).into_iter().map(|(_, h)| h).collect();
        let winding_down: Vec<JobKey> = self
            .stopping
            .keys()
            .filter(|k| k.profile == name)
            .cloned()
            .collect();
        for key in winding_down {
            handles.extend(self.stopping.remove(&key));
        }
        for handle in handles {
            let _ = handle.await;
        }
        Ok(self.store.remove_profile(name)?.is_some())
    }

    fn set_status(
        &mut self,
        name: &str,
        status: Option<ProfileStatus>,
    ) -> Result<ProfileStatus, HotfolderError> {
        let current = self
            .store
            .profile(name)
            .map(|r| r.status)
            .ok_or_else(|| HotfolderError::UnknownProfile { name: name.into() })?;
        let target = status.unwrap_or(current.toggled());
        if self.store.set_status(name, target)? {
            info!("Profile '{}' is now {:?}", name, target);
            match target {
                ProfileStatus::Paused => {
                    let handles = self.stop_profile(name);
                    self.stopping.extend(handles);
                }
                ProfileStatus::Active => self.enqueue(name),
            }
        }
        Ok(target)
    }

    fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            cap: self.cap,
            running: self.running.keys().cloned().collect(),
            pending: self.pending.iter().map(|s| s.key.clone()).collect(),
            stopping: self.stopping.keys().cloned().collect(),
            profiles: self
                .store
                .profiles()
                .iter()
                .map(|(name, r)| (name.clone(), r.status))
                .collect(),
            network_folder: self.store.network_folder().map(PathBuf::from),
        }
    }

    async fn stop_all(&mut self, mode: ShutdownMode) {
        info!(
            "Shutting down: {} running, {} pending dropped ({:?})",
            self.running.len(),
            self.pending.len(),
            mode
        );
        self.pending.clear();
        let mut handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut self.stopping).into_values().collect();
        for (_, worker) in std::mem::take(&mut self.running) {
            match mode {
                ShutdownMode::Terminate => worker.control.terminate(),
                ShutdownMode::Drain => worker.control.drain(),
            }
            handles.push(worker.handle);
        }
        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!("Worker panicked: {}", e);
                }
            }
        }
        info!("All workers stopped");
    }
}
