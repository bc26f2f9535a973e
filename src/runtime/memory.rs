//! In-process runtime
//!
//! Implements [`Runtime`] without a daemon: containers, images and content
//! live in memory, snapshots are plain directories, and task processes are
//! simulated from a script keyed on argv. The simulation honours the same IO
//! contract as the real daemon (it opens the client's FIFOs at task creation
//! and closes them when the process exits), so attach, logs and exit-code
//! propagation can be exercised end to end. OCI hooks are not executed.

use super::*;
use crate::error::{CtlError, RpcCode};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::{broadcast, mpsc, watch, Notify};

const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// How long `cat` keeps reading after its stdin was closed
const STDIN_DRAIN: Duration = Duration::from_millis(50);

/// Scripted behavior of a simulated process
#[derive(Debug, Clone, PartialEq)]
pub enum Behavior {
    /// Write output, then exit with `code`
    Exit {
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        code: u32,
    },
    /// Run until a signal arrives; optionally ignore SIGTERM
    UntilSignal { ignore_term: bool },
    /// Copy stdin to stdout until stdin is closed
    Cat,
    /// Fail at start with the given runtime message
    StartError(String),
}

impl Behavior {
    pub fn exit(code: u32) -> Self {
        Behavior::Exit {
            stdout: Vec::new(),
            stderr: Vec::new(),
            code,
        }
    }

    pub fn print(stdout: &str) -> Self {
        Behavior::Exit {
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
            code: 0,
        }
    }
}

type Script = Arc<dyn Fn(&[String]) -> Behavior + Send + Sync>;

/// Argv-driven default: understands `echo`, `true`, `false`, `sleep`, `cat`
/// and `sh -c '<echo ...|exit N|trap "" TERM; ...>'`.
pub fn default_behavior(args: &[String]) -> Behavior {
    let Some(argv0) = args.first() else {
        return Behavior::StartError("OCI runtime create failed: args must not be empty".into());
    };
    let program = argv0.rsplit('/').next().unwrap_or(argv0);
    match program {
        "echo" => Behavior::print(&format!("{}\n", args[1..].join(" "))),
        "true" => Behavior::exit(0),
        "false" => Behavior::exit(1),
        "sleep" | "tail" => Behavior::UntilSignal { ignore_term: false },
        "cat" => Behavior::Cat,
        "sh" | "bash" | "ash" => {
            let script = args
                .iter()
                .position(|a| a.starts_with('-') && a.contains('c'))
                .and_then(|i| args.get(i + 1))
                .cloned()
                .unwrap_or_default();
            shell_behavior(&script)
        }
        p if p.contains("nonexistent") => Behavior::StartError(format!(
            "OCI runtime exec failed: exec: \"{}\": executable file not found in $PATH: unknown",
            argv0
        )),
        p if p.starts_with("/etc") => Behavior::StartError(format!(
            "OCI runtime exec failed: exec: \"{}\": permission denied: unknown",
            argv0
        )),
        _ => Behavior::exit(0),
    }
}

fn shell_behavior(script: &str) -> Behavior {
    let script = script.trim();
    if script.contains("trap '' TERM") || script.contains("trap \"\" TERM") {
        return Behavior::UntilSignal { ignore_term: true };
    }
    let mut stdout = Vec::new();
    for statement in script.split([';', '\n']).map(str::trim) {
        if let Some(rest) = statement.strip_prefix("echo ") {
            stdout.extend_from_slice(rest.trim_matches(|c| c == '"' || c == '\'').as_bytes());
            stdout.push(b'\n');
        } else if let Some(code) = statement.strip_prefix("exit ") {
            let code = code.trim().parse().unwrap_or(1);
            return Behavior::Exit {
                stdout,
                stderr: Vec::new(),
                code,
            };
        } else if statement.starts_with("sleep") {
            return Behavior::UntilSignal { ignore_term: false };
        }
    }
    Behavior::Exit {
        stdout,
        stderr: Vec::new(),
        code: 0,
    }
}

/// Image made available to `pull_image` or loaded directly
#[derive(Debug, Clone, Default)]
pub struct ImageSeed {
    /// The `config` object of the OCI image configuration
    pub config: serde_json::Value,
    /// Files materialized in every snapshot prepared from this image
    pub files: Vec<(String, String)>,
}

struct ProcIo {
    stdin: Option<pipe::Receiver>,
    stdout: Option<pipe::Sender>,
    stderr: Option<pipe::Sender>,
    log: Option<Arc<Mutex<Vec<u8>>>>,
}

impl ProcIo {
    async fn write_stdout(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if let Some(out) = self.stdout.as_mut() {
            let _ = out.write_all(data).await;
        }
        if let Some(log) = &self.log {
            if let Ok(mut buf) = log.lock() {
                buf.extend_from_slice(data);
            }
        }
    }

    async fn write_stderr(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        match self.stderr.as_mut() {
            Some(err) => {
                let _ = err.write_all(data).await;
            }
            // A terminal merges both streams.
            None => {
                if let Some(out) = self.stdout.as_mut() {
                    let _ = out.write_all(data).await;
                }
            }
        }
        if let Some(log) = &self.log {
            if let Ok(mut buf) = log.lock() {
                buf.extend_from_slice(data);
            }
        }
    }
}

struct Proc {
    pid: u32,
    status: TaskStatus,
    behavior: Behavior,
    io: Option<ProcIo>,
    exit_tx: watch::Sender<Option<ExitRecord>>,
    signal_tx: Option<mpsc::UnboundedSender<i32>>,
    stdin_closed: Arc<Notify>,
    started: Option<Instant>,
    terminal: bool,
}

#[derive(Default)]
struct TaskEntry {
    init: Option<Proc>,
    execs: HashMap<String, Proc>,
}

struct Snapshot {
    dir: PathBuf,
    parent: String,
}

#[derive(Default)]
struct Namespace {
    containers: BTreeMap<String, ContainerRecord>,
    tasks: HashMap<String, TaskEntry>,
    images: BTreeMap<String, ImageRecord>,
    content: BTreeMap<String, (Vec<u8>, BTreeMap<String, String>)>,
    snapshots: BTreeMap<(String, String), Snapshot>,
    logs: HashMap<String, Arc<Mutex<Vec<u8>>>>,
}

#[derive(Default)]
struct Inner {
    namespaces: HashMap<String, Namespace>,
    registry: HashMap<String, ImageSeed>,
    seeds: HashMap<String, ImageSeed>,
}

/// Runtime that keeps all state in this process
pub struct MemoryRuntime {
    inner: Arc<Mutex<Inner>>,
    script: Mutex<Script>,
    root: PathBuf,
    next_pid: AtomicU32,
    events: broadcast::Sender<RuntimeEvent>,
}

fn not_found(what: &str, id: &str) -> CtlError {
    CtlError::runtime(RpcCode::NotFound, format!("{} {}: not found", what, id))
}

fn poisoned() -> CtlError {
    CtlError::internal("memory runtime state poisoned")
}

fn digest_of(data: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(data))
}

impl Default for MemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRuntime {
    /// Snapshots go under the system temp directory
    pub fn new() -> Self {
        Self::with_root(std::env::temp_dir().join(format!("runectl-memory-{}", std::process::id())))
    }

    pub fn with_root(root: PathBuf) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            script: Mutex::new(Arc::new(default_behavior)),
            root,
            next_pid: AtomicU32::new(1000),
            events,
        }
    }

    /// Replace the argv-to-behavior script
    pub fn set_script(&self, script: impl Fn(&[String]) -> Behavior + Send + Sync + 'static) {
        if let Ok(mut current) = self.script.lock() {
            *current = Arc::new(script);
        }
    }

    /// Make `reference` pullable
    pub fn add_registry_image(&self, reference: &str, seed: ImageSeed) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.registry.insert(reference.to_string(), seed);
        }
    }

    /// Store an image directly in the namespace, as if already pulled
    pub fn load_image(&self, ns: &str, reference: &str, seed: ImageSeed) -> Result<ImageRecord> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        Ok(Self::store_image(&mut inner, ns, reference, seed))
    }

    /// Bytes written by processes whose IO was a log URI
    pub fn logged_output(&self, ns: &str, id: &str) -> Vec<u8> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| {
                inner
                    .namespaces
                    .get(ns)
                    .and_then(|n| n.logs.get(id))
                    .and_then(|l| l.lock().ok().map(|b| b.clone()))
            })
            .unwrap_or_default()
    }

    fn store_image(inner: &mut Inner, ns: &str, reference: &str, seed: ImageSeed) -> ImageRecord {
        let config = serde_json::json!({
            "architecture": Platform::host().architecture,
            "os": "linux",
            "config": seed.config,
            "rootfs": { "type": "layers", "diff_ids": [] },
        });
        let config_bytes = serde_json::to_vec(&config).unwrap_or_default();
        let config_digest = digest_of(&config_bytes);
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST_MEDIA_TYPE,
            "config": {
                "mediaType": CONFIG_MEDIA_TYPE,
                "digest": config_digest,
                "size": config_bytes.len(),
            },
            "layers": [],
        });
        let manifest_bytes = serde_json::to_vec(&manifest).unwrap_or_default();
        let manifest_digest = digest_of(&manifest_bytes);

        let namespace = inner.namespaces.entry(ns.to_string()).or_default();
        let size = manifest_bytes.len() as u64;
        namespace
            .content
            .insert(config_digest, (config_bytes, BTreeMap::new()));
        namespace
            .content
            .insert(manifest_digest.clone(), (manifest_bytes, BTreeMap::new()));

        let record = ImageRecord {
            name: reference.to_string(),
            target: Descriptor {
                media_type: MANIFEST_MEDIA_TYPE.to_string(),
                digest: manifest_digest,
                size,
            },
            labels: BTreeMap::new(),
            created_at: Utc::now(),
        };
        namespace.images.insert(reference.to_string(), record.clone());
        inner.seeds.insert(reference.to_string(), seed);
        record
    }

    fn publish(&self, ns: &str, topic: &str, id: &str) {
        let _ = self.events.send(RuntimeEvent {
            namespace: ns.to_string(),
            topic: topic.to_string(),
            id: id.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn behavior_for(&self, args: &[String]) -> Behavior {
        match self.script.lock() {
            Ok(script) => script(args),
            Err(_) => default_behavior(args),
        }
    }

    async fn open_io(&self, io: &TaskIo, log: Option<Arc<Mutex<Vec<u8>>>>) -> Result<(ProcIo, bool)> {
        let mut proc_io = ProcIo {
            stdin: None,
            stdout: None,
            stderr: None,
            log: None,
        };
        let mut terminal = false;
        match io {
            TaskIo::Null => {}
            TaskIo::Log { .. } => proc_io.log = log,
            TaskIo::Fifos(fifos) => {
                terminal = fifos.terminal;
                // Read-write opens never block on a missing peer.
                if let Some(path) = &fifos.stdin {
                    proc_io.stdin = Some(pipe::OpenOptions::new().read_write(true).open_receiver(path)?);
                }
                if let Some(path) = &fifos.stdout {
                    proc_io.stdout = Some(pipe::OpenOptions::new().read_write(true).open_sender(path)?);
                }
                if let Some(path) = &fifos.stderr {
                    proc_io.stderr = Some(pipe::OpenOptions::new().read_write(true).open_sender(path)?);
                }
            }
        }
        Ok((proc_io, terminal))
    }

    fn new_proc(&self, behavior: Behavior, io: ProcIo, terminal: bool) -> Proc {
        let (exit_tx, _) = watch::channel(None);
        Proc {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            status: TaskStatus::Created,
            behavior,
            io: Some(io),
            exit_tx,
            signal_tx: None,
            stdin_closed: Arc::new(Notify::new()),
            started: None,
            terminal,
        }
    }

    fn with_proc<T>(
        &self,
        ns: &str,
        id: &str,
        exec_id: Option<&str>,
        f: impl FnOnce(&mut Proc) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        let entry = inner
            .namespaces
            .get_mut(ns)
            .and_then(|n| n.tasks.get_mut(id))
            .ok_or_else(|| not_found("task", id))?;
        let proc = match exec_id {
            None => entry.init.as_mut(),
            Some(exec) => entry.execs.get_mut(exec),
        }
        .ok_or_else(|| not_found("process", exec_id.unwrap_or(id)))?;
        f(proc)
    }

    fn start_proc(&self, ns: &str, id: &str, exec_id: Option<&str>) -> Result<u32> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (pid, behavior, io, stdin_closed) = self.with_proc(ns, id, exec_id, |proc| {
            if proc.status != TaskStatus::Created {
                return Err(CtlError::runtime(
                    RpcCode::Internal,
                    format!("process {} is {}, not created", proc.pid, proc.status),
                ));
            }
            if let Behavior::StartError(message) = &proc.behavior {
                return Err(CtlError::runtime(RpcCode::Internal, message.clone()));
            }
            proc.status = TaskStatus::Running;
            proc.started = Some(Instant::now());
            proc.signal_tx = Some(tx);
            Ok((
                proc.pid,
                proc.behavior.clone(),
                proc.io.take(),
                proc.stdin_closed.clone(),
            ))
        })?;

        let inner = self.inner.clone();
        let events = self.events.clone();
        let key = (ns.to_string(), id.to_string(), exec_id.map(str::to_string));
        tokio::spawn(async move {
            let exit = run_process(behavior, io, rx, stdin_closed).await;
            let mut guard = match inner.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            let (ns, id, exec_id) = key;
            let proc = guard
                .namespaces
                .get_mut(&ns)
                .and_then(|n| n.tasks.get_mut(&id))
                .and_then(|t| match &exec_id {
                    None => t.init.as_mut(),
                    Some(exec) => t.execs.get_mut(exec),
                });
            if let Some(proc) = proc {
                proc.status = TaskStatus::Stopped;
                proc.signal_tx = None;
                let _ = proc.exit_tx.send(Some(exit));
            }
            let _ = events.send(RuntimeEvent {
                namespace: ns,
                topic: "/tasks/exit".to_string(),
                id,
                timestamp: Utc::now(),
            });
        });
        Ok(pid)
    }

    async fn wait_proc(&self, ns: &str, id: &str, exec_id: Option<&str>) -> Result<ExitRecord> {
        let mut rx = self.with_proc(ns, id, exec_id, |proc| Ok(proc.exit_tx.subscribe()))?;
        let exit = rx
            .wait_for(|exit| exit.is_some())
            .await
            .map_err(|_| CtlError::runtime(RpcCode::NotFound, format!("task {} deleted", id)))?;
        exit.clone()
            .ok_or_else(|| CtlError::internal("exit channel closed without a status"))
    }

    fn signal_proc(&self, ns: &str, id: &str, exec_id: Option<&str>, signal: i32) -> Result<()> {
        self.with_proc(ns, id, exec_id, |proc| match proc.status {
            TaskStatus::Running | TaskStatus::Paused if proc.signal_tx.is_some() => {
                if let Some(tx) = &proc.signal_tx {
                    let _ = tx.send(signal);
                }
                Ok(())
            }
            TaskStatus::Created => {
                // Killing a never-started process stops it in place.
                proc.status = TaskStatus::Stopped;
                proc.io = None;
                let _ = proc.exit_tx.send(Some(ExitRecord {
                    status: 128 + signal as u32,
                    signal: Some(signal),
                    exited_at: Utc::now(),
                }));
                Ok(())
            }
            _ => Err(CtlError::runtime(
                RpcCode::NotFound,
                "process already finished",
            )),
        })
    }
}

async fn run_process(
    behavior: Behavior,
    io: Option<ProcIo>,
    mut signals: mpsc::UnboundedReceiver<i32>,
    stdin_closed: Arc<Notify>,
) -> ExitRecord {
    let mut io = io.unwrap_or(ProcIo {
        stdin: None,
        stdout: None,
        stderr: None,
        log: None,
    });
    let exited = |status: u32, signal: Option<i32>| ExitRecord {
        status,
        signal,
        exited_at: Utc::now(),
    };

    let exit = match behavior {
        Behavior::Exit {
            stdout,
            stderr,
            code,
        } => {
            io.write_stdout(&stdout).await;
            io.write_stderr(&stderr).await;
            exited(code, None)
        }
        Behavior::UntilSignal { ignore_term } => loop {
            match signals.recv().await {
                Some(15) if ignore_term => continue,
                // SIGCONT, SIGWINCH and friends do not terminate.
                Some(18) | Some(28) => continue,
                Some(sig) => break exited(128 + sig as u32, Some(sig)),
                None => break exited(0, None),
            }
        },
        Behavior::Cat => {
            let mut stdin = io.stdin.take();
            let mut buf = [0u8; 4096];
            loop {
                let read = async {
                    match stdin.as_mut() {
                        Some(r) => r.read(&mut buf).await.ok(),
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    n = read => match n {
                        Some(0) | None => break exited(0, None),
                        Some(n) => {
                            let chunk = buf[..n].to_vec();
                            io.write_stdout(&chunk).await;
                        }
                    },
                    _ = stdin_closed.notified() => {
                        // Data written before the close may still sit in the pipe.
                        if let Some(r) = stdin.as_mut() {
                            while let Ok(Ok(n)) = tokio::time::timeout(STDIN_DRAIN, r.read(&mut buf)).await {
                                if n == 0 {
                                    break;
                                }
                                let chunk = buf[..n].to_vec();
                                io.write_stdout(&chunk).await;
                            }
                        }
                        break exited(0, None);
                    }
                    sig = signals.recv() => match sig {
                        Some(18) | Some(28) => continue,
                        Some(sig) => break exited(128 + sig as u32, Some(sig)),
                        None => break exited(0, None),
                    },
                }
            }
        }
        Behavior::StartError(_) => exited(127, None),
    };
    // Dropping the write ends delivers EOF to the client.
    drop(io);
    exit
}

#[async_trait]
impl Runtime for MemoryRuntime {
    async fn create_container(&self, ns: &str, record: ContainerRecord) -> Result<ContainerRecord> {
        {
            let mut inner = self.inner.lock().map_err(|_| poisoned())?;
            let namespace = inner.namespaces.entry(ns.to_string()).or_default();
            if namespace.containers.contains_key(&record.id) {
                return Err(CtlError::runtime(
                    RpcCode::AlreadyExists,
                    format!("container {}: already exists", record.id),
                ));
            }
            namespace
                .containers
                .insert(record.id.clone(), record.clone());
        }
        self.publish(ns, "/containers/create", &record.id);
        Ok(record)
    }

    async fn load_container(&self, ns: &str, id: &str) -> Result<ContainerRecord> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        inner
            .namespaces
            .get(ns)
            .and_then(|n| n.containers.get(id))
            .cloned()
            .ok_or_else(|| not_found("container", id))
    }

    async fn list_containers(&self, ns: &str) -> Result<Vec<ContainerRecord>> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        Ok(inner
            .namespaces
            .get(ns)
            .map(|n| n.containers.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn update_labels(
        &self,
        ns: &str,
        id: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<ContainerRecord> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        let record = inner
            .namespaces
            .get_mut(ns)
            .and_then(|n| n.containers.get_mut(id))
            .ok_or_else(|| not_found("container", id))?;
        for (key, value) in labels {
            if value.is_empty() {
                record.labels.remove(&key);
            } else {
                record.labels.insert(key, value);
            }
        }
        Ok(record.clone())
    }

    async fn update_spec(&self, ns: &str, id: &str, spec: Spec) -> Result<ContainerRecord> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        let record = inner
            .namespaces
            .get_mut(ns)
            .and_then(|n| n.containers.get_mut(id))
            .ok_or_else(|| not_found("container", id))?;
        record.spec = spec;
        Ok(record.clone())
    }

    async fn delete_container(&self, ns: &str, id: &str) -> Result<()> {
        let snapshot_dir = {
            let mut inner = self.inner.lock().map_err(|_| poisoned())?;
            let namespace = inner
                .namespaces
                .get_mut(ns)
                .ok_or_else(|| not_found("container", id))?;
            if namespace.tasks.contains_key(id) {
                return Err(CtlError::runtime(
                    RpcCode::Internal,
                    format!("cannot delete container {}: task must be deleted first", id),
                ));
            }
            let record = namespace
                .containers
                .remove(id)
                .ok_or_else(|| not_found("container", id))?;
            namespace.logs.remove(id);
            namespace
                .snapshots
                .remove(&(record.snapshotter.clone(), record.snapshot_key.clone()))
                .map(|s| s.dir)
        };
        if let Some(dir) = snapshot_dir {
            let _ = std::fs::remove_dir_all(dir);
        }
        self.publish(ns, "/containers/delete", id);
        Ok(())
    }

    async fn create_task(&self, ns: &str, id: &str, io: TaskIo) -> Result<u32> {
        let (args, log) = {
            let mut inner = self.inner.lock().map_err(|_| poisoned())?;
            let namespace = inner
                .namespaces
                .get_mut(ns)
                .ok_or_else(|| not_found("container", id))?;
            let record = namespace
                .containers
                .get(id)
                .ok_or_else(|| not_found("container", id))?;
            if namespace.tasks.get(id).map(|t| t.init.is_some()) == Some(true) {
                return Err(CtlError::runtime(
                    RpcCode::AlreadyExists,
                    format!("task {}: already exists", id),
                ));
            }
            let args = record
                .spec
                .process()
                .as_ref()
                .and_then(|p| p.args().clone())
                .unwrap_or_default();
            let log = namespace
                .logs
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
                .clone();
            (args, log)
        };

        let behavior = self.behavior_for(&args);
        let (proc_io, terminal) = self.open_io(&io, Some(log)).await?;
        let proc = self.new_proc(behavior, proc_io, terminal);
        let pid = proc.pid;

        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        let namespace = inner.namespaces.entry(ns.to_string()).or_default();
        namespace.tasks.entry(id.to_string()).or_default().init = Some(proc);
        Ok(pid)
    }

    async fn start_task(&self, ns: &str, id: &str) -> Result<()> {
        self.start_proc(ns, id, None)?;
        self.publish(ns, "/tasks/start", id);
        Ok(())
    }

    async fn wait_task(&self, ns: &str, id: &str) -> Result<ExitRecord> {
        self.wait_proc(ns, id, None).await
    }

    async fn kill_task(&self, ns: &str, id: &str, signal: i32, _all: bool) -> Result<()> {
        self.signal_proc(ns, id, None, signal)
    }

    async fn pause_task(&self, ns: &str, id: &str) -> Result<()> {
        self.with_proc(ns, id, None, |proc| {
            if proc.status != TaskStatus::Running {
                return Err(CtlError::runtime(
                    RpcCode::Internal,
                    format!("cannot pause task in {} state", proc.status),
                ));
            }
            proc.status = TaskStatus::Paused;
            Ok(())
        })
    }

    async fn resume_task(&self, ns: &str, id: &str) -> Result<()> {
        self.with_proc(ns, id, None, |proc| {
            if proc.status != TaskStatus::Paused {
                return Err(CtlError::runtime(
                    RpcCode::Internal,
                    format!("cannot resume task in {} state", proc.status),
                ));
            }
            proc.status = TaskStatus::Running;
            Ok(())
        })
    }

    async fn delete_task(&self, ns: &str, id: &str) -> Result<Option<ExitRecord>> {
        let exit = {
            let mut inner = self.inner.lock().map_err(|_| poisoned())?;
            let namespace = inner
                .namespaces
                .get_mut(ns)
                .ok_or_else(|| not_found("task", id))?;
            let entry = namespace
                .tasks
                .get(id)
                .and_then(|t| t.init.as_ref())
                .ok_or_else(|| not_found("task", id))?;
            if matches!(entry.status, TaskStatus::Running | TaskStatus::Paused) {
                return Err(CtlError::runtime(
                    RpcCode::Internal,
                    format!("task {} must be stopped before deletion: {}", id, entry.status),
                ));
            }
            let exit = entry.exit_tx.borrow().clone();
            namespace.tasks.remove(id);
            exit
        };
        self.publish(ns, "/tasks/delete", id);
        Ok(exit)
    }

    async fn task_status(&self, ns: &str, id: &str) -> Result<TaskInfo> {
        self.with_proc(ns, id, None, |proc| {
            Ok(TaskInfo {
                id: id.to_string(),
                pid: proc.pid,
                status: proc.status,
                exit: proc.exit_tx.borrow().clone(),
            })
        })
    }

    async fn task_pids(&self, ns: &str, id: &str) -> Result<Vec<u32>> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        let entry = inner
            .namespaces
            .get(ns)
            .and_then(|n| n.tasks.get(id))
            .ok_or_else(|| not_found("task", id))?;
        let mut pids: Vec<u32> = entry
            .init
            .iter()
            .chain(entry.execs.values())
            .filter(|p| matches!(p.status, TaskStatus::Running | TaskStatus::Paused))
            .map(|p| p.pid)
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    async fn task_metrics(&self, ns: &str, id: &str) -> Result<TaskMetrics> {
        let pids = self.task_pids(ns, id).await?;
        let (started, limit) = {
            let inner = self.inner.lock().map_err(|_| poisoned())?;
            let namespace = inner.namespaces.get(ns).ok_or_else(|| not_found("task", id))?;
            let started = namespace
                .tasks
                .get(id)
                .and_then(|t| t.init.as_ref())
                .and_then(|p| p.started);
            let limit = namespace
                .containers
                .get(id)
                .and_then(|c| c.spec.linux().as_ref())
                .and_then(|l| l.resources().as_ref())
                .and_then(|r| r.memory().as_ref())
                .and_then(|m| m.limit())
                .unwrap_or(0);
            (started, limit)
        };
        Ok(TaskMetrics {
            cpu_usage_ns: started
                .map(|s| s.elapsed().as_nanos() as u64 / 100)
                .unwrap_or(0),
            memory_usage: 4 * 1024 * 1024,
            memory_limit: limit.max(0) as u64,
            pids: pids.len() as u64,
        })
    }

    async fn resize_pty(
        &self,
        ns: &str,
        id: &str,
        exec_id: Option<&str>,
        _width: u16,
        _height: u16,
    ) -> Result<()> {
        self.with_proc(ns, id, exec_id, |proc| {
            if proc.terminal {
                Ok(())
            } else {
                Err(CtlError::runtime(RpcCode::Internal, "process has no terminal"))
            }
        })
    }

    async fn close_stdin(&self, ns: &str, id: &str, exec_id: Option<&str>) -> Result<()> {
        self.with_proc(ns, id, exec_id, |proc| {
            proc.stdin_closed.notify_one();
            Ok(())
        })
    }

    async fn exec_process(&self, ns: &str, id: &str, request: ExecRequest) -> Result<()> {
        {
            let inner = self.inner.lock().map_err(|_| poisoned())?;
            let entry = inner
                .namespaces
                .get(ns)
                .and_then(|n| n.tasks.get(id))
                .ok_or_else(|| not_found("task", id))?;
            let running = entry
                .init
                .as_ref()
                .map(|p| p.status == TaskStatus::Running)
                .unwrap_or(false);
            if !running {
                return Err(CtlError::runtime(
                    RpcCode::Internal,
                    format!("cannot exec in a stopped container {}", id),
                ));
            }
            if entry.execs.contains_key(&request.exec_id) {
                return Err(CtlError::runtime(
                    RpcCode::AlreadyExists,
                    format!("exec process {}: already exists", request.exec_id),
                ));
            }
        }

        let args = request.process.args().clone().unwrap_or_default();
        let behavior = self.behavior_for(&args);
        let (proc_io, terminal) = self.open_io(&request.io, None).await?;
        let proc = self.new_proc(behavior, proc_io, terminal);

        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        let entry = inner
            .namespaces
            .get_mut(ns)
            .and_then(|n| n.tasks.get_mut(id))
            .ok_or_else(|| not_found("task", id))?;
        entry.execs.insert(request.exec_id, proc);
        Ok(())
    }

    async fn start_process(&self, ns: &str, id: &str, exec_id: &str) -> Result<u32> {
        self.start_proc(ns, id, Some(exec_id))
    }

    async fn wait_process(&self, ns: &str, id: &str, exec_id: &str) -> Result<ExitRecord> {
        self.wait_proc(ns, id, Some(exec_id)).await
    }

    async fn kill_process(&self, ns: &str, id: &str, exec_id: &str, signal: i32) -> Result<()> {
        self.signal_proc(ns, id, Some(exec_id), signal)
    }

    async fn delete_process(&self, ns: &str, id: &str, exec_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        let entry = inner
            .namespaces
            .get_mut(ns)
            .and_then(|n| n.tasks.get_mut(id))
            .ok_or_else(|| not_found("task", id))?;
        entry
            .execs
            .remove(exec_id)
            .map(|_| ())
            .ok_or_else(|| not_found("process", exec_id))
    }

    async fn pull_image(&self, ns: &str, request: PullRequest) -> Result<ImageRecord> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        let seed = inner.registry.get(&request.reference).cloned().ok_or_else(|| {
            CtlError::runtime(
                RpcCode::NotFound,
                format!(
                    "failed to resolve reference {:?}: {}: not found",
                    request.reference, request.endpoint.url
                ),
            )
        })?;
        let record = Self::store_image(&mut inner, ns, &request.reference, seed);
        drop(inner);
        self.publish(ns, "/images/create", &request.reference);
        Ok(record)
    }

    async fn push_image(&self, ns: &str, request: PushRequest) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        if !inner
            .namespaces
            .get(ns)
            .map(|n| n.images.contains_key(&request.reference))
            .unwrap_or(false)
        {
            return Err(not_found("image", &request.reference));
        }
        let seed = inner
            .seeds
            .get(&request.reference)
            .cloned()
            .unwrap_or_default();
        inner.registry.insert(request.reference, seed);
        Ok(())
    }

    async fn list_images(&self, ns: &str) -> Result<Vec<ImageRecord>> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        Ok(inner
            .namespaces
            .get(ns)
            .map(|n| n.images.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_image(&self, ns: &str, name: &str) -> Result<ImageRecord> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        inner
            .namespaces
            .get(ns)
            .and_then(|n| n.images.get(name))
            .cloned()
            .ok_or_else(|| not_found("image", name))
    }

    async fn commit_container(&self, ns: &str, request: CommitRequest) -> Result<ImageRecord> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        let base = inner
            .namespaces
            .get(ns)
            .and_then(|n| n.containers.get(&request.container_id))
            .map(|c| c.image.clone())
            .ok_or_else(|| not_found("container", &request.container_id))?;
        let seed = inner.seeds.get(&base).cloned().unwrap_or_default();
        Ok(Self::store_image(&mut inner, ns, &request.reference, seed))
    }

    async fn read_content(&self, ns: &str, digest: &str) -> Result<Vec<u8>> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        inner
            .namespaces
            .get(ns)
            .and_then(|n| n.content.get(digest))
            .map(|(data, _)| data.clone())
            .ok_or_else(|| not_found("content", digest))
    }

    async fn write_content(
        &self,
        ns: &str,
        data: Vec<u8>,
        labels: BTreeMap<String, String>,
    ) -> Result<Descriptor> {
        let digest = digest_of(&data);
        let size = data.len() as u64;
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        inner
            .namespaces
            .entry(ns.to_string())
            .or_default()
            .content
            .insert(digest.clone(), (data, labels));
        Ok(Descriptor {
            media_type: "application/octet-stream".to_string(),
            digest,
            size,
        })
    }

    async fn walk_content(&self, ns: &str) -> Result<Vec<ContentInfo>> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        Ok(inner
            .namespaces
            .get(ns)
            .map(|n| {
                n.content
                    .iter()
                    .map(|(digest, (data, labels))| ContentInfo {
                        digest: digest.clone(),
                        size: data.len() as u64,
                        labels: labels.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn prepare_snapshot(
        &self,
        ns: &str,
        snapshotter: &str,
        key: &str,
        image: &str,
    ) -> Result<Vec<RootfsMount>> {
        let dir = self.root.join(ns).join(snapshotter).join(key);
        let files = {
            let inner = self.inner.lock().map_err(|_| poisoned())?;
            if inner
                .namespaces
                .get(ns)
                .map(|n| n.snapshots.contains_key(&(snapshotter.to_string(), key.to_string())))
                .unwrap_or(false)
            {
                return Err(CtlError::runtime(
                    RpcCode::AlreadyExists,
                    format!("snapshot {}: already exists", key),
                ));
            }
            inner
                .seeds
                .get(image)
                .map(|s| s.files.clone())
                .unwrap_or_default()
        };

        std::fs::create_dir_all(&dir)?;
        for (path, contents) in files {
            let target = dir.join(path.trim_start_matches('/'));
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, contents)?;
        }

        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        inner
            .namespaces
            .entry(ns.to_string())
            .or_default()
            .snapshots
            .insert(
                (snapshotter.to_string(), key.to_string()),
                Snapshot {
                    dir: dir.clone(),
                    parent: image.to_string(),
                },
            );
        Ok(vec![bind_mount(&dir)])
    }

    async fn snapshot_mounts(
        &self,
        ns: &str,
        snapshotter: &str,
        key: &str,
    ) -> Result<Vec<RootfsMount>> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        inner
            .namespaces
            .get(ns)
            .and_then(|n| n.snapshots.get(&(snapshotter.to_string(), key.to_string())))
            .map(|s| vec![bind_mount(&s.dir)])
            .ok_or_else(|| not_found("snapshot", key))
    }

    async fn stat_snapshot(&self, ns: &str, snapshotter: &str, key: &str) -> Result<SnapshotInfo> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        inner
            .namespaces
            .get(ns)
            .and_then(|n| n.snapshots.get(&(snapshotter.to_string(), key.to_string())))
            .map(|s| SnapshotInfo {
                key: key.to_string(),
                parent: Some(s.parent.clone()),
                kind: "active".to_string(),
            })
            .ok_or_else(|| not_found("snapshot", key))
    }

    async fn snapshot_usage(
        &self,
        ns: &str,
        snapshotter: &str,
        key: &str,
    ) -> Result<SnapshotUsage> {
        let dir = {
            let inner = self.inner.lock().map_err(|_| poisoned())?;
            inner
                .namespaces
                .get(ns)
                .and_then(|n| n.snapshots.get(&(snapshotter.to_string(), key.to_string())))
                .map(|s| s.dir.clone())
                .ok_or_else(|| not_found("snapshot", key))?
        };
        let mut usage = SnapshotUsage::default();
        for entry in walkdir::WalkDir::new(&dir).into_iter().filter_map(|e| e.ok()) {
            usage.inodes += 1;
            if let Ok(meta) = entry.metadata() {
                if meta.is_file() {
                    usage.size += meta.len();
                }
            }
        }
        Ok(usage)
    }

    async fn remove_snapshot(&self, ns: &str, snapshotter: &str, key: &str) -> Result<()> {
        let dir = {
            let mut inner = self.inner.lock().map_err(|_| poisoned())?;
            inner
                .namespaces
                .get_mut(ns)
                .and_then(|n| n.snapshots.remove(&(snapshotter.to_string(), key.to_string())))
                .map(|s| s.dir)
                .ok_or_else(|| not_found("snapshot", key))?
        };
        let _ = std::fs::remove_dir_all(dir);
        Ok(())
    }

    async fn subscribe(&self, ns: &str) -> Result<BoxStream<'static, Result<RuntimeEvent>>> {
        let rx = self.events.subscribe();
        let ns = ns.to_string();
        let stream = futures::stream::unfold((rx, ns), |(mut rx, ns)| async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.namespace == ns => return Some((Ok(event), (rx, ns))),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

fn bind_mount(dir: &std::path::Path) -> RootfsMount {
    RootfsMount {
        typ: "bind".to_string(),
        source: dir.display().to_string(),
        options: vec!["rbind".to_string(), "rw".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::runtime::{ProcessBuilder, SpecBuilder};
    use tempfile::tempdir;

    fn record(id: &str, args: &[&str]) -> ContainerRecord {
        let process = ProcessBuilder::default()
            .args(args.iter().map(|s| s.to_string()).collect::<Vec<_>>())
            .build()
            .unwrap();
        ContainerRecord {
            id: id.to_string(),
            image: "docker.io/library/alpine:latest".to_string(),
            labels: BTreeMap::new(),
            spec: SpecBuilder::default().process(process).build().unwrap(),
            snapshotter: "overlayfs".to_string(),
            snapshot_key: id.to_string(),
            runtime: DEFAULT_OCI_RUNTIME.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_default_behavior_script() {
        let args = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(default_behavior(&args(&["echo", "hi"])), Behavior::print("hi\n"));
        assert_eq!(
            default_behavior(&args(&["sh", "-euxc", "exit 123"])),
            Behavior::exit(123)
        );
        assert_eq!(
            default_behavior(&args(&["/bin/sleep", "1h"])),
            Behavior::UntilSignal { ignore_term: false }
        );
        assert!(matches!(
            default_behavior(&args(&["nonexistent-cmd"])),
            Behavior::StartError(_)
        ));
    }

    #[tokio::test]
    async fn test_task_lifecycle_with_signal() {
        let temp = tempdir().unwrap();
        let runtime = MemoryRuntime::with_root(temp.path().to_path_buf());
        runtime
            .create_container("default", record("c1", &["sleep", "1h"]))
            .await
            .unwrap();

        let pid = runtime.create_task("default", "c1", TaskIo::Null).await.unwrap();
        runtime.start_task("default", "c1").await.unwrap();
        let status = runtime.task_status("default", "c1").await.unwrap();
        assert_eq!(status.status, TaskStatus::Running);
        assert_eq!(status.pid, pid);

        runtime.kill_task("default", "c1", 9, false).await.unwrap();
        let exit = runtime.wait_task("default", "c1").await.unwrap();
        assert_eq!(exit.status, 137);
        assert_eq!(exit.signal, Some(9));

        let deleted = runtime.delete_task("default", "c1").await.unwrap();
        assert_eq!(deleted.map(|e| e.status), Some(137));
        runtime.delete_container("default", "c1").await.unwrap();
        assert!(runtime
            .load_container("default", "c1")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_ignored_term_needs_kill() {
        let temp = tempdir().unwrap();
        let runtime = MemoryRuntime::with_root(temp.path().to_path_buf());
        runtime.set_script(|_| Behavior::UntilSignal { ignore_term: true });
        runtime
            .create_container("default", record("c1", &["server"]))
            .await
            .unwrap();
        runtime.create_task("default", "c1", TaskIo::Null).await.unwrap();
        runtime.start_task("default", "c1").await.unwrap();

        runtime.kill_task("default", "c1", 15, false).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(
            runtime.task_status("default", "c1").await.unwrap().status,
            TaskStatus::Running
        );
        runtime.kill_task("default", "c1", 9, false).await.unwrap();
        assert_eq!(runtime.wait_task("default", "c1").await.unwrap().status, 137);
    }

    #[tokio::test]
    async fn test_pull_and_content() {
        let temp = tempdir().unwrap();
        let runtime = MemoryRuntime::with_root(temp.path().to_path_buf());
        runtime.add_registry_image(
            "docker.io/library/alpine:latest",
            ImageSeed {
                config: serde_json::json!({ "Cmd": ["/bin/sh"] }),
                files: vec![("/etc/passwd".into(), "root:x:0:0:root:/root:/bin/sh\n".into())],
            },
        );

        let request = PullRequest {
            reference: "docker.io/library/alpine:latest".to_string(),
            source: ImageSource::Registry,
            platform: Platform::host(),
            endpoint: RegistryEndpoint {
                host: "docker.io".into(),
                url: "https://registry-1.docker.io".into(),
                plain_http: false,
                skip_verify: false,
            },
            credentials: None,
            unpack: Some("overlayfs".into()),
        };
        let image = runtime.pull_image("default", request).await.unwrap();
        let manifest = runtime
            .read_content("default", &image.target.digest)
            .await
            .unwrap();
        let manifest: serde_json::Value = serde_json::from_slice(&manifest).unwrap();
        assert_eq!(manifest["schemaVersion"], 2);

        let mounts = runtime
            .prepare_snapshot("default", "overlayfs", "k1", "docker.io/library/alpine:latest")
            .await
            .unwrap();
        let passwd = std::path::Path::new(&mounts[0].source).join("etc/passwd");
        assert!(passwd.exists());
    }

    #[tokio::test]
    async fn test_unknown_image_pull_is_not_found() {
        let runtime = MemoryRuntime::with_root(tempdir().unwrap().path().to_path_buf());
        let request = PullRequest {
            reference: "docker.io/library/missing:latest".to_string(),
            source: ImageSource::Registry,
            platform: Platform::host(),
            endpoint: RegistryEndpoint {
                host: "docker.io".into(),
                url: "https://registry-1.docker.io".into(),
                plain_http: false,
                skip_verify: false,
            },
            credentials: None,
            unpack: None,
        };
        let err = runtime.pull_image("default", request).await.unwrap_err();
        assert_eq!(err.rpc_code(), Some(RpcCode::NotFound));
    }
}
