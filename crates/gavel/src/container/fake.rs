//! Scripted in-memory runtime for unit tests
//!
//! Commands are matched by program name against a script of behaviors.
//! Unscripted commands exit 0 without output. File writes and memory counter
//! reads are recognized and emulated. Each container tracks a peak that
//! rises to the scripted footprint of every program started in it.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWrite, DuplexStream};
use tokio::sync::{mpsc, watch};

use crate::container::cgroup::PROBE_COMMAND;
use crate::container::environment::WRITE_SCRIPT;
use crate::container::{
    ContainerError, ContainerRuntime, EnvironmentSpec, ExecRequest, ExecSession, ExecStatus,
    OutputChunk,
};

/// Peak of a fresh container, in bytes
const BASELINE_PEAK_BYTES: u64 = 1024 * 1024;

/// Footprint of a program without a scripted one, in bytes
const DEFAULT_PEAK_BYTES: u64 = 8 * 1024 * 1024;

/// Exit code recorded for an exec killed with its container
const KILLED_EXIT_CODE: i64 = 137;

/// What a scripted command does
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Print the given output and exit with `code`
    Exit {
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        code: i64,
    },
    /// Copy stdin to stdout and exit 0
    Echo,
    /// Never exit on its own
    Hang,
    /// Sleep, then exit 0
    Sleep(Duration),
    /// Write stdout forever
    Flood,
    /// Get killed by the kernel for exceeding the memory ceiling
    OomKill,
    /// Close stdout and stderr, then keep running until killed
    Detach,
}

impl Behavior {
    pub fn stdout(text: &str) -> Self {
        Behavior::Exit {
            stdout: text.as_bytes().to_vec(),
            stderr: Vec::new(),
            code: 0,
        }
    }

    pub fn fail(stderr: &str, code: i64) -> Self {
        Behavior::Exit {
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
            code,
        }
    }
}

#[derive(Debug)]
enum Action {
    Write(String),
    Counters,
    Script(Behavior),
}

#[derive(Debug)]
struct FakeContainer {
    files: HashMap<String, Vec<u8>>,
    oom_kills: u64,
    peak: u64,
    kill: watch::Sender<bool>,
    kills: usize,
    removed: bool,
}

#[derive(Debug, Default)]
struct State {
    available: bool,
    images: HashSet<String>,
    image_checks: usize,
    pulls: Vec<String>,
    create_failures: u32,
    fail_removes: bool,
    names: Vec<String>,
    specs: Vec<EnvironmentSpec>,
    containers: HashMap<String, FakeContainer>,
    exec_status: HashMap<String, ExecStatus>,
    execs: Vec<ExecRequest>,
    scripts: Vec<(String, Behavior)>,
    peaks: Vec<(String, u64)>,
    raw_counters: Option<String>,
    next_id: u64,
}

/// In-memory [`ContainerRuntime`]
#[derive(Debug, Clone)]
pub struct FakeRuntime {
    state: Arc<Mutex<State>>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                available: true,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn with_image(self, image: &str) -> Self {
        self.lock().images.insert(image.to_owned());
        self
    }

    pub fn with_images<'a>(self, images: impl IntoIterator<Item = &'a str>) -> Self {
        self.lock()
            .images
            .extend(images.into_iter().map(str::to_owned));
        self
    }

    pub fn unavailable(self) -> Self {
        self.lock().available = false;
        self
    }

    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    pub fn script(self, program: &str, behavior: Behavior) -> Self {
        self.lock().scripts.push((program.to_owned(), behavior));
        self
    }

    /// Raise the container peak to `bytes` whenever `program` starts
    pub fn with_peak(self, program: &str, bytes: u64) -> Self {
        self.lock().peaks.push((program.to_owned(), bytes));
        self
    }

    /// Answer memory counter reads with `text` verbatim
    pub fn with_raw_counters(self, text: &str) -> Self {
        self.lock().raw_counters = Some(text.to_owned());
        self
    }

    pub fn fail_creates(self, count: u32) -> Self {
        self.lock().create_failures = count;
        self
    }

    pub fn fail_removes(self) -> Self {
        self.lock().fail_removes = true;
        self
    }

    pub fn created_names(&self) -> Vec<String> {
        self.lock().names.clone()
    }

    pub fn last_spec(&self) -> Option<EnvironmentSpec> {
        self.lock().specs.last().cloned()
    }

    pub fn image_checks(&self) -> usize {
        self.lock().image_checks
    }

    pub fn pulls(&self) -> Vec<String> {
        self.lock().pulls.clone()
    }

    pub fn live_containers(&self) -> usize {
        self.lock().containers.values().filter(|c| !c.removed).count()
    }

    pub fn kills(&self) -> usize {
        self.lock().containers.values().map(|c| c.kills).sum()
    }

    pub fn file(&self, id: &str, path: &str) -> Option<Vec<u8>> {
        self.lock().containers.get(id)?.files.get(path).cloned()
    }

    /// Every file written into any environment
    pub fn files(&self) -> Vec<(String, Vec<u8>)> {
        self.lock()
            .containers
            .values()
            .flat_map(|c| c.files.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect()
    }

    pub fn last_exec(&self) -> Option<ExecRequest> {
        self.lock().execs.last().cloned()
    }

    /// Programs of every exec except file writes and memory counter reads
    pub fn programs(&self) -> Vec<String> {
        self.lock()
            .execs
            .iter()
            .filter(|r| matches!(classify(r), Classified::User))
            .map(|r| r.program().to_owned())
            .collect()
    }

    /// Full commands of every exec except file writes and memory counter reads
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.lock()
            .execs
            .iter()
            .filter(|r| matches!(classify(r), Classified::User))
            .map(|r| r.command.clone())
            .collect()
    }

    fn ensure_available(state: &State) -> Result<(), ContainerError> {
        if state.available {
            Ok(())
        } else {
            Err(ContainerError::Unavailable("connection refused".to_owned()))
        }
    }
}

enum Classified {
    Write(String),
    Counters,
    User,
}

fn classify(request: &ExecRequest) -> Classified {
    let command = &request.command;
    if command.iter().map(String::as_str).eq(PROBE_COMMAND) {
        return Classified::Counters;
    }
    if command.len() == 5 && command[0] == "sh" && command[2] == WRITE_SCRIPT {
        return Classified::Write(command[4].clone());
    }
    Classified::User
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<(), ContainerError> {
        Self::ensure_available(&self.lock())
    }

    async fn image_present(&self, image: &str) -> Result<bool, ContainerError> {
        let mut state = self.lock();
        Self::ensure_available(&state)?;
        state.image_checks += 1;
        Ok(state.images.contains(image))
    }

    async fn pull_image(&self, image: &str) -> Result<(), ContainerError> {
        let mut state = self.lock();
        Self::ensure_available(&state)?;
        state.pulls.push(image.to_owned());
        state.images.insert(image.to_owned());
        Ok(())
    }

    async fn create(&self, spec: &EnvironmentSpec) -> Result<String, ContainerError> {
        let mut state = self.lock();
        Self::ensure_available(&state)?;
        state.names.push(spec.name().to_owned());
        state.specs.push(spec.clone());

        if state.create_failures > 0 {
            state.create_failures -= 1;
            return Err(ContainerError::Api {
                status: 500,
                message: "simulated daemon hiccup".to_owned(),
            });
        }
        if !state.images.contains(spec.image()) {
            return Err(ContainerError::ImageMissing(spec.image().to_owned()));
        }

        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        let (kill, _) = watch::channel(false);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                files: HashMap::new(),
                oom_kills: 0,
                peak: BASELINE_PEAK_BYTES,
                kill,
                kills: 0,
                removed: false,
            },
        );
        Ok(id)
    }

    async fn exec(&self, id: &str, request: ExecRequest) -> Result<ExecSession, ContainerError> {
        let (exec_id, action, kill_rx) = {
            let mut state = self.lock();
            Self::ensure_available(&state)?;

            let action = match classify(&request) {
                Classified::Write(path) => Action::Write(path),
                Classified::Counters => Action::Counters,
                Classified::User => Action::Script(
                    state
                        .scripts
                        .iter()
                        .find(|(program, _)| program == request.program())
                        .map(|(_, behavior)| behavior.clone())
                        .unwrap_or(Behavior::Exit {
                            stdout: Vec::new(),
                            stderr: Vec::new(),
                            code: 0,
                        }),
                ),
            };

            let footprint = match action {
                Action::Script(_) => Some(
                    state
                        .peaks
                        .iter()
                        .find(|(program, _)| program == request.program())
                        .map_or(DEFAULT_PEAK_BYTES, |(_, bytes)| *bytes),
                ),
                _ => None,
            };

            let container = state
                .containers
                .get_mut(id)
                .filter(|c| !c.removed)
                .ok_or_else(|| ContainerError::NotFound(id.to_owned()))?;
            let kill_rx = container.kill.subscribe();
            if *kill_rx.borrow() {
                return Err(ContainerError::Api {
                    status: 409,
                    message: "container is not running".to_owned(),
                });
            }
            if let Some(footprint) = footprint {
                container.peak = container.peak.max(footprint);
            }

            state.next_id += 1;
            let exec_id = format!("exec-{}", state.next_id);
            state.exec_status.insert(exec_id.clone(), ExecStatus::Running);
            state.execs.push(request.clone());
            (exec_id, action, kill_rx)
        };

        let (writer, reader) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(drive(
            Arc::clone(&self.state),
            id.to_owned(),
            exec_id.clone(),
            action,
            reader,
            tx,
            kill_rx,
        ));

        let output = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        })
        .boxed();

        let stdin: Option<Pin<Box<dyn AsyncWrite + Send>>> = if request.stdin {
            Some(Box::pin(writer))
        } else {
            None
        };

        Ok(ExecSession {
            exec_id,
            stdin,
            output,
        })
    }

    async fn exec_status(&self, exec_id: &str) -> Result<ExecStatus, ContainerError> {
        self.lock()
            .exec_status
            .get(exec_id)
            .copied()
            .ok_or_else(|| ContainerError::NotFound(exec_id.to_owned()))
    }

    async fn kill_all(&self, id: &str) -> Result<(), ContainerError> {
        let mut state = self.lock();
        Self::ensure_available(&state)?;
        if let Some(container) = state.containers.get_mut(id) {
            container.kills += 1;
            container.kill.send_replace(true);
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), ContainerError> {
        let mut state = self.lock();
        if state.fail_removes {
            return Err(ContainerError::Api {
                status: 500,
                message: "simulated removal failure".to_owned(),
            });
        }
        if let Some(container) = state.containers.get_mut(id) {
            container.removed = true;
            container.kill.send_replace(true);
        }
        Ok(())
    }
}

type Sender = mpsc::Sender<Result<OutputChunk, ContainerError>>;

async fn drive(
    state: Arc<Mutex<State>>,
    container_id: String,
    exec_id: String,
    action: Action,
    mut stdin: DuplexStream,
    tx: Sender,
    mut kill: watch::Receiver<bool>,
) {
    let work = {
        let state = Arc::clone(&state);
        async move {
            match action {
                Action::Write(path) => {
                    let mut content = Vec::new();
                    stdin.read_to_end(&mut content).await.ok()?;
                    let mut state = state.lock().unwrap();
                    state
                        .containers
                        .get_mut(&container_id)?
                        .files
                        .insert(path, content);
                    Some(0)
                }
                Action::Counters => {
                    let text = {
                        let state = state.lock().unwrap();
                        match &state.raw_counters {
                            Some(raw) => raw.clone(),
                            None => {
                                let (oom_kills, peak) = state
                                    .containers
                                    .get(&container_id)
                                    .map_or((0, BASELINE_PEAK_BYTES), |c| (c.oom_kills, c.peak));
                                format!("low 0\nhigh 0\nmax 0\noom 0\noom_kill {oom_kills}\npeak {peak}\n")
                            }
                        }
                    };
                    let _ = tx.send(Ok(OutputChunk::Stdout(text.into_bytes()))).await;
                    Some(0)
                }
                Action::Script(behavior) => {
                    run_behavior(behavior, &state, &container_id, &mut stdin, tx).await
                }
            }
        }
    };

    let code = tokio::select! {
        code = work => code,
        _ = kill.wait_for(|killed| *killed) => Some(KILLED_EXIT_CODE),
    };

    state
        .lock()
        .unwrap()
        .exec_status
        .insert(exec_id, ExecStatus::Exited(code));
}

async fn run_behavior(
    behavior: Behavior,
    state: &Mutex<State>,
    container_id: &str,
    stdin: &mut DuplexStream,
    tx: Sender,
) -> Option<i64> {
    match behavior {
        Behavior::Exit {
            stdout,
            stderr,
            code,
        } => {
            if !stdout.is_empty() {
                let _ = tx.send(Ok(OutputChunk::Stdout(stdout))).await;
            }
            if !stderr.is_empty() {
                let _ = tx.send(Ok(OutputChunk::Stderr(stderr))).await;
            }
            Some(code)
        }
        Behavior::Echo => {
            let mut input = Vec::new();
            stdin.read_to_end(&mut input).await.ok()?;
            if !input.is_empty() {
                let _ = tx.send(Ok(OutputChunk::Stdout(input))).await;
            }
            Some(0)
        }
        Behavior::Hang => std::future::pending().await,
        Behavior::Sleep(duration) => {
            tokio::time::sleep(duration).await;
            Some(0)
        }
        Behavior::Flood => loop {
            if tx.send(Ok(OutputChunk::Stdout(vec![b'y'; 4096]))).await.is_err() {
                return None;
            }
            tokio::task::yield_now().await;
        },
        Behavior::OomKill => {
            if let Some(container) = state.lock().unwrap().containers.get_mut(container_id) {
                container.oom_kills += 1;
            }
            Some(137)
        }
        Behavior::Detach => {
            drop(tx);
            std::future::pending().await
        }
    }
}
