//! Turn execution: spawn one provider process, normalize its output into
//! buffered response increments, correlate it to a session, and guarantee
//! teardown (buffer flush, registry removal, artifact cleanup, terminal
//! `complete` event) on every path out.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use relay_protocol::NormalizedEvent;
use relay_protocol::Role;
use relay_protocol::TurnEvent;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncReadExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tokio::time::Instant;
use tokio::time::sleep_until;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::artifacts;
use crate::artifacts::StagedArtifacts;
use crate::buffer::ResponseBuffer;
use crate::config;
use crate::error::RelayErr;
use crate::error::Result;
use crate::normalize::normalizer_for;
use crate::providers;
use crate::providers::ArgContext;
use crate::providers::ProviderProfile;
use crate::registry::ProcessHandle;
use crate::registry::ProcessRegistry;
use crate::session::SessionStore;
use crate::sink::EventSink;

/// How long an aborted process gets to exit after SIGTERM before it is
/// killed outright.
pub const ABORT_GRACE: Duration = Duration::from_secs(2);

const STDOUT_CHUNK: usize = 8192;

/// stderr lines carrying any of these markers are benign runtime chatter
/// and never surface to the caller.
const STDERR_NOISE: [&str; 5] = [
    "[DEPRECATED]",
    "DeprecationWarning",
    "punycode",
    "Loaded cached credentials",
    "ExperimentalWarning",
];

#[derive(Debug, Clone, Default)]
pub struct TurnSettings {
    pub model: Option<String>,
    pub skip_permissions: bool,
    pub allowed_tools: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// Provider tag, e.g. `claude`.
    pub provider: String,
    /// Known session to continue; `None` starts a fresh one whose record
    /// is created only once the process produces output.
    pub session_id: Option<String>,
    pub prompt: String,
    /// Base64 image payloads, staged to disk for providers that take
    /// attachments as file paths.
    pub images: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub settings: TurnSettings,
}

struct TurnState {
    session_id: Option<String>,
    registry_key: String,
    assistant_text: String,
    stderr: String,
}

pub struct Orchestrator {
    registry: ProcessRegistry,
    store: Arc<dyn SessionStore>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            registry: ProcessRegistry::new(),
            store,
        }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Cancel the live turn for `session_id`, if any. The running
    /// `run_turn` observes the cancellation and tears the process down.
    pub fn abort(&self, session_id: &str) -> bool {
        self.registry.abort(session_id)
    }

    pub async fn run_turn(&self, request: TurnRequest, sink: Arc<dyn EventSink>) -> Result<()> {
        let is_new_session = request.session_id.is_none();
        let profile = match providers::resolve(&request.provider) {
            Ok(profile) => profile,
            Err(err) => return fail(&sink, err, is_new_session),
        };

        if let Some(session_id) = &request.session_id
            && self.registry.get(session_id).is_some()
        {
            let err = RelayErr::TurnAlreadyActive {
                session_id: session_id.clone(),
            };
            return fail(&sink, err, is_new_session);
        }

        let (prompt, external_id) = self.resolve_context(profile, &request);

        let cwd = resolve_cwd(request.cwd.clone());
        let staged = stage_request_images(profile, &cwd, &request.images);

        let args = providers::build_args(
            profile,
            &ArgContext {
                settings: &request.settings,
                prompt: &prompt,
                external_session_id: external_id.as_deref(),
                image_paths: &staged.files,
                cwd: &cwd,
            },
        );

        let program = profile.executable();
        debug!(program = %program.display(), provider = %profile.kind, "spawning");
        let mut command = Command::new(&program);
        command
            .args(&args)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group: teardown signals must reach anything the
        // provider forks, or a grandchild keeps the stdout pipe open past
        // the kill.
        #[cfg(unix)]
        command.process_group(0);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                artifacts::cleanup(&staged);
                let err = RelayErr::Spawn {
                    program: program.display().to_string(),
                    source,
                };
                return fail(&sink, err, is_new_session);
            }
        };

        let registry_key = request
            .session_id
            .clone()
            .unwrap_or_else(|| format!("pending-{}", Utc::now().timestamp_millis()));
        let mut handle = ProcessHandle::new(registry_key.clone(), child.id());
        handle.staged_files = staged.files.clone();
        handle.staging_dir = staged.dir.clone();
        let cancel = handle.cancel.clone();
        let received_output = Arc::clone(&handle.received_output);
        if !self.registry.try_insert(handle) {
            kill_now(&mut child);
            artifacts::cleanup(&staged);
            let err = RelayErr::TurnAlreadyActive {
                session_id: registry_key,
            };
            return fail(&sink, err, is_new_session);
        }

        // An existing session persists the user turn up front; a fresh one
        // defers everything until first output so a silent failure never
        // leaves an orphaned session behind.
        if let Some(session_id) = &request.session_id {
            if let Err(err) = self.store.create_session(session_id, profile.kind.as_str(), &cwd) {
                warn!("failed to ensure session record: {err}");
            }
            if let Err(err) = self.store.add_message(session_id, Role::User, &request.prompt) {
                warn!("failed to persist user turn: {err}");
            }
        }

        let state = Arc::new(Mutex::new(TurnState {
            session_id: request.session_id.clone(),
            registry_key: registry_key.clone(),
            assistant_text: String::new(),
            stderr: String::new(),
        }));

        let buffer = {
            let sink = Arc::clone(&sink);
            Arc::new(ResponseBuffer::new(config::buffer_params(), move |inc| {
                sink.deliver(TurnEvent::Response {
                    content: inc.text,
                    is_final: inc.is_final,
                });
            }))
        };

        let stdout_task = self.spawn_stdout_task(
            &mut child,
            profile,
            &request,
            cwd.clone(),
            Arc::clone(&state),
            Arc::clone(&buffer),
            Arc::clone(&sink),
            Arc::clone(&received_output),
        );
        let stderr_task = spawn_stderr_task(&mut child, profile, Arc::clone(&state), Arc::clone(&sink));

        let wait_outcome = supervise(
            &mut child,
            profile,
            &cancel,
            &received_output,
        )
        .await;

        drain_readers(stdout_task, stderr_task).await;

        // Non-streaming providers flush their whole response once here.
        if !profile.streams_live {
            let text = {
                let guard = lock(&state);
                guard.assistant_text.clone()
            };
            buffer.process_data(&text);
        }
        buffer.force_flush();
        buffer.dispose();

        let (final_session_id, final_key, assistant_text, stderr_text) = {
            let guard = lock(&state);
            (
                guard.session_id.clone(),
                guard.registry_key.clone(),
                guard.assistant_text.clone(),
                guard.stderr.clone(),
            )
        };
        self.registry.remove(&final_key);

        if let Some(session_id) = &final_session_id
            && !assistant_text.is_empty()
            && let Err(err) = self.store.add_message(session_id, Role::Assistant, &assistant_text)
        {
            warn!("failed to persist assistant turn: {err}");
        }

        artifacts::cleanup(&staged);

        match wait_outcome {
            WaitOutcome::TimedOut { waited } => {
                let err = RelayErr::Timeout {
                    provider: profile.kind,
                    waited,
                };
                fail(&sink, err, is_new_session)
            }
            WaitOutcome::Aborted { exit_code } => {
                info!(session = ?final_session_id, exit_code, "turn aborted");
                sink.deliver(TurnEvent::Complete {
                    exit_code,
                    is_new_session,
                });
                Ok(())
            }
            WaitOutcome::Exited { exit_code } if exit_code == 0 => {
                sink.deliver(TurnEvent::Complete {
                    exit_code: 0,
                    is_new_session,
                });
                Ok(())
            }
            WaitOutcome::Exited { exit_code } => {
                let err = RelayErr::ProcessExit {
                    code: exit_code,
                    provider: profile.kind,
                    stderr: stderr_text,
                };
                fail(&sink, err, is_new_session)
            }
            WaitOutcome::WaitFailed(err) => fail(&sink, RelayErr::Io(err), is_new_session),
        }
    }

    /// Decide what prompt the process sees and whether a native resume id
    /// applies. Providers with native resume skip the replayed transcript.
    fn resolve_context(
        &self,
        profile: &ProviderProfile,
        request: &TurnRequest,
    ) -> (String, Option<String>) {
        let Some(session_id) = &request.session_id else {
            return (request.prompt.clone(), None);
        };
        let external_id = match self.store.external_session_id(session_id) {
            Ok(id) => id,
            Err(err) => {
                warn!("failed to read external session id: {err}");
                None
            }
        };
        if profile.native_resume && external_id.is_some() {
            return (request.prompt.clone(), external_id);
        }
        let prompt = match self.store.build_conversation_context(session_id) {
            Ok(Some(context)) => format!("{context}\n{}", request.prompt),
            Ok(None) => request.prompt.clone(),
            Err(err) => {
                warn!("failed to build conversation context: {err}");
                request.prompt.clone()
            }
        };
        (prompt, None)
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_stdout_task(
        &self,
        child: &mut Child,
        profile: &'static ProviderProfile,
        request: &TurnRequest,
        cwd: PathBuf,
        state: Arc<Mutex<TurnState>>,
        buffer: Arc<ResponseBuffer>,
        sink: Arc<dyn EventSink>,
        received_output: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let stdout = child.stdout.take();
        let store = Arc::clone(&self.store);
        let registry = self.registry.clone();
        let user_prompt = request.prompt.clone();
        tokio::spawn(async move {
            let Some(stdout) = stdout else {
                return;
            };
            let mut reader = BufReader::new(stdout);
            let mut chunk = [0u8; STDOUT_CHUNK];
            let mut normalizer = normalizer_for(profile.protocol);
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        received_output.store(true, Ordering::Relaxed);
                        bootstrap_session(&store, &registry, &state, &sink, profile, &user_prompt, &cwd);
                        handle_events(
                            normalizer.feed(&chunk[..n]),
                            profile,
                            &store,
                            &state,
                            &buffer,
                            &sink,
                        );
                    }
                    Err(err) => {
                        debug!("stdout read ended: {err}");
                        break;
                    }
                }
            }
            handle_events(normalizer.finish(), profile, &store, &state, &buffer, &sink);
        })
    }
}

enum WaitOutcome {
    Exited { exit_code: i32 },
    TimedOut { waited: Duration },
    Aborted { exit_code: i32 },
    WaitFailed(std::io::Error),
}

/// Drive the child to completion while watching the first-output guard
/// and the abort token. The guard fires only when no stdout has ever been
/// seen; an abort sends SIGTERM and escalates to SIGKILL after the grace
/// window.
async fn supervise(
    child: &mut Child,
    profile: &ProviderProfile,
    cancel: &tokio_util::sync::CancellationToken,
    received_output: &Arc<AtomicBool>,
) -> WaitOutcome {
    let timeout = config::first_output_timeout(profile.kind);
    let timeout_sleep = sleep_until(Instant::now() + timeout);
    tokio::pin!(timeout_sleep);
    let grace_sleep = sleep_until(Instant::now() + Duration::from_secs(86_400));
    tokio::pin!(grace_sleep);

    let mut timeout_armed = true;
    let mut timed_out = false;
    let mut aborted = false;
    let mut grace_armed = false;

    loop {
        tokio::select! {
            status = child.wait() => {
                return match status {
                    Ok(status) => {
                        let exit_code = exit_code_of(status);
                        if timed_out {
                            WaitOutcome::TimedOut { waited: timeout }
                        } else if aborted {
                            WaitOutcome::Aborted { exit_code }
                        } else {
                            WaitOutcome::Exited { exit_code }
                        }
                    }
                    Err(err) => WaitOutcome::WaitFailed(err),
                };
            }
            _ = &mut timeout_sleep, if timeout_armed => {
                timeout_armed = false;
                if !received_output.load(Ordering::Relaxed) {
                    warn!(provider = %profile.kind, ?timeout, "no output before deadline, killing");
                    timed_out = true;
                    kill_now(child);
                }
            }
            _ = cancel.cancelled(), if !aborted => {
                aborted = true;
                terminate(child);
                grace_sleep.as_mut().reset(Instant::now() + ABORT_GRACE);
                grace_armed = true;
            }
            _ = &mut grace_sleep, if grace_armed => {
                grace_armed = false;
                debug!("abort grace elapsed, killing");
                kill_now(child);
            }
        }
    }
}

/// How long to wait for the output readers after the child is gone.
/// They normally end at pipe EOF immediately, but a detached grandchild
/// that inherited the write end can hold the pipe open indefinitely.
const READER_DRAIN: Duration = Duration::from_secs(2);

/// Join both reader tasks, but never let an orphan holding the pipe gate
/// turn completion.
async fn drain_readers(
    mut stdout_task: tokio::task::JoinHandle<()>,
    mut stderr_task: tokio::task::JoinHandle<()>,
) {
    let both = async {
        let _ = (&mut stdout_task).await;
        let _ = (&mut stderr_task).await;
    };
    if tokio::time::timeout(READER_DRAIN, both).await.is_err() {
        warn!("output pipes still open after child exit, abandoning readers");
        stdout_task.abort();
        stderr_task.abort();
    }
}

#[allow(clippy::too_many_arguments)]
fn bootstrap_session(
    store: &Arc<dyn SessionStore>,
    registry: &ProcessRegistry,
    state: &Arc<Mutex<TurnState>>,
    sink: &Arc<dyn EventSink>,
    profile: &ProviderProfile,
    user_prompt: &str,
    cwd: &std::path::Path,
) {
    let mut guard = lock(state);
    if guard.session_id.is_some() {
        return;
    }
    let session_id = Uuid::new_v4().to_string();
    if let Err(err) = store.create_session(&session_id, profile.kind.as_str(), cwd) {
        warn!("failed to create session record: {err}");
        return;
    }
    if let Err(err) = store.add_message(&session_id, Role::User, user_prompt) {
        warn!("failed to persist user turn: {err}");
    }
    registry.rekey(&guard.registry_key, &session_id);
    guard.registry_key = session_id.clone();
    guard.session_id = Some(session_id.clone());
    drop(guard);
    info!(session = %session_id, "session created on first output");
    sink.deliver(TurnEvent::SessionCreated { session_id });
}

fn handle_events(
    events: Vec<NormalizedEvent>,
    profile: &ProviderProfile,
    store: &Arc<dyn SessionStore>,
    state: &Arc<Mutex<TurnState>>,
    buffer: &Arc<ResponseBuffer>,
    sink: &Arc<dyn EventSink>,
) {
    for event in events {
        match event {
            NormalizedEvent::Correlation { id } => {
                let session_id = lock(state).session_id.clone();
                if let Some(session_id) = session_id {
                    debug!(external = %id, "provider correlation id");
                    if let Err(err) = store.set_external_session_id(&session_id, &id) {
                        warn!("failed to record external session id: {err}");
                    }
                }
            }
            NormalizedEvent::Chunk { text } => {
                lock(state).assistant_text.push_str(&text);
                if profile.streams_live {
                    buffer.process_data(&text);
                }
            }
            NormalizedEvent::Error { message } => {
                sink.deliver(TurnEvent::Error { message });
            }
            NormalizedEvent::Ignored => {}
        }
    }
}

fn spawn_stderr_task(
    child: &mut Child,
    profile: &'static ProviderProfile,
    state: Arc<Mutex<TurnState>>,
    sink: Arc<dyn EventSink>,
) -> tokio::task::JoinHandle<()> {
    let stderr = child.stderr.take();
    tokio::spawn(async move {
        let Some(stderr) = stderr else {
            return;
        };
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            let mut guard = lock(&state);
            guard.stderr.push_str(&line);
            guard.stderr.push('\n');
            drop(guard);
            // Structured providers report real errors in stdout; their
            // stderr only surfaces on non-zero exit.
            if !profile.structured_stderr && !STDERR_NOISE.iter().any(|m| line.contains(m)) {
                sink.deliver(TurnEvent::Error { message: line });
            }
        }
    })
}

/// One error event, then the terminal complete with the synthetic code.
fn fail(sink: &Arc<dyn EventSink>, err: RelayErr, is_new_session: bool) -> Result<()> {
    sink.deliver(TurnEvent::Error {
        message: err.to_string(),
    });
    sink.deliver(TurnEvent::Complete {
        exit_code: err.synthetic_exit_code(),
        is_new_session,
    });
    Err(err)
}

fn stage_request_images(
    profile: &ProviderProfile,
    cwd: &std::path::Path,
    images: &[String],
) -> StagedArtifacts {
    if images.is_empty() {
        return StagedArtifacts::empty();
    }
    if !profile.supports_images {
        warn!(provider = %profile.kind, "provider does not accept image attachments, skipping");
        return StagedArtifacts::empty();
    }
    match artifacts::stage_images(cwd, profile.staging_dir_name, images) {
        Ok(staged) => staged,
        Err(err) => {
            warn!("image staging failed, continuing without attachments: {err}");
            StagedArtifacts::empty()
        }
    }
}

fn resolve_cwd(requested: Option<PathBuf>) -> PathBuf {
    let candidate = requested
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    if candidate.is_dir() {
        candidate
    } else {
        warn!(cwd = %candidate.display(), "working directory inaccessible, falling back to home");
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    }
}

#[cfg(unix)]
fn terminate(child: &Child) {
    if let Some(pid) = child.id() {
        // SIGTERM to the whole group first so the provider and anything
        // it forked can flush and exit cleanly.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn kill_now(child: &mut Child) {
    match child.id() {
        Some(pid) => unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        },
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn kill_now(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(1))
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

fn lock<'a>(state: &'a Arc<Mutex<TurnState>>) -> std::sync::MutexGuard<'a, TurnState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
