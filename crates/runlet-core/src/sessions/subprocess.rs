//! Subprocess-backed language sessions.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::config::LanguageProfile;
use crate::errors::EngineError;
use crate::markers::MarkerToken;
use crate::output::{spawn_reader, OutputEvent, StreamOrigin};

use super::{LanguageSession, OutputEvents, SessionState, StateCell};

/// A language session backed by one long-lived child process.
///
/// The interpreter is spawned once and fed over stdin; because the same
/// process serves every execution, language-level state (variables,
/// imports, definitions) survives between calls. Each execution is wrapped
/// by the profile's templates so that exactly one of the session's terminal
/// sentinels is printed when the code finishes, which is how the output
/// stream knows where an execution ends.
pub struct SubprocessSession {
    language: String,
    profile: LanguageProfile,
    token: MarkerToken,
    state: Arc<StateCell>,
    executions: AtomicU64,
    exited: Arc<AtomicBool>,
    stdin: Mutex<ChildStdin>,
    inbox: Arc<Mutex<UnboundedReceiver<OutputEvent>>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for SubprocessSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubprocessSession")
            .field("language", &self.language)
            .field("token", &self.token)
            .field("executions", &self.executions)
            .finish_non_exhaustive()
    }
}

impl SubprocessSession {
    /// Spawn the interpreter for `profile` and wire up its output pumps.
    pub async fn start(profile: LanguageProfile) -> Result<Self, EngineError> {
        profile.validate()?;
        let language = profile.name.clone();
        let command = profile.command.clone().ok_or_else(|| {
            EngineError::ConfigError(format!("language '{}' has no command", language))
        })?;

        let resolved = which::which(&command).map_err(|_| EngineError::ProcessSpawnFailed {
            language: language.clone(),
            message: format!("'{}' not found on PATH", command),
        })?;

        let mut child = Command::new(&resolved)
            .args(&profile.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| EngineError::ProcessSpawnFailed {
                language: language.clone(),
                message: err.to_string(),
            })?;

        log::info!(
            "spawned {} runtime ({}) pid={:?}",
            language,
            resolved.display(),
            child.id()
        );

        let mut stdin = take_handle(child.stdin.take(), &language, "stdin")?;
        let stdout = take_handle(child.stdout.take(), &language, "stdout")?;
        let stderr = take_handle(child.stderr.take(), &language, "stderr")?;

        let (tx, rx) = unbounded_channel();
        let mut tasks = vec![
            spawn_reader(stdout, StreamOrigin::Stdout, tx.clone()),
            spawn_reader(stderr, StreamOrigin::Stderr, tx),
        ];

        let token = MarkerToken::generate();

        if let Some(bootstrap) = &profile.bootstrap {
            let line = render_payload_line(&profile, bootstrap)?;
            write_line(&mut stdin, &line).await.map_err(|err| {
                EngineError::ProcessSpawnFailed {
                    language: language.clone(),
                    message: format!("failed to write bootstrap: {}", err),
                }
            })?;
        }

        let exited = Arc::new(AtomicBool::new(false));
        let (kill_tx, kill_rx) = oneshot::channel();
        tasks.push(spawn_monitor(child, kill_rx, exited.clone(), language.clone()));

        Ok(Self {
            language,
            profile,
            token,
            state: Arc::new(StateCell::new()),
            executions: AtomicU64::new(0),
            exited,
            stdin: Mutex::new(stdin),
            inbox: Arc::new(Mutex::new(rx)),
            kill_tx: Mutex::new(Some(kill_tx)),
            tasks,
        })
    }

    /// Render one execution into the single stdin line the runtime expects.
    fn render_execution(&self, code: &str) -> Result<String, EngineError> {
        let wrapper = self.profile.wrapper.as_deref().ok_or_else(|| {
            EngineError::ConfigError(format!("language '{}' has no wrapper", self.language))
        })?;
        let wrapped = wrapper
            .replace("{done}", &self.token.done())
            .replace("{error}", &self.token.error())
            .replace("{code_b64}", &BASE64.encode(code))
            .replace("{code}", code);
        render_payload_line(&self.profile, &wrapped)
    }
}

#[async_trait]
impl LanguageSession for SubprocessSession {
    fn language(&self) -> &str {
        &self.language
    }

    fn state(&self) -> SessionState {
        if self.exited.load(Ordering::SeqCst) {
            return SessionState::Terminated;
        }
        self.state.get()
    }

    fn execution_count(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }

    fn marker_token(&self) -> &MarkerToken {
        &self.token
    }

    async fn execute(&self, code: &str) -> Result<OutputEvents, EngineError> {
        if self.exited.load(Ordering::SeqCst) {
            self.state.set(SessionState::Terminated);
            return Err(EngineError::ProcessCrashed {
                language: self.language.clone(),
                message: "the runtime is no longer running".to_string(),
            });
        }

        self.state.begin().map_err(|blocked| match blocked {
            SessionState::Executing => EngineError::SessionBusy {
                language: self.language.clone(),
            },
            _ => EngineError::ProcessCrashed {
                language: self.language.clone(),
                message: "the session has been terminated".to_string(),
            },
        })?;

        self.executions.fetch_add(1, Ordering::SeqCst);

        let line = match self.render_execution(code) {
            Ok(line) => line,
            Err(err) => {
                self.state.finish();
                return Err(err);
            }
        };

        // Anything still queued belongs to a previous execution (stray
        // prompts, late writes); it must not leak into this one.
        {
            let mut inbox = self.inbox.lock().await;
            while inbox.try_recv().is_ok() {}
        }

        {
            let mut stdin = self.stdin.lock().await;
            if let Err(err) = write_line(&mut stdin, &line).await {
                self.state.set(SessionState::Terminated);
                return Err(EngineError::ProcessCrashed {
                    language: self.language.clone(),
                    message: format!("failed to submit code: {}", err),
                });
            }
        }

        let (exec_tx, exec_rx) = unbounded_channel();
        let inbox = Arc::clone(&self.inbox);
        let token = self.token.clone();
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let mut inbox = inbox.lock().await;
            let keep = token.max_len();
            let mut stdout_tail = String::new();
            let mut stderr_tail = String::new();
            let mut forwarding = true;

            loop {
                match inbox.recv().await {
                    Some(event) => {
                        let tail = match event.origin {
                            StreamOrigin::Stdout => &mut stdout_tail,
                            StreamOrigin::Stderr => &mut stderr_tail,
                        };
                        tail.push_str(&event.text);
                        let terminal = token.contains_terminal(tail);
                        trim_front(tail, keep);

                        if forwarding && exec_tx.send(event).is_err() {
                            // The consumer walked away; keep draining so the
                            // session returns to Idle once the runtime
                            // reaches its sentinel.
                            forwarding = false;
                        }
                        if terminal {
                            state.finish();
                            break;
                        }
                    }
                    None => {
                        // Readers are gone: the runtime died mid-execution.
                        state.set(SessionState::Terminated);
                        break;
                    }
                }
            }
        });

        Ok(exec_rx)
    }

    async fn terminate(&self) {
        self.state.set(SessionState::Terminated);
        if let Some(kill_tx) = self.kill_tx.lock().await.take() {
            let _ = kill_tx.send(());
        }
        log::info!("terminated {} session", self.language);
    }
}

impl Drop for SubprocessSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn take_handle<T>(handle: Option<T>, language: &str, name: &str) -> Result<T, EngineError> {
    handle.ok_or_else(|| EngineError::ProcessSpawnFailed {
        language: language.to_string(),
        message: format!("child process has no {}", name),
    })
}

fn render_payload_line(profile: &LanguageProfile, payload: &str) -> Result<String, EngineError> {
    let template = profile.payload_line.as_deref().ok_or_else(|| {
        EngineError::ConfigError(format!("language '{}' has no payload_line", profile.name))
    })?;
    Ok(template.replace("{payload_b64}", &BASE64.encode(payload)))
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Keep only the last `keep` bytes of `tail`, respecting char boundaries.
fn trim_front(tail: &mut String, keep: usize) {
    if tail.len() > keep {
        let mut cut = tail.len() - keep;
        while !tail.is_char_boundary(cut) {
            cut += 1;
        }
        tail.drain(..cut);
    }
}

fn spawn_monitor(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exited: Arc<AtomicBool>,
    language: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => match status {
                Ok(status) => log::info!("{} runtime exited: {}", language, status),
                Err(err) => log::warn!("{} runtime wait failed: {}", language, err),
            },
            _ = kill_rx => {
                if let Err(err) = child.start_kill() {
                    log::warn!("failed to kill {} runtime: {}", language, err);
                }
                let _ = child.wait().await;
                log::debug!("{} runtime killed", language);
            }
        }
        exited.store(true, Ordering::SeqCst);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defaults::builtin_config;
    use std::time::Duration;
    use tokio::time::timeout;

    fn shell_profile() -> LanguageProfile {
        builtin_config()
            .resolve("shell")
            .expect("builtin shell profile")
            .clone()
    }

    async fn drain_text(mut events: OutputEvents) -> String {
        let mut text = String::new();
        while let Ok(Some(event)) = timeout(Duration::from_secs(10), events.recv()).await {
            text.push_str(&event.text);
        }
        text
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_streams_until_done_sentinel() {
        let session = SubprocessSession::start(shell_profile()).await.unwrap();
        let events = session.execute("echo hello").await.unwrap();
        let text = drain_text(events).await;

        assert!(text.contains("hello"));
        assert!(text.contains(&session.marker_token().done()));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.execution_count(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_state_persists_across_executions() {
        let session = SubprocessSession::start(shell_profile()).await.unwrap();

        let events = session.execute("GREETING=persisted").await.unwrap();
        drain_text(events).await;

        let events = session.execute("echo $GREETING").await.unwrap();
        let text = drain_text(events).await;
        assert!(text.contains("persisted"));
        assert_eq!(session.execution_count(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_command_yields_error_sentinel() {
        let session = SubprocessSession::start(shell_profile()).await.unwrap();
        let events = session.execute("false").await.unwrap();
        let text = drain_text(events).await;

        assert!(text.contains(&session.marker_token().error()));
        assert!(!text.contains(&session.marker_token().done()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_second_execute_while_busy_is_rejected() {
        let session = SubprocessSession::start(shell_profile()).await.unwrap();
        let _events = session.execute("sleep 5").await.unwrap();

        let err = session.execute("echo too-soon").await.unwrap_err();
        assert!(matches!(err, EngineError::SessionBusy { .. }));

        session.terminate().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_stops_the_stream() {
        let session = SubprocessSession::start(shell_profile()).await.unwrap();
        let mut events = session.execute("sleep 30; echo never").await.unwrap();

        session.terminate().await;
        assert_eq!(session.state(), SessionState::Terminated);

        // The stream closes without the execution's output.
        let mut text = String::new();
        while let Ok(Some(event)) = timeout(Duration::from_secs(10), events.recv()).await {
            text.push_str(&event.text);
        }
        assert!(!text.contains("never"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runtime_exit_marks_session_terminated() {
        let session = SubprocessSession::start(shell_profile()).await.unwrap();
        let events = session.execute("exit 0").await.unwrap();
        drain_text(events).await;

        // The monitor needs a moment to reap the child.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(session.state(), SessionState::Terminated);

        let err = session.execute("echo after").await.unwrap_err();
        assert!(matches!(err, EngineError::ProcessCrashed { .. }));
    }

    #[test]
    fn test_trim_front_respects_char_boundaries() {
        let mut tail = "ééééé".to_string();
        trim_front(&mut tail, 3);
        assert!(tail.chars().all(|c| c == 'é'));
        assert!(tail.len() <= 4);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_interpreter_is_a_spawn_failure() {
        let mut profile = shell_profile();
        profile.command = Some("definitely-not-a-real-interpreter".to_string());
        let err = SubprocessSession::start(profile).await.unwrap_err();
        assert!(matches!(err, EngineError::ProcessSpawnFailed { .. }));
    }
}
