//! The public entry point for running code.
//!
//! `ExecutionController::run` turns a `(language, code)` pair into a
//! cancellable stream of chunks. An optional confirmation handler gates
//! execution: the stream first carries a confirmation chunk and nothing is
//! spawned or submitted until the handler approves. Cancellation is
//! cooperative at the stream level and forceful at the process level: a
//! triggered token terminates the underlying session and the stream ends
//! immediately, with no further chunks for that execution.

use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use runlet_chunks::{Chunk, ConfirmationRequest};
use tokio_util::sync::CancellationToken;

use crate::assembler::ChunkAssembler;
use crate::config::InstrumentKind;
use crate::errors::EngineError;
use crate::instrument::instrument;
use crate::registry::SessionRegistry;
use crate::sessions::LanguageSession;

/// The chunk stream one execution produces.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Chunk> + Send>>;

/// The caller's answer to a confirmation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationResponse {
    /// Run the code.
    Approve,
    /// Do not run the code.
    Deny,
}

/// Decides whether a pending execution may proceed.
///
/// The handler is the bridge to whatever interface can ask a human (or a
/// policy) for approval; `run` suspends on it after emitting the
/// confirmation chunk and before touching any session.
#[async_trait]
pub trait ConfirmationHandler: Send + Sync {
    async fn request_confirmation(
        &self,
        request: &ConfirmationRequest,
    ) -> Result<ConfirmationResponse, EngineError>;
}

/// Confirmation handler with a fixed answer (useful for tests and for
/// headless deployments that pre-approve everything).
#[derive(Debug, Clone)]
pub struct DefaultConfirmationHandler {
    response: ConfirmationResponse,
}

impl DefaultConfirmationHandler {
    pub fn new() -> Self {
        Self {
            response: ConfirmationResponse::Approve,
        }
    }

    pub fn with_response(response: ConfirmationResponse) -> Self {
        Self { response }
    }
}

impl Default for DefaultConfirmationHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfirmationHandler for DefaultConfirmationHandler {
    async fn request_confirmation(
        &self,
        _request: &ConfirmationRequest,
    ) -> Result<ConfirmationResponse, EngineError> {
        Ok(self.response)
    }
}

/// The public entry point: resolves the language, gates on confirmation,
/// drives the session and assembler, and owns cancellation.
pub struct ExecutionController {
    registry: Arc<SessionRegistry>,
    confirmer: Option<Arc<dyn ConfirmationHandler>>,
}

impl ExecutionController {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            confirmer: None,
        }
    }

    /// Require confirmation before every execution.
    pub fn with_confirmation(mut self, handler: Arc<dyn ConfirmationHandler>) -> Self {
        self.confirmer = Some(handler);
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Run `code` in `language`, streaming chunks until the execution ends.
    ///
    /// Without a confirmation handler the session is created before this
    /// returns, so a missing runtime surfaces as a synchronous
    /// [`EngineError::ProcessSpawnFailed`]. Every other failure arrives as
    /// a terminal error chunk inside the stream, as does a spawn failure on
    /// the confirmation path, where nothing may be spawned before approval.
    pub async fn run(
        &self,
        language: &str,
        code: &str,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, EngineError> {
        let profile = match self.registry.profile(language) {
            Some(profile) => profile,
            None => {
                log::warn!("no session type registered for '{}'", language);
                return Ok(terminal_error(EngineError::LanguageNotSupported(
                    language.to_string(),
                )));
            }
        };

        if let Some(confirmer) = self.confirmer.clone() {
            let registry = Arc::clone(&self.registry);
            let canonical = profile.name.clone();
            let kind = profile.instrument;
            let code = code.to_string();

            return Ok(Box::pin(stream! {
                let request = ConfirmationRequest::new(canonical.clone(), code.clone());
                yield Chunk::confirmation(canonical.clone(), code.clone());

                let decision = tokio::select! {
                    _ = cancel.cancelled() => None,
                    decision = confirmer.request_confirmation(&request) => Some(decision),
                };

                match decision {
                    Some(Ok(ConfirmationResponse::Approve)) => {}
                    Some(Err(err)) => {
                        log::warn!("confirmation handler failed: {}", err);
                        for chunk in framed_error(EngineError::Cancelled) {
                            yield chunk;
                        }
                        return;
                    }
                    _ => {
                        log::info!("execution of {} code was not approved", canonical);
                        for chunk in framed_error(EngineError::Cancelled) {
                            yield chunk;
                        }
                        return;
                    }
                }

                match prepare(&registry, &canonical, kind, &code).await {
                    Ok((session, chunks)) => {
                        let mut driven = drive(session, chunks, cancel.clone());
                        while let Some(chunk) = driven.next().await {
                            yield chunk;
                        }
                    }
                    Err(err) => {
                        for chunk in framed_error(err) {
                            yield chunk;
                        }
                    }
                }
            }));
        }

        match prepare(&self.registry, &profile.name, profile.instrument, code).await {
            Ok((session, chunks)) => Ok(drive(session, chunks, cancel)),
            Err(err @ EngineError::ProcessSpawnFailed { .. }) => Err(err),
            Err(err) => Ok(terminal_error(err)),
        }
    }
}

/// Resolve the session, instrument the code, and start the execution.
async fn prepare(
    registry: &Arc<SessionRegistry>,
    language: &str,
    kind: InstrumentKind,
    code: &str,
) -> Result<(Arc<dyn LanguageSession>, ChunkStream), EngineError> {
    let session = registry.get_or_create(language).await?;
    let instrumented = instrument(kind, code, session.marker_token());
    let events = session.execute(&instrumented).await?;
    let chunks = ChunkAssembler::new(session.marker_token().clone(), language).into_chunks(events);
    Ok((session, chunks))
}

/// Forward chunks until the execution ends or the token fires; on
/// cancellation the session is terminated and the stream closes without
/// another chunk.
fn drive(
    session: Arc<dyn LanguageSession>,
    mut chunks: ChunkStream,
    cancel: CancellationToken,
) -> ChunkStream {
    Box::pin(stream! {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("cancelling execution in {}", session.language());
                    session.terminate().await;
                    break;
                }
                chunk = chunks.next() => match chunk {
                    Some(chunk) => yield chunk,
                    None => break,
                },
            }
        }
    })
}

/// A complete framed stream carrying nothing but a terminal error.
fn terminal_error(err: EngineError) -> ChunkStream {
    Box::pin(futures_util::stream::iter(framed_error(err)))
}

fn framed_error(err: EngineError) -> Vec<Chunk> {
    vec![
        Chunk::console_start(),
        Chunk::error(err.chunk_text()),
        Chunk::console_end(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LanguageProfile, LanguagesConfig, SessionStrategy};
    use crate::markers::MarkerToken;
    use crate::output::{OutputEvent, StreamOrigin};
    use crate::sessions::{OutputEvents, SessionState};
    use runlet_chunks::{ChunkContent, ChunkType};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedSender;
    use tokio::sync::Mutex;

    /// Scripted session: emits a fixed set of events per execution, or
    /// holds the stream open until terminated.
    struct ScriptedSession {
        token: MarkerToken,
        script: Vec<String>,
        hold_open: bool,
        busy: bool,
        executions: AtomicU64,
        terminated: AtomicBool,
        open_tx: Mutex<Option<UnboundedSender<OutputEvent>>>,
    }

    impl ScriptedSession {
        fn new(script: Vec<&str>) -> Arc<Self> {
            Arc::new(Self {
                token: MarkerToken::fixed("tok"),
                script: script.into_iter().map(String::from).collect(),
                hold_open: false,
                busy: false,
                executions: AtomicU64::new(0),
                terminated: AtomicBool::new(false),
                open_tx: Mutex::new(None),
            })
        }

        fn held_open() -> Arc<Self> {
            Arc::new(Self {
                token: MarkerToken::fixed("tok"),
                script: vec![],
                hold_open: true,
                busy: false,
                executions: AtomicU64::new(0),
                terminated: AtomicBool::new(false),
                open_tx: Mutex::new(None),
            })
        }

        fn busy() -> Arc<Self> {
            Arc::new(Self {
                token: MarkerToken::fixed("tok"),
                script: vec![],
                hold_open: false,
                busy: true,
                executions: AtomicU64::new(0),
                terminated: AtomicBool::new(false),
                open_tx: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl LanguageSession for ScriptedSession {
        fn language(&self) -> &str {
            "mock"
        }

        fn state(&self) -> SessionState {
            if self.terminated.load(Ordering::SeqCst) {
                SessionState::Terminated
            } else {
                SessionState::Idle
            }
        }

        fn execution_count(&self) -> u64 {
            self.executions.load(Ordering::SeqCst)
        }

        fn marker_token(&self) -> &MarkerToken {
            &self.token
        }

        async fn execute(&self, _code: &str) -> Result<OutputEvents, EngineError> {
            if self.busy {
                return Err(EngineError::SessionBusy {
                    language: "mock".to_string(),
                });
            }
            self.executions.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            for fragment in &self.script {
                let _ = tx.send(OutputEvent::new(StreamOrigin::Stdout, fragment.clone()));
            }
            if self.hold_open {
                *self.open_tx.lock().await = Some(tx);
            } else {
                let _ = tx.send(OutputEvent::new(
                    StreamOrigin::Stdout,
                    format!("{}\n", self.token.done()),
                ));
            }
            Ok(rx)
        }

        async fn terminate(&self) {
            self.terminated.store(true, Ordering::SeqCst);
            // Dropping the sender closes any in-flight stream.
            self.open_tx.lock().await.take();
        }
    }

    fn mock_config() -> LanguagesConfig {
        LanguagesConfig {
            languages: vec![LanguageProfile {
                name: "mock".to_string(),
                aliases: vec![],
                strategy: SessionStrategy::Subprocess,
                instrument: InstrumentKind::None,
                command: Some("true".to_string()),
                args: vec![],
                bootstrap: None,
                wrapper: Some("{code}".to_string()),
                payload_line: Some("{payload_b64}".to_string()),
                kernel: None,
            }],
        }
    }

    async fn controller_with(session: Arc<ScriptedSession>) -> ExecutionController {
        let registry = Arc::new(SessionRegistry::new(mock_config()));
        registry.install("mock", session).await;
        ExecutionController::new(registry)
    }

    async fn collect(stream: ChunkStream) -> Vec<Chunk> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_scenario_loop_prints_in_order() {
        // The spec scenario: a three-iteration loop yields alternating
        // active-line and console chunks inside one frame.
        let session = ScriptedSession::new(vec![
            "##tok:line:1##\n0\n",
            "##tok:line:1##\n1\n",
            "##tok:line:1##\n2\n",
        ]);
        let controller = controller_with(session).await;

        let stream = controller
            .run("mock", "for i in range(3): print(i)", CancellationToken::new())
            .await
            .unwrap();
        let chunks = collect(stream).await;

        assert!(chunks.first().unwrap().is_start());
        assert!(chunks.last().unwrap().is_end());

        let kinds: Vec<ChunkType> = chunks
            .iter()
            .skip(1)
            .take(chunks.len() - 2)
            .map(|c| c.chunk_type)
            .collect();
        assert_eq!(
            kinds,
            vec![
                ChunkType::ActiveLine,
                ChunkType::Console,
                ChunkType::ActiveLine,
                ChunkType::Console,
                ChunkType::ActiveLine,
                ChunkType::Console,
            ]
        );

        let text: String = chunks
            .iter()
            .filter(|c| c.chunk_type == ChunkType::Console && !c.is_start() && !c.is_end())
            .filter_map(|c| c.content.as_text())
            .collect();
        assert_eq!(text, "0\n1\n2\n");
    }

    #[tokio::test]
    async fn test_unknown_language_yields_terminal_error_chunk() {
        let controller =
            ExecutionController::new(Arc::new(SessionRegistry::new(mock_config())));
        let stream = controller
            .run("cobol", "DISPLAY 'HI'", CancellationToken::new())
            .await
            .unwrap();
        let chunks = collect(stream).await;

        assert!(chunks.first().unwrap().is_start());
        assert!(chunks.last().unwrap().is_end());
        let error = chunks
            .iter()
            .find(|c| c.chunk_type == ChunkType::Error)
            .expect("expected an error chunk");
        assert!(error.content.as_text().unwrap().contains("cobol"));
    }

    #[tokio::test]
    async fn test_busy_session_yields_terminal_error_chunk() {
        let controller = controller_with(ScriptedSession::busy()).await;
        let stream = controller
            .run("mock", "x = 1", CancellationToken::new())
            .await
            .unwrap();
        let chunks = collect(stream).await;

        let error = chunks
            .iter()
            .find(|c| c.chunk_type == ChunkType::Error)
            .expect("expected an error chunk");
        assert!(error.content.as_text().unwrap().contains("still executing"));
    }

    #[tokio::test]
    async fn test_cancellation_terminates_session_and_ends_stream() {
        let session = ScriptedSession::held_open();
        let controller = controller_with(session.clone()).await;
        let cancel = CancellationToken::new();

        let mut stream = controller.run("mock", "while True: pass", cancel.clone()).await.unwrap();

        cancel.cancel();
        let ended = tokio::time::timeout(Duration::from_secs(5), async {
            while stream.next().await.is_some() {}
        })
        .await;

        assert!(ended.is_ok(), "stream must end promptly after cancellation");
        assert!(session.terminated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_denied_confirmation_never_executes() {
        let session = ScriptedSession::new(vec!["should not appear\n"]);
        let registry = Arc::new(SessionRegistry::new(mock_config()));
        registry.install("mock", session.clone()).await;
        let controller = ExecutionController::new(registry).with_confirmation(Arc::new(
            DefaultConfirmationHandler::with_response(ConfirmationResponse::Deny),
        ));

        let stream = controller
            .run("mock", "x = 1", CancellationToken::new())
            .await
            .unwrap();
        let chunks = collect(stream).await;

        assert_eq!(chunks[0].chunk_type, ChunkType::Confirmation);
        match &chunks[0].content {
            ChunkContent::Confirmation(request) => {
                assert_eq!(request.language, "mock");
                assert_eq!(request.code, "x = 1");
            }
            _ => panic!("expected structured confirmation content"),
        }
        assert!(chunks
            .iter()
            .any(|c| c.chunk_type == ChunkType::Error
                && c.content.as_text().is_some_and(|t| t.contains("cancelled"))));
        assert_eq!(session.execution_count(), 0, "code must never reach the session");
    }

    #[tokio::test]
    async fn test_approved_confirmation_executes() {
        let session = ScriptedSession::new(vec!["approved output\n"]);
        let registry = Arc::new(SessionRegistry::new(mock_config()));
        registry.install("mock", session.clone()).await;
        let controller = ExecutionController::new(registry)
            .with_confirmation(Arc::new(DefaultConfirmationHandler::new()));

        let stream = controller
            .run("mock", "x = 1", CancellationToken::new())
            .await
            .unwrap();
        let chunks = collect(stream).await;

        assert_eq!(chunks[0].chunk_type, ChunkType::Confirmation);
        assert!(chunks
            .iter()
            .any(|c| c.content.as_text().is_some_and(|t| t.contains("approved output"))));
        assert_eq!(session.execution_count(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_during_confirmation_spawns_nothing() {
        let session = ScriptedSession::new(vec!["nope\n"]);
        let registry = Arc::new(SessionRegistry::new(mock_config()));
        registry.install("mock", session.clone()).await;

        /// Handler that never answers, standing in for a human who walked
        /// away.
        struct NeverAnswers;

        #[async_trait]
        impl ConfirmationHandler for NeverAnswers {
            async fn request_confirmation(
                &self,
                _request: &ConfirmationRequest,
            ) -> Result<ConfirmationResponse, EngineError> {
                std::future::pending().await
            }
        }

        let controller =
            ExecutionController::new(registry).with_confirmation(Arc::new(NeverAnswers));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stream = controller.run("mock", "x = 1", cancel).await.unwrap();
        let chunks = collect(stream).await;

        assert_eq!(chunks[0].chunk_type, ChunkType::Confirmation);
        assert_eq!(session.execution_count(), 0);
    }
}
