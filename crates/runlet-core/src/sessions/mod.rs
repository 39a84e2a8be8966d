//! Persistent per-language execution sessions.
//!
//! A session owns exactly one runtime (a long-lived child process or a
//! kernel connection) and keeps it alive across executions so
//! interpreter-level state (variables, imports, definitions) survives
//! between calls. Two strategies implement the same contract:
//! [`SubprocessSession`] feeds sentinel-wrapped code to a child's stdin and
//! reads until a terminal sentinel appears; [`KernelSession`] speaks a
//! message-based kernel protocol and translates kernel messages into the
//! same output-event shape, so downstream consumers never know which
//! strategy produced an execution.

pub mod kernel;
pub mod subprocess;

pub use kernel::KernelSession;
pub use subprocess::SubprocessSession;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::errors::EngineError;
use crate::markers::MarkerToken;
use crate::output::OutputEvent;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Ready to accept an execution.
    Idle,
    /// An execution is in flight; further requests are rejected.
    Executing,
    /// The runtime is gone; the session must be replaced, not reused.
    Terminated,
}

/// The pull-based stream of raw output for one execution.
///
/// The stream terminates when a terminal sentinel is read, the runtime
/// exits, or the session is terminated.
pub type OutputEvents = UnboundedReceiver<OutputEvent>;

/// One persistent execution context for a single language.
#[async_trait]
pub trait LanguageSession: Send + Sync {
    /// Canonical name of the language this session runs.
    fn language(&self) -> &str;

    /// Current lifecycle state.
    fn state(&self) -> SessionState;

    /// Number of executions submitted to this session.
    fn execution_count(&self) -> u64;

    /// The sentinel token instrumented code must use for this session.
    fn marker_token(&self) -> &MarkerToken;

    /// Submit instrumented code and stream its raw output.
    ///
    /// Rejects with [`EngineError::SessionBusy`] while a previous execution
    /// is still draining; at most one execution is in flight per session.
    async fn execute(&self, code: &str) -> Result<OutputEvents, EngineError>;

    /// Kill the runtime and mark the session [`SessionState::Terminated`].
    ///
    /// After this returns no further output events are emitted for any
    /// in-flight execution.
    async fn terminate(&self);
}

impl std::fmt::Debug for dyn LanguageSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanguageSession")
            .field("language", &self.language())
            .field("state", &self.state())
            .field("execution_count", &self.execution_count())
            .finish()
    }
}

/// Lock-free lifecycle cell shared between a session and its background
/// tasks.
pub(crate) struct StateCell(std::sync::atomic::AtomicU8);

const STATE_IDLE: u8 = 0;
const STATE_EXECUTING: u8 = 1;
const STATE_TERMINATED: u8 = 2;

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(std::sync::atomic::AtomicU8::new(STATE_IDLE))
    }

    pub(crate) fn get(&self) -> SessionState {
        match self.0.load(std::sync::atomic::Ordering::SeqCst) {
            STATE_EXECUTING => SessionState::Executing,
            STATE_TERMINATED => SessionState::Terminated,
            _ => SessionState::Idle,
        }
    }

    pub(crate) fn set(&self, state: SessionState) {
        let value = match state {
            SessionState::Idle => STATE_IDLE,
            SessionState::Executing => STATE_EXECUTING,
            SessionState::Terminated => STATE_TERMINATED,
        };
        self.0.store(value, std::sync::atomic::Ordering::SeqCst);
    }

    /// Transition `Idle -> Executing`; on failure returns the state that
    /// blocked the transition.
    pub(crate) fn begin(&self) -> Result<(), SessionState> {
        match self.0.compare_exchange(
            STATE_IDLE,
            STATE_EXECUTING,
            std::sync::atomic::Ordering::SeqCst,
            std::sync::atomic::Ordering::SeqCst,
        ) {
            Ok(_) => Ok(()),
            Err(STATE_EXECUTING) => Err(SessionState::Executing),
            Err(_) => Err(SessionState::Terminated),
        }
    }

    /// Transition `Executing -> Idle`, unless the session was terminated in
    /// the meantime.
    pub(crate) fn finish(&self) {
        let _ = self.0.compare_exchange(
            STATE_EXECUTING,
            STATE_IDLE,
            std::sync::atomic::Ordering::SeqCst,
            std::sync::atomic::Ordering::SeqCst,
        );
    }
}
