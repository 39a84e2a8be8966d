//! The per-conversation session registry.
//!
//! Exactly one live session exists per language. The outer map lock is held
//! only long enough to find or insert a language's slot; session creation
//! itself serializes on the per-language slot lock, so two concurrent
//! submissions for the same language cannot race-spawn two runtimes while
//! executions in different languages never contend with each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;

use crate::config::{LanguageProfile, LanguagesConfig, SessionStrategy};
use crate::errors::EngineError;
use crate::sessions::{KernelSession, LanguageSession, SessionState, SubprocessSession};

type Slot = Arc<Mutex<Option<Arc<dyn LanguageSession>>>>;

/// Maps language identifiers to their live sessions.
pub struct SessionRegistry {
    config: LanguagesConfig,
    slots: StdMutex<HashMap<String, Slot>>,
}

impl SessionRegistry {
    pub fn new(config: LanguagesConfig) -> Self {
        Self {
            config,
            slots: StdMutex::new(HashMap::new()),
        }
    }

    /// Canonical names of every configured language.
    pub fn languages(&self) -> Vec<String> {
        self.config.names()
    }

    /// The profile for a language name or alias, if configured.
    pub fn profile(&self, language: &str) -> Option<LanguageProfile> {
        self.config.resolve(language).cloned()
    }

    /// Get the live session for `language`, creating one if none exists or
    /// if the previous one has terminated. A crashed session is never
    /// revived in place; its replacement starts with fresh interpreter
    /// state.
    pub async fn get_or_create(
        &self,
        language: &str,
    ) -> Result<Arc<dyn LanguageSession>, EngineError> {
        let (canonical, profile) = match self.config.resolve(language) {
            Some(profile) => (profile.name.clone(), Some(profile.clone())),
            None => {
                // Installed sessions may serve languages outside the
                // configured set.
                if self.slot_exists(language) {
                    (language.to_string(), None)
                } else {
                    return Err(EngineError::LanguageNotSupported(language.to_string()));
                }
            }
        };

        let slot = self.slot(&canonical);
        let mut guard = slot.lock().await;

        if let Some(existing) = guard.as_ref() {
            if existing.state() != SessionState::Terminated {
                return Ok(Arc::clone(existing));
            }
            log::info!(
                "{} session terminated after {} executions; starting a fresh one",
                canonical,
                existing.execution_count()
            );
        }

        let profile = profile.ok_or_else(|| {
            EngineError::LanguageNotSupported(canonical.clone())
        })?;
        let session: Arc<dyn LanguageSession> = match profile.strategy {
            SessionStrategy::Subprocess => Arc::new(SubprocessSession::start(profile).await?),
            SessionStrategy::Kernel => Arc::new(KernelSession::start(profile).await?),
        };
        *guard = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Install a session for `language`, replacing any existing one.
    ///
    /// Lets embedding applications provide their own [`LanguageSession`]
    /// implementations without registering a profile.
    pub async fn install(&self, language: &str, session: Arc<dyn LanguageSession>) {
        let canonical = self
            .config
            .resolve(language)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| language.to_string());
        let slot = self.slot(&canonical);
        let mut guard = slot.lock().await;
        if let Some(previous) = guard.take() {
            previous.terminate().await;
        }
        *guard = Some(session);
    }

    /// Destroy and forget the session for `language`.
    pub async fn reset(&self, language: &str) {
        let canonical = self
            .config
            .resolve(language)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| language.to_string());
        let slot = match self.existing_slot(&canonical) {
            Some(slot) => slot,
            None => return,
        };
        let mut guard = slot.lock().await;
        if let Some(session) = guard.take() {
            session.terminate().await;
            log::info!("reset {} session", canonical);
        }
    }

    /// Destroy and forget every session.
    pub async fn reset_all(&self) {
        let slots: Vec<Slot> = {
            match self.slots.lock() {
                Ok(guard) => guard.values().cloned().collect(),
                Err(_) => return,
            }
        };
        for slot in slots {
            let mut guard = slot.lock().await;
            if let Some(session) = guard.take() {
                session.terminate().await;
            }
        }
        log::info!("reset all sessions");
    }

    fn slot(&self, canonical: &str) -> Slot {
        match self.slots.lock() {
            Ok(mut guard) => Arc::clone(
                guard
                    .entry(canonical.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(None))),
            ),
            Err(poisoned) => Arc::clone(
                poisoned
                    .into_inner()
                    .entry(canonical.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(None))),
            ),
        }
    }

    fn existing_slot(&self, canonical: &str) -> Option<Slot> {
        match self.slots.lock() {
            Ok(guard) => guard.get(canonical).cloned(),
            Err(poisoned) => poisoned.into_inner().get(canonical).cloned(),
        }
    }

    fn slot_exists(&self, language: &str) -> bool {
        self.existing_slot(language).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defaults::builtin_config;
    use crate::markers::MarkerToken;
    use crate::sessions::OutputEvents;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubSession {
        language: String,
        token: MarkerToken,
        terminated: AtomicBool,
    }

    impl StubSession {
        fn new(language: &str) -> Arc<Self> {
            Arc::new(Self {
                language: language.to_string(),
                token: MarkerToken::generate(),
                terminated: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl LanguageSession for StubSession {
        fn language(&self) -> &str {
            &self.language
        }

        fn state(&self) -> SessionState {
            if self.terminated.load(Ordering::SeqCst) {
                SessionState::Terminated
            } else {
                SessionState::Idle
            }
        }

        fn execution_count(&self) -> u64 {
            0
        }

        fn marker_token(&self) -> &MarkerToken {
            &self.token
        }

        async fn execute(&self, _code: &str) -> Result<OutputEvents, EngineError> {
            let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
            Ok(rx)
        }

        async fn terminate(&self) {
            self.terminated.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_unknown_language_is_rejected() {
        let registry = SessionRegistry::new(builtin_config());
        let err = registry.get_or_create("cobol").await.unwrap_err();
        assert!(matches!(err, EngineError::LanguageNotSupported(_)));
    }

    #[tokio::test]
    async fn test_installed_session_is_returned_for_aliases() {
        let registry = SessionRegistry::new(builtin_config());
        let stub = StubSession::new("shell");
        registry.install("bash", stub.clone()).await;

        let session = registry.get_or_create("sh").await.unwrap();
        assert_eq!(session.language(), "shell");
    }

    #[tokio::test]
    async fn test_terminated_session_is_replaced() {
        let registry = SessionRegistry::new(builtin_config());
        let stub = StubSession::new("shell");
        registry.install("shell", stub.clone()).await;

        let first = registry.get_or_create("shell").await.unwrap();
        first.terminate().await;

        // The stub is now Terminated, so the registry must build a real
        // replacement rather than hand it back.
        #[cfg(unix)]
        {
            let second = registry.get_or_create("shell").await.unwrap();
            assert_eq!(second.state(), SessionState::Idle);
        }
    }

    #[tokio::test]
    async fn test_reset_terminates_and_forgets() {
        let registry = SessionRegistry::new(builtin_config());
        let stub = StubSession::new("shell");
        registry.install("shell", stub.clone()).await;

        registry.reset("shell").await;
        assert!(stub.terminated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_reset_all_terminates_every_session() {
        let registry = SessionRegistry::new(builtin_config());
        let shell = StubSession::new("shell");
        let python = StubSession::new("python");
        registry.install("shell", shell.clone()).await;
        registry.install("python", python.clone()).await;

        registry.reset_all().await;
        assert!(shell.terminated.load(Ordering::SeqCst));
        assert!(python.terminated.load(Ordering::SeqCst));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crashed_runtime_gets_a_fresh_session_on_next_use() {
        let registry = SessionRegistry::new(builtin_config());

        let first = registry.get_or_create("shell").await.unwrap();
        let mut events = first.execute("exit 7").await.unwrap();
        while events.recv().await.is_some() {}
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(first.state(), SessionState::Terminated);

        let second = registry.get_or_create("shell").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.execution_count(), 0, "interpreter state starts over");

        let mut events = second.execute("echo alive").await.unwrap();
        let mut text = String::new();
        while let Some(event) = events.recv().await {
            text.push_str(&event.text);
        }
        assert!(text.contains("alive"));
    }

    #[tokio::test]
    async fn test_install_for_unconfigured_language() {
        let registry = SessionRegistry::new(builtin_config());
        let stub = StubSession::new("fortran");
        registry.install("fortran", stub).await;

        let session = registry.get_or_create("fortran").await.unwrap();
        assert_eq!(session.language(), "fortran");
    }
}
