//! Configuration types for language profiles.

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// How a language's session talks to its runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStrategy {
    /// A long-lived child process fed code over stdin.
    Subprocess,
    /// A message-based channel to an interactive kernel.
    Kernel,
}

/// Which active-line instrumentor applies to a language's source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    Python,
    Shell,
    Javascript,
    /// No line tracking for this language.
    None,
}

/// Connection details for a kernel-protocol session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelEndpoint {
    /// Base URL of the kernel gateway, e.g. `http://127.0.0.1:8888`.
    pub base_url: String,
    /// Kernel spec name to launch, e.g. `python3`.
    pub kernel_name: String,
    /// Optional gateway authorization token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// One supported language.
///
/// Template placeholders: `wrapper` may use `{code}` (raw instrumented
/// source), `{code_b64}` (base64 of it), `{done}` and `{error}` (the
/// session's terminal sentinels); `payload_line` uses `{payload_b64}`
/// (base64 of the rendered wrapper) and must produce a single line safe to
/// write to the runtime's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageProfile {
    /// Canonical language name.
    pub name: String,
    /// Alternative names accepted by the registry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    pub strategy: SessionStrategy,
    pub instrument: InstrumentKind,
    /// Interpreter executable (subprocess strategy).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Source written to the runtime once, right after spawn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<String>,
    /// Per-execution wrap template attaching the terminal sentinels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapper: Option<String>,
    /// Template producing the single stdin line for one payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_line: Option<String>,
    /// Kernel connection details (kernel strategy).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<KernelEndpoint>,
}

impl LanguageProfile {
    /// Whether `name` names this profile, canonically or via alias.
    pub fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }

    /// Check that the profile carries what its strategy needs.
    pub fn validate(&self) -> Result<(), EngineError> {
        match self.strategy {
            SessionStrategy::Subprocess => {
                if self.command.is_none() {
                    return Err(EngineError::ConfigError(format!(
                        "language '{}' uses the subprocess strategy but has no command",
                        self.name
                    )));
                }
                if self.wrapper.is_none() || self.payload_line.is_none() {
                    return Err(EngineError::ConfigError(format!(
                        "language '{}' needs both a wrapper and a payload_line template",
                        self.name
                    )));
                }
            }
            SessionStrategy::Kernel => {
                if self.kernel.is_none() {
                    return Err(EngineError::ConfigError(format!(
                        "language '{}' uses the kernel strategy but has no kernel endpoint",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// The full set of supported languages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguagesConfig {
    #[serde(default)]
    pub languages: Vec<LanguageProfile>,
}

impl LanguagesConfig {
    /// Resolve a language name or alias to its profile.
    pub fn resolve(&self, name: &str) -> Option<&LanguageProfile> {
        self.languages.iter().find(|p| p.matches(name))
    }

    /// Canonical names of every configured language.
    pub fn names(&self) -> Vec<String> {
        self.languages.iter().map(|p| p.name.clone()).collect()
    }

    /// Overlay these profiles onto the built-in set; a profile with a
    /// built-in name replaces the built-in one.
    pub fn merged_over_builtin(self) -> Self {
        let mut merged = super::defaults::builtin_config();
        for profile in self.languages {
            match merged.languages.iter_mut().find(|p| p.name == profile.name) {
                Some(slot) => *slot = profile,
                None => merged.languages.push(profile),
            }
        }
        merged
    }

    /// Validate every profile.
    pub fn validate(&self) -> Result<(), EngineError> {
        for profile in &self.languages {
            profile.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subprocess_profile(name: &str) -> LanguageProfile {
        LanguageProfile {
            name: name.to_string(),
            aliases: vec![format!("{}-alias", name)],
            strategy: SessionStrategy::Subprocess,
            instrument: InstrumentKind::None,
            command: Some("cat".to_string()),
            args: vec![],
            bootstrap: None,
            wrapper: Some("{code}".to_string()),
            payload_line: Some("{payload_b64}".to_string()),
            kernel: None,
        }
    }

    #[test]
    fn test_resolve_by_name_and_alias() {
        let config = LanguagesConfig {
            languages: vec![subprocess_profile("demo")],
        };
        assert!(config.resolve("demo").is_some());
        assert!(config.resolve("DEMO").is_some());
        assert!(config.resolve("demo-alias").is_some());
        assert!(config.resolve("other").is_none());
    }

    #[test]
    fn test_validate_rejects_commandless_subprocess() {
        let mut profile = subprocess_profile("demo");
        profile.command = None;
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_kernel_without_endpoint() {
        let mut profile = subprocess_profile("demo");
        profile.strategy = SessionStrategy::Kernel;
        profile.kernel = None;
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_merge_replaces_builtin_by_name() {
        let mut custom = subprocess_profile("python");
        custom.command = Some("/opt/python/bin/python3".to_string());
        let merged = LanguagesConfig {
            languages: vec![custom],
        }
        .merged_over_builtin();

        let python = merged.resolve("python").unwrap();
        assert_eq!(python.command.as_deref(), Some("/opt/python/bin/python3"));
        // Untouched built-ins survive.
        assert!(merged.resolve("shell").is_some());
    }
}
