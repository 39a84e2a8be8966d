//! Built-in language profiles.
//!
//! These cover the interpreters the engine supports out of the box. Each
//! subprocess profile is tuned so that one execution becomes a single
//! stdin line: multi-line code is base64-embedded by the wrap templates,
//! which keeps interactive interpreters from misparsing blank lines and
//! keeps prompts out of the payload path.

use super::types::{
    InstrumentKind, KernelEndpoint, LanguageProfile, LanguagesConfig, SessionStrategy,
};

/// Suppresses the interactive prompt so stderr stays clean across
/// executions.
const PYTHON_BOOTSTRAP: &str = r#"import sys as __rl_sys
__rl_sys.ps1 = ""
__rl_sys.ps2 = ""
"#;

const PYTHON_WRAPPER: &str = r#"try:
    exec(compile(__import__("base64").b64decode("{code_b64}").decode("utf-8"), "<runlet>", "exec"), globals())
    print("{done}", flush=True)
except BaseException:
    __import__("traceback").print_exc()
    print("{error}", flush=True)
"#;

const PYTHON_PAYLOAD_LINE: &str =
    r#"exec(__import__("base64").b64decode("{payload_b64}").decode("utf-8"))"#;

const SHELL_WRAPPER: &str = r#"{code}
if [ $? -eq 0 ]; then echo '{done}'; else echo '{error}'; fi
"#;

const SHELL_PAYLOAD_LINE: &str = r#"eval "$(printf '%s' '{payload_b64}' | base64 -d)""#;

/// Line-oriented driver: each stdin line is one base64 payload. The
/// indirect eval keeps definitions in the global scope so state survives
/// across executions.
const NODE_DRIVER: &str = r#"const __rl = require("readline").createInterface({ input: process.stdin, terminal: false });
__rl.on("line", (line) => {
  const payload = line.trim();
  if (!payload) { return; }
  try {
    (0, eval)(Buffer.from(payload, "base64").toString("utf8"));
  } catch (err) {
    console.error((err && err.stack) || String(err));
  }
});
"#;

const JAVASCRIPT_WRAPPER: &str = r#"try {
  (0, eval)(Buffer.from("{code_b64}", "base64").toString("utf8"));
  console.log("{done}");
} catch (__rl_err) {
  console.error((__rl_err && __rl_err.stack) || String(__rl_err));
  console.log("{error}");
}
"#;

/// The profiles compiled into the engine.
pub fn builtin_config() -> LanguagesConfig {
    LanguagesConfig {
        languages: vec![
            LanguageProfile {
                name: "python".to_string(),
                aliases: vec!["python3".to_string(), "py".to_string()],
                strategy: SessionStrategy::Subprocess,
                instrument: InstrumentKind::Python,
                command: Some("python3".to_string()),
                args: vec!["-i".to_string(), "-q".to_string(), "-u".to_string()],
                bootstrap: Some(PYTHON_BOOTSTRAP.to_string()),
                wrapper: Some(PYTHON_WRAPPER.to_string()),
                payload_line: Some(PYTHON_PAYLOAD_LINE.to_string()),
                kernel: None,
            },
            LanguageProfile {
                name: "shell".to_string(),
                aliases: vec!["bash".to_string(), "sh".to_string(), "zsh".to_string()],
                strategy: SessionStrategy::Subprocess,
                instrument: InstrumentKind::Shell,
                command: Some("bash".to_string()),
                args: vec!["--noprofile".to_string(), "--norc".to_string()],
                bootstrap: None,
                wrapper: Some(SHELL_WRAPPER.to_string()),
                payload_line: Some(SHELL_PAYLOAD_LINE.to_string()),
                kernel: None,
            },
            LanguageProfile {
                name: "javascript".to_string(),
                aliases: vec!["js".to_string(), "node".to_string()],
                strategy: SessionStrategy::Subprocess,
                instrument: InstrumentKind::Javascript,
                command: Some("node".to_string()),
                args: vec!["-e".to_string(), NODE_DRIVER.to_string()],
                bootstrap: None,
                wrapper: Some(JAVASCRIPT_WRAPPER.to_string()),
                payload_line: Some("{payload_b64}".to_string()),
                kernel: None,
            },
            LanguageProfile {
                name: "python-kernel".to_string(),
                aliases: vec!["jupyter".to_string(), "ipython".to_string()],
                strategy: SessionStrategy::Kernel,
                instrument: InstrumentKind::Python,
                command: None,
                args: vec![],
                bootstrap: None,
                wrapper: None,
                payload_line: None,
                kernel: Some(KernelEndpoint {
                    base_url: "http://127.0.0.1:8888".to_string(),
                    kernel_name: "python3".to_string(),
                    token: None,
                }),
            },
        ],
    }
}
