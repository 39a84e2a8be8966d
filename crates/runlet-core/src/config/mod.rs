//! Configuration module for the execution engine
//!
//! Language profiles describe how each supported language is started,
//! bootstrapped, and fed code: the interpreter command, the wrap template
//! that attaches completion sentinels to an execution, and the
//! instrumentation flavor used for active-line tracking. Built-in profiles
//! cover the common interpreters and can be overridden from a YAML file.

pub mod defaults;
pub mod loader;
pub mod types;

pub use defaults::*;
pub use loader::*;
pub use types::*;

use crate::errors::EngineError;
use std::path::Path;

/// Load a languages configuration from a YAML file, merged over the
/// built-in profiles.
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<LanguagesConfig, EngineError> {
    let loaded = ConfigLoader::from_file(path).await?;
    Ok(loaded.merged_over_builtin())
}

/// The built-in language profiles.
pub fn default_config() -> LanguagesConfig {
    defaults::builtin_config()
}
