//! Core engine for multi-language interactive code execution.
//!
//! This crate turns a block of submitted source code into a persistent,
//! resumable execution session, streams its output as discrete typed chunks,
//! tracks the currently-executing line without modifying the program's
//! semantics, and exposes cancellation. The architecture emphasizes faithful
//! streaming: every byte a program prints is accounted for, in order, and
//! control information (active lines, completion, errors) travels out-of-band
//! from program output.
//!
//! # Architecture Overview
//!
//! The engine is organized around several key subsystems:
//!
//! - **Language sessions**: One persistent child process or kernel connection
//!   per language, keeping interpreter state alive between executions
//! - **Output readers**: Background pumps draining child stdout/stderr into
//!   thread-safe queues without blocking the submission path
//! - **Active-line instrumentation**: Per-language source rewriting that
//!   announces each top-level line before it executes
//! - **Chunk assembly**: A state machine converting raw output fragments into
//!   the framed chunk stream consumed by orchestrators and transports
//! - **Execution control**: Confirmation gating, cooperative cancellation,
//!   and the error taxonomy surfaced to callers
//! - **Configuration system**: Built-in language profiles overridable from a
//!   YAML file

pub mod assembler;
pub mod config;
pub mod controller;
pub mod errors;
pub mod instrument;
pub mod markers;
pub mod output;
pub mod registry;
pub mod sessions;

pub use assembler::ChunkAssembler;
pub use config::{LanguageProfile, LanguagesConfig, SessionStrategy};
pub use controller::{
    ChunkStream, ConfirmationHandler, ConfirmationResponse, DefaultConfirmationHandler,
    ExecutionController,
};
pub use errors::EngineError;
pub use markers::MarkerToken;
pub use output::{OutputEvent, StreamOrigin};
pub use registry::SessionRegistry;
pub use sessions::{LanguageSession, SessionState};
