//! Type definitions for the runlet streaming execution protocol
//!
//! This crate provides the shared contract between the execution engine and
//! its consumers (orchestrators, transports, rendering layers), ensuring
//! type-safe communication across system boundaries. The design philosophy
//! emphasizes protocol stability: consumers recognize execution boundaries
//! strictly by the `start`/`end` flags on chunks, never by counting them, so
//! the engine and its clients can evolve independently as long as the framing
//! contract holds.
//!
//! ## Features
//!
//! - **Strongly typed**: Roles, chunk types, and content variants are proper
//!   Rust enums rather than stringly-typed maps
//! - **Serde support**: The serialized form is the exact wire shape consumed
//!   over any transport (HTTP streaming, IPC, a pipe)
//! - **Framing helpers**: Constructors for start/content/end chunk triples
//!   and predicates for boundary detection
//!
//! ## Example
//!
//! ```rust
//! use runlet_chunks::{Chunk, ChunkType, Role};
//!
//! let chunk = Chunk::console("hello\n");
//!
//! assert_eq!(chunk.role, Role::Computer);
//! assert_eq!(chunk.chunk_type, ChunkType::Console);
//! assert!(!chunk.is_end());
//! ```

pub mod chunks;
pub mod error;

pub use chunks::*;
pub use error::*;
