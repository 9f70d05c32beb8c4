//! Core library for codebuild-local
//!
//! Runs a declarative build specification locally inside a disposable
//! container: specification parsing and validation, environment resolution,
//! container session management, the phase state machine, output streaming
//! with secret redaction, and artifact collection.

pub mod artifacts;
pub mod build;
pub mod buildspec;
pub mod config;
pub mod docker;
pub mod environment;
pub mod errors;
pub mod executor;
pub mod logging;
pub mod redaction;
pub mod runtime;
pub mod session;
pub mod store;
pub mod stream;

// Re-export IndexMap for use by dependent crates (preserves insertion order for ordered maps)
pub use indexmap::IndexMap;

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
