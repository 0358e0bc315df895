//! Cargo output parsing shared by the quality-gate pipeline: runs
//! `cargo check`/`cargo clippy`, parses the JSON diagnostic stream, and
//! classifies errors by category for the gate-recovery strategist.

pub mod compiler;
pub mod error_parser;

pub use compiler::{CargoOutput, CompileResult, Compiler};
pub use error_parser::{ErrorCategory, ParsedError, RustcErrorParser};
