//! Executor binary crate — wires `coordination`'s executor loop, watchdog
//! and quality-gate pipeline to a concrete git-worktree sandbox, a
//! subprocess-driven AI coding agent, and a `rig-core`-backed AI client.

pub mod ai_agent;
pub mod ai_client;
pub mod config;
pub mod sandbox;
