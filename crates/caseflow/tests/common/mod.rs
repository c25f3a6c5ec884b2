//! Shared utilities for caseflow integration tests.
//!
//! - `TestHarness`: a file-backed store, artifact root and pipeline runners
//!   in a temp directory
//! - `ScriptedStage`: stages whose behaviour each test dictates

pub mod harness;
pub mod scripted;

pub use harness::TestHarness;
pub use scripted::{Behaviour, ScriptedStage};
