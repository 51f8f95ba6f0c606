//! Core logic for devlaunch remote environment sessions
//!
//! This crate provides:
//! - Session state shared by every phase of a run
//! - Connectivity resolution (local engine or Docker over SSH, with key bootstrap)
//! - Container status and session recovery from the session record
//! - Image build, container start and stop with volume sync
//! - Git change detection, commit and push after a session
//! - A workflow coordinator that runs the phases in order

pub mod chain;
mod connectivity;
mod error;
mod git;
mod host;
mod interaction;
pub mod lifecycle;
mod metadata;
mod ssh;
mod state;
mod status;
mod workflow;

pub use connectivity::*;
pub use error::*;
pub use git::*;
pub use host::*;
pub use interaction::*;
pub use lifecycle::{LifecycleController, StartOutcome, StopOutcome};
pub use metadata::*;
pub use ssh::*;
pub use state::*;
pub use status::*;
pub use workflow::*;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
