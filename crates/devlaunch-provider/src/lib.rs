//! Process, docker and ssh plumbing for devlaunch
//!
//! Everything that leaves the process goes through [`CommandRunner`]; the
//! docker wrapper shapes each invocation according to the active
//! [`DockerChannel`].

mod channel;
mod docker;
mod error;
mod process;
mod ssh;
mod types;

pub use channel::*;
pub use docker::*;
pub use error::*;
pub use process::*;
pub use ssh::*;
pub use types::*;
