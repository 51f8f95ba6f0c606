//! Configuration for devlaunch
//!
//! This crate handles:
//! - Global configuration (`~/.config/devlaunch/config.toml`)
//! - Scalar lookups in a repository's project config file

mod error;
mod global;
mod project;

pub use error::*;
pub use global::*;
pub use project::*;
