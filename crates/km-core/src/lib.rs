//! # km-core
//!
//! Shared error types and small enums for kmband.
//!
//! Everything downstream (`km-prob`, `km-inference`, `km-cli`) reports failures through
//! [`Error`] and selects its likelihood ablation through [`Mode`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{Mode, ModeFlags};

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
