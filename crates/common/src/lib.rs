//! Shared types for the publishing workspace
//!
//! `Secret` keeps access and refresh tokens out of logs; `Error` is the
//! configuration error used by every binary that loads TOML settings.

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
