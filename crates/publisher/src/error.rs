//! Error types for the publisher
//!
//! Strategy failures are never errors: they are classified and end up in the
//! `PublishReport`. Only input no strategy could ever handle is rejected here.

use upstream::ContentError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid content: {0}")]
    InvalidContent(#[from] ContentError),
}

pub type Result<T> = std::result::Result<T, Error>;
