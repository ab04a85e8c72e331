//! Error types for Conveyor.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The caller's cancellation token fired before the operation completed.
    #[error("canceled")]
    Canceled,

    #[error("not implemented")]
    NotImplemented,

    #[error("store error: {0}")]
    Store(String),

    #[error("backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, Error>;
