use thiserror::Error;

/// Errors surfaced by the resource manager itself.
///
/// Application load failures are not errors at this level; they travel through
/// the result code recorded on the resource (see [`crate::Resman::res_result`]).
#[derive(Error, Debug)]
pub enum ResmanError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to start worker thread: {0}")]
    PoolStartup(std::io::Error),

    #[cfg(feature = "watch")]
    #[error("file watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("unknown resource id: {0}")]
    UnknownResource(usize),
}

pub type Result<T> = std::result::Result<T, ResmanError>;
