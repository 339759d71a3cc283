use thiserror::Error;

/// Error surface of the driver.
///
/// `Busy` is transient: the caller is expected to retry once a completion
/// has freed the exhausted resource. Corruption variants are only produced
/// while opening or creating an image; a successfully opened image never
/// reports them on the data path.
#[derive(Debug, Error)]
pub enum VhdError {
    #[error("invalid argument")]
    InvalidArg,

    #[error("resource temporarily unavailable")]
    Busy,

    #[error("image opened read-only")]
    ReadOnly,

    #[error("image has no parent")]
    NoParent,

    #[error("image corrupt: {0}")]
    Corrupt(&'static str),

    #[error("unsupported image: {0}")]
    Unsupported(&'static str),

    #[error("parent does not match child: {0}")]
    ParentMismatch(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VhdError>;
