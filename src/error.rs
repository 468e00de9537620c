use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, PmbdError>;

#[derive(Error, Debug)]
pub enum PmbdError {
    #[error("request sector range [{start}, {end}) exceeds device capacity of {capacity} sectors")]
    CapacityExceeded { start: u64, end: u64, capacity: u64 },

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("verification mismatch on pbn {pbn}: readback differs from the write just issued")]
    VerificationMismatch { pbn: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device index {0} out of range")]
    NoSuchDevice(usize),
}
