use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed chunk stream: {0}")]
    MalformedStream(String),

    #[error("Chunk trailer does not match its header")]
    TrailerMismatch,

    #[error("Unsupported catalog format (id {id:#010x}, version {version})")]
    UnsupportedFormat { id: u32, version: u32 },

    #[error("Object cost {cost} exceeds the cache maximum of {max}")]
    Capacity { cost: u64, max: u64 },

    #[error("Transfer failed with response code {code}: {message}")]
    TransferFailed { code: u16, message: String },

    #[error("Transfer was aborted")]
    TransferAborted,

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
