use thiserror::Error;

/// Everything the trainer and the model I/O can fail with.
#[derive(Debug, Error)]
pub enum Error {
    #[error("aligned allocation of {0} floats failed")]
    OutOfMemory(usize),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("rating index ({u}, {v}) outside the {m}x{n} matrix")]
    IndexOutOfRange { u: u32, v: u32, m: u32, n: u32 },

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed model file: {0}")]
    ModelParse(String),
}

pub type Result<T> = std::result::Result<T, Error>;
