//! Crate-wide error taxonomy (§7, §13).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("opcode {0} takes between {1} and {2} children, found {3}")]
    ArityViolation(&'static str, usize, usize, usize),

    #[error("unknown opcode byte {0:#04x}")]
    UnknownOpcode(u8),

    #[error("variable index {0} out of range for row of length {1}")]
    VarOutOfRange(usize, usize),

    #[error("opcode {0} has no evaluation semantics defined")]
    UnsupportedOpcode(&'static str),

    #[error("unexpected end of input while decoding")]
    UnexpectedEof,

    #[error("dataset hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("dataset {0} is unknown to this worker")]
    DatasetUnknown(String),

    #[error("factory '{0}' is unknown to this worker")]
    FactoryUnknown(String),

    #[error("remote returned unexpected status byte {0:#04x}")]
    ProtocolMismatch(u8),

    #[error("remote server is busy")]
    Busy,

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("operation timed out")]
    Timeout,

    #[error("failed to disseminate dataset: {0}")]
    DisseminationFailed(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),
}

pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;
