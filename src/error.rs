use thiserror::Error;

/// Errors produced while building, packing or decoding memory images.
#[derive(Error, Debug)]
pub enum KvspError {
    /// A segment does not fit inside its target image.
    #[error("{image} segment at offset {offset:#x} with length {length} exceeds image of {capacity} bytes")]
    OutOfBounds {
        image: &'static str,
        offset: u64,
        length: u64,
        capacity: usize,
    },

    /// Bad magic, unsupported version or inconsistent header fields.
    #[error("invalid packet: {0}")]
    Format(String),

    /// A declared section ended before its declared length.
    #[error("truncated {section}: expected {expected} bytes, got {actual}")]
    TruncatedData {
        section: &'static str,
        expected: u64,
        actual: u64,
    },

    /// The result document contains an entry of an unexpected shape.
    #[error("unexpected entry `{name}` in result document: {reason}")]
    Schema { name: String, reason: String },

    /// A required named entry is missing (or an unknown one is present).
    #[error("invalid result: {reason} `{name}`")]
    Validation { name: String, reason: &'static str },

    /// The startup layout for the given arguments does not fit in RAM.
    #[error("command line needs {required} bytes but only {available} are available in RAM")]
    LayoutOverflow { required: usize, available: usize },

    /// A plane split was requested for an image of odd length.
    #[error("image of {0} bytes cannot be split into two planes")]
    UnevenImage(usize),

    #[error("malformed executable: {0}")]
    Elf(&'static str),

    #[error("malformed result document: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl KvspError {
    pub(crate) fn missing(name: impl Into<String>) -> Self {
        KvspError::Validation {
            name: name.into(),
            reason: "missing required entry",
        }
    }
}

pub type Result<T> = std::result::Result<T, KvspError>;
