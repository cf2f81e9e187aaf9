use serde_derive::{Deserialize, Serialize};

/// Crate-wide result alias.
pub type CResult<T> = Result<T, Error>;

/// All errors the engine can return. Variants are semantic: callers match on
/// the kind, not on message text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Null, empty, or structurally invalid input, e.g. a wrong dimension,
    /// an unknown field, or a row index out of range.
    InvalidInput(String),

    /// The targeted row, transaction, subscriber, or key does not exist.
    NotFound(String),

    /// A conditional precondition did not hold.
    ConditionFailed(String),

    /// An MVCC or conditional write lost to a concurrent modifier.
    WriteConflict,

    /// Insert or search issued on a quantized index before training.
    Untrained,

    /// A capacity limit was reached, e.g. the maximum subscriber count.
    Exhausted(String),

    /// A WAL, snapshot, or CDC-log read or write failed.
    Io(String),

    /// Magic, version, or checksum mismatch while loading persisted state.
    Corrupted(String),

    /// A filter expression failed to lex or parse.
    Parse(String),

    /// An unexpected internal state; indicates a bug.
    Internal(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidInput(s) => write!(f, "invalid input: {}", s),
            Error::NotFound(s) => write!(f, "not found: {}", s),
            Error::ConditionFailed(s) => write!(f, "condition failed: {}", s),
            Error::WriteConflict => write!(f, "write conflict, retry transaction"),
            Error::Untrained => write!(f, "index is not trained"),
            Error::Exhausted(s) => write!(f, "exhausted: {}", s),
            Error::Io(s) => write!(f, "io error: {}", s),
            Error::Corrupted(s) => write!(f, "corrupted: {}", s),
            Error::Parse(s) => write!(f, "parse error: {}", s),
            Error::Internal(s) => write!(f, "internal error: {}", s),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Corrupted(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_conversion() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire").into();
        assert_eq!(err, Error::Io("disk on fire".to_string()));
    }

    #[test]
    fn display() {
        assert_eq!(Error::Untrained.to_string(), "index is not trained");
        assert_eq!(
            Error::NotFound("row 7".to_string()).to_string(),
            "not found: row 7"
        );
    }
}
