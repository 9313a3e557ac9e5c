//! Error types for tiger format parsing and building

use thiserror::Error;

/// Format operation result type
pub type Result<T> = std::result::Result<T, FormatError>;

/// Errors produced while decoding or encoding tiger structures
#[derive(Debug, Error)]
pub enum FormatError {
    /// I/O error from the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Binary layout error raised by binrw
    #[error("Binary format error: {0}")]
    BinRw(#[from] binrw::Error),

    /// Magic value did not match
    #[error("Invalid magic: expected {expected:#010x}, found {found:#010x}")]
    InvalidMagic {
        /// Magic the parser requires
        expected: u32,
        /// Magic read from the stream
        found: u32,
    },

    /// Version field of a structure does not match the game format
    #[error("Unsupported {structure} version: expected {expected}, found {found}")]
    UnsupportedVersion {
        /// Which structure carried the version
        structure: &'static str,
        /// Version the selected game uses
        expected: u32,
        /// Version stored on disk
        found: u32,
    },

    /// Ref-definition table is inconsistent with its counts
    #[error("Malformed ref definitions: {0}")]
    MalformedRefDefinitions(String),

    /// Caller supplied a value the format cannot represent
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Deflate stream could not be decoded
    #[error("Compression error: {0}")]
    Compression(String),

    /// Structurally invalid data
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

impl FormatError {
    /// Version mismatches mean the data belongs to a different game and no
    /// amount of retrying will parse it.
    pub fn is_unsupported_version(&self) -> bool {
        matches!(self, Self::UnsupportedVersion { .. })
    }

    /// Errors caused by the caller rather than by the data.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let version = FormatError::UnsupportedVersion {
            structure: "archive",
            expected: 5,
            found: 3,
        };
        assert!(version.is_unsupported_version());
        assert!(!version.is_contract_violation());
        assert!(FormatError::InvalidArgument("x".into()).is_contract_violation());
        assert_eq!(
            version.to_string(),
            "Unsupported archive version: expected 5, found 3"
        );
    }
}
