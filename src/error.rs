//! Error taxonomy shared by the image model, the packet codec and the host session.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed record line.
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },

    /// Record bytes do not sum to zero.
    #[error("line {line}: checksum failed (record sums to 0x{sum:02x})")]
    Checksum { line: usize, sum: u8 },

    /// Well-formed records in an invalid arrangement.
    #[error("line {line}: {reason}")]
    Structural { line: usize, reason: String },

    /// Buffers handed to an image or record constructor do not describe one.
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// Unexpected reply type, size or sequence number.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("maximum number of retries ({0}) reached for HELLO packet")]
    RetryExhausted(u8),

    /// `found` is `None` when the bootloader rejected the request itself.
    #[error("version mismatch: expected major {expected}, found {found:?}")]
    VersionMismatch { expected: u8, found: Option<u8> },

    #[error("signature mismatch: expected {}, found {}", hex::encode(expected), found.map(hex::encode).unwrap_or_else(|| "-".into()))]
    SignatureMismatch {
        expected: [u8; 3],
        found: Option<[u8; 3]>,
    },

    #[error("image of {size} bytes exceeds available space ({available} bytes)")]
    ImageTooLarge { size: usize, available: usize },

    #[error("address 0x{address:04x} out of range (limit 0x{limit:04x})")]
    AddressOutOfRange { address: u32, limit: u32 },

    #[error("verification failed at address 0x{address:04x} (found 0x{found:02x}, expected 0x{expected:02x})")]
    VerificationFailed { address: u16, expected: u8, found: u8 },

    /// A frame outside the handshake was not acknowledged by the link layer.
    #[error("{0} was not acknowledged")]
    Undelivered(&'static str),

    #[error("unsupported firmware file: {0}")]
    UnsupportedFile(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown part {0}")]
    UnknownPart(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<crate::protocol::FrameError> for Error {
    fn from(err: crate::protocol::FrameError) -> Self {
        Error::Protocol(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl Error {
    /// The link gave up waiting for an answer.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Io(err) if err.kind() == std::io::ErrorKind::TimedOut)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
