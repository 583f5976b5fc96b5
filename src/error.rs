use std::{borrow::Cow, fmt::Display, path::PathBuf};

/// Reason a writer refused to emit a stream without ZIP64 extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Zip64Reason {
    /// More than 65 535 entries.
    TooManyEntries,
    /// A single entry exceeds 4 GiB compressed or uncompressed.
    EntryTooLarge,
    /// The archive itself grows past 4 GiB.
    ArchiveTooLarge,
    /// The central directory exceeds a 32-bit size or offset.
    CentralDirectoryTooLarge,
}

/// The error type of the crate.
#[derive(Debug)]
pub enum Error {
    /// The underlying stream ended in the middle of a structure.
    Truncated,
    /// A magic number, checksum, or structural invariant failed.
    InvalidFormat {
        /// Byte offset of the failure, when known.
        offset: Option<u64>,
        /// Short description of the violated structure.
        reason: Cow<'static, str>,
    },
    /// A numeric or string header field did not parse.
    MalformedField {
        /// Byte offset of the field within its header.
        offset: u64,
        /// Name of the field.
        field: &'static str,
    },
    /// A known feature of the format is not implemented.
    Unsupported(Cow<'static, str>),
    /// The archive is encrypted and no password was supplied.
    PasswordRequired,
    /// Decryption produced data that fails verification, usually a bad password.
    DecryptionFailed,
    /// A writer refused a value exceeding a hard format limit.
    TooLong {
        /// Name of the refused field.
        field: &'static str,
    },
    /// A writer refused to emit a stream that needs ZIP64 while the mode forbids it.
    Zip64Required(Zip64Reason),
    /// An entry would be extracted outside the target directory.
    PathEscape {
        /// Name of the offending entry.
        entry: String,
        /// The normalised target directory.
        target_dir: PathBuf,
    },
    /// IO error with optional context message.
    Io(std::io::Error, Cow<'static, str>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        if value.kind() == std::io::ErrorKind::UnexpectedEof {
            return Self::Truncated;
        }
        // Errors raised inside a Read/Write adapter travel as io::Error; unwrap
        // them instead of double-wrapping.
        match value.downcast::<Error>() {
            Ok(e) => e,
            Err(value) => Self::Io(value, "".into()),
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Truncated => std::io::Error::new(std::io::ErrorKind::UnexpectedEof, value),
            Error::Io(e, msg) if msg.is_empty() => e,
            value => std::io::Error::other(value),
        }
    }
}

impl Error {
    #[inline]
    pub(crate) fn invalid<S: Into<Cow<'static, str>>>(reason: S) -> Self {
        Self::InvalidFormat {
            offset: None,
            reason: reason.into(),
        }
    }

    #[inline]
    pub(crate) fn invalid_at<S: Into<Cow<'static, str>>>(offset: u64, reason: S) -> Self {
        Self::InvalidFormat {
            offset: Some(offset),
            reason: reason.into(),
        }
    }

    #[inline]
    pub(crate) fn field(offset: u64, field: &'static str) -> Self {
        Self::MalformedField { offset, field }
    }

    #[inline]
    pub(crate) fn unsupported<S: Into<Cow<'static, str>>>(s: S) -> Self {
        Self::Unsupported(s.into())
    }

    #[inline]
    pub(crate) fn io(e: std::io::Error) -> Self {
        Self::from(e)
    }

    #[inline]
    pub(crate) fn io_msg(e: std::io::Error, msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Io(e, msg.into())
    }

    /// Moves this error into an `std::io::Error` for use inside `Read`/`Write`
    /// implementations. The original kind is recoverable via `Error::from`.
    #[inline]
    pub(crate) fn into_io(self) -> std::io::Error {
        self.into()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Truncated => write!(f, "stream ended mid-structure"),
            Error::InvalidFormat { offset, reason } => match offset {
                Some(offset) => write!(f, "invalid format at offset {offset}: {reason}"),
                None => write!(f, "invalid format: {reason}"),
            },
            Error::MalformedField { offset, field } => {
                write!(f, "malformed field {field} at offset {offset}")
            }
            Error::Unsupported(feature) => write!(f, "unsupported: {feature}"),
            Error::PasswordRequired => write!(f, "password required"),
            Error::DecryptionFailed => write!(f, "decryption failed, possibly a bad password"),
            Error::TooLong { field } => write!(f, "{field} exceeds the format limit"),
            Error::Zip64Required(reason) => {
                write!(f, "archive requires ZIP64 extensions: {reason:?}")
            }
            Error::PathEscape { entry, target_dir } => write!(
                f,
                "entry {entry:?} would escape the target directory {}",
                target_dir.display()
            ),
            Error::Io(e, msg) if msg.is_empty() => write!(f, "{e}"),
            Error::Io(e, msg) => write!(f, "{msg}: {e}"),
        }
    }
}

impl std::error::Error for Error {}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
