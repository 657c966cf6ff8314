use std::error::Error as StdError;
use std::io;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    /// Any failure that cannot be confidently attributed to any other error
    /// category in this enum.
    ///
    /// Use of Internal is never a guarantee that the error was not caused
    /// by the user, merely that it cannot be confidently determined by the
    /// code.
    Internal,

    /// The user provided invalid input or performed an action that is
    /// unsupported or impossible to complete.
    User,
}

/// Fine-grained condition flags for consumers that want to branch on error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The key is neither 16 nor 32 bytes long.
    InvalidKeyLength,
    /// A path handed to the packer does not exist or cannot be read.
    SourceUnavailable,
    /// The staging file could not be created.
    StagingCreateFailed,
    /// The staging file could not be closed and removed, or was already gone.
    StagingDeleteFailed,
    /// The vault stream ended before the nonce could be read.
    TruncatedStream,
    /// A ciphertext segment failed authentication due to a wrong key,
    /// tampering, reordering, truncation or corruption.
    AuthenticationFailed,
    /// The passphrase envelope is missing or not one we understand.
    FormatInvalid,
    /// Passphrase could not be obtained from the configured reader.
    PassphraseUnavailable,
    /// scrypt key derivation failed.
    KeyDerivation,
    /// Unexpected state reached within arcvault logic.
    InternalInvariant,
    /// Interaction with the filesystem, stdin/stdout, or other I/O failed.
    Io,
}

#[derive(Debug, Error)]
#[error("{msg}")]
pub struct VaultError {
    /// Broad error category, always provided.
    pub category: ErrorCategory,
    /// Optional specific condition tag for consumers that need to
    /// branch their behavior. Any code consuming errors MUST handle
    /// the absence of a defined kind.
    pub kind: Option<ErrorKind>,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    msg: String,
}

impl VaultError {
    /// Creates a new error that also tags the failure with a kind.
    pub fn with_kind(category: ErrorCategory, kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            category,
            kind: Some(kind),
            source: None,
            msg: msg.into(),
        }
    }

    /// Creates a new error that carries both a kind tag and the originating source error.
    pub fn with_kind_and_source(
        category: ErrorCategory,
        kind: ErrorKind,
        msg: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            category,
            kind: Some(kind),
            source: Some(Box::new(source)),
            msg: msg.into(),
        }
    }

    /// Converts an `io::Error` that came out of one of our streams (or out of
    /// the tar layer reading from one) back into a `VaultError`.
    ///
    /// If a `VaultError` is buried anywhere in the source chain, its category
    /// and kind are kept so that, say, an authentication failure detected
    /// three layers below `tar` is still reported as one. Anything else
    /// becomes an internal `Io` error.
    pub fn from_io(err: io::Error, msg: impl Into<String>) -> Self {
        let (category, kind) = match find_vault_error(&err) {
            Some(inner) => (inner.category, inner.kind),
            None => (ErrorCategory::Internal, Some(ErrorKind::Io)),
        };
        Self {
            category,
            kind,
            source: Some(Box::new(err)),
            msg: msg.into(),
        }
    }

    /// Wraps this error in an `io::Error` so it can travel through `Read`/`Write`.
    pub(crate) fn into_io(self) -> io::Error {
        let io_kind = match self.kind {
            Some(ErrorKind::AuthenticationFailed) => io::ErrorKind::InvalidData,
            Some(ErrorKind::TruncatedStream) => io::ErrorKind::UnexpectedEof,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(io_kind, self)
    }

    /// The user-facing message carried by the error.
    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Returns the preserved source error if present.
    pub fn source_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    /// Wraps the current error with a higher-level message while preserving the original as source.
    pub fn with_context(self, msg: impl Into<String>) -> Self {
        let category = self.category;
        let kind = self.kind;
        Self {
            category,
            kind,
            source: Some(Box::new(self)),
            msg: msg.into(),
        }
    }
}

/// `io::Error::source` skips the custom payload itself, so walk into it by hand.
fn find_vault_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a VaultError> {
    let mut current = err;
    loop {
        if let Some(vault) = current.downcast_ref::<VaultError>() {
            return Some(vault);
        }
        if let Some(inner) = current
            .downcast_ref::<io::Error>()
            .and_then(|io_err| io_err.get_ref())
        {
            current = inner;
            continue;
        }
        current = current.source()?;
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, VaultError>;
