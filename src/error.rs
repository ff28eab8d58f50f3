use nix::libc;
use thiserror::Error;

use crate::books::BookState;

/// Command-level failure, carrying enough to build the wire reply.
///
/// Every variant maps onto one POSIX errno via [`EngineError::errno`]; the
/// dispatcher turns the pair into `{errmsg, errno}`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Bad arguments, or the object is in the wrong state for the operation
    #[error("{0}")]
    Invalid(String),
    /// No such shelf or book
    #[error("no such {kind} \"{who}\"")]
    NotFound { kind: &'static str, who: String },
    /// Destroy attempted while handles are still open
    #[error("shelf \"{0}\" is still open")]
    Busy(String),
    /// The allocation policy under-delivered
    #[error("allocation policy returned {got} of {wanted} books")]
    OutOfSpace { wanted: u64, got: u64 },
    /// Shelf size and book count disagree
    #[error("shelf \"{0}\": size_bytes does not match book_count")]
    SizeMismatch(String),
    /// BOS sequence numbers are not dense 1..book_count
    #[error("shelf \"{0}\": corrupt BOS sequence progression")]
    CorruptSequence(String),
    /// BOS row count disagrees with the shelf's book count
    #[error("shelf \"{0}\": BOS row count does not match book_count")]
    CountMismatch(String),
    /// Close of a handle nobody holds
    #[error("stale shelf handle {0}")]
    StaleHandle(u64),
    /// Book state machine violation
    #[error("book {book_id:#07x}: illegal transition {from} -> {to}")]
    BadTransition {
        book_id: u64,
        from: BookState,
        to: BookState,
    },
    /// Command or policy not implemented
    #[error("not implemented: {0}")]
    Unimplemented(String),
    /// Metadata store failure outside the command's control
    #[error("metadata store: {0}")]
    Store(String),
    /// Anything truly unexpected; includes the origin for debugging
    #[error("internal error @ {origin}: {msg}")]
    Internal { origin: String, msg: String },
}

impl EngineError {
    pub fn not_found(kind: &'static str, who: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            who: who.into(),
        }
    }

    /// The errno delivered to the client alongside the message.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Invalid(_) => libc::EINVAL,
            Self::NotFound { .. } => libc::ENOENT,
            Self::Busy(_) => libc::EBUSY,
            Self::OutOfSpace { .. } => libc::ENOSPC,
            Self::SizeMismatch(_) => libc::EBADF,
            Self::CorruptSequence(_) => libc::EBADFD,
            Self::CountMismatch(_) => libc::EREMOTEIO,
            Self::StaleHandle(_) => libc::ESTALE,
            Self::BadTransition { .. } => libc::EUCLEAN,
            Self::Unimplemented(_) => libc::ENOSYS,
            Self::Store(_) | Self::Internal { .. } => libc::EIO,
        }
    }
}

/// Build an [`EngineError::Internal`] tagged with the current file and line.
macro_rules! internal {
    ($($arg:tt)*) => {
        $crate::EngineError::Internal {
            origin: format!("{}[{}]", file!(), line!()),
            msg: format!($($arg)*),
        }
    };
}
pub(crate) use internal;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(
            EngineError::not_found("shelf", "xyzzy").errno(),
            libc::ENOENT
        );
        assert_eq!(
            EngineError::OutOfSpace { wanted: 10, got: 3 }.errno(),
            libc::ENOSPC
        );
        assert_eq!(EngineError::StaleHandle(42).errno(), libc::ESTALE);
        assert_eq!(
            EngineError::BadTransition {
                book_id: 0x2001,
                from: BookState::Free,
                to: BookState::Zombie,
            }
            .errno(),
            libc::EUCLEAN
        );
    }

    #[test]
    fn internal_carries_origin() {
        let e = internal!("boom {}", 7);
        assert_eq!(e.errno(), libc::EIO);
        let msg = e.to_string();
        assert!(msg.contains("error.rs"));
        assert!(msg.contains("boom 7"));
    }
}
