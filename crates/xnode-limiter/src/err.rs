//! Declare an error type for the xnode-limiter crate.

use xnode_error::{Bug, ErrorKind, HasKind};

/// An error returned by the [`Limiter`](crate::Limiter).
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// We were asked to change the state of an inbound tag that has not
    /// been activated, or has since been deactivated.
    #[error("No limiter for inbound {tag:?}")]
    TagNotActive {
        /// The tag we were asked about.
        tag: String,
    },

    /// An internal error occurred.
    #[error("Internal error")]
    Bug(#[from] Bug),
}

impl HasKind for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::TagNotActive { .. } => ErrorKind::TagNotActive,
            Error::Bug(e) => e.kind(),
        }
    }
}

/// A Result as returned by this crate.
pub type Result<T> = std::result::Result<T, Error>;
