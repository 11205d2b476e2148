//! Declare an error type for the xnode-panel crate.

use std::path::PathBuf;
use std::sync::Arc;

use xnode_error::{Bug, ErrorKind, HasKind};

/// An error returned while talking to the management panel, or while
/// interpreting what it told us.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// We could not build our HTTP client.
    #[error("Unable to construct HTTP client")]
    ClientSetup(#[source] Arc<reqwest::Error>),

    /// A request failed before we got an answer, after all retries.
    #[error("Request {url} failed")]
    Request {
        /// The URL we requested, without credentials.
        url: String,
        /// What went wrong.
        #[source]
        cause: Arc<reqwest::Error>,
    },

    /// The panel answered with an error status.
    #[error("Request {url} failed with status {status}: {body}")]
    Status {
        /// The URL we requested, without credentials.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The body of the answer, for diagnosis.
        body: String,
    },

    /// The panel's answer was not what we expected.
    #[error("Invalid response from {url}: {problem}")]
    InvalidResponse {
        /// The URL we requested, without credentials.
        url: String,
        /// What was wrong with it.
        problem: String,
    },

    /// The node descriptor is well-formed, but can't be served.
    #[error("Unusable node configuration: {0}")]
    InvalidNode(String),

    /// We couldn't read the local rule list.
    #[error("Unable to read rule list {}", path.display())]
    ReadRules {
        /// The file we tried to read.
        path: PathBuf,
        /// What went wrong.
        #[source]
        cause: Arc<std::io::Error>,
    },

    /// An internal error occurred.
    #[error("Internal error")]
    Bug(#[from] Bug),
}

impl Error {
    /// Construct an [`Error::InvalidResponse`] for `url`.
    pub(crate) fn invalid_response(url: &str, problem: impl ToString) -> Self {
        Error::InvalidResponse {
            url: url.to_owned(),
            problem: problem.to_string(),
        }
    }
}

impl HasKind for Error {
    fn kind(&self) -> ErrorKind {
        use Error as E;
        use ErrorKind as EK;
        match self {
            E::ClientSetup(_) => EK::Other,
            E::Request { .. } | E::Status { .. } => EK::RemoteTransient,
            E::InvalidResponse { .. } => EK::RemoteProtocolViolation,
            E::InvalidNode(_) => EK::InvalidNodeConfig,
            E::ReadRules { .. } => EK::LocalIoError,
            E::Bug(e) => e.kind(),
        }
    }
}

/// A Result as returned by this crate.
pub type Result<T> = std::result::Result<T, Error>;
