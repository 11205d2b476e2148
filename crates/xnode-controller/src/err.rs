//! Declare an error type for the xnode-controller crate.

use std::sync::Arc;

use futures::task::SpawnError;
use xnode_error::{Bug, ErrorKind, HasKind};

use crate::EngineError;

/// An error returned by the [`Controller`](crate::Controller).
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A request to the remote source failed.
    #[error("Unable to {action}")]
    Remote {
        /// What we were trying to do.
        action: &'static str,
        /// What went wrong.
        #[source]
        cause: xnode_panel::Error,
    },

    /// The node descriptor can't be turned into inbounds.
    #[error("Cannot plan inbounds for node: {0}")]
    InvalidPlan(String),

    /// The limiter refused an operation.
    #[error("Limiter failure")]
    Limiter(#[from] xnode_limiter::Error),

    /// An external component refused an operation.
    #[error("External component failure")]
    Engine(#[from] EngineError),

    /// We couldn't spawn a periodic task.
    #[error("Unable to spawn {spawning}")]
    Spawn {
        /// What we were trying to spawn.
        spawning: &'static str,
        /// What happened when we tried to spawn it.
        #[source]
        cause: Arc<SpawnError>,
    },

    /// We couldn't cancel a periodic task.
    #[error("Unable to cancel the {task} task")]
    CancelFailed {
        /// The task we couldn't cancel.
        task: &'static str,
    },

    /// The controller was already started, or already stopped.
    #[error("Controller is {0}")]
    WrongPhase(crate::Phase),

    /// An internal error occurred.
    #[error("Internal error")]
    Bug(#[from] Bug),
}

impl Error {
    /// Construct an [`Error::Remote`].
    pub(crate) fn remote(action: &'static str, cause: xnode_panel::Error) -> Self {
        Error::Remote { action, cause }
    }

    /// Construct an [`Error::Spawn`].
    pub(crate) fn from_spawn(spawning: &'static str, err: SpawnError) -> Self {
        Error::Spawn {
            spawning,
            cause: Arc::new(err),
        }
    }
}

impl HasKind for Error {
    fn kind(&self) -> ErrorKind {
        use Error as E;
        use ErrorKind as EK;
        match self {
            E::Remote { cause, .. } => cause.kind(),
            E::InvalidPlan(_) => EK::InvalidNodeConfig,
            E::Limiter(e) => e.kind(),
            E::Engine(e) => e.kind(),
            E::Spawn { cause, .. } if cause.is_shutdown() => EK::ShuttingDown,
            E::Spawn { .. } => EK::Internal,
            E::CancelFailed { .. } => EK::Internal,
            E::WrongPhase(_) => EK::Other,
            E::Bug(e) => e.kind(),
        }
    }
}

/// A Result as returned by this crate.
pub type Result<T> = std::result::Result<T, Error>;
