#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]

mod internal;
mod report;

pub use internal::Bug;
pub use report::{ErrorReport, Report};

#[doc(hidden)]
pub use tracing;

use derive_more::Display;

/// Classification of an error arising from the xnode control plane.
///
/// Kinds are deliberately coarse: they tell the caller how to react, not
/// precisely what failed.  The concrete error types carry the details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A request to the management panel failed in a way that may succeed
    /// on a later attempt.
    ///
    /// Timeouts, connection failures and 4xx/5xx statuses all land here.
    /// The current polling cycle should be abandoned, keeping all state.
    #[display("remote panel request failed")]
    RemoteTransient,

    /// The management panel answered, but with something we could not make
    /// sense of.
    #[display("remote panel sent an invalid response")]
    RemoteProtocolViolation,

    /// The node descriptor we were given cannot be served.
    ///
    /// A zero port, an empty node type or a TLS node without a server
    /// name.  The node must not be brought up in this state.
    #[display("node descriptor is not usable")]
    InvalidNodeConfig,

    /// Our local configuration is invalid.
    #[display("invalid configuration")]
    InvalidConfig,

    /// An operation needed limiter state for an inbound tag that is not
    /// active.
    #[display("inbound tag is not active")]
    TagNotActive,

    /// An external component (proxy engine, certificate manager,
    /// accounting layer) refused an operation.
    #[display("external component failed")]
    ExternalComponentFailed,

    /// We could not read or write some local resource.
    #[display("local I/O error")]
    LocalIoError,

    /// The operation was abandoned because we are shutting down.
    #[display("shutting down")]
    ShuttingDown,

    /// Internal error (bug).
    ///
    /// Something that should be impossible has happened.
    #[display("internal error (bug)")]
    Internal,

    /// Some other failure.
    #[display("unclassified error")]
    Other,
}

/// Errors that can be categorized as belonging to an [`ErrorKind`]
pub trait HasKind {
    /// Return the kind of this error.
    fn kind(&self) -> ErrorKind;
}

impl HasKind for std::convert::Infallible {
    fn kind(&self) -> ErrorKind {
        match *self {}
    }
}

/// Log a message, followed by an error and its chain of sources, at the
/// given level.
///
/// ```
/// # use xnode_error::event_report;
/// let e = std::io::Error::other("disk on fire");
/// event_report!(xnode_error::tracing::Level::WARN, e, "Unable to read {}", "rules.txt");
/// ```
#[macro_export]
macro_rules! event_report {
    ($level:expr, $err:expr, $fmt:literal $(, $arg:expr )* $(,)?) => {
        {
            use $crate::ErrorReport as _;
            $crate::tracing::event!(
                $level,
                "{}: {}",
                format_args!($fmt $(, $arg)*),
                ($err).report()
            )
        }
    }
}

/// Log a message and an error report at `WARN` level.
#[macro_export]
macro_rules! warn_report {
    ($err:expr, $($rest:tt)+) => {
        $crate::event_report!($crate::tracing::Level::WARN, $err, $($rest)+)
    }
}

/// Log a message and an error report at `ERROR` level.
#[macro_export]
macro_rules! error_report {
    ($err:expr, $($rest:tt)+) => {
        $crate::event_report!($crate::tracing::Level::ERROR, $err, $($rest)+)
    }
}

/// Log a message and an error report at `DEBUG` level.
#[macro_export]
macro_rules! debug_report {
    ($err:expr, $($rest:tt)+) => {
        $crate::event_report!($crate::tracing::Level::DEBUG, $err, $($rest)+)
    }
}
