//! The `Bug` type, and the `internal!` and `into_internal!` macros.

use std::fmt::{self, Debug, Display};
use std::panic::Location;
use std::sync::Arc;

use crate::{ErrorKind, HasKind};

/// Something that should be impossible happened.
///
/// Construct one with [`internal!`](crate::internal) rather than calling
/// [`Bug::new`] directly, so that the message is formatted in place.
///
/// A `Bug` records where it was created, which is usually enough to find
/// the broken invariant.
#[derive(Clone)]
pub struct Bug(Box<BugRepr>);

/// The inside of a [`Bug`]: boxed so that `Result<_, Bug>` stays small.
#[derive(Clone)]
struct BugRepr {
    /// What went wrong.
    message: String,
    /// Where the bug was detected.
    location: &'static Location<'static>,
    /// The error that exposed the bug, if there was one.
    source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Bug {
    /// Create a bug with a message, recording the caller's location.
    #[track_caller]
    pub fn new<S: Into<String>>(message: S) -> Self {
        Bug(Box::new(BugRepr {
            message: message.into(),
            location: Location::caller(),
            source: None,
        }))
    }

    /// Create a bug caused by some other error.
    #[track_caller]
    pub fn from_error<E, S>(source: E, message: S) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
        S: Into<String>,
    {
        Bug(Box::new(BugRepr {
            message: message.into(),
            location: Location::caller(),
            source: Some(Arc::new(source)),
        }))
    }
}

impl Debug for Bug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bug")
            .field("message", &self.0.message)
            .field("location", &self.0.location)
            .finish_non_exhaustive()
    }
}

impl Display for Bug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "internal error (bug) at {}: {}",
            self.0.location, self.0.message
        )
    }
}

impl std::error::Error for Bug {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0
            .source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl HasKind for Bug {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Internal
    }
}

/// Create a [`Bug`] from a format string.
///
/// ```
/// use xnode_error::{internal, Bug};
/// fn lookup(tables: &[u32], idx: usize) -> Result<u32, Bug> {
///     tables
///         .get(idx)
///         .copied()
///         .ok_or_else(|| internal!("index {} out of range", idx))
/// }
/// assert!(lookup(&[], 3).is_err());
/// ```
#[macro_export]
macro_rules! internal {
    ($($arg:tt)+) => {
        $crate::Bug::new(format!($($arg)+))
    };
}

/// Return a closure that wraps an error into a [`Bug`], for use with
/// `map_err`.
///
/// ```
/// use xnode_error::{into_internal, Bug};
/// fn parse(s: &str) -> Result<u16, Bug> {
///     s.parse().map_err(into_internal!("port {:?} failed to parse", s))
/// }
/// assert!(parse("http").is_err());
/// ```
#[macro_export]
macro_rules! into_internal {
    ($($arg:tt)+) => {
        |e| $crate::Bug::from_error(e, format!($($arg)+))
    };
}

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list @@ -->
    use super::*;
    use crate::ErrorReport as _;

    #[test]
    fn bug_records_location() {
        let bug = crate::internal!("limiter table {} poisoned", "vless_443_1");
        let s = bug.to_string();
        assert!(s.starts_with("internal error (bug) at "));
        assert!(s.contains(file!()));
        assert!(s.ends_with("limiter table vless_443_1 poisoned"));
        assert_eq!(bug.kind(), ErrorKind::Internal);
    }

    #[test]
    fn bug_keeps_source() {
        let r: Result<u8, _> = "300".parse::<u8>();
        let bug = r.map_err(crate::into_internal!("bad width")).unwrap_err();
        assert!(std::error::Error::source(&bug).is_some());
        assert!(bug.report().to_string().contains("number too large"));
    }
}
