//! Formatting an error together with its chain of sources.

use std::error::Error as StdError;
use std::fmt::{self, Display};

/// Wrapper that displays an error and every error in its `source()` chain.
///
/// Returned by [`ErrorReport::report`].
#[derive(Debug, Clone, Copy)]
pub struct Report<'e>(&'e (dyn StdError + 'static));

impl Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut last = self.0.to_string();
        write!(f, "error: {}", last)?;
        let mut source = self.0.source();
        while let Some(e) = source {
            let msg = e.to_string();
            // Many errors already embed their source in their own message;
            // don't say the same thing twice.
            if !last.contains(&msg) {
                write!(f, ": {}", msg)?;
            }
            last = msg;
            source = e.source();
        }
        Ok(())
    }
}

/// Extension trait providing `.report()` on every error type.
pub trait ErrorReport: StdError + Sized + 'static {
    /// Return an object that displays this error with all its sources.
    fn report(&self) -> Report<'_> {
        Report(self)
    }
}

impl<E: StdError + Sized + 'static> ErrorReport for E {}
