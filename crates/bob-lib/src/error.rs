//! Error taxonomy shared across the crate.
//!
//! Every fallible module defines its own [`thiserror::Error`] enum (mirroring
//! how `turborepo-cache`, `turborepo-errors` and the engine each keep one
//! error type per concern) and implements [`Categorized`] so a caller at any
//! layer can decide how to report a failure without matching on every
//! variant.

use std::fmt;

/// Coarse bucket a concrete error falls into, used by the CLI to choose an
/// exit code and a presentation (plain message vs. full error chain).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input from the person invoking bob: a malformed manifest, a
    /// missing task, a cyclic dependency.
    User,
    /// A task's command exited non-zero.
    TaskFailure,
    /// The build-info or artifact store could not be read or written.
    Store,
    /// Something that should be impossible: a poisoned lock, a missing
    /// node the graph itself promised existed.
    Internal,
    /// The run was canceled (Ctrl-C, or a dependency failing upstream).
    Canceled,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::User => "user error",
            ErrorCategory::TaskFailure => "task failure",
            ErrorCategory::Store => "store error",
            ErrorCategory::Internal => "internal error",
            ErrorCategory::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

pub trait Categorized {
    fn category(&self) -> ErrorCategory;
}
