//! Error types used by multiple modules.
//!
//! There are two error types that are used widely within this crate.
//!
//! The most important is [`Failed`]. This error indicates that an
//! operation had to be canceled for some reason and callers can assume
//! that all diagnostic information has been logged and they need not do
//! anything further.
//!
//! Secondly, [`ExitError`] is used when the program should be terminated. It
//! provides enough information to determine the exit code of the process.
//!
//! A third, narrower type, [`Retryable`], distinguishes the transient
//! failures the measurement engine retries (circuit build, ting) from
//! everything else, so retry loops don't need to pattern-match on what
//! went wrong.

use log::error;


//------------ Failed --------------------------------------------------------

/// An operation has failed to complete.
///
/// This error type is used to indicate that an operation has failed,
/// diagnostic information has been printed or logged, and the caller can't
/// really do anything to recover.
#[derive(Clone, Copy, Debug)]
pub struct Failed;


//------------ ExitError -----------------------------------------------------

/// An error happened that should lead to terminating the process.
#[derive(Clone, Copy, Debug)]
pub enum ExitError {
    /// Something has happened. This should be exit status 1.
    Generic,

    /// Argument parsing or setup failed before any work could start.
    /// This should be exit status 2.
    InvalidArgs,
}

impl From<Failed> for ExitError {
    fn from(_: Failed) -> ExitError {
        error!("Fatal error. Exiting.");
        ExitError::Generic
    }
}


//------------ Retryable ------------------------------------------------------

/// A transient failure of a single attempt at a retried operation.
///
/// Both circuit construction and ting return this from a single attempt.
/// The caller (the measurement engine's per-phase retry loop) only cares
/// whether it should try again, not why the attempt failed; the "why" has
/// already been logged at the point of failure.
#[derive(Clone, Copy, Debug)]
pub struct Retryable;
