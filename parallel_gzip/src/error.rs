//! Error type shared by the queue, the pipeline stages and the orchestrator.

use std::error::Error as StdError;
use std::fmt;
use std::io;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while moving chunks through the pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// A queue was constructed with a capacity of zero.
    #[error("queue capacity can't be zero")]
    ZeroCapacity,

    /// An item was offered to a queue after adding was completed.
    #[error("can't add to a queue for which adding was completed")]
    AddingCompleted,

    /// Internal bookkeeping disagreed with itself. Never retried.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A blocking wait was interrupted by an external cancellation request.
    #[error("operation cancelled")]
    Cancelled,

    /// Reading the input or writing the output failed.
    #[error("{context}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    /// A stage (or codec) failure with the stage-specific description on top.
    #[error("{context}")]
    Stage {
        context: &'static str,
        #[source]
        source: Box<Error>,
    },

    /// Decompressed chunk size disagrees with the size recorded in the archive.
    #[error("decompressed size {actual} does not match original size {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// The input is not a well-formed block archive, or a block in it
    /// failed to decode.
    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    /// A [`Settings`](crate::Settings) value is out of range.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// Every failure captured from the pipeline threads of one run.
    #[error("{}", AggregateDisplay(.0))]
    Aggregate(Vec<Error>),

    /// Top-level failure of a whole conversion ("failed to compress").
    #[error("{operation}")]
    Run {
        operation: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn io(context: &'static str, source: io::Error) -> Self {
        Error::Io { context, source }
    }

    pub(crate) fn stage(context: &'static str, source: Error) -> Self {
        Error::Stage {
            context,
            source: Box::new(source),
        }
    }

    /// Returns true if this error is, or wraps, a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Stage { source, .. } | Error::Run { source, .. } => source.is_cancelled(),
            Error::Aggregate(errors) => !errors.is_empty() && errors.iter().all(Error::is_cancelled),
            _ => false,
        }
    }

    /// Walks through stage and run wrappers down to the innermost cause.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Stage { source, .. } | Error::Run { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

struct AggregateDisplay<'a>(&'a [Error]);

impl fmt::Display for AggregateDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} pipeline thread(s) failed", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            write!(f, "\n  [{}] {}", i, err)?;
            let mut source = StdError::source(err);
            while let Some(cause) = source {
                write!(f, ": {}", cause)?;
                source = StdError::source(cause);
            }
        }
        Ok(())
    }
}
