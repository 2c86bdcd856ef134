//! Failure reporting for executor runs.

use tokio::task::JoinError;

/// A failed operation and the source position of the item that produced it.
#[derive(Debug)]
pub struct OperationFailure<E> {
    pub index: usize,
    pub error: E,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError<E> {
    #[error("operation {index} failed: {error}")]
    Operation { index: usize, error: E },

    /// More than one operation failed before the run finished (collect mode only).
    /// Sorted by source index.
    #[error("{} operations failed", .0.len())]
    Multiple(Vec<OperationFailure<E>>),

    /// The operation's task panicked or was aborted by the runtime.
    #[error("operation did not complete: {0}")]
    Join(JoinError),

    #[error("run cancelled before the source was exhausted")]
    Cancelled,
}

impl<E> ExecError<E> {
    /// Build the error for a non-empty set of failures.
    pub(crate) fn from_failures(mut failures: Vec<OperationFailure<E>>) -> Self {
        if failures.len() == 1
            && let Some(OperationFailure { index, error }) = failures.pop()
        {
            return Self::Operation { index, error };
        }
        failures.sort_by_key(|f| f.index);
        Self::Multiple(failures)
    }

    /// The operation errors carried by this error, in source order.
    pub fn errors(&self) -> Vec<&E> {
        match self {
            Self::Operation { error, .. } => vec![error],
            Self::Multiple(failures) => failures.iter().map(|f| &f.error).collect(),
            Self::Join(_) | Self::Cancelled => Vec::new(),
        }
    }

    /// Source indices of the failed operations, in order.
    pub fn indices(&self) -> Vec<usize> {
        match self {
            Self::Operation { index, .. } => vec![*index],
            Self::Multiple(failures) => failures.iter().map(|f| f.index).collect(),
            Self::Join(_) | Self::Cancelled => Vec::new(),
        }
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Join(e) if e.is_panic())
    }
}
