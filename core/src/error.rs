//! Errors shared across components.

use std::error::Error;
use std::fmt;

/// Several independent failures reported as one.
///
/// Batch operations (fan-out, change-feed batches, reset sweeps) continue past
/// individual failures and return every cause together. `Display` renders
/// `"<message>: <e1>; <e2>; ..."`.
#[derive(Debug)]
pub struct AggregateError<E> {
    message: String,
    errors: Vec<E>,
}

impl<E> AggregateError<E> {
    /// Wrap `errors` under a summary `message`.
    #[must_use]
    pub fn new(message: impl Into<String>, errors: Vec<E>) -> Self {
        Self {
            message: message.into(),
            errors,
        }
    }

    /// Summary message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Individual causes, in the order they occurred.
    #[must_use]
    pub fn errors(&self) -> &[E] {
        &self.errors
    }

    /// Consume into the individual causes.
    #[must_use]
    pub fn into_errors(self) -> Vec<E> {
        self.errors
    }

    /// Number of causes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// `true` when no cause was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl<E: fmt::Display> fmt::Display for AggregateError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.message)?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl<E: Error + 'static> Error for AggregateError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.errors.first().map(|e| e as &(dyn Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thiserror::Error;

    #[derive(Error, Debug)]
    #[error("item {0} failed")]
    struct ItemFailed(u32);

    #[test]
    fn display_joins_causes() {
        let err = AggregateError::new(
            "Failed to process batch",
            vec![ItemFailed(1), ItemFailed(3)],
        );

        assert_eq!(
            err.to_string(),
            "Failed to process batch: item 1 failed; item 3 failed"
        );
        assert_eq!(err.len(), 2);
        assert!(err.source().is_some());
    }
}
