use crate::{Error, Result};

/// The outcome of running (or cancelling) an [`Operation`](crate::Operation)
///
/// Holds exactly one of a value or a failure once settled. It's handed to
/// an operation's completion callback which then owns it.
#[derive(Debug)]
pub struct OperationResult<T> {
    outcome: Option<Result<T>>,
}

impl<T> OperationResult<T> {
    pub fn new() -> Self {
        OperationResult { outcome: None }
    }

    /// Settles the result with a value
    ///
    /// # Panics
    ///
    /// If the result has already been settled
    pub fn set_result(&mut self, value: T) {
        self.settle(Ok(value));
    }

    /// Settles the result with a failure
    ///
    /// # Panics
    ///
    /// If the result has already been settled
    pub fn set_failure(&mut self, error: Error) {
        self.settle(Err(error));
    }

    fn settle(&mut self, outcome: Result<T>) {
        assert!(self.outcome.is_none(), "OperationResult settled twice");
        self.outcome = Some(outcome);
    }

    pub fn is_settled(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, Some(Ok(_)))
    }

    pub fn error(&self) -> Option<&Error> {
        match &self.outcome {
            Some(Err(err)) => Some(err),
            _ => None,
        }
    }

    /// Borrows the value, or the failure that the operation raised
    ///
    /// # Panics
    ///
    /// If the result hasn't been settled yet, which is a programming error
    pub fn as_result(&self) -> std::result::Result<&T, &Error> {
        match &self.outcome {
            Some(outcome) => outcome.as_ref(),
            None => panic!("OperationResult read before it was settled"),
        }
    }

    /// Consumes the result, returning the value or re-raising the failure
    ///
    /// # Panics
    ///
    /// If the result hasn't been settled yet, which is a programming error
    pub fn get(self) -> Result<T> {
        match self.outcome {
            Some(outcome) => outcome,
            None => panic!("OperationResult read before it was settled"),
        }
    }
}

impl<T> Default for OperationResult<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> From<Result<T>> for OperationResult<T> {
    fn from(outcome: Result<T>) -> Self {
        OperationResult { outcome: Some(outcome) }
    }
}
