// SPDX-License-Identifier: MPL-2.0

use std::fmt;

/// Successful outcome of a data-flow operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlowSuccess {
    Ok,
    /// Returned by an aggregate step that produced nothing and wants to be called again.
    NeedData,
}

/// Data-flow signals that stop the normal flow of buffers.
///
/// These are not failures in the exception sense, they are propagated by return value
/// through every layer. Variants are ordered by severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, thiserror::Error)]
pub enum FlowError {
    #[error("Not linked")]
    NotLinked,
    #[error("Flushing")]
    Flushing,
    #[error("End of stream")]
    Eos,
    #[error("Not negotiated")]
    NotNegotiated,
    #[error("Error")]
    Error,
}

pub type FlowResult = Result<FlowSuccess, FlowError>;

impl FlowError {
    /// Returns the more severe of the two.
    pub fn combine(self, other: FlowError) -> FlowError {
        self.max(other)
    }
}

/// Flow state stored per input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum FlowState {
    #[default]
    Ok,
    Err(FlowError),
}

impl FlowState {
    pub(crate) fn is_ok(self) -> bool {
        matches!(self, FlowState::Ok)
    }

    pub(crate) fn err(self) -> Option<FlowError> {
        match self {
            FlowState::Ok => None,
            FlowState::Err(err) => Some(err),
        }
    }
}

impl From<FlowResult> for FlowState {
    fn from(res: FlowResult) -> Self {
        match res {
            Ok(_) => FlowState::Ok,
            Err(err) => FlowState::Err(err),
        }
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FlowState::Ok => f.write_str("ok"),
            FlowState::Err(err) => write!(f, "{err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_takes_most_severe() {
        assert_eq!(
            FlowError::NotLinked.combine(FlowError::Flushing),
            FlowError::Flushing
        );
        assert_eq!(FlowError::Error.combine(FlowError::Eos), FlowError::Error);
        assert_eq!(
            FlowError::NotNegotiated.combine(FlowError::NotLinked),
            FlowError::NotNegotiated
        );
    }

    #[test]
    fn flow_state_from_result() {
        assert!(FlowState::from(Ok(FlowSuccess::NeedData)).is_ok());
        assert_eq!(
            FlowState::from(Err(FlowError::Eos)).err(),
            Some(FlowError::Eos)
        );
    }
}
