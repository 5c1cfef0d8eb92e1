use crate::error::{Error, ErrorKind};
use crate::response::ResponseDescriptor;

/// Terminal result of one logical request.
#[derive(Clone, Debug)]
pub enum Outcome {
    Success(ResponseDescriptor),
    Failure(Failure),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Success(_) => None,
            Self::Failure(failure) => Some(failure.kind()),
        }
    }

    pub fn response(&self) -> Option<&ResponseDescriptor> {
        match self {
            Self::Success(response) => Some(response),
            Self::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Success(_) => None,
            Self::Failure(failure) => Some(failure),
        }
    }

    pub fn into_result(self) -> Result<ResponseDescriptor, Failure> {
        match self {
            Self::Success(response) => Ok(response),
            Self::Failure(failure) => Err(failure),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{error} (attempts={attempts}, replays={replays})")]
pub struct Failure {
    error: Error,
    attempts: usize,
    replays: usize,
}

impl Failure {
    pub(crate) fn new(error: Error, attempts: usize, replays: usize) -> Self {
        Self {
            error,
            attempts,
            replays,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    pub fn error(&self) -> &Error {
        &self.error
    }

    pub fn into_error(self) -> Error {
        self.error
    }

    pub fn status(&self) -> Option<u16> {
        self.error.status()
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn replays(&self) -> usize {
        self.replays
    }
}
