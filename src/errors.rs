//! Definition of errors.

use core::fmt;

use std::error::Error;

/// Error used when the argument is invalid.
#[derive(Debug)]
pub struct InvalidArgumentError {
    msg: String,
}

/// Error used when a value that must stay fixed during training changes.
#[derive(Debug)]
pub struct InconsistentError {
    msg: String,
}

/// Error used when a NaN is found in a weight, an accumulator, or a cost.
#[derive(Debug)]
pub struct NotANumberError {
    msg: String,
}

/// Error used when the optimizer fails and cannot be recovered.
#[derive(Debug)]
pub struct OptimizerError {
    msg: String,
}

/// The error type for fsacrf.
#[derive(Debug)]
pub enum CrfError {
    /// The argument is invalid.
    InvalidArgument(InvalidArgumentError),

    /// An internal consistency check failed.
    Inconsistent(InconsistentError),

    /// A NaN was found.
    NotANumber(NotANumberError),

    /// The optimizer failed.
    Optimizer(OptimizerError),
}

impl fmt::Display for InvalidArgumentError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "InvalidArgumentError: {}", self.msg)
    }
}

impl Error for InvalidArgumentError {}

impl fmt::Display for InconsistentError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "InconsistentError: {}", self.msg)
    }
}

impl Error for InconsistentError {}

impl fmt::Display for NotANumberError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "NotANumberError: {}", self.msg)
    }
}

impl Error for NotANumberError {}

impl fmt::Display for OptimizerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "OptimizerError: {}", self.msg)
    }
}

impl Error for OptimizerError {}

impl CrfError {
    /// Creates a new [`InvalidArgumentError`].
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Self::InvalidArgument(InvalidArgumentError { msg: msg.into() })
    }

    /// Creates a new [`InconsistentError`].
    pub fn inconsistent<S: Into<String>>(msg: S) -> Self {
        Self::Inconsistent(InconsistentError { msg: msg.into() })
    }

    /// Creates a new [`NotANumberError`].
    pub fn not_a_number<S: Into<String>>(msg: S) -> Self {
        Self::NotANumber(NotANumberError { msg: msg.into() })
    }

    /// Creates a new [`OptimizerError`].
    pub fn optimizer<S: Into<String>>(msg: S) -> Self {
        Self::Optimizer(OptimizerError { msg: msg.into() })
    }
}

impl fmt::Display for CrfError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidArgument(e) => e.fmt(f),
            Self::Inconsistent(e) => e.fmt(f),
            Self::NotANumber(e) => e.fmt(f),
            Self::Optimizer(e) => e.fmt(f),
        }
    }
}

impl Error for CrfError {}

/// A specialized Result type.
pub type Result<T, E = CrfError> = core::result::Result<T, E>;
