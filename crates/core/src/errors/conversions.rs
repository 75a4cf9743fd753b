//! Conversion implementations for error types

use super::types::Error;

impl From<url::ParseError> for Error {
    fn from(error: url::ParseError) -> Self {
        Error::InvalidArgument {
            operation: "parse url",
            message: error.to_string(),
        }
    }
}
