use std::{error::Error, fmt, sync::Arc};
use thiserror::Error;

/// Broad class of a [`StreamError`], mirroring how the error propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rejected at construction; no stream exists.
    Construction,
    /// Misuse of a locked, closing, closed or released handle. The stream is unaffected.
    State,
    /// A sink, size or abort failure. Fatal to the stream.
    Sink,
}

#[derive(Debug, Clone, Error)]
pub enum StreamError {
    #[error("Invalid use of reserved sink field 'type' ({0})")]
    ReservedSinkType(String),
    #[error("Invalid high water mark: {0}")]
    InvalidHighWaterMark(f64),
    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(f64),
    #[error("Stream is locked")]
    Locked,
    #[error("Writer has been released")]
    Released,
    #[error("Stream is closing")]
    Closing,
    #[error("Stream is closed")]
    Closed,
    #[error("Stream was aborted{}", reason_suffix(.0))]
    Aborted(Option<String>),
    #[error("Stream task was dropped")]
    TaskDropped,
    #[error("{0}")]
    Other(#[source] Arc<dyn Error + Send + Sync>),
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason
        .as_deref()
        .map(|r| format!(": {r}"))
        .unwrap_or_default()
}

impl StreamError {
    /// Wrap any error type into `StreamError`
    pub fn other<E>(e: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        StreamError::Other(Arc::new(e))
    }

    /// Wrap a boxed error
    pub fn other_boxed(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            StreamError::ReservedSinkType(_) | StreamError::InvalidHighWaterMark(_) => {
                ErrorCategory::Construction
            }
            StreamError::Locked
            | StreamError::Released
            | StreamError::Closing
            | StreamError::Closed => ErrorCategory::State,
            StreamError::InvalidChunkSize(_)
            | StreamError::Aborted(_)
            | StreamError::TaskDropped
            | StreamError::Other(_) => ErrorCategory::Sink,
        }
    }

    /// Range errors in WHATWG terms: bad construction input or a bad chunk size.
    pub fn is_range_error(&self) -> bool {
        matches!(
            self,
            StreamError::ReservedSinkType(_)
                | StreamError::InvalidHighWaterMark(_)
                | StreamError::InvalidChunkSize(_)
        )
    }

    /// Type errors in WHATWG terms.
    pub fn is_type_error(&self) -> bool {
        self.category() == ErrorCategory::State
    }
}

#[derive(Debug)]
struct SimpleError(String);

impl fmt::Display for SimpleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for SimpleError {}

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        StreamError::Other(Arc::new(SimpleError(s.to_string())))
    }
}

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::Other(Arc::new(SimpleError(s)))
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        StreamError::Other(Arc::new(e))
    }
}

impl From<Box<dyn Error + Send + Sync>> for StreamError {
    fn from(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }
}

/// Macro for sink authors to add direct `From` implementations for their error types.
/// This allows using `?` directly without `.map_err(StreamError::other)`.
///
/// # Example
/// ```ignore
/// use writable_streams::{StreamError, impl_stream_error_from};
///
/// impl_stream_error_from!(serde_json::Error, my_crate::Error);
///
/// fn example() -> Result<(), StreamError> {
///     let data: serde_json::Value = serde_json::from_str("{}")?;
///     Ok(())
/// }
/// ```
#[macro_export]
macro_rules! impl_stream_error_from {
    ($($error_type:ty),* $(,)?) => {
        $(
            impl From<$error_type> for $crate::streams::error::StreamError {
                fn from(e: $error_type) -> Self {
                    $crate::streams::error::StreamError::Other(std::sync::Arc::new(e))
                }
            }
        )*
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_produce_other_variant() {
        let e: StreamError = "error message".into();
        assert_eq!(e.to_string(), "error message");
        assert_eq!(e.category(), ErrorCategory::Sink);

        let e: StreamError = String::from("owned").into();
        assert_eq!(e.to_string(), "owned");

        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "io error");
        let e: StreamError = io_err.into();
        assert!(e.source().is_some());
    }

    #[test]
    fn categories_follow_taxonomy() {
        assert_eq!(
            StreamError::ReservedSinkType("bytes".into()).category(),
            ErrorCategory::Construction
        );
        assert!(StreamError::InvalidHighWaterMark(-1.0).is_range_error());
        assert!(StreamError::Locked.is_type_error());
        assert!(StreamError::Released.is_type_error());
        assert!(StreamError::Closing.is_type_error());
        assert!(!StreamError::Aborted(None).is_type_error());
        assert_eq!(StreamError::TaskDropped.category(), ErrorCategory::Sink);
    }

    #[test]
    fn aborted_display_includes_reason() {
        assert_eq!(
            StreamError::Aborted(Some("cancelled".into())).to_string(),
            "Stream was aborted: cancelled"
        );
        assert_eq!(StreamError::Aborted(None).to_string(), "Stream was aborted");
    }

    #[test]
    fn question_mark_works_through_macro() {
        #[derive(Debug)]
        struct UserCustomError(String);
        impl fmt::Display for UserCustomError {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "User error: {}", self.0)
            }
        }
        impl Error for UserCustomError {}

        impl_stream_error_from!(UserCustomError);

        fn user_function() -> Result<(), StreamError> {
            fn might_fail() -> Result<(), UserCustomError> {
                Err(UserCustomError("something went wrong".to_string()))
            }
            might_fail()?;
            Ok(())
        }

        let err = user_function().unwrap_err();
        assert_eq!(err.to_string(), "User error: something went wrong");
    }
}
