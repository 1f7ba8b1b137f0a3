use thiserror::Error;

/// A specialized `Result` type for pipeline operations.
pub type PipelineResult<T> = Result<T, Error>;

/// Errors surfaced by reporters and the report dispatcher.
///
/// Nothing in the span-processing pipeline itself produces a user-visible
/// failure; a faulty reporter or interceptor only ever costs the span its
/// report or its call tree. These variants exist so reporter implementations
/// have a typed error to return and so dispatch problems can be logged with
/// structure.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A reporter failed to deliver a span to its backend.
    #[error("reporter {reporter} failed: {source}")]
    ReporterFailed {
        /// Name of the failing reporter.
        reporter: &'static str,
        /// The underlying reporter error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Other errors not covered above.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl From<String> for Error {
    fn from(err_msg: String) -> Self {
        Error::Other(err_msg.into())
    }
}

impl From<&'static str> for Error {
    fn from(err_msg: &'static str) -> Self {
        Error::Other(err_msg.into())
    }
}
