//! Error type for event-table access and histogram filling.

use thiserror::Error;

/// Errors raised while reading event tables or evaluating bookings.
#[derive(Error, Debug)]
pub enum FrameError {
    /// A referenced column does not exist in the table.
    #[error("missing column: '{0}'")]
    MissingColumn(String),

    /// Expression failed to tokenize, parse or compile.
    #[error("expression error: {0}")]
    Expression(String),

    /// Column lengths or jagged offsets are inconsistent.
    #[error("shape error: {0}")]
    Shape(String),

    /// Column has an Arrow type that cannot become a numeric column.
    #[error("column '{column}' has unsupported type {data_type}")]
    UnsupportedType {
        /// Column name.
        column: String,
        /// Arrow type, rendered.
        data_type: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Parquet decoding error
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Arrow error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Worker pool could not be started.
    #[error("thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, FrameError>;

impl From<FrameError> for xs_core::Error {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Expression(_) | FrameError::ThreadPool(_) => {
                xs_core::Error::Configuration(e.to_string())
            }
            FrameError::MissingColumn(_)
            | FrameError::Shape(_)
            | FrameError::UnsupportedType { .. }
            | FrameError::Io(_)
            | FrameError::Parquet(_)
            | FrameError::Arrow(_) => xs_core::Error::DataAvailability(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xs_core::ErrorKind;

    #[test]
    fn classification() {
        let e: xs_core::Error = FrameError::MissingColumn("weightsGenie".into()).into();
        assert_eq!(e.kind(), ErrorKind::DataAvailability);
        assert!(e.to_string().contains("weightsGenie"));

        let e: xs_core::Error = FrameError::Expression("unknown function: 'foo'".into()).into();
        assert_eq!(e.kind(), ErrorKind::Configuration);
    }
}
