//! Error types for xsyst

use std::fmt;

use thiserror::Error;

/// Broad classification of a failure.
///
/// The orchestrator branches on the kind: everything except [`ErrorKind::StoreIo`]
/// aborts only the systematic being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing or malformed configuration.
    Configuration,
    /// A column or nominal histogram the computation needs is absent.
    DataAvailability,
    /// Input is well formed but carries nothing to decompose.
    DegenerateInput,
    /// The template store cannot be opened or written.
    StoreIo,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::DataAvailability => "data availability",
            ErrorKind::DegenerateInput => "degenerate input",
            ErrorKind::StoreIo => "store I/O",
        };
        f.write_str(s)
    }
}

/// xsyst error type
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or malformed catalogue column, unknown sample category, invalid option.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Missing weight/ratio column or nominal histogram.
    #[error("Data availability error: {0}")]
    DataAvailability(String),

    /// Degenerate nominal stack or undeterminable universe count.
    #[error("Degenerate input: {0}")]
    DegenerateInput(String),

    /// Template store could not be opened or written.
    #[error("Store I/O error: {0}")]
    StoreIo(String),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::DataAvailability(_) => ErrorKind::DataAvailability,
            Error::DegenerateInput(_) => ErrorKind::DegenerateInput,
            Error::StoreIo(_) => ErrorKind::StoreIo,
        }
    }

    /// Whether this error must stop the whole run rather than one systematic.
    pub fn aborts_run(&self) -> bool {
        self.kind() == ErrorKind::StoreIo
    }

    /// Prefix the message with `ctx` (systematic, sample, key), keeping the kind.
    pub fn context(self, ctx: impl fmt::Display) -> Self {
        match self {
            Error::Configuration(m) => Error::Configuration(format!("{ctx}: {m}")),
            Error::DataAvailability(m) => Error::DataAvailability(format!("{ctx}: {m}")),
            Error::DegenerateInput(m) => Error::DegenerateInput(format!("{ctx}: {m}")),
            Error::StoreIo(m) => Error::StoreIo(format!("{ctx}: {m}")),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
