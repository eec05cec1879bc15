//! Error types for the metric store, chart handler and report archive.

use std::path::{Path, PathBuf};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse failure class.
///
/// Chart requests swallow both classes after logging them; archive and
/// store operations hand them back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad, missing or unknown request parameter.
    Validation,
    /// Storage unreadable or unwritable, copy interrupted, encoding failed.
    Io,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed metric history {}: line {line}: {message}", .path.display())]
    CorruptHistory {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Chart rendering failed: {0}")]
    Render(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn corrupt(path: &Path, line: usize, message: impl Into<String>) -> Self {
        Self::CorruptHistory {
            path: path.to_path_buf(),
            line,
            message: message.into(),
        }
    }

    pub fn render(message: impl Into<String>) -> Self {
        Self::Render(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Io { .. }
            | Self::CorruptHistory { .. }
            | Self::Render(_)
            | Self::Config(_)
            | Self::Json(_) => ErrorKind::Io,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(Error::validation("no metric").kind(), ErrorKind::Validation);
        assert_eq!(
            Error::io("read", std::io::Error::other("boom")).kind(),
            ErrorKind::Io
        );
        assert_eq!(
            Error::corrupt(Path::new("h.csv"), 3, "bad").kind(),
            ErrorKind::Io
        );
        assert_eq!(Error::render("encode").kind(), ErrorKind::Io);
    }

    #[test]
    fn test_corrupt_message_names_file_and_line() {
        let err = Error::corrupt(Path::new("/tmp/history.csv"), 7, "expected 4 fields, got 3");
        let text = err.to_string();
        assert!(text.contains("/tmp/history.csv"));
        assert!(text.contains("line 7"));
        assert!(text.contains("expected 4 fields"));
    }
}
