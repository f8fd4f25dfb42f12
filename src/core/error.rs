//! Error type system for the catalog host
//!
//! Every fallible operation in the library returns [`CatalogError`]. The
//! install pipeline maps these onto the `Error` install step; the loader maps
//! them onto a failed-to-load marker; the binary wraps them in `anyhow`.

/// Main error type for catalog lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Filesystem error: {0}")]
    FilesystemError(#[from] std::io::Error),

    /// A host still answered `429` after the client slowed down and retried
    #[error("Host throttled: {0}")]
    HostThrottled(String),

    #[error("Catalog not found: {0}")]
    NotFound(String),

    #[error("Catalog load failed: {0}")]
    LoadFailed(String),

    #[error("Catalog execution error: {0}")]
    Execution(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for CatalogError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CatalogError::Timeout(err.to_string())
        } else {
            CatalogError::DownloadFailed(err.to_string())
        }
    }
}

impl From<zip::result::ZipError> for CatalogError {
    fn from(err: zip::result::ZipError) -> Self {
        CatalogError::ValidationFailed(format!("unreadable package archive: {}", err))
    }
}

impl From<url::ParseError> for CatalogError {
    fn from(err: url::ParseError) -> Self {
        CatalogError::DownloadFailed(format!("invalid url: {}", err))
    }
}

impl CatalogError {
    /// Stable identifier used in structured log fields
    pub fn error_type(&self) -> &'static str {
        match self {
            CatalogError::DownloadFailed(_) => "DownloadFailed",
            CatalogError::ValidationFailed(_) => "ValidationFailed",
            CatalogError::FilesystemError(_) => "FilesystemError",
            CatalogError::HostThrottled(_) => "HostThrottled",
            CatalogError::NotFound(_) => "NotFound",
            CatalogError::LoadFailed(_) => "LoadFailed",
            CatalogError::Execution(_) => "Execution",
            CatalogError::Timeout(_) => "Timeout",
            CatalogError::Cancelled(_) => "Cancelled",
            CatalogError::Config(_) => "Config",
            CatalogError::Serialization(_) => "Serialization",
        }
    }

    /// Whether a caller may reasonably retry the operation unchanged.
    ///
    /// The installer never retries on its own; this only informs callers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CatalogError::DownloadFailed(_)
                | CatalogError::Timeout(_)
                | CatalogError::HostThrottled(_)
        )
    }
}

/// Result type alias for catalog operations
pub type Result<T> = std::result::Result<T, CatalogError>;

/// Extension trait for attaching context to errors from foreign crates
pub trait ErrorContext<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context to an error using a closure
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ErrorContext<T> for std::result::Result<T, std::io::Error> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        let context = context.into();
        self.map_err(|e| {
            CatalogError::FilesystemError(std::io::Error::new(e.kind(), format!("{}: {}", context, e)))
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let context = f();
            CatalogError::FilesystemError(std::io::Error::new(e.kind(), format!("{}: {}", context, e)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_types() {
        assert_eq!(
            CatalogError::DownloadFailed("403".into()).error_type(),
            "DownloadFailed"
        );
        assert_eq!(
            CatalogError::ValidationFailed("empty".into()).error_type(),
            "ValidationFailed"
        );
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(CatalogError::from(io).error_type(), "FilesystemError");
    }

    #[test]
    fn test_error_retryable() {
        assert!(CatalogError::DownloadFailed("x".into()).is_retryable());
        assert!(CatalogError::Timeout("x".into()).is_retryable());
        assert!(!CatalogError::ValidationFailed("x".into()).is_retryable());
        assert!(!CatalogError::Cancelled("x".into()).is_retryable());
    }

    #[test]
    fn test_io_context_keeps_kind() {
        let res: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        let err = res.context("creating staging dir").unwrap_err();
        match err {
            CatalogError::FilesystemError(e) => {
                assert_eq!(e.kind(), std::io::ErrorKind::PermissionDenied);
                assert!(e.to_string().starts_with("creating staging dir"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
