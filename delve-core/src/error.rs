//! Error types for the Delve research engine.
//!
//! Uses `thiserror` for public API error types. Per-query and per-source
//! failures (`SearchError`, `ModelError`) are local to the item that failed;
//! only `ValidationError` aborts a research session.

/// Top-level error type for the Delve core library.
#[derive(Debug, thiserror::Error)]
pub enum DelveError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Invalid research parameters, raised before any external call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Research query must not be empty")]
    EmptyQuery,

    #[error("Depth {value} is out of range (1..={max})")]
    DepthOutOfRange { value: usize, max: usize },

    #[error("Breadth {value} is out of range (1..={max})")]
    BreadthOutOfRange { value: usize, max: usize },
}

/// Failures from the search capability for a single query.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SearchError {
    #[error("Search request failed: {message}")]
    Request { message: String },

    #[error("Search provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Search timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Search provider reported failure for query '{query}'")]
    Unsuccessful { query: String },

    #[error("Search response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Authentication failed for search provider {provider}")]
    AuthFailed { provider: String },
}

/// Failures from the model capability for one planning, evaluation or digest call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Reply does not match schema '{schema}': {message}")]
    SchemaMismatch { schema: String, message: String },
}

/// Cache tier faults. Always downgraded to a miss by the cache facade.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache backend failure: {message}")]
    Backend { message: String },

    #[error("Cache value serialization failed: {message}")]
    Serialization { message: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },
}

/// A type alias for results using the top-level `DelveError`.
pub type Result<T> = std::result::Result<T, DelveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_validation() {
        let err = DelveError::Validation(ValidationError::DepthOutOfRange { value: 0, max: 5 });
        assert_eq!(
            err.to_string(),
            "Validation error: Depth 0 is out of range (1..=5)"
        );
    }

    #[test]
    fn test_error_display_search() {
        let err = DelveError::Search(SearchError::Timeout { timeout_secs: 15 });
        assert_eq!(err.to_string(), "Search error: Search timed out after 15s");
    }

    #[test]
    fn test_error_display_model() {
        let err = DelveError::Model(ModelError::SchemaMismatch {
            schema: "source_reliability".into(),
            message: "missing field `score`".into(),
        });
        assert_eq!(
            err.to_string(),
            "Model error: Reply does not match schema 'source_reliability': missing field `score`"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: DelveError = io_err.into();
        assert!(matches!(err, DelveError::Io(_)));
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: DelveError = serde_err.into();
        assert!(matches!(err, DelveError::Serialization(_)));
    }

    #[test]
    fn test_model_error_variants() {
        let err = ModelError::RateLimited {
            retry_after_secs: 60,
        };
        assert_eq!(err.to_string(), "Rate limited by provider, retry after 60s");

        let err = SearchError::Unsuccessful {
            query: "rust async".into(),
        };
        assert_eq!(
            err.to_string(),
            "Search provider reported failure for query 'rust async'"
        );
    }
}
