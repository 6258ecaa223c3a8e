use thiserror::Error;

/// How a remote failure should be treated by the callers that drive traversals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    RateLimited,
    Transient,
    Permanent,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("database connection error: {0}")]
    Connection(#[from] tokio_rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("feed parse error: {0}")]
    FeedParse(#[from] feed_rs::parser::ParseFeedError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("remote error: {message}")]
    Remote {
        kind: RemoteErrorKind,
        message: String,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("adapter error: {0}")]
    Adapter(String),

    #[error("post {0} has neither a sort index nor a numeric original id")]
    MissingSortIndex(i64),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn remote(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        AppError::Remote {
            kind,
            message: message.into(),
        }
    }

    /// Maps an HTTP status to the remote error taxonomy.
    pub fn from_status(status: reqwest::StatusCode, context: &str) -> Self {
        let kind = if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            RemoteErrorKind::RateLimited
        } else if status.is_server_error() || status == reqwest::StatusCode::REQUEST_TIMEOUT {
            RemoteErrorKind::Transient
        } else {
            RemoteErrorKind::Permanent
        };
        let message = if kind == RemoteErrorKind::RateLimited {
            format!("{}: rate limit reached (HTTP {})", context, status)
        } else {
            format!("{}: HTTP {}", context, status)
        };
        AppError::Remote { kind, message }
    }

    pub fn is_rate_limited(&self) -> bool {
        match self {
            AppError::Remote {
                kind: RemoteErrorKind::RateLimited,
                ..
            } => true,
            other => other.to_string().to_lowercase().contains("rate limit"),
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Remote { kind, .. } => *kind != RemoteErrorKind::Permanent,
            AppError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
            other => other.is_rate_limited(),
        }
    }

    /// True for unique-constraint and foreign-key violations reported by SQLite.
    pub fn is_constraint_violation(&self) -> bool {
        let inner = match self {
            AppError::Database(e) => Some(e),
            AppError::Connection(tokio_rusqlite::Error::Rusqlite(e)) => Some(e),
            _ => None,
        };
        matches!(
            inner,
            Some(rusqlite::Error::SqliteFailure(f, _))
                if f.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }

    /// Turns constraint violations into `Conflict` so callers see a local integrity error.
    pub fn into_conflict(self, what: &str) -> Self {
        if self.is_constraint_violation() {
            AppError::Conflict(format!("{}: {}", what, self))
        } else {
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_detected_from_message() {
        let err = AppError::Adapter("Rate Limit exceeded, try later".into());
        assert!(err.is_rate_limited());
        assert!(err.is_transient());

        let err = AppError::Adapter("not found".into());
        assert!(!err.is_rate_limited());
        assert!(!err.is_transient());
    }

    #[test]
    fn status_classification() {
        let err = AppError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "list");
        assert!(err.is_rate_limited());

        let err = AppError::from_status(reqwest::StatusCode::BAD_GATEWAY, "list");
        assert!(err.is_transient());
        assert!(!err.is_rate_limited());

        let err = AppError::from_status(reqwest::StatusCode::NOT_FOUND, "list");
        assert!(!err.is_transient());
    }
}
