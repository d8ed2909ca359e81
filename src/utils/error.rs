use http::StatusCode;
use thiserror::Error;
use tracing::{error, info};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Classification of an error, used to pick the HTTP status and to decide
/// whether a caller may retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Unauthenticated,
    Forbidden,
    Busy,
    DependencyUnavailable,
    Internal,
    ProFeature,
    Cancelled,
}

impl ErrorKind {
    pub fn errcode(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::Unauthenticated => "UNAUTHENTICATED",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::Busy => "BUSY",
            ErrorKind::DependencyUnavailable => "DEPENDENCY_UNAVAILABLE",
            ErrorKind::Internal => "INTERNAL",
            ErrorKind::ProFeature => "PRO_FEATURE",
            ErrorKind::Cancelled => "CANCELLED",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::Busy => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::DependencyUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::ProFeature => StatusCode::PAYMENT_REQUIRED,
            // Client closed request; nginx convention, nothing standard fits
            ErrorKind::Cancelled => StatusCode::from_u16(499).expect("499 is a valid status code"),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Busy | ErrorKind::DependencyUnavailable)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("There was a problem with the connection to the coordination store: {source}")]
    RedisError {
        #[from]
        source: redis::RedisError,
    },
    #[error("There was a problem with the connection to the document store: {source}")]
    MongoError {
        #[from]
        source: mongodb::error::Error,
    },
    #[error("Could not connect to remote endpoint: {source}")]
    ReqwestError {
        #[from]
        source: reqwest::Error,
    },
    #[error("Token error: {source}")]
    JwtError {
        #[from]
        source: jsonwebtoken::errors::Error,
    },
    #[error("Could not do this io: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("{0}")]
    BadMediaServerResponse(&'static str),
    #[error("{0}")]
    BadS3Response(&'static str),
    #[error("{0}")]
    BadServerResponse(&'static str),
    #[error("{0}")]
    BadConfig(&'static str),
    /// Don't create this directly. Use Error::bad_database instead.
    #[error("{0}")]
    BadDatabase(&'static str),
    #[error("{n}: {1}", n = _0.errcode())]
    BadRequest(ErrorKind, &'static str),
    #[error("{0}")]
    Conflict(&'static str),
    #[error("{0}")]
    AdminCommand(&'static str),
}

impl Error {
    pub fn bad_database(message: &'static str) -> Self {
        error!("BadDatabase: {}", message);
        Self::BadDatabase(message)
    }

    pub fn bad_config(message: &'static str) -> Self {
        error!("BadConfig: {}", message);
        Self::BadConfig(message)
    }

    pub fn bad_media_server_response(message: &'static str) -> Self {
        info!("BadMediaServerResponse: {}", message);
        Self::BadMediaServerResponse(message)
    }

    pub fn bad_s3_response(message: &'static str) -> Self {
        info!("BadS3Response: {}", message);
        Self::BadS3Response(message)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest(kind, _) => *kind,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::RedisError { .. }
            | Self::MongoError { .. }
            | Self::ReqwestError { .. }
            | Self::BadMediaServerResponse(_)
            | Self::BadS3Response(_)
            | Self::BadServerResponse(_) => ErrorKind::DependencyUnavailable,
            Self::JwtError { .. } => ErrorKind::Unauthenticated,
            _ => ErrorKind::Internal,
        }
    }

    /// Sanitizes public-facing errors that can leak sensitive information.
    pub fn sanitized_message(&self) -> String {
        match self {
            Self::RedisError { .. }
            | Self::MongoError { .. }
            | Self::IoError { .. }
            | Self::BadConfig(_)
            | Self::BadDatabase(_) => "Database or I/O error occurred.".to_owned(),
            Self::ReqwestError { .. } => "Upstream request failed.".to_owned(),
            _ => self.to_string(),
        }
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let kind = self.kind();
        let status_code = kind.status_code();
        let message = self.sanitized_message();

        info!("Returning an error: {}: {}", status_code, message);

        (
            status_code,
            axum::Json(serde_json::json!({
                "error": kind.errcode(),
                "message": message,
            })),
        )
            .into_response()
    }
}
