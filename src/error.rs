#[cfg(feature = "web")]
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Failures of the file-backed store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt data file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to replace data file: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("{0} is already registered")]
    Duplicate(&'static str),

    #[error("User {0} not found")]
    UserNotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Rejected glucose readings
#[derive(Error, Debug, PartialEq)]
pub enum ReadingError {
    #[error("Glucose value must be a number")]
    NotFinite,

    #[error("Glucose value {0:.1} mg/dL is outside the accepted range")]
    OutOfRange(f64),

    #[error("Reading time is in the future")]
    InFuture,

    #[error("Note is longer than {0} characters")]
    NoteTooLong(usize),
}

/// One-time password verification failures
#[derive(Error, Debug, PartialEq)]
pub enum OtpError {
    #[error("No verification code was requested")]
    Missing,

    #[error("Verification code was issued for a different purpose")]
    WrongPurpose,

    #[error("Verification code expired")]
    Expired,

    #[error("Invalid verification code, {remaining} attempts left")]
    Mismatch { remaining: u32 },

    #[error("Too many failed attempts, request a new code")]
    Locked,

    #[error("Please wait {0} seconds before requesting another code")]
    Cooldown(i64),
}

/// Account and session failures
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Email address has not been verified")]
    NotVerified,

    #[error("Email address is already verified")]
    AlreadyVerified,

    #[error("No account is registered with this email")]
    UnknownEmail,

    #[error("New passwords don't match")]
    PasswordMismatch,

    #[error("Password hashing failed")]
    Hash,

    #[error(transparent)]
    Otp(#[from] OtpError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// CSV import failures that abort the whole file
#[derive(Error, Debug, PartialEq)]
pub enum ImportError {
    #[error("CSV file is empty")]
    Empty,

    #[error("Missing required column: {0}")]
    MissingColumn(&'static str),
}

/// Configuration errors detected at startup
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid {key} value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("Failed to read secret file {path}: {source}")]
    Secret {
        path: String,
        source: std::io::Error,
    },
}

/// Errors returned by HTTP handlers
#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    TooManyRequests(String),

    #[error("Failed to send email: {0}")]
    Mail(String),

    #[error("Internal error: {0}")]
    Internal(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(_) => AppError::Conflict(err.to_string()),
            StoreError::UserNotFound(_) => AppError::NotFound(err.to_string()),
            StoreError::InvalidKey(_) => AppError::BadRequest(err.to_string()),
            other => AppError::Internal(Box::new(other)),
        }
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidInput(msg) => AppError::BadRequest(msg),
            AuthError::PasswordMismatch | AuthError::AlreadyVerified => {
                AppError::BadRequest(err.to_string())
            }
            AuthError::InvalidCredentials => AppError::Unauthorized(err.to_string()),
            AuthError::NotVerified => AppError::Forbidden(err.to_string()),
            AuthError::UnknownEmail => AppError::NotFound(err.to_string()),
            AuthError::Otp(OtpError::Cooldown(_)) | AuthError::Otp(OtpError::Locked) => {
                AppError::TooManyRequests(err.to_string())
            }
            AuthError::Otp(_) => AppError::BadRequest(err.to_string()),
            AuthError::Store(store) => store.into(),
            AuthError::Hash => AppError::Internal(err.to_string().into()),
        }
    }
}

impl From<ReadingError> for AppError {
    fn from(err: ReadingError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl From<ImportError> for AppError {
    fn from(err: ImportError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

#[cfg(feature = "web")]
impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Mail(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(feature = "web")]
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("{}", self);
        }

        (
            status,
            Json(serde_json::json!({
                "status": "error",
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}
