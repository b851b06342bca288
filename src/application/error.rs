use std::error::Error as StdError;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::{application::delegate::DelegateError, domain::GateError, infra::error::InfraError};

#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    public_message: &'static str,
    report: ErrorReport,
}

impl HttpError {
    pub fn from_error(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        error: &dyn StdError,
    ) -> Self {
        let report = ErrorReport::from_error(source, status, error);
        Self {
            status,
            public_message,
            report,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.public_message).into_response();
        self.report.attach(&mut response);
        response
    }
}

impl From<DelegateError> for HttpError {
    fn from(error: DelegateError) -> Self {
        const SOURCE: &str = "application::error::delegate_error_to_http_error";
        match &error {
            DelegateError::Gate(GateError::AmbiguousCredential { .. }) => HttpError::from_error(
                SOURCE,
                StatusCode::BAD_REQUEST,
                "Too many credential headers",
                &error,
            ),
            DelegateError::Gate(GateError::InvalidCredential { .. }) => HttpError::from_error(
                SOURCE,
                StatusCode::BAD_REQUEST,
                "Invalid credential header",
                &error,
            ),
            DelegateError::Gate(GateError::Decode { .. }) => HttpError::from_error(
                SOURCE,
                StatusCode::BAD_REQUEST,
                "Malformed resource identifier",
                &error,
            ),
            DelegateError::Gate(GateError::UnknownSite { .. }) => HttpError::from_error(
                SOURCE,
                StatusCode::NOT_FOUND,
                "Unknown site",
                &error,
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}
