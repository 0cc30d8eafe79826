use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use debitflow_core::diagnostics::DiagnosticReport;
use debitflow_core::ledger::LedgerError;
use debitflow_core::orchestrator::{FlowState, SubscriptionError};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The ledger answered badly or not at all. Carries how far the flow got
    /// and, for payment failures, the diagnostic report.
    #[error("Bad gateway: {message}")]
    BadGateway {
        message: String,
        committed_through: Option<FlowState>,
        diagnostics: Option<Box<DiagnosticReport>>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    committed_through: Option<FlowState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    diagnostics: Option<Box<DiagnosticReport>>,
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::BadGateway { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::BadGateway { .. } => "BAD_GATEWAY",
        }
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(id) => Self::NotFound(format!("subscription {id}")),
            other => Self::BadGateway {
                message: other.to_string(),
                committed_through: None,
                diagnostics: None,
            },
        }
    }
}

impl From<SubscriptionError> for AppError {
    fn from(err: SubscriptionError) -> Self {
        let message = err.to_string();
        match err {
            SubscriptionError::InvalidMerchantAddress(_)
            | SubscriptionError::InvalidAmount(_)
            | SubscriptionError::InsufficientFunds { .. } => Self::BadRequest(message),
            SubscriptionError::ConnectionRejected(_) => Self::Unauthorized(message),
            SubscriptionError::WalletUnavailable(_) => Self::ServiceUnavailable(message),
            SubscriptionError::PaymentExecutionFailed {
                diagnostics,
                committed_through,
                ..
            } => Self::BadGateway {
                message,
                committed_through: Some(committed_through),
                diagnostics: Some(diagnostics),
            },
            other => Self::BadGateway {
                committed_through: Some(other.committed_through()),
                message,
                diagnostics: None,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error = self.error_type().to_string();
        let message = self.to_string();
        let (committed_through, diagnostics) = match self {
            Self::BadGateway {
                committed_through,
                diagnostics,
                ..
            } => (committed_through, diagnostics),
            _ => (None, None),
        };
        let body = Json(ErrorResponse {
            error,
            message,
            committed_through,
            diagnostics,
        });

        (status, body).into_response()
    }
}
