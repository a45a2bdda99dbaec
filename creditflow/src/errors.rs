use crate::db::errors::DbError;
use crate::jobs::JobError;
use crate::ledger::LedgerError;
use crate::payment_providers::PaymentError;
use crate::types::JobId;
use crate::webhooks::ingress::WebhookError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// The identity header was missing or empty
    #[error("Not authenticated")]
    Unauthenticated { message: Option<String> },

    /// Invalid request data, rejected before any mutation
    #[error("{message}")]
    BadRequest { message: String },

    /// Requested resource not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: String, id: String },

    /// The debit was refused
    #[error("Insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits {
        job_id: Option<JobId>,
        required: i64,
        balance: i64,
    },

    /// The gateway has not collected the payment yet
    #[error("Payment not completed: {message}")]
    PaymentRequired { message: String },

    /// A signature or payment proof did not verify
    #[error("Authenticity check failed: {reason}")]
    Authenticity { reason: String },

    /// The provider could not take the job; it was failed and refunded
    #[error("Provider unavailable for job {job_id}: {detail}")]
    ProviderUnavailable { job_id: JobId, detail: String },

    /// The payment gateway failed
    #[error("Payment gateway error: {detail}")]
    GatewayUnavailable { detail: String },

    /// The resource is in a state that does not allow the operation
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Database operation error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthenticated { .. } | Error::Authenticity { .. } => StatusCode::UNAUTHORIZED,
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::InsufficientCredits { .. } | Error::PaymentRequired { .. } => StatusCode::PAYMENT_REQUIRED,
            Error::ProviderUnavailable { .. } | Error::GatewayUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::Internal { .. } | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Database(db_err) => match db_err {
                DbError::NotFound => StatusCode::NOT_FOUND,
                DbError::UniqueViolation { .. } => StatusCode::CONFLICT,
                DbError::CheckViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
                DbError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Unauthenticated { message } => message.clone().unwrap_or_else(|| "Authentication required".to_string()),
            Error::BadRequest { message } => message.clone(),
            Error::NotFound { resource, id } => format!("{resource} with ID {id} not found"),
            Error::InsufficientCredits { required, balance, .. } => {
                format!("Insufficient credits: this request costs {required} credits and your balance is {balance}")
            }
            Error::PaymentRequired { message } => message.clone(),
            Error::Authenticity { .. } => "Signature verification failed".to_string(),
            Error::ProviderUnavailable { .. } => {
                "The job could not be submitted to the provider. It has been marked failed and your credits were refunded".to_string()
            }
            Error::GatewayUnavailable { .. } => "The payment gateway is unavailable, please try again later".to_string(),
            Error::Conflict { message } => message.clone(),
            Error::Internal { .. } | Error::Other(_) => "Internal server error".to_string(),
            Error::Database(db_err) => match db_err {
                DbError::NotFound => "Resource not found".to_string(),
                DbError::UniqueViolation { .. } => "Resource already exists".to_string(),
                DbError::CheckViolation { .. } => "Invalid data provided".to_string(),
                DbError::Transient(_) => "Service temporarily unavailable, please retry".to_string(),
                DbError::Other(_) => "Database error occurred".to_string(),
            },
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::Database(DbError::Other(_) | DbError::Transient(_)) | Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Database(_) => {
                tracing::warn!("Database constraint error: {}", self);
            }
            Error::Authenticity { .. } => {
                tracing::warn!(target: "security", "Authenticity error: {}", self);
            }
            Error::ProviderUnavailable { .. } | Error::GatewayUnavailable { .. } => {
                tracing::warn!("Upstream error: {}", self);
            }
            Error::Unauthenticated { .. } => {
                tracing::info!("Authorization error: {}", self);
            }
            Error::BadRequest { .. }
            | Error::NotFound { .. }
            | Error::InsufficientCredits { .. }
            | Error::PaymentRequired { .. }
            | Error::Conflict { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let status = self.status_code();
        let message = self.user_message();

        match self {
            Error::InsufficientCredits {
                job_id,
                required,
                balance,
            } => {
                let body = json!({
                    "message": message,
                    "jobId": job_id,
                    "required": required,
                    "balance": balance,
                });
                (status, Json(body)).into_response()
            }
            Error::ProviderUnavailable { job_id, .. } => {
                let body = json!({
                    "message": message,
                    "jobId": job_id,
                });
                (status, Json(body)).into_response()
            }
            _ => (status, message).into_response(),
        }
    }
}

impl From<JobError> for Error {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Validation(message) => Error::BadRequest { message },
            JobError::InsufficientCredits {
                job_id,
                balance,
                required,
            } => Error::InsufficientCredits {
                job_id: Some(job_id),
                required,
                balance,
            },
            JobError::NotFound(id) => Error::NotFound {
                resource: "Job".to_string(),
                id: id.to_string(),
            },
            JobError::ProviderUnavailable { job_id, source } => Error::ProviderUnavailable {
                job_id,
                detail: source.to_string(),
            },
            JobError::InvalidState { job_id, state } => Error::Conflict {
                message: format!("Job {job_id} is {state}"),
            },
            JobError::IllegalTransition { .. } => Error::Internal {
                operation: format!("apply job transition: {err}"),
            },
            JobError::Ledger(ledger_err) => ledger_err.into(),
            JobError::Database(db_err) => Error::Database(db_err),
        }
    }
}

impl From<LedgerError> for Error {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientCredits { balance, required } => Error::InsufficientCredits {
                job_id: None,
                required,
                balance,
            },
            LedgerError::InvalidAmount(_) | LedgerError::InvalidReason(_) => Error::BadRequest { message: err.to_string() },
            LedgerError::Database(db_err) => Error::Database(db_err),
        }
    }
}

impl From<PaymentError> for Error {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::InvalidSignature => Error::Authenticity {
                reason: "payment signature mismatch".to_string(),
            },
            PaymentError::InvalidData(message) => Error::BadRequest { message },
            PaymentError::UnknownPlan(plan) => Error::BadRequest {
                message: format!("Unknown plan '{plan}'"),
            },
            PaymentError::OrderNotFound(order_id) => Error::NotFound {
                resource: "Order".to_string(),
                id: order_id,
            },
            PaymentError::NotPending { order_id, status } => Error::Conflict {
                message: format!("Order {order_id} is {status} and can no longer be paid"),
            },
            PaymentError::PaymentNotCompleted(order_id) => Error::PaymentRequired {
                message: format!("Payment for order {order_id} has not been completed yet"),
            },
            PaymentError::ProviderApi(detail) => Error::GatewayUnavailable { detail },
            PaymentError::Database(db_err) => Error::Database(db_err),
        }
    }
}

impl From<WebhookError> for Error {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::Signature(e) => Error::Authenticity { reason: e.to_string() },
            WebhookError::Malformed(message) => Error::BadRequest { message },
            WebhookError::Database(db_err) => Error::Database(db_err),
        }
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;
