//! Error kinds surfaced by the broker core.

use thiserror::Error;

use crate::encryption::EncryptionError;

/// Top-level broker error.
///
/// Variants map to the HTTP status codes returned to OSBAPI callers:
/// - [`BrokerError::Validation`] → 400
/// - [`BrokerError::NotFound`] → 404
/// - [`BrokerError::Gone`] → 410
/// - [`BrokerError::Conflict`] → 409
/// - [`BrokerError::Unprocessable`] and [`BrokerError::VersionGate`] → 422
/// - everything else → 500
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Malformed request, bad UUID, duplicated plan ID, parameter not in schema.
    #[error("{0}")]
    Validation(String),

    /// Unknown instance, binding, or deployment.
    #[error("{0}")]
    NotFound(String),

    /// Unknown instance or binding where OSBAPI asks for 410.
    #[error("{0}")]
    Gone(String),

    /// Duplicate-id creation.
    #[error("{0}")]
    Conflict(String),

    /// OSBAPI 422 with a machine readable error code.
    #[error("{description}")]
    Unprocessable { error: String, description: String },

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    /// Ciphertext was valid but the plaintext is not the expected JSON.
    #[error("JSON parse error: {0}")]
    Decode(String),

    #[error("{0}")]
    VersionGate(String),

    /// Non-zero exit from the IaC binary.
    #[error("{0}")]
    ExternalTool(String),

    /// The operation was interrupted by a broker shutdown.
    #[error("{0}")]
    RecoveredFromCrash(String),

    #[error("{0}")]
    Internal(String),
}

impl BrokerError {
    pub fn http_status(&self) -> u16 {
        match self {
            BrokerError::Validation(_) => 400,
            BrokerError::NotFound(_) => 404,
            BrokerError::Gone(_) => 410,
            BrokerError::Conflict(_) => 409,
            BrokerError::Unprocessable { .. } | BrokerError::VersionGate(_) => 422,
            BrokerError::Encryption(_)
            | BrokerError::Decode(_)
            | BrokerError::ExternalTool(_)
            | BrokerError::RecoveredFromCrash(_)
            | BrokerError::Internal(_) => 500,
        }
    }

    /// The OSBAPI `error` code for the response body, when one applies.
    pub fn error_code(&self) -> Option<&str> {
        match self {
            BrokerError::Unprocessable { error, .. } => Some(error.as_str()),
            _ => None,
        }
    }

    pub fn concurrency() -> Self {
        BrokerError::Unprocessable {
            error: "ConcurrencyError".to_string(),
            description: "operation already in progress".to_string(),
        }
    }

    pub fn async_required() -> Self {
        BrokerError::Unprocessable {
            error: "AsyncRequired".to_string(),
            description: "This service plan requires client support for asynchronous service operations.".to_string(),
        }
    }

    pub fn maintenance_info_conflict() -> Self {
        BrokerError::Unprocessable {
            error: "MaintenanceInfoConflict".to_string(),
            description: "The maintenance information for the requested Service Plan has changed.".to_string(),
        }
    }
}

/// Find a [`BrokerError`] anywhere in an `anyhow` chain.
pub fn find_broker_error(err: &anyhow::Error) -> Option<&BrokerError> {
    err.chain().find_map(|cause| cause.downcast_ref::<BrokerError>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_codes() {
        assert_eq!(BrokerError::Validation("x".into()).http_status(), 400);
        assert_eq!(BrokerError::Gone("x".into()).http_status(), 410);
        assert_eq!(BrokerError::Conflict("x".into()).http_status(), 409);
        assert_eq!(BrokerError::concurrency().http_status(), 422);
        assert_eq!(BrokerError::ExternalTool("x".into()).http_status(), 500);
    }

    #[test]
    fn finds_error_through_context() {
        let err = anyhow::Error::new(BrokerError::Gone("instance does not exist".into()))
            .context("deprovision");
        let found = find_broker_error(&err).unwrap();
        assert_eq!(found.http_status(), 410);
    }
}
