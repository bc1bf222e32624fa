use serde::{Deserialize, Serialize};

use crate::errors::{DbError, DomainError, ServiceError};

/// Error shape handed to the embedding HTTP layer: a status code, a
/// human-readable message, and the Retry-After hint for rate-limited
/// admissions. The host translates this 1:1 into its response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub status: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl ApiError {
    pub fn new(status: u16, message: &str) -> Self {
        Self {
            status,
            message: message.to_string(),
            retry_after_seconds: None,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<ServiceError> for ApiError {
    fn from(error: ServiceError) -> Self {
        let message = error.to_string();
        match error {
            ServiceError::Domain(domain) => domain_status(domain, message),
            ServiceError::EntityHasChildren { .. } => Self::new(400, &message),
            ServiceError::RateLimitExceeded {
                retry_after_seconds,
            } => Self {
                status: 429,
                message,
                retry_after_seconds: Some(retry_after_seconds),
            },
            ServiceError::PermissionDenied(_) => Self::new(403, &message),
        }
    }
}

impl From<DomainError> for ApiError {
    fn from(error: DomainError) -> Self {
        let message = error.to_string();
        domain_status(error, message)
    }
}

fn domain_status(error: DomainError, message: String) -> ApiError {
    let status = match error {
        DomainError::EntityNotFound(_, _) | DomainError::OperationNotFound(_) => 404,
        DomainError::Database(DbError::NotFound(_, _)) => 404,
        DomainError::InvalidStatusTransition { .. } => 400,
        DomainError::Validation(_) => 400,
        DomainError::VersionConflict(_, _) | DomainError::Database(DbError::Conflict(_)) => 409,
        _ => 500,
    };
    ApiError {
        status,
        message,
        retry_after_seconds: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_admission_errors_map_to_http_statuses() {
        let not_found: ApiError =
            ServiceError::Domain(DomainError::EntityNotFound("Entity".into(), Uuid::new_v4()))
                .into();
        assert_eq!(not_found.status, 404);

        let children: ApiError = ServiceError::EntityHasChildren {
            entity_id: Uuid::new_v4(),
            child_count: 2,
        }
        .into();
        assert_eq!(children.status, 400);

        let limited: ApiError = ServiceError::RateLimitExceeded {
            retry_after_seconds: 30,
        }
        .into();
        assert_eq!(limited.status, 429);
        assert_eq!(limited.retry_after_seconds, Some(30));

        let expired: ApiError =
            ServiceError::Domain(DomainError::OperationNotFound(Uuid::new_v4())).into();
        assert_eq!(expired.status, 404);

        let bad_transition: ApiError = ServiceError::Domain(DomainError::InvalidStatusTransition {
            id: Uuid::new_v4(),
            current: "completed".into(),
            expected: "failed, partial".into(),
        })
        .into();
        assert_eq!(bad_transition.status, 400);
    }
}
