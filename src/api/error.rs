//! Error responses: `{"error": kind, "message": ..., "decision_id"?: ...}`.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use crate::error::{ConnectorError, CoordinationError, PolicyError};

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    decision_id: Option<Uuid>,
}

/// An error on its way to the client.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
    decision_id: Option<Uuid>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "Validation",
            message: message.into(),
            decision_id: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

fn status_for(err: &CoordinationError) -> StatusCode {
    use CoordinationError::*;
    match err {
        NotFound(_) => StatusCode::NOT_FOUND,
        TaskNotClaimable { .. } | LockConflict { .. } | InvalidTransition { .. } | RetryExhausted { .. } => {
            StatusCode::CONFLICT
        }
        ClaimExpired { .. } => StatusCode::GONE,
        NotOwner { .. } | PolicyViolation { .. } => StatusCode::FORBIDDEN,
        EvidenceRequired { .. } | EvidenceInvalid { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        CyclicDependency { .. } | Validation(_) => StatusCode::BAD_REQUEST,
        Connector(ConnectorError::NotAllowed(_)) => StatusCode::FORBIDDEN,
        Connector(_) => StatusCode::BAD_GATEWAY,
        Audit(_) | Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<CoordinationError> for ApiError {
    fn from(err: CoordinationError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            error!(error = %err, "Request failed");
        }
        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
            decision_id: err.decision_id(),
        }
    }
}

impl From<ConnectorError> for ApiError {
    fn from(err: ConnectorError) -> Self {
        CoordinationError::Connector(err).into()
    }
}

impl From<PolicyError> for ApiError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::Io(_) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                kind: "Policy",
                message: err.to_string(),
                decision_id: None,
            },
            other => Self::bad_request(other.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            kind: "Validation",
            message: rejection.body_text(),
            decision_id: None,
        }
    }
}

/// `Json` body extractor whose rejections use the API error body.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.kind,
            message: self.message,
            decision_id: self.decision_id,
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::model::TaskStatus;

    #[test]
    fn taxonomy_maps_to_status_codes() {
        let id = Uuid::new_v4();
        let cases = [
            (CoordinationError::NotFound(id), StatusCode::NOT_FOUND),
            (
                CoordinationError::LockConflict {
                    resource: "task".into(),
                    holder: "w1".into(),
                },
                StatusCode::CONFLICT,
            ),
            (
                CoordinationError::InvalidTransition {
                    id,
                    from: TaskStatus::Done,
                    to: TaskStatus::Queued,
                },
                StatusCode::CONFLICT,
            ),
            (CoordinationError::ClaimExpired { id }, StatusCode::GONE),
            (
                CoordinationError::NotOwner {
                    id,
                    worker: "w".into(),
                },
                StatusCode::FORBIDDEN,
            ),
            (
                CoordinationError::EvidenceInvalid {
                    reason: "r".into(),
                    decision_id: id,
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (CoordinationError::CyclicDependency { cycle: vec![id, id] }, StatusCode::BAD_REQUEST),
            (
                CoordinationError::Connector(ConnectorError::NotAllowed("rm".into())),
                StatusCode::FORBIDDEN,
            ),
            (
                CoordinationError::Connector(ConnectorError::SpawnFailed("x".into())),
                StatusCode::BAD_GATEWAY,
            ),
            (CoordinationError::Audit("gone".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn denial_carries_decision_id() {
        let decision_id = Uuid::new_v4();
        let api: ApiError = CoordinationError::PolicyViolation {
            reason: "no secrets".into(),
            decision_id,
        }
        .into();
        assert_eq!(api.status(), StatusCode::FORBIDDEN);
        assert_eq!(api.kind, "PolicyViolation");
        assert_eq!(api.decision_id, Some(decision_id));
    }
}
