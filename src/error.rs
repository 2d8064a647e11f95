use std::fmt;

use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;

use crate::models::{Id, ValidationError};
use crate::repo::RepoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Thread,
    Message,
    Participant,
    Intervention,
    User,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Resource::Thread => "thread",
            Resource::Message => "message",
            Resource::Participant => "participant",
            Resource::Intervention => "intervention",
            Resource::User => "user",
        };
        f.write_str(s)
    }
}

/// Failure kinds surfaced by the conversation service. The first four are caller-facing and
/// always reported as-is; `Timeout` and `Internal` come from the storage layer.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConversationError {
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },
    #[error("permission denied: {action}")]
    Permission { action: &'static str },
    #[error("{resource} {id} not found")]
    NotFound { resource: Resource, id: Id },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage call timed out")]
    Timeout,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ConversationError {
    pub fn permission(action: &'static str) -> Self {
        ConversationError::Permission { action }
    }

    pub fn not_found(resource: Resource, id: Id) -> Self {
        ConversationError::NotFound { resource, id }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ConversationError::Validation { .. } => "validation",
            ConversationError::Permission { .. } => "permission",
            ConversationError::NotFound { .. } => "not_found",
            ConversationError::Conflict(_) => "conflict",
            ConversationError::Timeout => "timeout",
            ConversationError::Internal(_) => "internal",
        }
    }
}

impl From<ValidationError> for ConversationError {
    fn from(e: ValidationError) -> Self {
        ConversationError::Validation { field: e.field, reason: e.reason }
    }
}

impl From<RepoError> for ConversationError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::NotFound { resource, id } => ConversationError::NotFound { resource, id },
            RepoError::Conflict(reason) => ConversationError::Conflict(reason),
            RepoError::Validation(v) => v.into(),
            RepoError::Internal(msg) => ConversationError::Internal(msg),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: String,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<Resource>,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Conversation(#[from] ConversationError),
    #[error("unauthorized")]
    Unauthorized,
    #[error("too many requests")]
    TooManyRequests,
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            ApiError::Conversation(e) => match e {
                ConversationError::Validation { .. } => StatusCode::BAD_REQUEST,
                ConversationError::Permission { .. } => StatusCode::FORBIDDEN,
                ConversationError::NotFound { .. } => StatusCode::NOT_FOUND,
                ConversationError::Conflict(_) => StatusCode::CONFLICT,
                ConversationError::Timeout => StatusCode::GATEWAY_TIMEOUT,
                ConversationError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = match self {
            ApiError::Conversation(e) => ApiErrorBody {
                // internal details stay in the logs
                error: match e {
                    ConversationError::Internal(_) => "internal error".to_string(),
                    other => other.to_string(),
                },
                kind: e.kind(),
                field: match e {
                    ConversationError::Validation { field, .. } => Some(*field),
                    _ => None,
                },
                resource: match e {
                    ConversationError::NotFound { resource, .. } => Some(*resource),
                    _ => None,
                },
            },
            ApiError::Unauthorized => ApiErrorBody { error: self.to_string(), kind: "unauthorized", field: None, resource: None },
            ApiError::TooManyRequests => ApiErrorBody { error: self.to_string(), kind: "rate_limited", field: None, resource: None },
            ApiError::BadRequest(_) => ApiErrorBody { error: self.to_string(), kind: "validation", field: None, resource: None },
        };
        HttpResponse::build(self.status_code()).json(body)
    }
}
