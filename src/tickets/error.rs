use axum::{http::StatusCode, response::IntoResponse, Json};
use std::time::Duration;
use uuid::Uuid;

use super::types::TicketStatus;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TicketError {
    #[error("Ticket not found: {0}")]
    NotFound(Uuid),
    #[error("Cannot modify closed ticket {0}")]
    TicketClosed(Uuid),
    #[error("Ticket is already {0}")]
    NoChange(TicketStatus),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Replies are closed for this ticket ({0})")]
    RepliesClosed(TicketStatus),
    #[error("Request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TicketError {
    /// Rejections decided locally, before or instead of a network call.
    /// These are not worth retrying.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::TicketClosed(_)
                | Self::NoChange(_)
                | Self::Validation(_)
                | Self::Unauthorized(_)
                | Self::RepliesClosed(_)
        )
    }
}

impl IntoResponse for TicketError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::FORBIDDEN,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::TicketClosed(_) | Self::NoChange(_) | Self::RepliesClosed(_) => {
                StatusCode::CONFLICT
            }
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Database(_) | Self::Connection(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// The user-initiated actions that can fail visibly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketAction {
    Submit,
    Load,
    ChangeStatus(TicketStatus),
    Resolve,
    Close,
    Rate,
    Reply,
    Delete,
}

impl std::fmt::Display for TicketAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Submit => write!(f, "submit ticket"),
            Self::Load => write!(f, "load tickets"),
            Self::ChangeStatus(status) => write!(f, "change status to {status}"),
            Self::Resolve => write!(f, "resolve ticket"),
            Self::Close => write!(f, "close ticket"),
            Self::Rate => write!(f, "submit rating"),
            Self::Reply => write!(f, "send reply"),
            Self::Delete => write!(f, "delete tickets"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Failed to {action}: {error}")]
pub struct ActionError {
    pub action: TicketAction,
    #[source]
    pub error: TicketError,
}

impl ActionError {
    pub fn new(action: TicketAction, error: TicketError) -> Self {
        Self { action, error }
    }

    /// Text for the notification shown to the user.
    pub fn notice(&self) -> String {
        if self.error.is_validation() {
            format!("Could not {}: {}", self.action, self.error)
        } else {
            format!(
                "Could not {}: {}. Please try again.",
                self.action, self.error
            )
        }
    }
}
