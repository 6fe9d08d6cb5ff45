mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::{MemoryTicketStore, StoreOp};
#[cfg(feature = "postgres")]
pub use postgres::{DbPool, PgTicketStore};

use async_trait::async_trait;
use log::error;
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

use super::constants::SYSTEM_AUTHOR;
use super::error::TicketError;
use super::types::{
    ReplyDraft, StatusLogEntry, Ticket, TicketDraft, TicketReply, TicketStatus,
};

/// Narrow CRUD surface over persisted tickets and replies.
///
/// Implementations publish every committed write to their change feed.
/// No call retries on its own.
#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn create(&self, draft: TicketDraft) -> Result<Ticket, TicketError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Ticket, TicketError>;

    /// Newest first.
    async fn list_all(&self, status: Option<TicketStatus>) -> Result<Vec<Ticket>, TicketError>;

    /// Newest first. The email is matched after trimming and lowercasing.
    async fn list_by_email(&self, email: &str) -> Result<Vec<Ticket>, TicketError>;

    /// Refuses to touch a closed ticket. `rating`, when given, is written in
    /// the same update.
    async fn update_status(
        &self,
        id: Uuid,
        status: TicketStatus,
        rating: Option<u8>,
    ) -> Result<Ticket, TicketError>;

    /// Writes the rating only if none is stored yet and returns the stored
    /// record either way.
    async fn set_rating(&self, id: Uuid, rating: u8) -> Result<Ticket, TicketError>;

    /// Removes replies, then status history, then the tickets themselves.
    /// Unknown ids are ignored.
    async fn delete_many(&self, ids: &[Uuid]) -> Result<(), TicketError>;

    async fn create_reply(&self, ticket_id: Uuid, draft: ReplyDraft) -> Result<TicketReply, TicketError>;

    /// Oldest first.
    async fn list_replies(&self, ticket_id: Uuid) -> Result<Vec<TicketReply>, TicketError>;

    /// Oldest first.
    async fn status_history(&self, ticket_id: Uuid) -> Result<Vec<StatusLogEntry>, TicketError>;
}

/// Bounds a store call by `limit`.
pub async fn timed<T, F>(limit: Duration, fut: F) -> Result<T, TicketError>
where
    F: Future<Output = Result<T, TicketError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            error!("Store call exceeded {}ms", limit.as_millis());
            Err(TicketError::Timeout(limit))
        }
    }
}

/// Server-side reply policy shared by every store.
///
/// A notice is accepted only as a genuine system draft and only in the
/// status it announces. The system author name is reserved for notices.
pub(crate) fn check_reply_allowed(ticket: &Ticket, draft: &ReplyDraft) -> Result<(), TicketError> {
    use super::types::{AuthorKind, SystemNotice};

    if let Some(notice) = draft.notice {
        if !draft.is_system_notice() {
            return Err(TicketError::Validation(
                "notices can only be posted by the system".to_string(),
            ));
        }
        let expected = match notice {
            SystemNotice::Resolved => TicketStatus::Resolved,
            SystemNotice::RatingPrompt => TicketStatus::Closed,
        };
        if ticket.status != expected {
            return Err(TicketError::Validation(format!(
                "{} notice does not apply to a {} ticket",
                notice.as_str(),
                ticket.status
            )));
        }
        return Ok(());
    }

    match (ticket.status, draft.author_kind()) {
        (_, AuthorKind::System) => Err(TicketError::Validation(format!(
            "author name {SYSTEM_AUTHOR:?} is reserved"
        ))),
        (TicketStatus::Closed, _) => Err(TicketError::RepliesClosed(TicketStatus::Closed)),
        (TicketStatus::Resolved, AuthorKind::Guest) => {
            Err(TicketError::RepliesClosed(TicketStatus::Resolved))
        }
        _ => {
            if draft.message.trim().is_empty() {
                return Err(TicketError::Validation("reply message is empty".to_string()));
            }
            Ok(())
        }
    }
}
