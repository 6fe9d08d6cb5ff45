use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, info};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{check_reply_allowed, TicketStore};
use crate::tickets::error::TicketError;
use crate::tickets::feed::{BroadcastChangeFeed, FeedEvent};
use crate::tickets::types::{
    check_rating, normalize_email, ReplyDraft, StatusLogEntry, Ticket, TicketDraft, TicketReply,
    TicketStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Create,
    GetById,
    List,
    UpdateStatus,
    SetRating,
    DeleteMany,
    CreateReply,
    ListReplies,
    StatusHistory,
}

#[derive(Default)]
struct MemoryState {
    tickets: Vec<Ticket>,
    replies: Vec<TicketReply>,
    status_logs: Vec<StatusLogEntry>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl MemoryState {
    /// Strictly increasing, so `updated_at` comparisons never tie.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_timestamp {
            Some(last) if now <= last => last + ChronoDuration::microseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }

    fn ticket_mut(&mut self, id: Uuid) -> Result<&mut Ticket, TicketError> {
        self.tickets
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(TicketError::NotFound(id))
    }
}

/// Store kept entirely in process memory. Used when no database is
/// configured, and by tests through its fault and latency hooks.
pub struct MemoryTicketStore {
    state: RwLock<MemoryState>,
    feed: BroadcastChangeFeed,
    faults: Mutex<HashSet<StoreOp>>,
    latency: Mutex<Option<Duration>>,
    calls: Mutex<HashMap<StoreOp, usize>>,
}

impl MemoryTicketStore {
    pub fn new(feed: BroadcastChangeFeed) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            feed,
            faults: Mutex::new(HashSet::new()),
            latency: Mutex::new(None),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn feed(&self) -> &BroadcastChangeFeed {
        &self.feed
    }

    /// Makes the next call of `op` fail with a connection error.
    pub fn fail_next(&self, op: StoreOp) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.insert(op);
        }
    }

    /// Delays every subsequent call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut slot) = self.latency.lock() {
            *slot = latency;
        }
    }

    /// How many times `op` has been attempted, failures included.
    pub fn call_count(&self, op: StoreOp) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.get(&op).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Overwrites a stored status without any checks, the way an external
    /// writer with direct table access would.
    pub async fn force_status_raw(&self, id: Uuid, raw_status: &str) -> Result<Ticket, TicketError> {
        let ticket = {
            let mut state = self.state.write().await;
            let ts = state.next_timestamp();
            let ticket = state.ticket_mut(id)?;
            ticket.status = TicketStatus::from_stored(raw_status);
            ticket.updated_at = Some(ts);
            ticket.clone()
        };
        self.feed.publish(FeedEvent::TicketUpdated { ticket: ticket.clone() });
        Ok(ticket)
    }

    async fn enter(&self, op: StoreOp) -> Result<(), TicketError> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(op).or_insert(0) += 1;
        }
        let latency = self.latency.lock().ok().and_then(|l| *l);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let injected = self
            .faults
            .lock()
            .map(|mut faults| faults.remove(&op))
            .unwrap_or(false);
        if injected {
            debug!("Injected failure for {op:?}");
            return Err(TicketError::Connection(format!("injected failure for {op:?}")));
        }
        Ok(())
    }
}

fn newest_first(mut tickets: Vec<Ticket>) -> Vec<Ticket> {
    tickets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    tickets
}

#[async_trait]
impl TicketStore for MemoryTicketStore {
    async fn create(&self, draft: TicketDraft) -> Result<Ticket, TicketError> {
        self.enter(StoreOp::Create).await?;
        draft.validate()?;
        let draft = draft.normalized();

        let ticket = {
            let mut state = self.state.write().await;
            let now = state.next_timestamp();
            let ticket = Ticket {
                id: Uuid::new_v4(),
                name: draft.name,
                email: draft.email,
                subject: draft.subject,
                message: draft.message,
                status: TicketStatus::Open,
                created_at: now,
                updated_at: Some(now),
                rating: None,
            };
            state.tickets.push(ticket.clone());
            state.status_logs.push(StatusLogEntry {
                id: Uuid::new_v4(),
                ticket_id: ticket.id,
                old_status: None,
                new_status: TicketStatus::Open,
                created_at: now,
            });
            ticket
        };

        info!("Created ticket {}", ticket.id);
        self.feed.publish(FeedEvent::TicketInserted { ticket: ticket.clone() });
        Ok(ticket)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Ticket, TicketError> {
        self.enter(StoreOp::GetById).await?;
        let state = self.state.read().await;
        state
            .tickets
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or(TicketError::NotFound(id))
    }

    async fn list_all(&self, status: Option<TicketStatus>) -> Result<Vec<Ticket>, TicketError> {
        self.enter(StoreOp::List).await?;
        let state = self.state.read().await;
        let tickets = state
            .tickets
            .iter()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        Ok(newest_first(tickets))
    }

    async fn list_by_email(&self, email: &str) -> Result<Vec<Ticket>, TicketError> {
        self.enter(StoreOp::List).await?;
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(TicketError::Validation("email is required".to_string()));
        }
        let state = self.state.read().await;
        let tickets = state
            .tickets
            .iter()
            .filter(|t| t.email == email)
            .cloned()
            .collect();
        Ok(newest_first(tickets))
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: TicketStatus,
        rating: Option<u8>,
    ) -> Result<Ticket, TicketError> {
        self.enter(StoreOp::UpdateStatus).await?;
        if let Some(r) = rating {
            check_rating(r)?;
        }

        let (ticket, previous) = {
            let mut state = self.state.write().await;
            let now = state.next_timestamp();
            let ticket = state.ticket_mut(id)?;
            if ticket.is_closed() {
                return Err(TicketError::TicketClosed(id));
            }
            let previous = ticket.status;
            ticket.status = status;
            if let Some(r) = rating {
                if !ticket.has_rating() {
                    ticket.rating = Some(r);
                }
            }
            ticket.updated_at = Some(now);
            let ticket = ticket.clone();
            if previous != status {
                state.status_logs.push(StatusLogEntry {
                    id: Uuid::new_v4(),
                    ticket_id: id,
                    old_status: Some(previous),
                    new_status: status,
                    created_at: now,
                });
            }
            (ticket, previous)
        };

        info!("Ticket {id} updated from {previous} to {status}");
        self.feed.publish(FeedEvent::TicketUpdated { ticket: ticket.clone() });
        Ok(ticket)
    }

    async fn set_rating(&self, id: Uuid, rating: u8) -> Result<Ticket, TicketError> {
        self.enter(StoreOp::SetRating).await?;
        check_rating(rating)?;

        let (ticket, written) = {
            let mut state = self.state.write().await;
            let now = state.next_timestamp();
            let ticket = state.ticket_mut(id)?;
            if !ticket.is_closed() {
                return Err(TicketError::Validation(
                    "tickets can only be rated once closed".to_string(),
                ));
            }
            let written = !ticket.has_rating();
            if written {
                ticket.rating = Some(rating);
                ticket.updated_at = Some(now);
            }
            (ticket.clone(), written)
        };

        if written {
            info!("Ticket {id} rated {rating}");
            self.feed.publish(FeedEvent::TicketUpdated { ticket: ticket.clone() });
        }
        Ok(ticket)
    }

    async fn delete_many(&self, ids: &[Uuid]) -> Result<(), TicketError> {
        self.enter(StoreOp::DeleteMany).await?;
        let doomed: HashSet<Uuid> = ids.iter().copied().collect();
        let mut state = self.state.write().await;
        state.replies.retain(|r| !doomed.contains(&r.ticket_id));
        state.status_logs.retain(|l| !doomed.contains(&l.ticket_id));
        state.tickets.retain(|t| !doomed.contains(&t.id));
        info!("Deleted {} ticket(s)", doomed.len());
        Ok(())
    }

    async fn create_reply(&self, ticket_id: Uuid, draft: ReplyDraft) -> Result<TicketReply, TicketError> {
        self.enter(StoreOp::CreateReply).await?;

        let reply = {
            let mut state = self.state.write().await;
            let ticket = state
                .tickets
                .iter()
                .find(|t| t.id == ticket_id)
                .ok_or(TicketError::NotFound(ticket_id))?;
            check_reply_allowed(ticket, &draft)?;
            let now = state.next_timestamp();
            let reply = TicketReply {
                id: Uuid::new_v4(),
                ticket_id,
                admin_name: draft.admin_name,
                is_from_guest: draft.is_from_guest,
                message: draft.message,
                created_at: now,
                notice: draft.notice,
            };
            state.replies.push(reply.clone());
            reply
        };

        debug!("Reply {} added to ticket {}", reply.id, ticket_id);
        self.feed.publish(FeedEvent::ReplyInserted { reply: reply.clone() });
        Ok(reply)
    }

    async fn list_replies(&self, ticket_id: Uuid) -> Result<Vec<TicketReply>, TicketError> {
        self.enter(StoreOp::ListReplies).await?;
        let state = self.state.read().await;
        let mut replies: Vec<TicketReply> = state
            .replies
            .iter()
            .filter(|r| r.ticket_id == ticket_id)
            .cloned()
            .collect();
        replies.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(replies)
    }

    async fn status_history(&self, ticket_id: Uuid) -> Result<Vec<StatusLogEntry>, TicketError> {
        self.enter(StoreOp::StatusHistory).await?;
        let state = self.state.read().await;
        Ok(state
            .status_logs
            .iter()
            .filter(|l| l.ticket_id == ticket_id)
            .cloned()
            .collect())
    }
}
