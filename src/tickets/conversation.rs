//! Per-ticket reply log.
//!
//! Replies arrive from two paths: the full fetch on load and the realtime
//! insert feed. Both go through [`ConversationManager::merge`], which keeps
//! the list ordered by `created_at` and drops ids it has already seen.

use log::{debug, error, info};
use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

use super::error::{ActionError, TicketAction, TicketError};
use super::feed::{ChangeFeed, Subscription};
use super::session::SessionContext;
use super::store::{timed, TicketStore};
use super::types::{AuthorKind, SystemNotice, TicketReply};
use crate::config::SyncConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Appended { notify: bool },
    Duplicate,
    ForeignTicket,
}

pub struct ConversationManager {
    ticket_id: Uuid,
    viewer: SessionContext,
    config: SyncConfig,
    replies: Vec<TicketReply>,
    seen: HashSet<Uuid>,
    subscription: Option<Subscription<TicketReply>>,
    notifications: VecDeque<TicketReply>,
}

impl ConversationManager {
    pub fn new(ticket_id: Uuid, viewer: SessionContext, config: SyncConfig) -> Self {
        Self {
            ticket_id,
            viewer,
            config,
            replies: Vec::new(),
            seen: HashSet::new(),
            subscription: None,
            notifications: VecDeque::new(),
        }
    }

    pub fn ticket_id(&self) -> Uuid {
        self.ticket_id
    }

    /// Subscribes to reply inserts, then seeds from a full fetch. Events that
    /// land between the two are absorbed by de-duplication.
    pub async fn open(
        &mut self,
        store: &dyn TicketStore,
        feed: &dyn ChangeFeed,
    ) -> Result<usize, ActionError> {
        self.mount(feed);
        self.load(store).await
    }

    /// Seeds the log from the store. History never raises notifications. On
    /// failure the current list is kept as is.
    pub async fn load(&mut self, store: &dyn TicketStore) -> Result<usize, ActionError> {
        let fetched = timed(self.config.request_timeout, store.list_replies(self.ticket_id))
            .await
            .map_err(|e| {
                error!("Failed to load replies for ticket {}: {}", self.ticket_id, e);
                ActionError::new(TicketAction::Load, e)
            })?;

        let mut added = 0;
        for reply in fetched {
            if self.insert(reply) {
                added += 1;
            }
        }
        debug!("Loaded {} new replies for ticket {}", added, self.ticket_id);
        Ok(added)
    }

    /// Subscribes to the ticket's replies. A no-op while a live
    /// subscription exists; a cancelled one is replaced.
    pub fn mount(&mut self, feed: &dyn ChangeFeed) {
        if self.is_mounted() {
            return;
        }
        if let Some(mut stale) = self.subscription.take() {
            stale.unsubscribe();
            debug!("Replacing cancelled reply subscription for ticket {}", self.ticket_id);
        }
        self.subscription = Some(feed.subscribe_replies(self.ticket_id));
    }

    /// Releases the reply subscription. Returns `false` if nothing was mounted.
    pub fn unmount(&mut self) -> bool {
        match self.subscription.take() {
            Some(mut sub) => sub.unsubscribe(),
            None => false,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.subscription.as_ref().is_some_and(|s| s.is_active())
    }

    /// Merges one realtime delivery.
    pub fn merge(&mut self, reply: TicketReply) -> MergeOutcome {
        if reply.ticket_id != self.ticket_id {
            return MergeOutcome::ForeignTicket;
        }
        let notify = self.should_notify(&reply);
        let pending = notify.then(|| reply.clone());
        if !self.insert(reply) {
            return MergeOutcome::Duplicate;
        }
        if let Some(reply) = pending {
            self.notifications.push_back(reply);
        }
        MergeOutcome::Appended { notify }
    }

    /// Drains everything the subscription has queued. Returns how many
    /// replies were appended.
    pub fn process_pending(&mut self) -> usize {
        let pending = match self.subscription.as_mut() {
            Some(sub) => sub.drain(),
            None => return 0,
        };
        let mut appended = 0;
        for reply in pending {
            if matches!(self.merge(reply), MergeOutcome::Appended { .. }) {
                appended += 1;
            }
        }
        appended
    }

    /// Waits for the next realtime delivery and merges it. `None` once the
    /// subscription ends or if none is mounted.
    pub async fn next_remote_change(&mut self) -> Option<MergeOutcome> {
        let reply = self.subscription.as_mut()?.recv().await?;
        Some(self.merge(reply))
    }

    /// Posts a reply authored by the viewing session.
    pub async fn send(
        &mut self,
        store: &dyn TicketStore,
        body: &str,
    ) -> Result<TicketReply, ActionError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ActionError::new(
                TicketAction::Reply,
                TicketError::Validation("reply message is empty".to_string()),
            ));
        }
        let draft = self.viewer.reply(body);
        let reply = timed(
            self.config.request_timeout,
            store.create_reply(self.ticket_id, draft),
        )
        .await
        .map_err(|e| {
            error!("Failed to send reply on ticket {}: {}", self.ticket_id, e);
            ActionError::new(TicketAction::Reply, e)
        })?;

        info!("Reply {} posted on ticket {}", reply.id, self.ticket_id);
        self.insert(reply.clone());
        Ok(reply)
    }

    pub fn replies(&self) -> &[TicketReply] {
        &self.replies
    }

    pub fn latest(&self) -> Option<&TicketReply> {
        self.replies.last()
    }

    pub fn len(&self) -> usize {
        self.replies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }

    /// Whether the closing rating prompt is present in the log.
    pub fn rating_prompt_issued(&self) -> bool {
        self.replies
            .iter()
            .any(|r| r.notice == Some(SystemNotice::RatingPrompt))
    }

    pub fn take_notifications(&mut self) -> Vec<TicketReply> {
        self.notifications.drain(..).collect()
    }

    /// A session is never notified of its own side of the conversation.
    fn should_notify(&self, reply: &TicketReply) -> bool {
        match reply.author_kind() {
            AuthorKind::Guest => self.viewer.is_privileged(),
            AuthorKind::Staff => !self.viewer.is_privileged(),
            AuthorKind::System => true,
        }
    }

    fn insert(&mut self, reply: TicketReply) -> bool {
        if !self.seen.insert(reply.id) {
            return false;
        }
        let at = self
            .replies
            .partition_point(|r| r.created_at <= reply.created_at);
        self.replies.insert(at, reply);
        true
    }
}
