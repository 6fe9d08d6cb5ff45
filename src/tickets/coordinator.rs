//! Client-side owner of the canonical ticket list.
//!
//! A coordinator serves one view at a time: the staff dashboard (every
//! ticket), a guest's lookup by email, or a single tracked ticket. Mutations
//! are applied optimistically and then reconciled against the record the
//! store returns; realtime deliveries are merged by id, with the newer
//! `updated_at` winning and deleted ids held back by a tombstone set.
//!
//! All state is owned by the coordinator and mutated through `&mut self`, so
//! a store round-trip and a feed merge can never interleave.

use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use super::dashboard::{apply_filter, count_by_status, DashboardFilter};
use super::error::{ActionError, TicketAction, TicketError};
use super::feed::{ChangeFeed, Subscription};
use super::session::SessionContext;
use super::state_machine::{check_rating_allowed, plan_transition, TransitionTrigger};
use super::store::{timed, TicketStore};
use super::types::{
    check_rating, normalize_email, ReplyDraft, Ticket, TicketDraft, TicketReply, TicketStatus,
    TicketStatusCounts,
};
use crate::config::SyncConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorView {
    Dashboard,
    GuestLookup(String),
    Ticket(Uuid),
}

/// Result of a status change. The status write and the automated reply are
/// separate writes; a failed reply does not undo the status.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub ticket: Ticket,
    pub notice_reply: Option<TicketReply>,
    pub notice_error: Option<ActionError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RatingOutcome {
    Recorded(Ticket),
    AlreadySubmitted(Ticket),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteMerge {
    Inserted,
    Replaced,
    Stale,
    Tombstoned,
    OutOfScope,
}

impl RemoteMerge {
    pub fn changed(&self) -> bool {
        matches!(self, Self::Inserted | Self::Replaced)
    }
}

pub struct TicketSessionCoordinator {
    store: Arc<dyn TicketStore>,
    feed: Arc<dyn ChangeFeed>,
    session: SessionContext,
    config: SyncConfig,
    view: Option<CoordinatorView>,
    tickets: Vec<Ticket>,
    tombstones: HashSet<Uuid>,
    rated: HashSet<Uuid>,
    subscription: Option<Subscription<Ticket>>,
    last_error: Option<ActionError>,
}

impl TicketSessionCoordinator {
    pub fn new(
        store: Arc<dyn TicketStore>,
        feed: Arc<dyn ChangeFeed>,
        session: SessionContext,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            feed,
            session,
            config,
            view: None,
            tickets: Vec::new(),
            tombstones: HashSet::new(),
            rated: HashSet::new(),
            subscription: None,
            last_error: None,
        }
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn view(&self) -> Option<&CoordinatorView> {
        self.view.as_ref()
    }

    /// Newest first.
    pub fn tickets(&self) -> &[Ticket] {
        &self.tickets
    }

    pub fn ticket(&self, id: Uuid) -> Option<&Ticket> {
        self.tickets.iter().find(|t| t.id == id)
    }

    pub fn is_mounted(&self) -> bool {
        self.subscription.as_ref().is_some_and(|s| s.is_active())
    }

    pub fn is_tombstoned(&self, id: Uuid) -> bool {
        self.tombstones.contains(&id)
    }

    /// The failure of the most recent load, if it failed. The view keeps
    /// rendering whatever list it has.
    pub fn last_error(&self) -> Option<&ActionError> {
        self.last_error.as_ref()
    }

    pub async fn mount_dashboard(&mut self) -> Result<usize, ActionError> {
        self.session
            .require_privileged("The dashboard")
            .map_err(|e| ActionError::new(TicketAction::Load, e))?;
        self.remount(CoordinatorView::Dashboard, self.feed.subscribe_all_tickets());
        self.refresh().await
    }

    pub async fn mount_guest_lookup(&mut self, email: &str) -> Result<usize, ActionError> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(ActionError::new(
                TicketAction::Load,
                TicketError::Validation("email is required".to_string()),
            ));
        }
        self.remount(CoordinatorView::GuestLookup(email), self.feed.subscribe_all_tickets());
        self.refresh().await
    }

    pub async fn mount_ticket(&mut self, id: Uuid) -> Result<usize, ActionError> {
        self.remount(CoordinatorView::Ticket(id), self.feed.subscribe_ticket(id));
        self.refresh().await
    }

    /// Releases the view's subscription. Safe to call repeatedly; only the
    /// first call after a mount returns `true`.
    pub fn unmount(&mut self) -> bool {
        self.view = None;
        self.tickets.clear();
        match self.subscription.take() {
            Some(mut sub) => sub.unsubscribe(),
            None => false,
        }
    }

    /// Re-fetches the current view. Anything queued on the feed meanwhile
    /// is merged afterwards, so a late stale event cannot undo the fetch.
    pub async fn refresh(&mut self) -> Result<usize, ActionError> {
        let Some(view) = self.view.clone() else {
            return Ok(0);
        };
        let fetched = match &view {
            CoordinatorView::Dashboard => {
                timed(self.config.request_timeout, self.store.list_all(None)).await
            }
            CoordinatorView::GuestLookup(email) => {
                timed(self.config.request_timeout, self.store.list_by_email(email)).await
            }
            CoordinatorView::Ticket(id) => {
                timed(self.config.request_timeout, self.store.get_by_id(*id))
                    .await
                    .map(|t| vec![t])
            }
        };

        match fetched {
            Ok(tickets) => {
                self.tickets = tickets
                    .into_iter()
                    .filter(|t| !self.tombstones.contains(&t.id))
                    .collect();
                self.last_error = None;
                self.process_pending();
                debug!("Loaded {} tickets for {:?}", self.tickets.len(), view);
                Ok(self.tickets.len())
            }
            Err(e) => {
                error!("Failed to load tickets for {:?}: {}", view, e);
                let err = ActionError::new(TicketAction::Load, e);
                self.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    pub async fn change_status(
        &mut self,
        id: Uuid,
        to: TicketStatus,
    ) -> Result<TransitionOutcome, ActionError> {
        self.transition(id, to, TransitionTrigger::StatusButton, TicketAction::ChangeStatus(to))
            .await
    }

    pub async fn resolve(&mut self, id: Uuid) -> Result<TransitionOutcome, ActionError> {
        self.transition(
            id,
            TicketStatus::Resolved,
            TransitionTrigger::ResolveAction,
            TicketAction::Resolve,
        )
        .await
    }

    pub async fn close(&mut self, id: Uuid) -> Result<TransitionOutcome, ActionError> {
        self.transition(
            id,
            TicketStatus::Closed,
            TransitionTrigger::StatusButton,
            TicketAction::Close,
        )
        .await
    }

    async fn transition(
        &mut self,
        id: Uuid,
        to: TicketStatus,
        trigger: TransitionTrigger,
        action: TicketAction,
    ) -> Result<TransitionOutcome, ActionError> {
        let fail = |e| ActionError::new(action, e);

        let previous = self
            .ticket(id)
            .cloned()
            .ok_or(TicketError::NotFound(id))
            .map_err(fail)?;
        let plan = plan_transition(&previous, to, trigger).map_err(|e| {
            warn!("Rejected transition of ticket {} to {}: {}", id, to, e);
            fail(e)
        })?;

        self.replace_local(Ticket {
            status: to,
            ..previous.clone()
        });

        let confirmed = match timed(
            self.config.request_timeout,
            self.store.update_status(id, to, None),
        )
        .await
        {
            Ok(ticket) => ticket,
            Err(e) => {
                error!("Status update of ticket {} to {} failed: {}", id, to, e);
                self.replace_local(previous);
                return Err(fail(e));
            }
        };

        if confirmed.status != to {
            warn!(
                "Server kept ticket {} at {} instead of {}",
                id, confirmed.status, to
            );
        }
        info!("Ticket {} moved from {} to {}", id, plan.from, confirmed.status);
        self.replace_local(confirmed.clone());

        let mut outcome = TransitionOutcome {
            ticket: confirmed,
            notice_reply: None,
            notice_error: None,
        };
        if let Some(notice) = plan.notice {
            match timed(
                self.config.request_timeout,
                self.store.create_reply(id, ReplyDraft::system(notice)),
            )
            .await
            {
                Ok(reply) => outcome.notice_reply = Some(reply),
                Err(e) => {
                    error!("Status of ticket {} changed but the {} notice failed: {}", id, notice.as_str(), e);
                    outcome.notice_error = Some(ActionError::new(TicketAction::Reply, e));
                }
            }
        }
        Ok(outcome)
    }

    /// Records a star rating on a closed ticket. Only the first submission
    /// per ticket reaches the store.
    pub async fn submit_rating(&mut self, id: Uuid, rating: u8) -> Result<RatingOutcome, ActionError> {
        let fail = |e| ActionError::new(TicketAction::Rate, e);

        let rating = check_rating(rating).map_err(fail)?;
        let current = self
            .ticket(id)
            .cloned()
            .ok_or(TicketError::NotFound(id))
            .map_err(fail)?;
        check_rating_allowed(&current).map_err(fail)?;

        if self.rated.contains(&id) || current.has_rating() {
            debug!("Ticket {} already rated, ignoring {}", id, rating);
            self.rated.insert(id);
            return Ok(RatingOutcome::AlreadySubmitted(current));
        }

        let stored = timed(self.config.request_timeout, self.store.set_rating(id, rating))
            .await
            .map_err(|e| {
                error!("Rating ticket {} failed: {}", id, e);
                fail(e)
            })?;
        self.rated.insert(id);
        self.replace_local(stored.clone());

        if stored.rating == Some(rating) {
            info!("Ticket {} rated {}", id, rating);
            Ok(RatingOutcome::Recorded(stored))
        } else {
            Ok(RatingOutcome::AlreadySubmitted(stored))
        }
    }

    pub async fn submit_ticket(&mut self, draft: TicketDraft) -> Result<Ticket, ActionError> {
        let fail = |e| ActionError::new(TicketAction::Submit, e);

        draft.validate().map_err(fail)?;
        let ticket = timed(self.config.request_timeout, self.store.create(draft.normalized()))
            .await
            .map_err(|e| {
                error!("Ticket submission failed: {}", e);
                fail(e)
            })?;
        info!("Ticket {} submitted", ticket.id);
        self.merge_remote(ticket.clone());
        Ok(ticket)
    }

    /// Bulk delete. Removed ids are tombstoned so no later delivery can bring
    /// them back into this view.
    pub async fn delete_tickets(&mut self, ids: &[Uuid]) -> Result<usize, ActionError> {
        let fail = |e| ActionError::new(TicketAction::Delete, e);

        self.session.require_privileged("Deleting tickets").map_err(fail)?;
        if ids.is_empty() {
            return Ok(0);
        }
        timed(self.config.request_timeout, self.store.delete_many(ids))
            .await
            .map_err(|e| {
                error!("Deleting {} tickets failed: {}", ids.len(), e);
                fail(e)
            })?;

        self.tombstones.extend(ids.iter().copied());
        let before = self.tickets.len();
        self.tickets.retain(|t| !self.tombstones.contains(&t.id));
        let removed = before - self.tickets.len();
        info!("Deleted {} tickets ({} were in view)", ids.len(), removed);
        Ok(removed)
    }

    /// Merges one full ticket record from the change feed or any other
    /// out-of-band source.
    pub fn merge_remote(&mut self, incoming: Ticket) -> RemoteMerge {
        if self.tombstones.contains(&incoming.id) {
            debug!("Dropping delivery for deleted ticket {}", incoming.id);
            return RemoteMerge::Tombstoned;
        }
        if !self.in_scope(&incoming) {
            return RemoteMerge::OutOfScope;
        }

        match self.tickets.iter().position(|t| t.id == incoming.id) {
            Some(at) => {
                if let (Some(local), Some(remote)) = (self.tickets[at].updated_at, incoming.updated_at) {
                    if remote < local {
                        debug!("Dropping stale delivery for ticket {}", incoming.id);
                        return RemoteMerge::Stale;
                    }
                }
                self.tickets[at] = incoming;
                RemoteMerge::Replaced
            }
            None => {
                let at = self
                    .tickets
                    .partition_point(|t| t.created_at > incoming.created_at);
                self.tickets.insert(at, incoming);
                RemoteMerge::Inserted
            }
        }
    }

    /// Merges everything queued on the subscription. Returns how many
    /// deliveries changed the list.
    pub fn process_pending(&mut self) -> usize {
        let pending = match self.subscription.as_mut() {
            Some(sub) => sub.drain(),
            None => return 0,
        };
        pending
            .into_iter()
            .map(|t| self.merge_remote(t))
            .filter(RemoteMerge::changed)
            .count()
    }

    pub async fn next_remote_change(&mut self) -> Option<RemoteMerge> {
        let ticket = self.subscription.as_mut()?.recv().await?;
        Some(self.merge_remote(ticket))
    }

    pub fn filtered(&self, filter: &DashboardFilter) -> Vec<&Ticket> {
        apply_filter(&self.tickets, filter)
    }

    pub fn counts(&self, show_resolved: bool) -> TicketStatusCounts {
        count_by_status(&self.tickets, show_resolved)
    }

    fn remount(&mut self, view: CoordinatorView, subscription: Subscription<Ticket>) {
        if self.unmount() {
            debug!("Replaced previous view subscription");
        }
        info!("Mounting {:?}", view);
        self.view = Some(view);
        self.subscription = Some(subscription);
    }

    fn in_scope(&self, ticket: &Ticket) -> bool {
        match &self.view {
            Some(CoordinatorView::Dashboard) => true,
            Some(CoordinatorView::GuestLookup(email)) => normalize_email(&ticket.email) == *email,
            Some(CoordinatorView::Ticket(id)) => ticket.id == *id,
            None => false,
        }
    }

    /// Unconditional overwrite, used for the coordinator's own writes.
    fn replace_local(&mut self, ticket: Ticket) {
        if let Some(slot) = self.tickets.iter_mut().find(|t| t.id == ticket.id) {
            *slot = ticket;
        }
    }
}
