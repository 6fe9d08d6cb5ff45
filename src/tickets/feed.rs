use log::{debug, info, warn};
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::constants::DEFAULT_FEED_CAPACITY;
use super::types::{Ticket, TicketReply};

/// Row-level change, always carrying the full record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    TicketInserted { ticket: Ticket },
    TicketUpdated { ticket: Ticket },
    ReplyInserted { reply: TicketReply },
}

impl FeedEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::TicketInserted { .. } => "ticket_inserted",
            Self::TicketUpdated { .. } => "ticket_updated",
            Self::ReplyInserted { .. } => "reply_inserted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedScope {
    Ticket(Uuid),
    AllTickets,
    Replies(Uuid),
}

impl FeedScope {
    pub fn channel_name(&self) -> String {
        match self {
            Self::Ticket(id) => format!("ticket-{id}"),
            Self::AllTickets => "tickets-list".to_string(),
            Self::Replies(ticket_id) => format!("replies-{ticket_id}"),
        }
    }
}

/// A record type a subscription can yield.
pub trait FeedItem: Clone + Send + 'static {
    fn extract(event: &FeedEvent, scope: &FeedScope) -> Option<Self>;
}

impl FeedItem for Ticket {
    fn extract(event: &FeedEvent, scope: &FeedScope) -> Option<Self> {
        let ticket = match event {
            FeedEvent::TicketInserted { ticket } | FeedEvent::TicketUpdated { ticket } => ticket,
            FeedEvent::ReplyInserted { .. } => return None,
        };
        match scope {
            FeedScope::Ticket(id) if ticket.id == *id => Some(ticket.clone()),
            FeedScope::AllTickets => Some(ticket.clone()),
            _ => None,
        }
    }
}

impl FeedItem for TicketReply {
    fn extract(event: &FeedEvent, scope: &FeedScope) -> Option<Self> {
        match (event, scope) {
            (FeedEvent::ReplyInserted { reply }, FeedScope::Replies(ticket_id))
                if reply.ticket_id == *ticket_id =>
            {
                Some(reply.clone())
            }
            _ => None,
        }
    }
}

/// A live subscription to one feed scope.
///
/// Dropping it unsubscribes. `unsubscribe` may be called any number of
/// times; only the first call releases the channel.
pub struct Subscription<T> {
    scope: FeedScope,
    receiver: broadcast::Receiver<FeedEvent>,
    cancel: CancellationToken,
    active: Arc<AtomicUsize>,
    closed: bool,
    _item: PhantomData<fn() -> T>,
}

impl<T: FeedItem> Subscription<T> {
    pub fn new(
        scope: FeedScope,
        receiver: broadcast::Receiver<FeedEvent>,
        cancel: CancellationToken,
        active: Arc<AtomicUsize>,
    ) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        info!("Subscribed to {}", scope.channel_name());
        Self {
            scope,
            receiver,
            cancel,
            active,
            closed: false,
            _item: PhantomData,
        }
    }

    pub fn scope(&self) -> FeedScope {
        self.scope
    }

    pub fn is_active(&self) -> bool {
        !self.closed && !self.cancel.is_cancelled()
    }

    /// Token that fires when this subscription is cancelled from anywhere.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the next matching record. Returns `None` once cancelled or
    /// once the feed is gone.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            if self.closed {
                return None;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.unsubscribe();
                    return None;
                }
                result = self.receiver.recv() => match result {
                    Ok(event) => {
                        if let Some(item) = T::extract(&event, &self.scope) {
                            return Some(item);
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!("Subscription {} lagged behind by {} events", self.scope.channel_name(), n);
                    }
                    Err(RecvError::Closed) => {
                        debug!("Feed closed under {}", self.scope.channel_name());
                        self.unsubscribe();
                        return None;
                    }
                }
            }
        }
    }

    /// Non-blocking variant of `recv`.
    pub fn try_recv(&mut self) -> Option<T> {
        if self.closed || self.cancel.is_cancelled() {
            return None;
        }
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if let Some(item) = T::extract(&event, &self.scope) {
                        return Some(item);
                    }
                }
                Err(TryRecvError::Lagged(n)) => {
                    warn!("Subscription {} lagged behind by {} events", self.scope.channel_name(), n);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Everything already queued for this subscription.
    pub fn drain(&mut self) -> Vec<T> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Returns `true` only for the call that actually released the channel.
    pub fn unsubscribe(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.cancel.cancel();
        self.active.fetch_sub(1, Ordering::SeqCst);
        info!("Unsubscribed from {}", self.scope.channel_name());
        true
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            self.cancel.cancel();
            self.active.fetch_sub(1, Ordering::SeqCst);
            debug!("Dropped subscription to {}", self.scope.channel_name());
        }
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("scope", &self.scope)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Realtime change feed consumed by the client-side components.
///
/// Delivery is at-least-once per subscription and unordered across
/// subscriptions. Writers see their own changes echoed back.
pub trait ChangeFeed: Send + Sync {
    fn subscribe_ticket(&self, id: Uuid) -> Subscription<Ticket>;
    fn subscribe_all_tickets(&self) -> Subscription<Ticket>;
    fn subscribe_replies(&self, ticket_id: Uuid) -> Subscription<TicketReply>;
}

/// In-process feed backed by one broadcast channel. Stores publish into it
/// after every committed write.
#[derive(Clone)]
pub struct BroadcastChangeFeed {
    sender: broadcast::Sender<FeedEvent>,
    active: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl BroadcastChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            active: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Returns how many receivers the event reached.
    pub fn publish(&self, event: FeedEvent) -> usize {
        debug!("Publishing {}", event.event_name());
        self.sender.send(event).unwrap_or(0)
    }

    /// Unfiltered receiver, used by the SSE endpoint.
    pub fn raw_receiver(&self) -> broadcast::Receiver<FeedEvent> {
        self.sender.subscribe()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Cancels every outstanding subscription.
    pub fn shutdown(&self) {
        info!("Shutting down change feed");
        self.shutdown.cancel();
    }

    fn subscribe<T: FeedItem>(&self, scope: FeedScope) -> Subscription<T> {
        Subscription::new(
            scope,
            self.sender.subscribe(),
            self.shutdown.child_token(),
            Arc::clone(&self.active),
        )
    }
}

impl Default for BroadcastChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl ChangeFeed for BroadcastChangeFeed {
    fn subscribe_ticket(&self, id: Uuid) -> Subscription<Ticket> {
        self.subscribe(FeedScope::Ticket(id))
    }

    fn subscribe_all_tickets(&self) -> Subscription<Ticket> {
        self.subscribe(FeedScope::AllTickets)
    }

    fn subscribe_replies(&self, ticket_id: Uuid) -> Subscription<TicketReply> {
        self.subscribe(FeedScope::Replies(ticket_id))
    }
}
