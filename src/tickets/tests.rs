use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use uuid::Uuid;

use super::conversation::ConversationManager;
use super::coordinator::{RatingOutcome, RemoteMerge, TicketSessionCoordinator};
use super::dashboard::{DashboardFilter, StatusFilter};
use super::error::{TicketAction, TicketError};
use super::feed::{BroadcastChangeFeed, FeedEvent};
use super::session::SessionContext;
use super::store::{MemoryTicketStore, StoreOp, TicketStore};
use super::types::{AuthorKind, SystemNotice, Ticket, TicketDraft, TicketStatus};
use crate::config::SyncConfig;

struct Harness {
    feed: BroadcastChangeFeed,
    store: Arc<MemoryTicketStore>,
}

impl Harness {
    fn new() -> Self {
        let feed = BroadcastChangeFeed::new(256);
        let store = Arc::new(MemoryTicketStore::new(feed.clone()));
        Self { feed, store }
    }

    fn coordinator(&self, session: SessionContext, config: SyncConfig) -> TicketSessionCoordinator {
        TicketSessionCoordinator::new(
            self.store.clone(),
            Arc::new(self.feed.clone()),
            session,
            config,
        )
    }

    fn staff(&self) -> TicketSessionCoordinator {
        self.coordinator(SessionContext::staff("Admin"), SyncConfig::default())
    }

    async fn ticket(&self, email: &str) -> Ticket {
        self.store
            .create(TicketDraft {
                name: "Dana".to_string(),
                email: email.to_string(),
                subject: "Printer".to_string(),
                message: "Out of toner".to_string(),
            })
            .await
            .unwrap()
    }

    async fn system_replies(&self, id: Uuid, notice: SystemNotice) -> usize {
        self.store
            .list_replies(id)
            .await
            .unwrap()
            .iter()
            .filter(|r| r.author_kind() == AuthorKind::System && r.notice == Some(notice))
            .count()
    }
}

#[tokio::test]
async fn test_closed_ticket_never_changes() {
    let h = Harness::new();
    let ticket = h.ticket("dana@example.com").await;
    let mut coord = h.staff();
    coord.mount_dashboard().await.unwrap();

    coord.close(ticket.id).await.unwrap();
    let writes = h.store.call_count(StoreOp::UpdateStatus);

    for to in TicketStatus::ALL {
        let err = coord.change_status(ticket.id, to).await.unwrap_err();
        assert_eq!(err.error, TicketError::TicketClosed(ticket.id));
    }
    assert!(coord.resolve(ticket.id).await.is_err());
    assert!(coord.close(ticket.id).await.is_err());

    assert_eq!(h.store.call_count(StoreOp::UpdateStatus), writes);
    assert_eq!(coord.ticket(ticket.id).unwrap().status, TicketStatus::Closed);
    assert_eq!(h.store.get_by_id(ticket.id).await.unwrap().status, TicketStatus::Closed);
}

#[tokio::test]
async fn test_transitions_emit_one_system_reply() {
    let h = Harness::new();
    let ticket = h.ticket("dana@example.com").await;
    let mut coord = h.staff();
    coord.mount_dashboard().await.unwrap();

    let outcome = coord.resolve(ticket.id).await.unwrap();
    assert_eq!(outcome.ticket.status, TicketStatus::Resolved);
    assert!(outcome.notice_reply.unwrap().message.contains("marked as resolved"));
    assert_eq!(h.system_replies(ticket.id, SystemNotice::Resolved).await, 1);

    let outcome = coord.close(ticket.id).await.unwrap();
    assert!(outcome.notice_reply.unwrap().message.contains("rate us"));
    assert!(coord.close(ticket.id).await.is_err());
    assert_eq!(h.system_replies(ticket.id, SystemNotice::RatingPrompt).await, 1);
    assert_eq!(h.store.list_replies(ticket.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_status_button_into_resolved_posts_nothing() {
    let h = Harness::new();
    let ticket = h.ticket("dana@example.com").await;
    let mut coord = h.staff();
    coord.mount_dashboard().await.unwrap();

    coord.change_status(ticket.id, TicketStatus::InProgress).await.unwrap();
    let outcome = coord.change_status(ticket.id, TicketStatus::Resolved).await.unwrap();
    assert!(outcome.notice_reply.is_none());

    let outcome = coord.change_status(ticket.id, TicketStatus::Open).await.unwrap();
    assert_eq!(outcome.ticket.status, TicketStatus::Open);
    assert!(h.store.list_replies(ticket.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rating_keeps_first_value() {
    let h = Harness::new();
    let ticket = h.ticket("dana@example.com").await;
    let mut staff = h.staff();
    staff.mount_dashboard().await.unwrap();

    let mut guest = h.coordinator(
        SessionContext::guest("Dana", "dana@example.com"),
        SyncConfig::default(),
    );
    guest.mount_ticket(ticket.id).await.unwrap();
    assert!(guest.submit_rating(ticket.id, 4).await.is_err());

    staff.close(ticket.id).await.unwrap();
    guest.process_pending();
    assert_eq!(guest.ticket(ticket.id).unwrap().status, TicketStatus::Closed);

    let first = guest.submit_rating(ticket.id, 4).await.unwrap();
    assert!(matches!(first, RatingOutcome::Recorded(ref t) if t.rating == Some(4)));
    let second = guest.submit_rating(ticket.id, 2).await.unwrap();
    assert!(matches!(second, RatingOutcome::AlreadySubmitted(ref t) if t.rating == Some(4)));

    assert_eq!(h.store.call_count(StoreOp::SetRating), 1);
    assert_eq!(h.store.get_by_id(ticket.id).await.unwrap().rating, Some(4));
    assert_eq!(h.store.get_by_id(ticket.id).await.unwrap().status, TicketStatus::Closed);
}

#[tokio::test]
async fn test_failed_update_rolls_back() {
    let h = Harness::new();
    let ticket = h.ticket("dana@example.com").await;
    let mut coord = h.staff();
    coord.mount_dashboard().await.unwrap();

    h.store.fail_next(StoreOp::UpdateStatus);
    let err = coord
        .change_status(ticket.id, TicketStatus::InProgress)
        .await
        .unwrap_err();
    assert_eq!(err.action, TicketAction::ChangeStatus(TicketStatus::InProgress));
    assert!(err.notice().ends_with("Please try again."));
    assert_eq!(coord.ticket(ticket.id).unwrap(), &ticket);
}

#[tokio::test]
async fn test_slow_store_times_out_and_rolls_back() {
    let h = Harness::new();
    let ticket = h.ticket("dana@example.com").await;
    let config = SyncConfig::default().with_request_timeout(Duration::from_millis(50));
    let mut coord = h.coordinator(SessionContext::staff("Admin"), config);
    coord.mount_dashboard().await.unwrap();

    h.store.set_latency(Some(Duration::from_millis(500)));
    let err = coord.close(ticket.id).await.unwrap_err();
    assert_eq!(err.error, TicketError::Timeout(Duration::from_millis(50)));
    assert_eq!(coord.ticket(ticket.id).unwrap().status, TicketStatus::Open);

    h.store.set_latency(None);
    assert_eq!(h.store.get_by_id(ticket.id).await.unwrap().status, TicketStatus::Open);
}

#[tokio::test]
async fn test_notice_failure_keeps_transition() {
    let h = Harness::new();
    let ticket = h.ticket("dana@example.com").await;
    let mut coord = h.staff();
    coord.mount_dashboard().await.unwrap();

    h.store.fail_next(StoreOp::CreateReply);
    let outcome = coord.close(ticket.id).await.unwrap();
    assert_eq!(outcome.ticket.status, TicketStatus::Closed);
    assert!(outcome.notice_reply.is_none());
    assert_eq!(outcome.notice_error.unwrap().action, TicketAction::Reply);
    assert_eq!(h.store.get_by_id(ticket.id).await.unwrap().status, TicketStatus::Closed);
}

#[tokio::test]
async fn test_own_echo_merges_in_place() {
    let h = Harness::new();
    let ticket = h.ticket("dana@example.com").await;
    let mut coord = h.staff();
    coord.mount_dashboard().await.unwrap();

    coord.change_status(ticket.id, TicketStatus::InProgress).await.unwrap();
    coord.process_pending();
    assert_eq!(coord.tickets().len(), 1);
    assert_eq!(coord.tickets()[0].status, TicketStatus::InProgress);
}

#[tokio::test]
async fn test_stale_delivery_is_dropped() {
    let h = Harness::new();
    let ticket = h.ticket("dana@example.com").await;
    let mut coord = h.staff();
    coord.mount_dashboard().await.unwrap();
    coord.change_status(ticket.id, TicketStatus::InProgress).await.unwrap();

    let mut stale = coord.ticket(ticket.id).unwrap().clone();
    stale.status = TicketStatus::Open;
    stale.updated_at = stale.updated_at.map(|t| t - ChronoDuration::seconds(5));
    assert_eq!(coord.merge_remote(stale), RemoteMerge::Stale);
    assert_eq!(coord.ticket(ticket.id).unwrap().status, TicketStatus::InProgress);

    let mut undated = coord.ticket(ticket.id).unwrap().clone();
    undated.status = TicketStatus::Resolved;
    undated.updated_at = None;
    assert_eq!(coord.merge_remote(undated), RemoteMerge::Replaced);
}

#[tokio::test]
async fn test_other_session_changes_arrive_through_feed() {
    let h = Harness::new();
    let ticket = h.ticket("dana@example.com").await;
    let mut watcher = h.staff();
    watcher.mount_dashboard().await.unwrap();
    let mut actor = h.staff();
    actor.mount_dashboard().await.unwrap();

    actor.change_status(ticket.id, TicketStatus::InProgress).await.unwrap();
    let merged = tokio::time::timeout(Duration::from_secs(1), watcher.next_remote_change())
        .await
        .unwrap();
    assert_eq!(merged, Some(RemoteMerge::Replaced));
    assert_eq!(watcher.ticket(ticket.id).unwrap().status, TicketStatus::InProgress);

    let fresh = h.ticket("lee@example.com").await;
    watcher.process_pending();
    assert_eq!(watcher.tickets()[0].id, fresh.id);
}

#[tokio::test]
async fn test_deleted_ticket_is_not_resurrected() {
    let h = Harness::new();
    let ticket = h.ticket("dana@example.com").await;
    let other = h.ticket("lee@example.com").await;
    let mut coord = h.staff();
    coord.mount_dashboard().await.unwrap();

    assert_eq!(coord.delete_tickets(&[ticket.id]).await.unwrap(), 1);
    assert_eq!(h.store.get_by_id(ticket.id).await, Err(TicketError::NotFound(ticket.id)));

    h.feed.publish(FeedEvent::TicketUpdated { ticket: ticket.clone() });
    assert_eq!(coord.process_pending(), 0);
    assert!(coord.ticket(ticket.id).is_none());
    assert_eq!(coord.merge_remote(ticket.clone()), RemoteMerge::Tombstoned);

    coord.refresh().await.unwrap();
    assert_eq!(coord.tickets().len(), 1);
    assert_eq!(coord.tickets()[0].id, other.id);
}

#[tokio::test]
async fn test_guest_may_close_but_not_delete() {
    let h = Harness::new();
    let ticket = h.ticket("dana@example.com").await;
    let mut guest = h.coordinator(
        SessionContext::guest("Dana", "dana@example.com"),
        SyncConfig::default(),
    );
    guest.mount_ticket(ticket.id).await.unwrap();

    let err = guest.delete_tickets(&[ticket.id]).await.unwrap_err();
    assert!(matches!(err.error, TicketError::Unauthorized(_)));
    assert_eq!(h.store.call_count(StoreOp::DeleteMany), 0);

    let foreign = h.ticket("lee@example.com").await;
    let err = guest.close(foreign.id).await.unwrap_err();
    assert_eq!(err.error, TicketError::NotFound(foreign.id));

    let outcome = guest.close(ticket.id).await.unwrap();
    assert_eq!(outcome.ticket.status, TicketStatus::Closed);
    assert!(guest.mount_dashboard().await.is_err());
}

#[tokio::test]
async fn test_unknown_stored_status_reads_as_open() {
    let h = Harness::new();
    let ticket = h.ticket("dana@example.com").await;
    let mut coord = h.staff();
    coord.mount_dashboard().await.unwrap();
    coord.change_status(ticket.id, TicketStatus::InProgress).await.unwrap();

    h.store.force_status_raw(ticket.id, "escalated").await.unwrap();
    coord.process_pending();
    assert_eq!(coord.ticket(ticket.id).unwrap().status, TicketStatus::Open);
}

#[tokio::test]
async fn test_guest_lookup_only_sees_own_email() {
    let h = Harness::new();
    h.ticket("dana@example.com").await;
    h.ticket("lee@example.com").await;

    let mut guest = h.coordinator(
        SessionContext::guest("Dana", "dana@example.com"),
        SyncConfig::default(),
    );
    assert_eq!(guest.mount_guest_lookup(" Dana@Example.com ").await.unwrap(), 1);

    h.ticket("lee@example.com").await;
    h.ticket("DANA@example.com").await;
    assert_eq!(guest.process_pending(), 1);
    assert_eq!(guest.tickets().len(), 2);
}

#[tokio::test]
async fn test_failed_load_degrades_to_empty_view() {
    let h = Harness::new();
    h.ticket("dana@example.com").await;
    let mut coord = h.staff();

    h.store.fail_next(StoreOp::List);
    let err = coord.mount_dashboard().await.unwrap_err();
    assert_eq!(err.action, TicketAction::Load);
    assert!(coord.tickets().is_empty());
    assert!(coord.last_error().is_some());
    assert!(coord.is_mounted());

    coord.refresh().await.unwrap();
    assert_eq!(coord.tickets().len(), 1);
    assert!(coord.last_error().is_none());
}

#[tokio::test]
async fn test_each_mount_releases_exactly_one_subscription() {
    let h = Harness::new();
    let ticket = h.ticket("dana@example.com").await;
    let mut coord = h.staff();

    coord.mount_dashboard().await.unwrap();
    assert_eq!(h.feed.active_subscriptions(), 1);
    coord.mount_ticket(ticket.id).await.unwrap();
    assert_eq!(h.feed.active_subscriptions(), 1);

    assert!(coord.unmount());
    assert!(!coord.unmount());
    assert_eq!(h.feed.active_subscriptions(), 0);

    let mut conv = ConversationManager::new(ticket.id, SessionContext::staff("Admin"), SyncConfig::default());
    conv.open(&*h.store, &h.feed).await.unwrap();
    assert_eq!(h.feed.active_subscriptions(), 1);
    drop(conv);
    assert_eq!(h.feed.active_subscriptions(), 0);
}

#[tokio::test]
async fn test_dashboard_filter_over_live_list() {
    let h = Harness::new();
    let a = h.ticket("a@example.com").await;
    let b = h.ticket("b@example.com").await;
    h.ticket("c@example.com").await;
    let mut coord = h.staff();
    coord.mount_dashboard().await.unwrap();

    coord.resolve(a.id).await.unwrap();
    coord.change_status(b.id, TicketStatus::InProgress).await.unwrap();

    let hidden = DashboardFilter::new(StatusFilter::All, false);
    assert_eq!(coord.filtered(&hidden).len(), 2);
    let shown = DashboardFilter::new(StatusFilter::Only(TicketStatus::Resolved), true);
    assert_eq!(coord.filtered(&shown)[0].id, a.id);

    let counts = coord.counts(false);
    assert_eq!((counts.all, counts.open, counts.in_progress, counts.resolved), (2, 1, 1, 1));
}

#[tokio::test]
async fn test_conversation_follows_status_changes() {
    let h = Harness::new();
    let ticket = h.ticket("dana@example.com").await;
    let mut staff = h.staff();
    staff.mount_dashboard().await.unwrap();

    let mut conv = ConversationManager::new(
        ticket.id,
        SessionContext::guest("Dana", "dana@example.com"),
        SyncConfig::default(),
    );
    conv.open(&*h.store, &h.feed).await.unwrap();
    conv.send(&*h.store, "Still broken").await.unwrap();

    staff.close(ticket.id).await.unwrap();
    assert_eq!(conv.process_pending(), 1);
    assert!(conv.rating_prompt_issued());
    assert_eq!(conv.take_notifications().len(), 1);

    let err = conv.send(&*h.store, "One more thing").await.unwrap_err();
    assert_eq!(err.error, TicketError::RepliesClosed(TicketStatus::Closed));
    assert_eq!(conv.len(), 2);
}
