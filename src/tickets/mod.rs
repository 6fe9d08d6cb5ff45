pub mod constants;
pub mod conversation;
pub mod coordinator;
pub mod dashboard;
pub mod error;
pub mod feed;
pub mod handlers;
pub mod migrations;
#[cfg(feature = "postgres")]
pub mod schema;
pub mod session;
pub mod state_machine;
pub mod store;
pub mod types;

#[cfg(test)]
mod tests;

pub use conversation::{ConversationManager, MergeOutcome};
pub use coordinator::{
    CoordinatorView, RatingOutcome, RemoteMerge, TicketSessionCoordinator, TransitionOutcome,
};
pub use dashboard::{apply_filter, count_by_status, DashboardFilter, StatusFilter};
pub use error::{ActionError, TicketAction, TicketError};
pub use feed::{BroadcastChangeFeed, ChangeFeed, FeedEvent, FeedScope, Subscription};
pub use handlers::{ticket_routes, TicketsState};
pub use session::{Actor, AdminCredentials, SessionContext};
pub use state_machine::{
    available_targets, can_transition, plan_transition, TransitionPlan, TransitionTrigger,
};
pub use store::{timed, MemoryTicketStore, StoreOp, TicketStore};
#[cfg(feature = "postgres")]
pub use store::{DbPool, PgTicketStore};
pub use types::{
    AuthorKind, ReplyDraft, StatusLogEntry, SystemNotice, Ticket, TicketDraft, TicketReply,
    TicketStatus, TicketStatusCounts,
};
