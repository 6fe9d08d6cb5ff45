//! Ticket status lifecycle.
//!
//! `closed` is terminal. From any other state every other state is reachable
//! directly, so staff can reopen resolved work. Two transitions carry an
//! automated reply: entering `closed` always posts the rating prompt, and the
//! dedicated resolve action posts the resolved notice. A bare status change
//! into `resolved` posts nothing.

use uuid::Uuid;

use super::error::TicketError;
use super::types::{SystemNotice, Ticket, TicketStatus};

/// What asked for the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionTrigger {
    StatusButton,
    ResolveAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionPlan {
    pub ticket_id: Uuid,
    pub from: TicketStatus,
    pub to: TicketStatus,
    pub notice: Option<SystemNotice>,
}

impl TransitionPlan {
    pub fn issues_rating_prompt(&self) -> bool {
        self.notice == Some(SystemNotice::RatingPrompt)
    }
}

pub fn can_transition(from: TicketStatus, to: TicketStatus) -> bool {
    !from.is_terminal() && from != to
}

/// Targets a status control should offer for a ticket currently in `from`.
pub fn available_targets(from: TicketStatus) -> Vec<TicketStatus> {
    TicketStatus::ALL
        .into_iter()
        .filter(|to| can_transition(from, *to))
        .collect()
}

/// Validates a transition and decides its side effect. Never touches the
/// network; a rejection here must stop the caller before any store call.
pub fn plan_transition(
    ticket: &Ticket,
    to: TicketStatus,
    trigger: TransitionTrigger,
) -> Result<TransitionPlan, TicketError> {
    let from = ticket.status;
    if from.is_terminal() {
        return Err(TicketError::TicketClosed(ticket.id));
    }
    if from == to {
        return Err(TicketError::NoChange(to));
    }

    let notice = match (to, trigger) {
        (TicketStatus::Closed, _) => Some(SystemNotice::RatingPrompt),
        (TicketStatus::Resolved, TransitionTrigger::ResolveAction) => Some(SystemNotice::Resolved),
        _ => None,
    };

    Ok(TransitionPlan {
        ticket_id: ticket.id,
        from,
        to,
        notice,
    })
}

/// Rating may be written once, and only after the ticket is closed.
pub fn check_rating_allowed(ticket: &Ticket) -> Result<(), TicketError> {
    if !ticket.is_closed() {
        return Err(TicketError::Validation(
            "tickets can only be rated once closed".to_string(),
        ));
    }
    Ok(())
}
