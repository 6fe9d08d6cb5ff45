//! Staff dashboard views over the canonical ticket list. Everything here is a
//! pure function of its inputs and is recomputed on every change.

use serde::Deserialize;

use super::types::{Ticket, TicketStatus, TicketStatusCounts};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatusFilter {
    #[default]
    All,
    Only(TicketStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DashboardFilter {
    pub status: StatusFilter,
    pub show_resolved: bool,
}

impl DashboardFilter {
    pub fn new(status: StatusFilter, show_resolved: bool) -> Self {
        Self {
            status,
            show_resolved,
        }
    }

    pub fn matches(&self, ticket: &Ticket) -> bool {
        if !self.show_resolved && ticket.status.is_settled() {
            return false;
        }
        match self.status {
            StatusFilter::All => true,
            StatusFilter::Only(status) => ticket.status == status,
        }
    }
}

pub fn apply_filter<'a>(tickets: &'a [Ticket], filter: &DashboardFilter) -> Vec<&'a Ticket> {
    tickets.iter().filter(|t| filter.matches(t)).collect()
}

/// `all` respects the resolved toggle; the per-status counts do not.
pub fn count_by_status(tickets: &[Ticket], show_resolved: bool) -> TicketStatusCounts {
    tickets.iter().fold(TicketStatusCounts::default(), |mut counts, t| {
        if show_resolved || !t.status.is_settled() {
            counts.all += 1;
        }
        match t.status {
            TicketStatus::Open => counts.open += 1,
            TicketStatus::InProgress => counts.in_progress += 1,
            TicketStatus::Resolved => counts.resolved += 1,
            TicketStatus::Closed => counts.closed += 1,
        }
        counts
    })
}
