use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use super::constants::{GUEST_AUTHOR_PREFIX, MAX_RATING, MIN_RATING, SYSTEM_AUTHOR};
use super::error::TicketError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TicketStatus {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "inProgress")]
    InProgress,
    #[serde(rename = "resolved")]
    Resolved,
    #[serde(rename = "closed")]
    Closed,
}

impl TicketStatus {
    pub const ALL: [TicketStatus; 4] = [
        TicketStatus::Open,
        TicketStatus::InProgress,
        TicketStatus::Resolved,
        TicketStatus::Closed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "inProgress",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
        }
    }

    /// Strict parse, used for values supplied by callers.
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }

    /// Lenient parse for values read back from storage or the change feed.
    /// Anything outside the four known states is coerced to `Open`.
    pub fn from_stored(value: &str) -> Self {
        Self::parse(value).unwrap_or_else(|| {
            warn!("Unknown stored ticket status {value:?}, coercing to open");
            Self::Open
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Resolved and closed tickets are hidden from the staff dashboard
    /// unless the "show resolved" toggle is on.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Resolved | Self::Closed)
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TicketStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from_stored(&raw))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub subject: String,
    pub message: String,
    pub status: TicketStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rating: Option<u8>,
}

impl Ticket {
    /// A rating of zero is how older rows encode "not rated yet".
    pub fn has_rating(&self) -> bool {
        matches!(self.rating, Some(r) if r > 0)
    }

    pub fn is_closed(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Guest-supplied fields of a new ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketDraft {
    pub name: String,
    pub email: String,
    pub subject: String,
    pub message: String,
}

impl TicketDraft {
    pub fn validate(&self) -> Result<(), TicketError> {
        if self.name.trim().is_empty() {
            return Err(TicketError::Validation("name is required".to_string()));
        }
        if !self.email.contains('@') {
            return Err(TicketError::Validation(
                "a valid email address is required".to_string(),
            ));
        }
        if self.subject.trim().is_empty() {
            return Err(TicketError::Validation("subject is required".to_string()));
        }
        if self.message.trim().is_empty() {
            return Err(TicketError::Validation("message is required".to_string()));
        }
        Ok(())
    }

    /// Trimmed copy with the email lowercased, as stored.
    pub fn normalized(&self) -> Self {
        Self {
            name: self.name.trim().to_string(),
            email: normalize_email(&self.email),
            subject: self.subject.trim().to_string(),
            message: self.message.trim().to_string(),
        }
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Automated replies the state machine can emit. Stored alongside the reply
/// so that clients never have to pattern-match message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemNotice {
    Resolved,
    RatingPrompt,
}

impl SystemNotice {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::RatingPrompt => "rating_prompt",
        }
    }

    pub fn from_stored(value: &str) -> Option<Self> {
        match value {
            "resolved" => Some(Self::Resolved),
            "rating_prompt" => Some(Self::RatingPrompt),
            _ => None,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::Resolved => super::constants::RESOLVED_NOTICE,
            Self::RatingPrompt => super::constants::RATING_PROMPT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorKind {
    Guest,
    Staff,
    System,
}

impl AuthorKind {
    /// Classifies a reply author from its stored attribution. The guest
    /// flag or the guest name prefix wins over the system name.
    pub fn classify(admin_name: &str, is_from_guest: bool) -> Self {
        if is_from_guest || admin_name.starts_with(GUEST_AUTHOR_PREFIX) {
            Self::Guest
        } else if admin_name == SYSTEM_AUTHOR {
            Self::System
        } else {
            Self::Staff
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketReply {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub admin_name: String,
    #[serde(default)]
    pub is_from_guest: bool,
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub notice: Option<SystemNotice>,
}

impl TicketReply {
    pub fn author_kind(&self) -> AuthorKind {
        AuthorKind::classify(&self.admin_name, self.is_from_guest)
    }

    /// Name to show next to the message, without the guest prefix.
    pub fn display_name(&self) -> &str {
        self.admin_name
            .strip_prefix(GUEST_AUTHOR_PREFIX)
            .and_then(|rest| rest.strip_suffix(')'))
            .unwrap_or(&self.admin_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyDraft {
    pub admin_name: String,
    pub is_from_guest: bool,
    pub message: String,
    #[serde(default)]
    pub notice: Option<SystemNotice>,
}

impl ReplyDraft {
    pub fn system(notice: SystemNotice) -> Self {
        Self {
            admin_name: SYSTEM_AUTHOR.to_string(),
            is_from_guest: false,
            message: notice.message().to_string(),
            notice: Some(notice),
        }
    }

    pub fn guest(guest_name: &str, message: impl Into<String>) -> Self {
        Self {
            admin_name: format!("{GUEST_AUTHOR_PREFIX}{})", guest_name.trim()),
            is_from_guest: true,
            message: message.into(),
            notice: None,
        }
    }

    pub fn staff(staff_name: &str, message: impl Into<String>) -> Self {
        Self {
            admin_name: staff_name.trim().to_string(),
            is_from_guest: false,
            message: message.into(),
            notice: None,
        }
    }

    pub fn author_kind(&self) -> AuthorKind {
        AuthorKind::classify(&self.admin_name, self.is_from_guest)
    }

    /// True only for a draft built from a notice: system author, notice
    /// set and the canonical notice text.
    pub fn is_system_notice(&self) -> bool {
        match self.notice {
            Some(notice) => {
                self.author_kind() == AuthorKind::System && self.message == notice.message()
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusLogEntry {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub old_status: Option<TicketStatus>,
    pub new_status: TicketStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TicketStatusCounts {
    pub all: usize,
    pub open: usize,
    #[serde(rename = "inProgress")]
    pub in_progress: usize,
    pub resolved: usize,
    pub closed: usize,
}

/// Validates a star rating before it is sent anywhere.
pub fn check_rating(rating: u8) -> Result<u8, TicketError> {
    if (MIN_RATING..=MAX_RATING).contains(&rating) {
        Ok(rating)
    } else {
        Err(TicketError::Validation(format!(
            "rating must be between {MIN_RATING} and {MAX_RATING}"
        )))
    }
}
