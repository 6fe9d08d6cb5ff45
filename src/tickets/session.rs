use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::error::TicketError;
use super::types::ReplyDraft;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Actor {
    Guest { name: String, email: String },
    Staff { name: String },
}

/// Who is driving the current client session. Passed explicitly to the
/// components that need it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    actor: Actor,
}

impl SessionContext {
    pub fn guest(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            actor: Actor::Guest {
                name: name.into(),
                email: email.into(),
            },
        }
    }

    pub fn staff(name: impl Into<String>) -> Self {
        Self {
            actor: Actor::Staff { name: name.into() },
        }
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn is_privileged(&self) -> bool {
        matches!(self.actor, Actor::Staff { .. })
    }

    pub fn display_name(&self) -> &str {
        match &self.actor {
            Actor::Guest { name, .. } | Actor::Staff { name } => name,
        }
    }

    pub fn require_privileged(&self, what: &str) -> Result<(), TicketError> {
        if self.is_privileged() {
            Ok(())
        } else {
            Err(TicketError::Unauthorized(format!("{what} requires a staff session")))
        }
    }

    /// Reply authored by this session.
    pub fn reply(&self, message: impl Into<String>) -> ReplyDraft {
        match &self.actor {
            Actor::Guest { name, .. } => ReplyDraft::guest(name, message),
            Actor::Staff { name } => ReplyDraft::staff(name, message),
        }
    }
}

#[derive(Clone)]
pub struct AdminCredentials {
    pub username: String,
    pub password: String,
    pub display_name: String,
}

impl AdminCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            display_name: "Admin".to_string(),
        }
    }

    pub fn authenticate(&self, username: &str, password: &str) -> Result<SessionContext, TicketError> {
        if username.is_empty() || password.is_empty() {
            return Err(TicketError::Validation(
                "Please enter both username and password".to_string(),
            ));
        }
        if constant_time_eq(username.as_bytes(), self.username.as_bytes())
            & constant_time_eq(password.as_bytes(), self.password.as_bytes())
        {
            info!("Staff session opened for {username}");
            Ok(SessionContext::staff(self.display_name.clone()))
        } else {
            warn!("Rejected staff login for {username}");
            Err(TicketError::Unauthorized("invalid credentials".to_string()))
        }
    }
}

impl std::fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("display_name", &self.display_name)
            .finish()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tickets::types::AuthorKind;

    #[test]
    fn test_staff_login() {
        let creds = AdminCredentials::new("admin", "s3cret");
        let session = creds.authenticate("admin", "s3cret").unwrap();
        assert!(session.is_privileged());
        assert_eq!(session.display_name(), "Admin");

        assert!(matches!(
            creds.authenticate("admin", "wrong"),
            Err(TicketError::Unauthorized(_))
        ));
        assert!(matches!(
            creds.authenticate("", ""),
            Err(TicketError::Validation(_))
        ));
    }

    #[test]
    fn test_reply_authorship_follows_actor() {
        let guest = SessionContext::guest("Dana", "dana@example.com");
        let draft = guest.reply("hello");
        assert_eq!(draft.admin_name, "Guest (Dana)");
        assert_eq!(draft.author_kind(), AuthorKind::Guest);
        assert!(guest.require_privileged("Deleting tickets").is_err());

        let staff = SessionContext::staff("Morgan");
        assert_eq!(staff.reply("hi").author_kind(), AuthorKind::Staff);
    }
}
