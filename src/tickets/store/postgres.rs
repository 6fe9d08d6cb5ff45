use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::PgConnection;
use log::{error, info};
use uuid::Uuid;

use super::{check_reply_allowed, TicketStore};
use crate::tickets::error::TicketError;
use crate::tickets::feed::{BroadcastChangeFeed, FeedEvent};
use crate::tickets::migrations::create_ticket_tables_migration;
use crate::tickets::schema::{ticket_replies, ticket_status_logs, tickets};
use crate::tickets::types::{
    check_rating, normalize_email, ReplyDraft, StatusLogEntry, SystemNotice, Ticket, TicketDraft,
    TicketReply, TicketStatus,
};

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

impl From<diesel::result::Error> for TicketError {
    fn from(e: diesel::result::Error) -> Self {
        TicketError::Database(e.to_string())
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = tickets)]
struct TicketRow {
    id: Uuid,
    name: String,
    email: String,
    subject: String,
    message: String,
    status: String,
    rating: Option<i32>,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl From<TicketRow> for Ticket {
    fn from(row: TicketRow) -> Self {
        Ticket {
            id: row.id,
            name: row.name,
            email: row.email,
            subject: row.subject,
            message: row.message,
            status: TicketStatus::from_stored(&row.status),
            created_at: row.created_at,
            updated_at: row.updated_at,
            rating: row.rating.and_then(|r| u8::try_from(r).ok()),
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = tickets)]
struct NewTicketRow<'a> {
    id: Uuid,
    name: &'a str,
    email: &'a str,
    subject: &'a str,
    message: &'a str,
    status: &'a str,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = ticket_replies)]
struct ReplyRow {
    id: Uuid,
    ticket_id: Uuid,
    admin_name: String,
    is_from_guest: Option<bool>,
    message: String,
    notice: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<ReplyRow> for TicketReply {
    fn from(row: ReplyRow) -> Self {
        TicketReply {
            id: row.id,
            ticket_id: row.ticket_id,
            admin_name: row.admin_name,
            is_from_guest: row.is_from_guest.unwrap_or(false),
            message: row.message,
            created_at: row.created_at,
            notice: row.notice.as_deref().and_then(SystemNotice::from_stored),
        }
    }
}

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = ticket_status_logs)]
struct StatusLogRow {
    id: Uuid,
    ticket_id: Uuid,
    old_status: Option<String>,
    new_status: Option<String>,
    created_at: Option<DateTime<Utc>>,
}

impl StatusLogRow {
    fn new(ticket_id: Uuid, old: Option<TicketStatus>, new: TicketStatus, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ticket_id,
            old_status: old.map(|s| s.as_str().to_string()),
            new_status: Some(new.as_str().to_string()),
            created_at: Some(at),
        }
    }

    fn into_entry(self, fallback_time: DateTime<Utc>) -> StatusLogEntry {
        StatusLogEntry {
            id: self.id,
            ticket_id: self.ticket_id,
            old_status: self.old_status.as_deref().map(TicketStatus::from_stored),
            new_status: self
                .new_status
                .as_deref()
                .map(TicketStatus::from_stored)
                .unwrap_or(TicketStatus::Open),
            created_at: self.created_at.unwrap_or(fallback_time),
        }
    }
}

fn load_ticket(conn: &mut PgConnection, id: Uuid) -> Result<Ticket, TicketError> {
    tickets::table
        .find(id)
        .select(TicketRow::as_select())
        .first(conn)
        .optional()?
        .map(Ticket::from)
        .ok_or(TicketError::NotFound(id))
}

fn lock_ticket(conn: &mut PgConnection, id: Uuid) -> Result<Ticket, TicketError> {
    tickets::table
        .find(id)
        .select(TicketRow::as_select())
        .for_update()
        .first(conn)
        .optional()?
        .map(Ticket::from)
        .ok_or(TicketError::NotFound(id))
}

/// Diesel-backed store. Every call runs on the blocking pool.
pub struct PgTicketStore {
    pool: DbPool,
    feed: BroadcastChangeFeed,
}

impl PgTicketStore {
    pub fn connect(
        database_url: &str,
        max_connections: u32,
        feed: BroadcastChangeFeed,
    ) -> Result<Self, TicketError> {
        let manager = ConnectionManager::<PgConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(max_connections)
            .build(manager)
            .map_err(|e| {
                error!("Failed to create database pool: {e}");
                TicketError::Connection(e.to_string())
            })?;
        Ok(Self::from_pool(pool, feed))
    }

    pub fn from_pool(pool: DbPool, feed: BroadcastChangeFeed) -> Self {
        Self { pool, feed }
    }

    pub async fn run_migrations(&self) -> Result<(), TicketError> {
        self.with_conn(|conn| {
            conn.batch_execute(create_ticket_tables_migration())?;
            Ok(())
        })
        .await?;
        info!("Ticket tables ready");
        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, TicketError>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> Result<T, TicketError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| {
                error!("Failed to get database connection: {e}");
                TicketError::Connection(e.to_string())
            })?;
            f(&mut conn)
        })
        .await
        .map_err(|e| TicketError::Internal(format!("Task error: {e}")))?
    }
}

#[async_trait]
impl TicketStore for PgTicketStore {
    async fn create(&self, draft: TicketDraft) -> Result<Ticket, TicketError> {
        draft.validate()?;
        let draft = draft.normalized();

        let ticket = self
            .with_conn(move |conn| {
                conn.transaction::<_, TicketError, _>(|conn| {
                    let id = Uuid::new_v4();
                    let now = Utc::now();
                    diesel::insert_into(tickets::table)
                        .values(&NewTicketRow {
                            id,
                            name: &draft.name,
                            email: &draft.email,
                            subject: &draft.subject,
                            message: &draft.message,
                            status: TicketStatus::Open.as_str(),
                            created_at: now,
                            updated_at: Some(now),
                        })
                        .execute(conn)?;
                    diesel::insert_into(ticket_status_logs::table)
                        .values(&StatusLogRow::new(id, None, TicketStatus::Open, now))
                        .execute(conn)?;
                    load_ticket(conn, id)
                })
            })
            .await?;

        info!("Created ticket {}", ticket.id);
        self.feed.publish(FeedEvent::TicketInserted { ticket: ticket.clone() });
        Ok(ticket)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Ticket, TicketError> {
        self.with_conn(move |conn| load_ticket(conn, id)).await
    }

    async fn list_all(&self, status: Option<TicketStatus>) -> Result<Vec<Ticket>, TicketError> {
        self.with_conn(move |conn| {
            let mut query = tickets::table.select(TicketRow::as_select()).into_boxed();
            if let Some(status) = status {
                query = query.filter(tickets::status.eq(status.as_str()));
            }
            let rows: Vec<TicketRow> = query.order(tickets::created_at.desc()).load(conn)?;
            Ok(rows.into_iter().map(Ticket::from).collect())
        })
        .await
    }

    async fn list_by_email(&self, email: &str) -> Result<Vec<Ticket>, TicketError> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(TicketError::Validation("email is required".to_string()));
        }
        self.with_conn(move |conn| {
            let rows: Vec<TicketRow> = tickets::table
                .filter(tickets::email.eq(&email))
                .select(TicketRow::as_select())
                .order(tickets::created_at.desc())
                .load(conn)?;
            Ok(rows.into_iter().map(Ticket::from).collect())
        })
        .await
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: TicketStatus,
        rating: Option<u8>,
    ) -> Result<Ticket, TicketError> {
        if let Some(r) = rating {
            check_rating(r)?;
        }

        let (ticket, previous) = self
            .with_conn(move |conn| {
                conn.transaction::<_, TicketError, _>(|conn| {
                    let current = lock_ticket(conn, id)?;
                    if current.is_closed() {
                        return Err(TicketError::TicketClosed(id));
                    }
                    let now = Utc::now();
                    let new_rating = match rating {
                        Some(r) if !current.has_rating() => Some(i32::from(r)),
                        _ => current.rating.map(i32::from),
                    };
                    diesel::update(tickets::table.find(id))
                        .set((
                            tickets::status.eq(status.as_str()),
                            tickets::rating.eq(new_rating),
                            tickets::updated_at.eq(Some(now)),
                        ))
                        .execute(conn)?;
                    if current.status != status {
                        diesel::insert_into(ticket_status_logs::table)
                            .values(&StatusLogRow::new(id, Some(current.status), status, now))
                            .execute(conn)?;
                    }
                    Ok((load_ticket(conn, id)?, current.status))
                })
            })
            .await?;

        info!("Ticket {id} updated from {previous} to {status}");
        self.feed.publish(FeedEvent::TicketUpdated { ticket: ticket.clone() });
        Ok(ticket)
    }

    async fn set_rating(&self, id: Uuid, rating: u8) -> Result<Ticket, TicketError> {
        check_rating(rating)?;

        let (ticket, written) = self
            .with_conn(move |conn| {
                conn.transaction::<_, TicketError, _>(|conn| {
                    let current = lock_ticket(conn, id)?;
                    if !current.is_closed() {
                        return Err(TicketError::Validation(
                            "tickets can only be rated once closed".to_string(),
                        ));
                    }
                    let written = diesel::update(
                        tickets::table
                            .find(id)
                            .filter(tickets::rating.is_null().or(tickets::rating.eq(0))),
                    )
                    .set((
                        tickets::rating.eq(Some(i32::from(rating))),
                        tickets::updated_at.eq(Some(Utc::now())),
                    ))
                    .execute(conn)?;
                    Ok((load_ticket(conn, id)?, written > 0))
                })
            })
            .await?;

        if written {
            info!("Ticket {id} rated {rating}");
            self.feed.publish(FeedEvent::TicketUpdated { ticket: ticket.clone() });
        }
        Ok(ticket)
    }

    async fn delete_many(&self, ids: &[Uuid]) -> Result<(), TicketError> {
        let ids = ids.to_vec();
        let count = ids.len();
        self.with_conn(move |conn| {
            conn.transaction::<_, TicketError, _>(|conn| {
                diesel::delete(ticket_replies::table.filter(ticket_replies::ticket_id.eq_any(ids.clone())))
                    .execute(conn)?;
                diesel::delete(
                    ticket_status_logs::table.filter(ticket_status_logs::ticket_id.eq_any(ids.clone())),
                )
                .execute(conn)?;
                diesel::delete(tickets::table.filter(tickets::id.eq_any(ids))).execute(conn)?;
                Ok(())
            })
        })
        .await?;
        info!("Deleted {count} ticket(s)");
        Ok(())
    }

    async fn create_reply(&self, ticket_id: Uuid, draft: ReplyDraft) -> Result<TicketReply, TicketError> {
        let reply = self
            .with_conn(move |conn| {
                conn.transaction::<_, TicketError, _>(|conn| {
                    let ticket = load_ticket(conn, ticket_id)?;
                    check_reply_allowed(&ticket, &draft)?;
                    let row = ReplyRow {
                        id: Uuid::new_v4(),
                        ticket_id,
                        admin_name: draft.admin_name,
                        is_from_guest: Some(draft.is_from_guest),
                        message: draft.message,
                        notice: draft.notice.map(|n| n.as_str().to_string()),
                        created_at: Utc::now(),
                    };
                    diesel::insert_into(ticket_replies::table)
                        .values(&row)
                        .execute(conn)?;
                    Ok(TicketReply::from(row))
                })
            })
            .await?;

        self.feed.publish(FeedEvent::ReplyInserted { reply: reply.clone() });
        Ok(reply)
    }

    async fn list_replies(&self, ticket_id: Uuid) -> Result<Vec<TicketReply>, TicketError> {
        self.with_conn(move |conn| {
            let rows: Vec<ReplyRow> = ticket_replies::table
                .filter(ticket_replies::ticket_id.eq(ticket_id))
                .select(ReplyRow::as_select())
                .order(ticket_replies::created_at.asc())
                .load(conn)?;
            Ok(rows.into_iter().map(TicketReply::from).collect())
        })
        .await
    }

    async fn status_history(&self, ticket_id: Uuid) -> Result<Vec<StatusLogEntry>, TicketError> {
        self.with_conn(move |conn| {
            let rows: Vec<StatusLogRow> = ticket_status_logs::table
                .filter(ticket_status_logs::ticket_id.eq(ticket_id))
                .select(StatusLogRow::as_select())
                .order(ticket_status_logs::created_at.asc())
                .load(conn)?;
            let now = Utc::now();
            Ok(rows.into_iter().map(|r| r.into_entry(now)).collect())
        })
        .await
    }
}
