use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post, put},
    Json, Router,
};
use futures::Stream;
use log::{error, info, warn};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};
use uuid::Uuid;

use super::error::TicketError;
use super::feed::BroadcastChangeFeed;
use super::session::AdminCredentials;
use super::store::TicketStore;
use super::types::{
    check_rating, ReplyDraft, StatusLogEntry, SystemNotice, Ticket, TicketDraft, TicketReply,
    TicketStatus,
};

/// Shared state of the ticket HTTP surface.
#[derive(Clone)]
pub struct TicketsState {
    pub store: Arc<dyn TicketStore>,
    pub feed: BroadcastChangeFeed,
    pub admin: Option<AdminCredentials>,
}

pub fn ticket_routes(state: TicketsState) -> Router {
    Router::new()
        .route(
            "/api/tickets",
            get(list_tickets_handler)
                .post(create_ticket_handler)
                .delete(delete_tickets_handler),
        )
        .route("/api/tickets/events", get(events_handler))
        .route("/api/tickets/:id", get(get_ticket_handler))
        .route("/api/tickets/:id/status", put(update_status_handler))
        .route("/api/tickets/:id/rating", put(set_rating_handler))
        .route(
            "/api/tickets/:id/replies",
            get(list_replies_handler).post(create_reply_handler),
        )
        .route("/api/tickets/:id/history", get(status_history_handler))
        .route("/api/session/login", post(login_handler))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
    pub rating: Option<u8>,
}

#[derive(Debug, Deserialize)]
pub struct RatingRequest {
    pub rating: u8,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct CreateReplyRequest {
    pub admin_name: String,
    #[serde(default)]
    pub is_from_guest: bool,
    pub message: String,
    pub notice: Option<SystemNotice>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

fn parse_status(raw: &str) -> Result<TicketStatus, TicketError> {
    TicketStatus::parse(raw)
        .ok_or_else(|| TicketError::Validation(format!("unknown ticket status {raw:?}")))
}

async fn list_tickets_handler(
    State(state): State<TicketsState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Ticket>>, TicketError> {
    let status = query.status.as_deref().map(parse_status).transpose()?;
    let tickets = match query.email.as_deref() {
        Some(email) => {
            let mut tickets = state.store.list_by_email(email).await?;
            if let Some(status) = status {
                tickets.retain(|t| t.status == status);
            }
            tickets
        }
        None => state.store.list_all(status).await?,
    };
    Ok(Json(tickets))
}

async fn create_ticket_handler(
    State(state): State<TicketsState>,
    Json(draft): Json<TicketDraft>,
) -> Result<(StatusCode, Json<Ticket>), TicketError> {
    draft.validate()?;
    let ticket = state.store.create(draft.normalized()).await?;
    info!("Created ticket {}", ticket.id);
    Ok((StatusCode::CREATED, Json(ticket)))
}

async fn delete_tickets_handler(
    State(state): State<TicketsState>,
    Json(req): Json<DeleteRequest>,
) -> Result<StatusCode, TicketError> {
    state.store.delete_many(&req.ids).await?;
    info!("Deleted {} tickets", req.ids.len());
    Ok(StatusCode::NO_CONTENT)
}

async fn get_ticket_handler(
    State(state): State<TicketsState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Ticket>, TicketError> {
    Ok(Json(state.store.get_by_id(id).await?))
}

async fn update_status_handler(
    State(state): State<TicketsState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<Json<Ticket>, TicketError> {
    let status = parse_status(&req.status)?;
    let rating = req.rating.map(check_rating).transpose()?;
    let ticket = state.store.update_status(id, status, rating).await?;
    Ok(Json(ticket))
}

async fn set_rating_handler(
    State(state): State<TicketsState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RatingRequest>,
) -> Result<Json<Ticket>, TicketError> {
    let rating = check_rating(req.rating)?;
    Ok(Json(state.store.set_rating(id, rating).await?))
}

async fn list_replies_handler(
    State(state): State<TicketsState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<TicketReply>>, TicketError> {
    Ok(Json(state.store.list_replies(id).await?))
}

async fn create_reply_handler(
    State(state): State<TicketsState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CreateReplyRequest>,
) -> Result<(StatusCode, Json<TicketReply>), TicketError> {
    let draft = match req.notice {
        Some(notice) => ReplyDraft::system(notice),
        None => ReplyDraft {
            admin_name: req.admin_name,
            is_from_guest: req.is_from_guest,
            message: req.message,
            notice: None,
        },
    };
    let reply = state.store.create_reply(id, draft).await?;
    Ok((StatusCode::CREATED, Json(reply)))
}

async fn status_history_handler(
    State(state): State<TicketsState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<StatusLogEntry>>, TicketError> {
    state.store.get_by_id(id).await?;
    Ok(Json(state.store.status_history(id).await?))
}

async fn login_handler(
    State(state): State<TicketsState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, TicketError> {
    let admin = state
        .admin
        .as_ref()
        .ok_or_else(|| TicketError::Unauthorized("staff login is disabled".to_string()))?;
    let session = admin.authenticate(&req.username, &req.password)?;
    Ok(Json(serde_json::json!({
        "name": session.display_name(),
        "privileged": session.is_privileged(),
    })))
}

async fn events_handler(
    State(state): State<TicketsState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("SSE client connected to the ticket feed");
    let stream = BroadcastStream::new(state.feed.raw_receiver()).filter_map(|msg| match msg {
        Ok(event) => match serde_json::to_string(&event) {
            Ok(data) => Some(Ok(Event::default().event(event.event_name()).data(data))),
            Err(e) => {
                error!("Failed to encode {} event: {}", event.event_name(), e);
                None
            }
        },
        Err(BroadcastStreamRecvError::Lagged(n)) => {
            warn!("SSE client lagged behind by {} events", n);
            None
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tickets::store::MemoryTicketStore;
    use axum::body::Body;
    use axum::http::{Request, Response};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn router() -> (Router, Arc<MemoryTicketStore>) {
        let feed = BroadcastChangeFeed::new(64);
        let store = Arc::new(MemoryTicketStore::new(feed.clone()));
        let state = TicketsState {
            store: store.clone(),
            feed,
            admin: Some(AdminCredentials::new("admin", "pw")),
        };
        (ticket_routes(state), store)
    }

    fn request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response<Body>) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create(app: &Router) -> Value {
        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/tickets",
                json!({
                    "name": "Dana",
                    "email": "Dana@Example.com",
                    "subject": "Billing",
                    "message": "Charged twice"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        json_body(response).await
    }

    #[tokio::test]
    async fn test_create_and_fetch() {
        let (app, _) = router();
        let created = create(&app).await;
        assert_eq!(created["status"], "open");
        assert_eq!(created["email"], "dana@example.com");

        let id = created["id"].as_str().unwrap();
        let response = app
            .clone()
            .oneshot(Request::get(format!("/api/tickets/{id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::get("/api/tickets?email=%20DANA@example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(json_body(response).await.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_draft_is_rejected() {
        let (app, store) = router();
        let response = app
            .oneshot(request(
                "POST",
                "/api/tickets",
                json!({ "name": "", "email": "x", "subject": "", "message": "" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(store.list_all(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_ticket_rejects_status_change() {
        let (app, _) = router();
        let id = create(&app).await["id"].as_str().unwrap().to_string();
        let uri = format!("/api/tickets/{id}/status");

        let response = app
            .clone()
            .oneshot(request("PUT", &uri, json!({ "status": "closed" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(request("PUT", &uri, json!({ "status": "open" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(json_body(response).await["error"]
            .as_str()
            .unwrap()
            .contains("closed"));

        let response = app
            .oneshot(request("PUT", &uri, json!({ "status": "archived" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_ticket_is_404() {
        let (app, _) = router();
        let response = app
            .oneshot(
                Request::get(format!("/api/tickets/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_replies_and_history() {
        let (app, _) = router();
        let id = create(&app).await["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                &format!("/api/tickets/{id}/replies"),
                json!({ "admin_name": "Guest (Dana)", "is_from_guest": true, "message": "Any news?" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/api/tickets/{id}/replies"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(json_body(response).await.as_array().unwrap().len(), 1);

        let response = app
            .oneshot(
                Request::get(format!("/api/tickets/{id}/history"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let history = json_body(response).await;
        assert_eq!(history[0]["new_status"], "open");
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        (status, json_body(response).await)
    }

    #[tokio::test]
    async fn test_reply_route_enforces_authorship() {
        let (app, store) = router();
        let id = create(&app).await["id"].as_str().unwrap().to_string();
        let uri = format!("/api/tickets/{id}/replies");

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                &uri,
                json!({ "admin_name": "Support", "message": "x", "notice": "rating_prompt" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(request("PUT", &format!("/api/tickets/{id}/status"), json!({ "status": "resolved" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                &uri,
                json!({ "admin_name": "Guest (Dana)", "is_from_guest": false, "message": "Reopen?" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .clone()
            .oneshot(request("PUT", &format!("/api/tickets/{id}/status"), json!({ "status": "closed" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(request(
                "POST",
                &uri,
                json!({ "admin_name": "System", "message": "Reopened by request" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let ticket_id: Uuid = id.parse().unwrap();
        assert!(store.list_replies(ticket_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rating_route_keeps_first_value() {
        let (app, _) = router();
        let id = create(&app).await["id"].as_str().unwrap().to_string();
        let uri = format!("/api/tickets/{id}/rating");

        let response = app
            .clone()
            .oneshot(request("PUT", &uri, json!({ "rating": 5 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        app.clone()
            .oneshot(request("PUT", &format!("/api/tickets/{id}/status"), json!({ "status": "closed" })))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(request("PUT", &uri, json!({ "rating": 4 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["rating"], 4);

        let response = app
            .clone()
            .oneshot(request("PUT", &uri, json!({ "rating": 1 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["rating"], 4);

        let (_, ticket) = get_json(&app, &format!("/api/tickets/{id}")).await;
        assert_eq!(ticket["rating"], 4);
        assert_eq!(ticket["status"], "closed");
    }

    #[tokio::test]
    async fn test_list_filters_by_status_and_email() {
        let (app, store) = router();
        let first = create(&app).await["id"].as_str().unwrap().to_string();
        create(&app).await;
        store
            .create(TicketDraft {
                name: "Lee".to_string(),
                email: "lee@example.com".to_string(),
                subject: "VPN".to_string(),
                message: "Drops hourly".to_string(),
            })
            .await
            .unwrap();
        app.clone()
            .oneshot(request(
                "PUT",
                &format!("/api/tickets/{first}/status"),
                json!({ "status": "inProgress" }),
            ))
            .await
            .unwrap();

        let (status, body) = get_json(&app, "/api/tickets?status=inProgress").await;
        assert_eq!(status, StatusCode::OK);
        let listed = body.as_array().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["id"], first.as_str());

        let (_, body) = get_json(&app, "/api/tickets?status=open").await;
        assert_eq!(body.as_array().unwrap().len(), 2);

        let (_, body) = get_json(&app, "/api/tickets?email=dana@example.com&status=open").await;
        let listed = body.as_array().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["email"], "dana@example.com");

        let (status, body) = get_json(&app, "/api/tickets?status=pending").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("pending"));
    }

    #[tokio::test]
    async fn test_events_stream_announces_new_ticket() {
        let (app, _) = router();
        let response = app
            .clone()
            .oneshot(Request::get("/api/tickets/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let created = create(&app).await;
        let mut body = response.into_body();
        let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();
        assert!(text.starts_with("event: ticket_inserted\n"));
        assert!(text.contains(created["id"].as_str().unwrap()));
    }

    #[tokio::test]
    async fn test_bulk_delete() {
        let (app, store) = router();
        let id = create(&app).await["id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(request("DELETE", "/api/tickets", json!({ "ids": [id] })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(store.list_all(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_login() {
        let (app, _) = router();
        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/session/login",
                json!({ "username": "admin", "password": "pw" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["privileged"], true);

        let response = app
            .oneshot(request(
                "POST",
                "/api/session/login",
                json!({ "username": "admin", "password": "nope" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
