use actix_web::http::header::{self, ContentEncoding};
use actix_web::{web, HttpResponse};
use futures_util::StreamExt as _;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::auth::Auth;
use crate::error::ApiError;
use crate::models::*;
use crate::rate_limit::{Action, RateLimiter};
use crate::service::ConversationService;
use crate::telemetry;

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(
                web::resource("/interventions/{id}/threads")
                    .route(web::get().to(list_threads))
                    .route(web::post().to(create_thread)),
            )
            .service(
                web::resource("/threads/{id}/messages")
                    .route(web::get().to(list_messages))
                    .route(web::post().to(send_message)),
            )
            .service(web::resource("/messages/{id}").route(web::delete().to(delete_message)))
            .service(web::resource("/threads/{id}/participants").route(web::post().to(add_participant)))
            .service(
                web::resource("/threads/{id}/participants/{user_id}")
                    .route(web::delete().to(remove_participant)),
            )
            .service(web::resource("/threads/{id}/read").route(web::post().to(mark_read)))
            .service(web::resource("/threads/{id}/unread").route(web::get().to(thread_unread)))
            .service(web::resource("/me/unread").route(web::get().to(total_unread)))
            .service(web::resource("/threads/{id}/events").route(web::get().to(thread_events))),
    );
    cfg.route("/metrics", web::get().to(metrics));
}

#[derive(Clone)]
pub struct AppState {
    pub service: ConversationService,
    pub rate_limiter: Option<RateLimiter>,
}

impl AppState {
    fn throttle(&self, action: Action, user_id: Id) -> Result<(), ApiError> {
        match &self.rate_limiter {
            Some(rl) if !rl.allow(action, user_id) => Err(ApiError::TooManyRequests),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateThreadRequest {
    pub thread_type: ThreadType,
    pub title: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AddParticipantRequest {
    pub user_id: Id,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct MessagesQuery {
    /// Zero-based page index.
    pub page: Option<u32>,
    /// Page size, capped at 200.
    pub limit: Option<u32>,
    /// `newest` (default): page 0 holds the latest messages; `oldest`: page 0 starts at the
    /// beginning of the thread.
    pub direction: Option<PageDirection>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UnreadResponse {
    pub unread_count: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MarkReadResponse {
    pub marker: Option<ReadMarker>,
}

#[utoipa::path(
    get,
    path = "/api/v1/interventions/{id}/threads",
    params(("id" = Id, Path, description = "Intervention id")),
    responses(
        (status = 200, description = "Readable threads with unread counts", body = [ThreadSummary]),
        (status = 403, description = "Caller is not associated with the intervention"),
        (status = 404, description = "Intervention not found")
    ),
    security(("bearer" = []))
)]
pub async fn list_threads(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let threads = data.service.list_threads(path.into_inner(), auth.user_id).await?;
    Ok(HttpResponse::Ok().json(threads))
}

#[utoipa::path(
    post,
    path = "/api/v1/interventions/{id}/threads",
    params(("id" = Id, Path, description = "Intervention id")),
    request_body = CreateThreadRequest,
    responses(
        (status = 201, description = "Thread created", body = Thread),
        (status = 403, description = "Not allowed to open this thread type"),
        (status = 409, description = "The intervention already has a thread of this type"),
        (status = 429, description = "Rate limited")
    ),
    security(("bearer" = []))
)]
pub async fn create_thread(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<CreateThreadRequest>,
) -> Result<HttpResponse, ApiError> {
    data.throttle(Action::CreateThread, auth.user_id)?;
    let req = payload.into_inner();
    let thread = data
        .service
        .create_thread(path.into_inner(), req.thread_type, req.title.as_deref(), auth.user_id)
        .await?;
    Ok(HttpResponse::Created().json(thread))
}

#[utoipa::path(
    get,
    path = "/api/v1/threads/{id}/messages",
    params(("id" = Id, Path, description = "Thread id"), MessagesQuery),
    responses(
        (status = 200, description = "One page of messages, oldest first; deleted ones as tombstones", body = [Message]),
        (status = 403, description = "No read access"),
        (status = 404, description = "Thread not found")
    ),
    security(("bearer" = []))
)]
pub async fn list_messages(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    query: web::Query<MessagesQuery>,
) -> Result<HttpResponse, ApiError> {
    let q = query.into_inner();
    let messages = data
        .service
        .list_messages(path.into_inner(), auth.user_id, q.page, q.limit, q.direction.unwrap_or_default())
        .await?;
    Ok(HttpResponse::Ok().json(messages))
}

#[utoipa::path(
    post,
    path = "/api/v1/threads/{id}/messages",
    params(("id" = Id, Path, description = "Thread id")),
    request_body = MessageDraft,
    responses(
        (status = 201, description = "Message stored", body = Message),
        (status = 400, description = "Empty or oversized content"),
        (status = 403, description = "No write access"),
        (status = 429, description = "Rate limited")
    ),
    security(("bearer" = []))
)]
pub async fn send_message(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<MessageDraft>,
) -> Result<HttpResponse, ApiError> {
    data.throttle(Action::SendMessage, auth.user_id)?;
    let message = data.service.send_message(path.into_inner(), auth.user_id, payload.into_inner()).await?;
    Ok(HttpResponse::Created().json(message))
}

#[utoipa::path(
    delete,
    path = "/api/v1/messages/{id}",
    params(("id" = Id, Path, description = "Message id")),
    responses(
        (status = 200, description = "Tombstone of the deleted message", body = Message),
        (status = 403, description = "Neither author nor team manager"),
        (status = 404, description = "Message not found")
    ),
    security(("bearer" = []))
)]
pub async fn delete_message(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let tombstone = data.service.delete_message(path.into_inner(), auth.user_id).await?;
    Ok(HttpResponse::Ok().json(tombstone))
}

#[utoipa::path(
    post,
    path = "/api/v1/threads/{id}/participants",
    params(("id" = Id, Path, description = "Thread id")),
    request_body = AddParticipantRequest,
    responses(
        (status = 200, description = "Participant (existing or new)", body = Participant),
        (status = 403, description = "Only team managers and the thread creator"),
        (status = 404, description = "Thread or user not found")
    ),
    security(("bearer" = []))
)]
pub async fn add_participant(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<AddParticipantRequest>,
) -> Result<HttpResponse, ApiError> {
    let p = data.service.add_participant(path.into_inner(), payload.user_id, auth.user_id).await?;
    Ok(HttpResponse::Ok().json(p))
}

#[utoipa::path(
    delete,
    path = "/api/v1/threads/{id}/participants/{user_id}",
    params(("id" = Id, Path, description = "Thread id"), ("user_id" = Id, Path, description = "Participant to remove")),
    responses(
        (status = 204, description = "Removed"),
        (status = 403, description = "Only team managers and the thread creator"),
        (status = 409, description = "Last participant of the thread")
    ),
    security(("bearer" = []))
)]
pub async fn remove_participant(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<(Id, Id)>,
) -> Result<HttpResponse, ApiError> {
    let (thread_id, target_id) = path.into_inner();
    data.service.remove_participant(thread_id, target_id, auth.user_id).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[utoipa::path(
    post,
    path = "/api/v1/threads/{id}/read",
    params(("id" = Id, Path, description = "Thread id")),
    responses((status = 200, description = "Marker after the update", body = MarkReadResponse)),
    security(("bearer" = []))
)]
pub async fn mark_read(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let marker = data.service.mark_thread_as_read(path.into_inner(), auth.user_id).await?;
    Ok(HttpResponse::Ok().json(MarkReadResponse { marker }))
}

#[utoipa::path(
    get,
    path = "/api/v1/threads/{id}/unread",
    params(("id" = Id, Path, description = "Thread id")),
    responses((status = 200, description = "Unread messages in the thread", body = UnreadResponse)),
    security(("bearer" = []))
)]
pub async fn thread_unread(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let unread_count = data.service.unread_count(path.into_inner(), auth.user_id).await?;
    Ok(HttpResponse::Ok().json(UnreadResponse { unread_count }))
}

#[utoipa::path(
    get,
    path = "/api/v1/me/unread",
    responses((status = 200, description = "Unread messages across every readable thread", body = UnreadResponse)),
    security(("bearer" = []))
)]
pub async fn total_unread(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let unread_count = data.service.total_unread(auth.user_id).await?;
    Ok(HttpResponse::Ok().json(UnreadResponse { unread_count }))
}

#[utoipa::path(
    get,
    path = "/api/v1/threads/{id}/events",
    params(("id" = Id, Path, description = "Thread id")),
    responses(
        (status = 200, description = "Server-sent events, one `message` event per new message", body = String, content_type = "text/event-stream"),
        (status = 403, description = "No read access")
    ),
    security(("bearer" = []))
)]
pub async fn thread_events(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let live = data.service.subscribe_stream(path.into_inner(), auth.user_id).await?;
    let events = live.map(|delivered| {
        let payload = serde_json::to_string(&delivered)?;
        Ok::<_, serde_json::Error>(web::Bytes::from(format!("id: {}\nevent: message\ndata: {payload}\n\n", delivered.message.id)))
    });
    Ok(HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "text/event-stream"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        // compressing would buffer the stream
        .insert_header(ContentEncoding::Identity)
        .streaming(events))
}

pub async fn metrics() -> HttpResponse {
    match telemetry::prometheus() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().finish(),
    }
}
