use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::models::{
    AuthorInfo, DeliveredMessage, Message, MessageDraft, PageDirection, Participant, ReadMarker, Thread,
    ThreadSummary, ThreadType,
};
use crate::routes::{AddParticipantRequest, CreateThreadRequest, MarkReadResponse, UnreadResponse};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::list_threads,
        crate::routes::create_thread,
        crate::routes::list_messages,
        crate::routes::send_message,
        crate::routes::delete_message,
        crate::routes::add_participant,
        crate::routes::remove_participant,
        crate::routes::mark_read,
        crate::routes::thread_unread,
        crate::routes::total_unread,
        crate::routes::thread_events,
    ),
    components(schemas(
        Thread, ThreadType, ThreadSummary, Participant, Message, MessageDraft, ReadMarker,
        PageDirection, AuthorInfo, DeliveredMessage,
        CreateThreadRequest, AddParticipantRequest, UnreadResponse, MarkReadResponse
    )),
    modifiers(&BearerAuth),
    tags(
        (name = "threads", description = "Intervention conversation threads"),
        (name = "messages", description = "Messages, read state and live events"),
    )
)]
pub struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).bearer_format("JWT").build()),
            );
        }
    }
}
