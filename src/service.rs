//! The conversation orchestrator: every public operation loads the caller and the thread,
//! asks [`crate::access`] for a decision, and only then touches the stores.
//!
//! Secondary effects (attachment linking, activity bumps, notifications) are best-effort:
//! they are logged and counted when they fail, never surfaced to the caller once the
//! primary write has succeeded.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::access::{self, Permissions};
use crate::collab::{AttachmentLinker, CollabError, InterventionDirectory, NotificationDispatcher, NotificationKind, UserDirectory};
use crate::config::{ServiceSettings, MAX_PAGE_LIMIT};
use crate::error::{ConversationError, Resource};
use crate::gateway::{backlog, FanOutGateway, MessageSink, SubscriptionHandle};
use crate::models::*;
use crate::repo::{Repo, RepoResult};
use crate::telemetry;

pub type ConversationResult<T> = Result<T, ConversationError>;

/// External systems the service consumes.
#[derive(Clone)]
pub struct Collaborators {
    pub users: Arc<dyn UserDirectory>,
    pub interventions: Arc<dyn InterventionDirectory>,
    pub notifier: Arc<dyn NotificationDispatcher>,
    pub attachments: Arc<dyn AttachmentLinker>,
}

/// Caller's view of one thread, loaded once per operation.
struct ThreadContext {
    user: UserProfile,
    thread: Thread,
    intervention: Intervention,
    participants: HashSet<Id>,
    perms: Permissions,
}

#[derive(Clone)]
pub struct ConversationService {
    repo: Arc<dyn Repo>,
    collab: Collaborators,
    gateway: FanOutGateway,
    settings: ServiceSettings,
}

impl ConversationService {
    /// Wires the fan-out gateway to the store's change feed. Must run inside a tokio runtime.
    pub fn new(repo: Arc<dyn Repo>, collab: Collaborators, settings: ServiceSettings) -> Self {
        let gateway = FanOutGateway::new(collab.users.clone(), settings.subscriber_queue);
        gateway.attach_feed(repo.message_feed());
        Self { repo, collab, gateway, settings }
    }

    pub fn gateway(&self) -> &FanOutGateway {
        &self.gateway
    }

    // ---------------- plumbing ----------------------------------------------------

    async fn bounded<T>(&self, fut: impl Future<Output = ConversationResult<T>>) -> ConversationResult<T> {
        tokio::time::timeout(self.settings.store_timeout, fut)
            .await
            .map_err(|_| ConversationError::Timeout)?
    }

    async fn store<T>(&self, fut: impl Future<Output = RepoResult<T>>) -> ConversationResult<T> {
        self.bounded(async { fut.await.map_err(ConversationError::from) }).await
    }

    async fn user(&self, id: Id) -> ConversationResult<UserProfile> {
        self.bounded(async { self.collab.users.get_user(id).await.map_err(collab_error(Resource::User, id)) })
            .await
    }

    async fn intervention(&self, id: Id) -> ConversationResult<Intervention> {
        self.bounded(async {
            self.collab.interventions.get_intervention(id).await.map_err(collab_error(Resource::Intervention, id))
        })
        .await
    }

    async fn participant_ids(&self, thread_id: Id) -> ConversationResult<HashSet<Id>> {
        let rows = self.store(self.repo.list_participants(thread_id)).await?;
        Ok(rows.into_iter().map(|p| p.user_id).collect())
    }

    async fn thread_context(&self, thread_id: Id, user_id: Id) -> ConversationResult<ThreadContext> {
        let user = self.user(user_id).await?;
        let thread = self.store(self.repo.get_thread(thread_id)).await?;
        let intervention = self.intervention(thread.intervention_id).await?;
        let participants = self.participant_ids(thread_id).await?;
        let perms = access::evaluate(&user, &thread, &participants, &intervention);
        Ok(ThreadContext { user, thread, intervention, participants, perms })
    }

    async fn readable_context(&self, thread_id: Id, user_id: Id, action: &'static str) -> ConversationResult<ThreadContext> {
        let ctx = self.thread_context(thread_id, user_id).await?;
        if !ctx.perms.read {
            return Err(ConversationError::permission(action));
        }
        Ok(ctx)
    }

    async fn team_manager_ids(&self, team_id: Id) -> ConversationResult<Vec<Id>> {
        let managers = self
            .bounded(async {
                self.collab.users.list_team_managers(team_id).await.map_err(|e| ConversationError::Internal(e.to_string()))
            })
            .await?;
        Ok(managers.into_iter().map(|u| u.id).collect())
    }

    fn dispatch(&self, recipients: BTreeSet<Id>, kind: NotificationKind, payload: Value) {
        if recipients.is_empty() {
            return;
        }
        let notifier = self.collab.notifier.clone();
        tokio::spawn(async move {
            let recipients: Vec<Id> = recipients.into_iter().collect();
            if let Err(e) = notifier.notify(&recipients, kind, payload).await {
                telemetry::notification_failed();
                warn!(?kind, error = %e, "notification dispatch failed");
            }
        });
    }

    async fn unread_for(&self, thread_id: Id, user_id: Id) -> ConversationResult<u64> {
        let marker = self.store(self.repo.get_read_marker(thread_id, user_id)).await?;
        self.store(self.repo.count_after(thread_id, marker.map(|m| m.position()))).await
    }

    async fn advance_to_latest(&self, thread_id: Id, user_id: Id) -> ConversationResult<Option<ReadMarker>> {
        let Some(latest) = self.store(self.repo.latest_message(thread_id)).await? else {
            return Ok(None);
        };
        let marker = self.store(self.repo.advance_read_marker(thread_id, user_id, &latest)).await?;
        Ok(Some(marker))
    }

    // ---------------- threads -----------------------------------------------------

    /// Threads of the intervention the caller can read, most recently active first.
    pub async fn list_threads(&self, intervention_id: Id, user_id: Id) -> ConversationResult<Vec<ThreadSummary>> {
        let user = self.user(user_id).await?;
        let intervention = self.intervention(intervention_id).await?;
        if !access::is_associated(&user, &intervention) {
            return Err(ConversationError::permission("list_threads"));
        }
        let threads = self.store(self.repo.list_threads_by_intervention(intervention_id)).await?;
        let mut out = Vec::with_capacity(threads.len());
        for thread in threads {
            let participants = self.participant_ids(thread.id).await?;
            if !access::evaluate(&user, &thread, &participants, &intervention).read {
                continue;
            }
            let unread_count = self.unread_for(thread.id, user_id).await?;
            out.push(ThreadSummary { thread, unread_count });
        }
        out.sort_by(|a, b| b.thread.activity_at().cmp(&a.thread.activity_at()));
        Ok(out)
    }

    pub async fn create_thread(
        &self,
        intervention_id: Id,
        thread_type: ThreadType,
        title: Option<&str>,
        user_id: Id,
    ) -> ConversationResult<Thread> {
        let user = self.user(user_id).await?;
        let intervention = self.intervention(intervention_id).await?;
        if !access::can_create_thread(&user, &intervention, thread_type) {
            return Err(ConversationError::permission("create_thread"));
        }
        let title = resolve_title(title, thread_type)?;
        let seeded = self.seed_participants(&intervention, thread_type).await?;

        let thread = self
            .store(self.repo.create_thread(NewThread {
                intervention_id,
                team_id: intervention.team_id,
                thread_type,
                title,
                created_by: user.id,
                participants: seeded.iter().copied().collect(),
            }))
            .await?;
        telemetry::thread_created(thread_type.as_str());
        info!(thread_id = thread.id, intervention_id, %thread_type, user_id, "thread created");

        let mut recipients = seeded;
        recipients.remove(&user.id);
        self.dispatch(
            recipients,
            NotificationKind::ThreadCreated,
            json!({
                "thread_id": thread.id,
                "intervention_id": intervention_id,
                "thread_type": thread_type,
                "title": thread.title,
                "created_by": user.id,
            }),
        );
        Ok(thread)
    }

    /// Initial membership per thread type; the store adds the creator on top.
    async fn seed_participants(&self, intervention: &Intervention, thread_type: ThreadType) -> ConversationResult<BTreeSet<Id>> {
        let mut seeded = BTreeSet::new();
        match thread_type {
            ThreadType::Group => {
                seeded.extend(intervention.tenant_id);
                seeded.extend(intervention.assigned_user_ids.iter().copied());
            }
            ThreadType::TenantToManagers => {
                seeded.extend(intervention.tenant_id);
                seeded.extend(self.team_manager_ids(intervention.team_id).await?);
            }
            ThreadType::ProviderToManagers => {
                for &id in &intervention.assigned_user_ids {
                    match self.user(id).await {
                        Ok(u) if u.role == Role::Provider => {
                            seeded.insert(id);
                        }
                        Ok(_) => {}
                        Err(e) => warn!(user_id = id, error = %e, "skipping unresolvable assignee"),
                    }
                }
                seeded.extend(self.team_manager_ids(intervention.team_id).await?);
            }
        }
        Ok(seeded)
    }

    // ---------------- messages ----------------------------------------------------

    /// One page of messages, oldest first inside the page. Reading marks the thread as read
    /// up to its latest message.
    pub async fn list_messages(
        &self,
        thread_id: Id,
        user_id: Id,
        page: Option<u32>,
        limit: Option<u32>,
        direction: PageDirection,
    ) -> ConversationResult<Vec<Message>> {
        self.readable_context(thread_id, user_id, "read_thread").await?;
        let page = Page {
            page: page.unwrap_or(0),
            limit: limit.unwrap_or(self.settings.default_page_limit).clamp(1, MAX_PAGE_LIMIT),
            direction,
        };
        let messages = self.store(self.repo.list_messages(thread_id, page)).await?;
        if let Err(e) = self.advance_to_latest(thread_id, user_id).await {
            telemetry::side_effect_failed("read_on_fetch");
            warn!(thread_id, user_id, error = %e, "could not advance read marker after fetch");
        }
        Ok(messages)
    }

    pub async fn send_message(&self, thread_id: Id, user_id: Id, draft: MessageDraft) -> ConversationResult<Message> {
        let ctx = self.thread_context(thread_id, user_id).await?;
        if !ctx.perms.write {
            return Err(ConversationError::permission("send_message"));
        }
        let content = validate_content(&draft.content)?;
        validate_extras(&draft.attachments, draft.metadata.as_ref())?;

        let message = self
            .store(self.repo.create_message(NewMessage {
                thread_id,
                author_id: user_id,
                content,
                attachments: draft.attachments,
                metadata: draft.metadata,
            }))
            .await?;
        telemetry::message_sent();
        debug!(thread_id, message_id = message.id, user_id, "message stored");

        if !message.attachments.is_empty() {
            let linked = self
                .bounded(async {
                    self.collab
                        .attachments
                        .link_attachments(message.id, &message.attachments)
                        .await
                        .map_err(|e| ConversationError::Internal(e.to_string()))
                })
                .await;
            if let Err(e) = linked {
                telemetry::side_effect_failed("link_attachments");
                warn!(message_id = message.id, error = %e, "attachment linking failed");
            }
        }
        if let Err(e) = self.store(self.repo.bump_activity(thread_id, message.created_at)).await {
            telemetry::side_effect_failed("bump_activity");
            warn!(thread_id, error = %e, "thread activity bump failed");
        }
        // the author has obviously read their own message
        if let Err(e) = self.store(self.repo.advance_read_marker(thread_id, user_id, &message)).await {
            telemetry::side_effect_failed("advance_read_marker");
            warn!(thread_id, user_id, error = %e, "author read marker not advanced");
        }

        let mut recipients: BTreeSet<Id> = ctx.participants.iter().copied().collect();
        match self.team_manager_ids(ctx.intervention.team_id).await {
            Ok(managers) => recipients.extend(managers),
            Err(e) => warn!(thread_id, error = %e, "team managers unavailable, notifying participants only"),
        }
        recipients.remove(&user_id);
        let preview: String = message.content.as_deref().unwrap_or_default().chars().take(120).collect();
        self.dispatch(
            recipients,
            NotificationKind::NewMessage,
            json!({
                "thread_id": thread_id,
                "intervention_id": ctx.thread.intervention_id,
                "message_id": message.id,
                "author_id": user_id,
                "author_name": ctx.user.display_name,
                "preview": preview,
            }),
        );
        Ok(message)
    }

    /// Soft delete by the author or a manager/admin of the owning team. Idempotent.
    /// Callers who cannot read the thread get `NotFound`, as for an unknown id.
    pub async fn delete_message(&self, message_id: Id, user_id: Id) -> ConversationResult<Message> {
        let user = self.user(user_id).await?;
        let message = self.store(self.repo.get_message(message_id)).await?;
        let thread = self.store(self.repo.get_thread(message.thread_id)).await?;
        let intervention = self.intervention(thread.intervention_id).await?;
        if message.author_id != user.id {
            let participants = self.participant_ids(thread.id).await?;
            if !access::evaluate(&user, &thread, &participants, &intervention).read {
                return Err(ConversationError::not_found(Resource::Message, message_id));
            }
        }
        if !access::can_delete_message(&user, &message, &intervention) {
            return Err(ConversationError::permission("delete_message"));
        }
        let deleted = self.store(self.repo.soft_delete_message(message_id, user_id)).await?;
        info!(message_id, thread_id = thread.id, user_id, "message deleted");
        Ok(deleted)
    }

    // ---------------- participants ------------------------------------------------

    pub async fn add_participant(&self, thread_id: Id, target_id: Id, acting_id: Id) -> ConversationResult<Participant> {
        let ctx = self.thread_context(thread_id, acting_id).await?;
        if !access::can_manage_participants(&ctx.user, &ctx.thread, &ctx.intervention) {
            return Err(ConversationError::permission("add_participant"));
        }
        self.user(target_id).await?;
        let participant = self.store(self.repo.add_participant(thread_id, target_id)).await?;
        if !ctx.participants.contains(&target_id) {
            info!(thread_id, target_id, acting_id, "participant added");
            if target_id != acting_id {
                self.dispatch(
                    BTreeSet::from([target_id]),
                    NotificationKind::ParticipantAdded,
                    json!({ "thread_id": thread_id, "intervention_id": ctx.thread.intervention_id, "added_by": acting_id }),
                );
            }
        }
        Ok(participant)
    }

    /// Refused with `Conflict` when the target is the last participant.
    pub async fn remove_participant(&self, thread_id: Id, target_id: Id, acting_id: Id) -> ConversationResult<()> {
        let ctx = self.thread_context(thread_id, acting_id).await?;
        if !access::can_manage_participants(&ctx.user, &ctx.thread, &ctx.intervention) {
            return Err(ConversationError::permission("remove_participant"));
        }
        let target = self.user(target_id).await?;
        self.store(self.repo.remove_participant(thread_id, target_id)).await?;
        info!(thread_id, target_id, acting_id, "participant removed");

        let mut remaining = ctx.participants;
        remaining.remove(&target_id);
        if !access::evaluate(&target, &ctx.thread, &remaining, &ctx.intervention).read
            && self.gateway.drop_subscriber(thread_id, target_id)
        {
            debug!(thread_id, target_id, "closed live subscription of removed participant");
        }
        if target_id != acting_id {
            self.dispatch(
                BTreeSet::from([target_id]),
                NotificationKind::ParticipantRemoved,
                json!({ "thread_id": thread_id, "intervention_id": ctx.thread.intervention_id, "removed_by": acting_id }),
            );
        }
        Ok(())
    }

    // ---------------- read state --------------------------------------------------

    /// Moves the caller's marker to the thread's latest message; `None` on an empty thread.
    pub async fn mark_thread_as_read(&self, thread_id: Id, user_id: Id) -> ConversationResult<Option<ReadMarker>> {
        self.readable_context(thread_id, user_id, "read_thread").await?;
        self.advance_to_latest(thread_id, user_id).await
    }

    pub async fn unread_count(&self, thread_id: Id, user_id: Id) -> ConversationResult<u64> {
        self.readable_context(thread_id, user_id, "read_thread").await?;
        self.unread_for(thread_id, user_id).await
    }

    /// Sum of unread counts over every thread the caller can read: threads they participate
    /// in, plus every thread of the interventions they are associated with.
    pub async fn total_unread(&self, user_id: Id) -> ConversationResult<u64> {
        let user = self.user(user_id).await?;
        let associated = self
            .bounded(async {
                self.collab.interventions.list_for_user(&user).await.map_err(|e| ConversationError::Internal(e.to_string()))
            })
            .await?;

        let mut threads: HashMap<Id, Thread> = HashMap::new();
        for t in self.store(self.repo.list_threads_for_participant(user_id)).await? {
            threads.insert(t.id, t);
        }
        let mut interventions: HashMap<Id, Intervention> = HashMap::new();
        for iv in associated {
            for t in self.store(self.repo.list_threads_by_intervention(iv.id)).await? {
                threads.insert(t.id, t);
            }
            interventions.insert(iv.id, iv);
        }

        let mut total = 0u64;
        for thread in threads.into_values() {
            let intervention = match interventions.get(&thread.intervention_id) {
                Some(iv) => iv.clone(),
                None => match self.intervention(thread.intervention_id).await {
                    Ok(iv) => {
                        interventions.insert(iv.id, iv.clone());
                        iv
                    }
                    Err(ConversationError::NotFound { .. }) => continue,
                    Err(e) => return Err(e),
                },
            };
            let participants = self.participant_ids(thread.id).await?;
            if access::evaluate(&user, &thread, &participants, &intervention).read {
                total += self.unread_for(thread.id, user_id).await?;
            }
        }
        Ok(total)
    }

    // ---------------- live delivery -----------------------------------------------

    /// Registers `sink` for new messages on the thread, keyed by the caller's id: a second
    /// subscription by the same user replaces the first.
    pub async fn subscribe<S: MessageSink>(&self, thread_id: Id, user_id: Id, sink: S) -> ConversationResult<SubscriptionHandle> {
        self.readable_context(thread_id, user_id, "subscribe").await?;
        Ok(self.gateway.subscribe(thread_id, user_id, sink))
    }

    /// Same as [`Self::subscribe`] but hands back a stream that cancels the subscription
    /// when dropped. At most `subscriber_queue` unread messages are held; past that the
    /// oldest are evicted.
    pub async fn subscribe_stream(&self, thread_id: Id, user_id: Id) -> ConversationResult<LiveMessages> {
        let (sink, queue) = backlog(self.settings.subscriber_queue);
        let handle = self.subscribe(thread_id, user_id, sink).await?;
        let messages = stream::unfold(queue, |mut queue| async move { queue.recv().await.map(|m| (m, queue)) }).boxed();
        Ok(LiveMessages { messages, handle: Some(handle) })
    }
}

fn collab_error(resource: Resource, id: Id) -> impl FnOnce(CollabError) -> ConversationError {
    move |e| match e {
        CollabError::NotFound => ConversationError::not_found(resource, id),
        CollabError::Unavailable(reason) => ConversationError::Internal(reason),
    }
}

/// Live messages of one subscription, newest kept when the reader falls behind. Ends when
/// the subscription is replaced or the gateway shuts down.
pub struct LiveMessages {
    messages: BoxStream<'static, DeliveredMessage>,
    handle: Option<SubscriptionHandle>,
}

impl LiveMessages {
    pub async fn recv(&mut self) -> Option<DeliveredMessage> {
        self.messages.next().await
    }
}

impl Stream for LiveMessages {
    type Item = DeliveredMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.messages.poll_next_unpin(cx)
    }
}

impl Drop for LiveMessages {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
    }
}
