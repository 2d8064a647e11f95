use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::*;

#[derive(Default, Serialize, Deserialize)]
struct State {
    threads: BTreeMap<Id, Thread>,
    participants: HashMap<Id, Vec<Participant>>,          // thread id -> participants
    messages: BTreeMap<Id, Message>,                       // unredacted rows
    read_markers: HashMap<Id, HashMap<Id, ReadMarker>>,   // thread id -> user id -> marker
    attachment_links: HashMap<Id, Vec<String>>,            // message id -> attachment ids
    next_id: Id,
}

impl State {
    fn next_id(&mut self) -> Id {
        self.next_id += 1;
        self.next_id
    }

    fn thread_messages(&self, thread_id: Id) -> impl Iterator<Item = &Message> {
        self.messages.values().filter(move |m| m.thread_id == thread_id)
    }
}

#[derive(Clone)]
pub struct InMemRepo {
    state: Arc<RwLock<State>>,
    snapshot_path: Option<Arc<PathBuf>>,
    persist_lock: Arc<Mutex<()>>, // one snapshot writer at a time
    feed: broadcast::Sender<Message>,
}

impl InMemRepo {
    /// Purely in-memory store; nothing survives the process.
    pub fn new() -> Self {
        Self::from_state(State::default(), None)
    }

    /// Store backed by a JSON snapshot rewritten after every mutation.
    pub fn with_snapshot(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = Self::load_state_from(&path);
        Self::from_state(state, Some(path))
    }

    fn from_state(state: State, snapshot_path: Option<PathBuf>) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(state)),
            snapshot_path: snapshot_path.map(Arc::new),
            persist_lock: Arc::new(Mutex::new(())),
            feed,
        }
    }

    fn load_state_from(path: &Path) -> State {
        match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                Ok(s) => {
                    info!(path = %path.display(), "loaded conversation snapshot");
                    s
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable snapshot, starting empty");
                    State::default()
                }
            },
            Err(e) => {
                info!(path = %path.display(), error = %e, "no snapshot, starting empty");
                State::default()
            }
        }
    }

    fn read(&self) -> RepoResult<RwLockReadGuard<'_, State>> {
        self.state.read().map_err(|_| RepoError::Internal("state lock poisoned".into()))
    }

    fn write(&self) -> RepoResult<RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(|_| RepoError::Internal("state lock poisoned".into()))
    }

    fn persist(&self) {
        let Some(path) = self.snapshot_path.as_ref() else { return };
        // serialized under the writer lock so an older state never lands after a newer one
        let _writer = self.persist_lock.lock().unwrap_or_else(|e| e.into_inner());
        let bytes = match self.read().map(|s| serde_json::to_vec_pretty(&*s)) {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to serialize snapshot");
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to read state for snapshot");
                return;
            }
        };
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let tmp = path.with_extension("json.tmp");
        if let Err(e) = std::fs::write(&tmp, bytes).and_then(|_| std::fs::rename(&tmp, path.as_path())) {
            warn!(path = %path.display(), error = %e, "failed to write snapshot");
        }
    }
}

impl Default for InMemRepo {
    fn default() -> Self { Self::new() }
}

#[async_trait]
impl ThreadRepo for InMemRepo {
    async fn create_thread(&self, new: NewThread) -> RepoResult<Thread> {
        let mut s = self.write()?;
        if s.threads.values().any(|t| t.intervention_id == new.intervention_id && t.thread_type == new.thread_type) {
            return Err(RepoError::Conflict(format!(
                "intervention {} already has a {} thread",
                new.intervention_id, new.thread_type
            )));
        }
        let now = Utc::now();
        let id = s.next_id();
        let thread = Thread {
            id,
            intervention_id: new.intervention_id,
            team_id: new.team_id,
            thread_type: new.thread_type,
            title: new.title,
            created_by: new.created_by,
            created_at: now,
            last_message_at: None,
            message_count: 0,
        };
        let mut members: Vec<Participant> = Vec::with_capacity(new.participants.len() + 1);
        for user_id in std::iter::once(new.created_by).chain(new.participants) {
            if members.iter().all(|p| p.user_id != user_id) {
                members.push(Participant { thread_id: id, user_id, joined_at: now, last_read_message_id: None });
            }
        }
        s.threads.insert(id, thread.clone());
        s.participants.insert(id, members);
        drop(s);                       // release lock before persisting
        self.persist();
        Ok(thread)
    }

    async fn get_thread(&self, id: Id) -> RepoResult<Thread> {
        let s = self.read()?;
        s.threads.get(&id).cloned().ok_or(RepoError::not_found(Resource::Thread, id))
    }

    async fn list_threads_by_intervention(&self, intervention_id: Id) -> RepoResult<Vec<Thread>> {
        let s = self.read()?;
        let mut v: Vec<_> = s.threads.values()
            .filter(|t| t.intervention_id == intervention_id)
            .cloned()
            .collect();
        v.sort_by(|a, b| b.activity_at().cmp(&a.activity_at()));   // latest first
        Ok(v)
    }

    async fn list_threads_for_participant(&self, user_id: Id) -> RepoResult<Vec<Thread>> {
        let s = self.read()?;
        Ok(s.participants
            .iter()
            .filter(|(_, members)| members.iter().any(|p| p.user_id == user_id))
            .filter_map(|(thread_id, _)| s.threads.get(thread_id).cloned())
            .collect())
    }

    async fn bump_activity(&self, thread_id: Id, message_at: DateTime<Utc>) -> RepoResult<()> {
        let mut s = self.write()?;
        let th = s.threads.get_mut(&thread_id).ok_or(RepoError::not_found(Resource::Thread, thread_id))?;
        th.message_count += 1;
        if th.last_message_at.map_or(true, |at| at < message_at) {
            th.last_message_at = Some(message_at);
        }
        drop(s);
        self.persist();
        Ok(())
    }
}

#[async_trait]
impl ParticipantRepo for InMemRepo {
    async fn add_participant(&self, thread_id: Id, user_id: Id) -> RepoResult<Participant> {
        let mut s = self.write()?;
        if !s.threads.contains_key(&thread_id) {
            return Err(RepoError::not_found(Resource::Thread, thread_id));
        }
        let members = s.participants.entry(thread_id).or_default();
        if let Some(existing) = members.iter().find(|p| p.user_id == user_id) {
            return Ok(existing.clone());
        }
        let p = Participant { thread_id, user_id, joined_at: Utc::now(), last_read_message_id: None };
        members.push(p.clone());
        drop(s);
        self.persist();
        Ok(p)
    }

    async fn remove_participant(&self, thread_id: Id, user_id: Id) -> RepoResult<()> {
        let mut s = self.write()?;
        if !s.threads.contains_key(&thread_id) {
            return Err(RepoError::not_found(Resource::Thread, thread_id));
        }
        let members = s.participants.entry(thread_id).or_default();
        let pos = members
            .iter()
            .position(|p| p.user_id == user_id)
            .ok_or(RepoError::not_found(Resource::Participant, user_id))?;
        // check and removal happen under the same write lock
        if members.len() <= 1 {
            return Err(RepoError::Conflict(format!("thread {thread_id} must keep at least one participant")));
        }
        members.remove(pos);
        drop(s);
        self.persist();
        Ok(())
    }

    async fn list_participants(&self, thread_id: Id) -> RepoResult<Vec<Participant>> {
        let s = self.read()?;
        if !s.threads.contains_key(&thread_id) {
            return Err(RepoError::not_found(Resource::Thread, thread_id));
        }
        Ok(s.participants.get(&thread_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl MessageRepo for InMemRepo {
    async fn create_message(&self, new: NewMessage) -> RepoResult<Message> {
        let content = validate_content(&new.content)?;
        let mut s = self.write()?;
        if !s.threads.contains_key(&new.thread_id) {
            return Err(RepoError::not_found(Resource::Thread, new.thread_id));
        }
        let id = s.next_id();
        let msg = Message {
            id,
            thread_id: new.thread_id,
            author_id: new.author_id,
            content: Some(content),
            attachments: new.attachments,
            metadata: new.metadata,
            created_at: Utc::now(),
            deleted_at: None,
            deleted_by: None,
        };
        s.messages.insert(id, msg.clone());
        // published under the write lock so the feed observes insertion order
        let _ = self.feed.send(msg.clone());
        drop(s);
        self.persist();
        Ok(msg)
    }

    async fn get_message(&self, id: Id) -> RepoResult<Message> {
        let s = self.read()?;
        s.messages.get(&id).cloned().map(Message::redacted).ok_or(RepoError::not_found(Resource::Message, id))
    }

    async fn list_messages(&self, thread_id: Id, page: Page) -> RepoResult<Vec<Message>> {
        let s = self.read()?;
        if !s.threads.contains_key(&thread_id) {
            return Err(RepoError::not_found(Resource::Thread, thread_id));
        }
        let mut all: Vec<&Message> = s.thread_messages(thread_id).collect();
        all.sort_by_key(|m| m.position());
        let offset = usize::try_from(page.offset()).unwrap_or(usize::MAX);
        let limit = page.limit as usize;
        let window: Vec<&Message> = match page.direction {
            PageDirection::Oldest => all.into_iter().skip(offset).take(limit).collect(),
            PageDirection::Newest => {
                let end = all.len().saturating_sub(offset);
                let start = end.saturating_sub(limit);
                all[start..end].to_vec()
            }
        };
        Ok(window.into_iter().cloned().map(Message::redacted).collect())
    }

    async fn soft_delete_message(&self, id: Id, deleted_by: Id) -> RepoResult<Message> {
        let mut s = self.write()?;
        let msg = s.messages.get_mut(&id).ok_or(RepoError::not_found(Resource::Message, id))?;
        if msg.deleted_at.is_none() {
            msg.deleted_at = Some(Utc::now());
            msg.deleted_by = Some(deleted_by);
        }
        let out = msg.clone().redacted();
        drop(s);
        self.persist();
        Ok(out)
    }

    async fn count_after(&self, thread_id: Id, after: Option<(DateTime<Utc>, Id)>) -> RepoResult<u64> {
        let s = self.read()?;
        let n = s
            .thread_messages(thread_id)
            .filter(|m| !m.is_deleted())
            .filter(|m| after.map_or(true, |pos| m.position() > pos))
            .count();
        Ok(n as u64)
    }

    async fn latest_message(&self, thread_id: Id) -> RepoResult<Option<Message>> {
        let s = self.read()?;
        Ok(s.thread_messages(thread_id).max_by_key(|m| m.position()).cloned().map(Message::redacted))
    }

    async fn link_attachments(&self, message_id: Id, attachment_ids: &[String]) -> RepoResult<()> {
        let mut s = self.write()?;
        if !s.messages.contains_key(&message_id) {
            return Err(RepoError::not_found(Resource::Message, message_id));
        }
        let links = s.attachment_links.entry(message_id).or_default();
        for a in attachment_ids {
            if !links.contains(a) {
                links.push(a.clone());
            }
        }
        drop(s);
        self.persist();
        Ok(())
    }
}

#[async_trait]
impl ReadStateRepo for InMemRepo {
    async fn get_read_marker(&self, thread_id: Id, user_id: Id) -> RepoResult<Option<ReadMarker>> {
        let s = self.read()?;
        Ok(s.read_markers.get(&thread_id).and_then(|m| m.get(&user_id)).cloned())
    }

    async fn advance_read_marker(&self, thread_id: Id, user_id: Id, message: &Message) -> RepoResult<ReadMarker> {
        let mut s = self.write()?;
        if !s.threads.contains_key(&thread_id) {
            return Err(RepoError::not_found(Resource::Thread, thread_id));
        }
        let candidate = ReadMarker {
            thread_id,
            user_id,
            message_id: message.id,
            message_created_at: message.created_at,
            updated_at: Utc::now(),
        };
        let markers = s.read_markers.entry(thread_id).or_default();
        let stored = match markers.get(&user_id) {
            Some(current) if current.position() > candidate.position() => current.clone(),
            _ => {
                markers.insert(user_id, candidate.clone());
                candidate
            }
        };
        if let Some(p) = s
            .participants
            .get_mut(&thread_id)
            .and_then(|ps| ps.iter_mut().find(|p| p.user_id == user_id))
        {
            p.last_read_message_id = Some(stored.message_id);
        }
        drop(s);
        self.persist();
        Ok(stored)
    }
}

impl ChangeFeed for InMemRepo {
    fn message_feed(&self) -> broadcast::Receiver<Message> {
        self.feed.subscribe()
    }
}
