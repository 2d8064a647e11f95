//! Narrow interfaces to the systems this service depends on but does not own: user
//! profiles, interventions, outbound notifications and attachment storage.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::models::{Id, Intervention, UserProfile};
use crate::repo::MessageRepo;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CollabError {
    #[error("not found")]
    NotFound,
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user(&self, id: Id) -> Result<UserProfile, CollabError>;
    /// Managers and admins belonging to `team_id`.
    async fn list_team_managers(&self, team_id: Id) -> Result<Vec<UserProfile>, CollabError>;
}

#[async_trait]
pub trait InterventionDirectory: Send + Sync {
    async fn get_intervention(&self, id: Id) -> Result<Intervention, CollabError>;
    /// Interventions where the user is tenant, assignee, or a manager of the owning team.
    async fn list_for_user(&self, user: &UserProfile) -> Result<Vec<Intervention>, CollabError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ThreadCreated,
    NewMessage,
    ParticipantAdded,
    ParticipantRemoved,
}

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn notify(&self, recipients: &[Id], kind: NotificationKind, payload: Value) -> Result<(), CollabError>;
}

#[async_trait]
pub trait AttachmentLinker: Send + Sync {
    async fn link_attachments(&self, message_id: Id, attachment_ids: &[String]) -> Result<(), CollabError>;
}

// ---------------- in-memory directory ------------------------------------------

#[derive(Default, Serialize, Deserialize)]
pub struct DirectorySeed {
    #[serde(default)]
    pub users: Vec<UserProfile>,
    #[serde(default)]
    pub interventions: Vec<Intervention>,
}

#[derive(Default)]
struct DirectoryState {
    users: HashMap<Id, UserProfile>,
    interventions: HashMap<Id, Intervention>,
}

/// Directory held in process memory. Used by tests and single-node deployments that load
/// their users and interventions from a JSON seed file.
#[derive(Clone, Default)]
pub struct InMemDirectory {
    state: Arc<RwLock<DirectoryState>>,
}

impl InMemDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: DirectorySeed) -> Self {
        let dir = Self::new();
        for u in seed.users {
            dir.upsert_user(u);
        }
        for i in seed.interventions {
            dir.upsert_intervention(i);
        }
        dir
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)?;
        let seed: DirectorySeed = serde_json::from_slice(&bytes)?;
        info!(path = %path.display(), users = seed.users.len(), interventions = seed.interventions.len(), "loaded directory seed");
        Ok(Self::from_seed(seed))
    }

    pub fn upsert_user(&self, user: UserProfile) {
        if let Ok(mut s) = self.state.write() {
            s.users.insert(user.id, user);
        }
    }

    pub fn upsert_intervention(&self, intervention: Intervention) {
        if let Ok(mut s) = self.state.write() {
            s.interventions.insert(intervention.id, intervention);
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&DirectoryState) -> T) -> Result<T, CollabError> {
        let s = self.state.read().map_err(|_| CollabError::Unavailable("directory lock poisoned".into()))?;
        Ok(f(&s))
    }
}

#[async_trait]
impl UserDirectory for InMemDirectory {
    async fn get_user(&self, id: Id) -> Result<UserProfile, CollabError> {
        self.with_state(|s| s.users.get(&id).cloned())?.ok_or(CollabError::NotFound)
    }

    async fn list_team_managers(&self, team_id: Id) -> Result<Vec<UserProfile>, CollabError> {
        self.with_state(|s| {
            let mut v: Vec<_> = s.users.values()
                .filter(|u| u.role.is_manager() && u.team_id == Some(team_id))
                .cloned()
                .collect();
            v.sort_by_key(|u| u.id);
            v
        })
    }
}

#[async_trait]
impl InterventionDirectory for InMemDirectory {
    async fn get_intervention(&self, id: Id) -> Result<Intervention, CollabError> {
        self.with_state(|s| s.interventions.get(&id).cloned())?.ok_or(CollabError::NotFound)
    }

    async fn list_for_user(&self, user: &UserProfile) -> Result<Vec<Intervention>, CollabError> {
        self.with_state(|s| {
            let mut v: Vec<_> = s.interventions.values()
                .filter(|i| crate::access::is_associated(user, i))
                .cloned()
                .collect();
            v.sort_by_key(|i| i.id);
            v
        })
    }
}

// ---------------- notification dispatchers ---------------------------------------

/// Fallback dispatcher when no delivery backend is configured: records to the log only.
#[derive(Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationDispatcher for LogNotifier {
    async fn notify(&self, recipients: &[Id], kind: NotificationKind, payload: Value) -> Result<(), CollabError> {
        info!(?kind, ?recipients, %payload, "notification");
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    recipients: &'a [Id],
    kind: NotificationKind,
    payload: Value,
}

/// Posts every notification as JSON to an external delivery service.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client, url: url.into() }
    }
}

#[async_trait]
impl NotificationDispatcher for WebhookNotifier {
    async fn notify(&self, recipients: &[Id], kind: NotificationKind, payload: Value) -> Result<(), CollabError> {
        let resp = self.client
            .post(&self.url)
            .json(&WebhookBody { recipients, kind, payload })
            .send()
            .await
            .map_err(|e| CollabError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CollabError::Unavailable(format!("webhook answered {}", resp.status())));
        }
        Ok(())
    }
}

// ---------------- attachment linking ---------------------------------------------

/// Records attachment links next to the messages in the conversation store.
pub struct StoreAttachmentLinker<R: ?Sized> {
    repo: Arc<R>,
}

impl<R: ?Sized> StoreAttachmentLinker<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl<R> AttachmentLinker for StoreAttachmentLinker<R>
where
    R: MessageRepo + ?Sized,
{
    async fn link_attachments(&self, message_id: Id, attachment_ids: &[String]) -> Result<(), CollabError> {
        self.repo
            .link_attachments(message_id, attachment_ids)
            .await
            .map_err(|e| CollabError::Unavailable(e.to_string()))
    }
}
