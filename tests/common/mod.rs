#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use convo::collab::{
    CollabError, DirectorySeed, InMemDirectory, NotificationDispatcher, NotificationKind, StoreAttachmentLinker,
};
use convo::config::ServiceSettings;
use convo::models::{Id, Intervention, Role, UserProfile};
use convo::repo::inmem::InMemRepo;
use convo::{Collaborators, ConversationService};

pub const TEAM_A: Id = 10;
pub const TEAM_B: Id = 20;

pub const TENANT: Id = 1;
pub const PROVIDER: Id = 2;
pub const M1: Id = 3;
pub const M2: Id = 4;
pub const OTHER_MANAGER: Id = 6; // manager of team B
pub const OUTSIDER: Id = 7; // provider not assigned to X
pub const INTERVENTION_X: Id = 100;

pub fn user(id: Id, role: Role, team_id: Option<Id>, name: &str) -> UserProfile {
    UserProfile { id, role, team_id, display_name: name.to_string(), avatar_url: Some(format!("https://cdn.test/{id}.png")) }
}

/// Intervention X of team A: tenant T1, provider P1 assigned, managers M1 and M2.
pub fn directory() -> InMemDirectory {
    InMemDirectory::from_seed(DirectorySeed {
        users: vec![
            user(TENANT, Role::Tenant, None, "Tina Tenant"),
            user(PROVIDER, Role::Provider, None, "Paul Plombier"),
            user(M1, Role::Manager, Some(TEAM_A), "Marie Gestion"),
            user(M2, Role::Manager, Some(TEAM_A), "Marc Gestion"),
            user(OTHER_MANAGER, Role::Manager, Some(TEAM_B), "Other Team"),
            user(OUTSIDER, Role::Provider, None, "Olivier Outsider"),
        ],
        interventions: vec![Intervention {
            id: INTERVENTION_X,
            team_id: TEAM_A,
            tenant_id: Some(TENANT),
            assigned_user_ids: vec![PROVIDER],
        }],
    })
}

pub type Sent = (Vec<Id>, NotificationKind, Value);

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Sent>>,
}

#[async_trait]
impl NotificationDispatcher for RecordingNotifier {
    async fn notify(&self, recipients: &[Id], kind: NotificationKind, payload: Value) -> Result<(), CollabError> {
        self.sent.lock().unwrap().push((recipients.to_vec(), kind, payload));
        Ok(())
    }
}

impl RecordingNotifier {
    pub fn all(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    /// Dispatch is fire-and-forget, so give the spawned tasks a moment.
    pub async fn wait_for(&self, kind: NotificationKind, count: usize) -> Vec<Sent> {
        for _ in 0..100 {
            let of_kind = self.of_kind(kind);
            if of_kind.len() >= count {
                return of_kind;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.of_kind(kind)
    }

    pub fn of_kind(&self, kind: NotificationKind) -> Vec<Sent> {
        self.all().into_iter().filter(|(_, k, _)| *k == kind).collect()
    }
}

pub struct Fixture {
    pub service: ConversationService,
    pub repo: Arc<InMemRepo>,
    pub directory: Arc<InMemDirectory>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn fixture() -> Fixture {
    fixture_with(ServiceSettings::default())
}

/// Must be called from inside a tokio runtime.
pub fn fixture_with(settings: ServiceSettings) -> Fixture {
    let repo = Arc::new(InMemRepo::new());
    let directory = Arc::new(directory());
    let notifier = Arc::new(RecordingNotifier::default());
    let service = ConversationService::new(
        repo.clone(),
        Collaborators {
            users: directory.clone(),
            interventions: directory.clone(),
            notifier: notifier.clone(),
            attachments: Arc::new(StoreAttachmentLinker::new(repo.clone())),
        },
        settings,
    );
    Fixture { service, repo, directory, notifier }
}
