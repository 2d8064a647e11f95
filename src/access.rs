//! Authorization decisions for conversation threads.
//!
//! Everything here is a pure function of its arguments: no I/O, no caching. The
//! orchestrator loads the user, thread, participants and intervention, then asks.

use std::collections::HashSet;

use serde::Serialize;

use crate::models::{Id, Intervention, Message, Role, Thread, ThreadType, UserProfile};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub administer: bool,
}

impl Permissions {
    pub const NONE: Permissions = Permissions { read: false, write: false, administer: false };
    pub const FULL: Permissions = Permissions { read: true, write: true, administer: true };

    pub fn any(&self) -> bool {
        self.read || self.write || self.administer
    }
}

/// Manager or admin of the team that owns the intervention.
pub fn is_team_manager(user: &UserProfile, intervention: &Intervention) -> bool {
    user.role.is_manager() && user.team_id == Some(intervention.team_id)
}

fn is_intervention_tenant(user: &UserProfile, intervention: &Intervention) -> bool {
    user.role == Role::Tenant && intervention.tenant_id == Some(user.id)
}

/// Tenant, assigned user, or team manager of the intervention.
pub fn is_associated(user: &UserProfile, intervention: &Intervention) -> bool {
    is_team_manager(user, intervention)
        || is_intervention_tenant(user, intervention)
        || intervention.assigned_user_ids.contains(&user.id)
}

/// Evaluates the thread access table, first matching rule wins:
///
/// 1. team manager/admin: full access to every thread of the intervention;
/// 2. the intervention's tenant on `tenant_to_managers`: read + write;
/// 3. `provider_to_managers`: read follows participation, write only for
///    providers/managers/admins who can read;
/// 4. explicit participant: read + write;
/// 5. nothing.
pub fn evaluate(
    user: &UserProfile,
    thread: &Thread,
    participants: &HashSet<Id>,
    intervention: &Intervention,
) -> Permissions {
    if thread.intervention_id != intervention.id {
        return Permissions::NONE;
    }
    if is_team_manager(user, intervention) {
        return Permissions::FULL;
    }
    let participant = participants.contains(&user.id);
    match thread.thread_type {
        ThreadType::TenantToManagers if is_intervention_tenant(user, intervention) => {
            Permissions { read: true, write: true, administer: false }
        }
        ThreadType::ProviderToManagers => Permissions {
            read: participant,
            write: participant && matches!(user.role, Role::Provider | Role::Manager | Role::Admin),
            administer: false,
        },
        _ if participant => Permissions { read: true, write: true, administer: false },
        _ => Permissions::NONE,
    }
}

pub fn can_create_thread(user: &UserProfile, intervention: &Intervention, thread_type: ThreadType) -> bool {
    match thread_type {
        ThreadType::Group => is_associated(user, intervention),
        ThreadType::TenantToManagers => {
            is_intervention_tenant(user, intervention) || is_team_manager(user, intervention)
        }
        ThreadType::ProviderToManagers => is_team_manager(user, intervention),
    }
}

/// Adding or removing participants: team managers and the thread's creator.
pub fn can_manage_participants(user: &UserProfile, thread: &Thread, intervention: &Intervention) -> bool {
    thread.intervention_id == intervention.id
        && (is_team_manager(user, intervention) || thread.created_by == user.id)
}

/// Soft deletion: the author, or a manager/admin of the owning team.
pub fn can_delete_message(user: &UserProfile, message: &Message, intervention: &Intervention) -> bool {
    message.author_id == user.id || is_team_manager(user, intervention)
}
