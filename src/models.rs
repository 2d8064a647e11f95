use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value; // free-form message metadata
use utoipa::ToSchema;

pub type Id = i64;

/// Upper bound on trimmed message content, in characters.
pub const MAX_CONTENT_CHARS: usize = 5000;
pub const MAX_TITLE_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Tenant,
    Provider,
    Manager,
    Admin,
}

impl Role {
    pub fn is_manager(self) -> bool {
        matches!(self, Role::Manager | Role::Admin)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ThreadType {
    Group,
    TenantToManagers,
    ProviderToManagers,
}

impl ThreadType {
    pub const ALL: [ThreadType; 3] = [
        ThreadType::Group,
        ThreadType::TenantToManagers,
        ThreadType::ProviderToManagers,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ThreadType::Group => "group",
            ThreadType::TenantToManagers => "tenant_to_managers",
            ThreadType::ProviderToManagers => "provider_to_managers",
        }
    }

    pub fn default_title(self) -> &'static str {
        match self {
            ThreadType::Group => "Discussion générale",
            ThreadType::TenantToManagers => "Locataire ↔ Gestionnaires",
            ThreadType::ProviderToManagers => "Prestataire ↔ Gestionnaires",
        }
    }
}

impl fmt::Display for ThreadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThreadType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ThreadType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown thread type '{s}'"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct Thread {
    pub id: Id,
    pub intervention_id: Id,
    pub team_id: Id,
    pub thread_type: ThreadType,
    pub title: String,
    pub created_by: Id,
    pub created_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub message_count: i64, // denormalized, tombstones included
}

impl Thread {
    /// Sort key for "most recently active first" listings.
    pub fn activity_at(&self) -> DateTime<Utc> {
        self.last_message_at.unwrap_or(self.created_at)
    }
}

/// Insert payload for the thread store. `participants` is seeded atomically with the thread
/// and always contains the creator.
#[derive(Debug, Clone)]
pub struct NewThread {
    pub intervention_id: Id,
    pub team_id: Id,
    pub thread_type: ThreadType,
    pub title: String,
    pub created_by: Id,
    pub participants: Vec<Id>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct Participant {
    pub thread_id: Id,
    pub user_id: Id,
    pub joined_at: DateTime<Utc>,
    pub last_read_message_id: Option<Id>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct Message {
    pub id: Id,
    pub thread_id: Id,
    pub author_id: Id,
    /// `None` once the message has been soft-deleted.
    pub content: Option<String>,
    pub attachments: Vec<String>,
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>, // soft delete marker
    pub deleted_by: Option<Id>,
}

impl Message {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Strips the payload of a soft-deleted message, keeping its identity and position.
    pub fn redacted(mut self) -> Self {
        if self.is_deleted() {
            self.content = None;
            self.attachments.clear();
            self.metadata = None;
        }
        self
    }

    pub fn position(&self) -> (DateTime<Utc>, Id) {
        (self.created_at, self.id)
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub thread_id: Id,
    pub author_id: Id,
    pub content: String,
    pub attachments: Vec<String>,
    pub metadata: Option<Value>,
}

/// What a caller submits when posting to a thread.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct MessageDraft {
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<Value>,
}

impl MessageDraft {
    pub fn text(content: impl Into<String>) -> Self {
        Self { content: content.into(), ..Self::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ReadMarker {
    pub thread_id: Id,
    pub user_id: Id,
    pub message_id: Id,
    pub message_created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReadMarker {
    pub fn position(&self) -> (DateTime<Utc>, Id) {
        (self.message_created_at, self.message_id)
    }
}

/// Which end of the thread page 0 starts from. Rows inside a page are always oldest first.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PageDirection {
    #[default]
    Newest,
    Oldest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub limit: u32,
    pub direction: PageDirection,
}

impl Page {
    pub fn offset(&self) -> u64 {
        u64::from(self.page) * u64::from(self.limit)
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ThreadSummary {
    #[serde(flatten)]
    pub thread: Thread,
    pub unread_count: u64,
}

// ----- external collaborator shapes -------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct UserProfile {
    pub id: Id,
    pub role: Role,
    pub team_id: Option<Id>,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct Intervention {
    pub id: Id,
    pub team_id: Id,
    pub tenant_id: Option<Id>,
    #[serde(default)]
    pub assigned_user_ids: Vec<Id>,
}

/// Author identity attached to a live message, resolved when the message is delivered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct AuthorInfo {
    pub id: Id,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct DeliveredMessage {
    #[serde(flatten)]
    pub message: Message,
    pub author: AuthorInfo,
}

// ----- validation --------------------------------------------------------------

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

/// Trims message content and enforces the non-empty / length bounds.
pub fn validate_content(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError { field: "content", reason: "must not be empty".into() });
    }
    let chars = trimmed.chars().count();
    if chars > MAX_CONTENT_CHARS {
        return Err(ValidationError {
            field: "content",
            reason: format!("{chars} characters exceeds the {MAX_CONTENT_CHARS} limit"),
        });
    }
    Ok(trimmed.to_string())
}

/// Falls back to the per-type default title when none (or only whitespace) is given.
pub fn resolve_title(raw: Option<&str>, thread_type: ThreadType) -> Result<String, ValidationError> {
    let trimmed = raw.map(str::trim).unwrap_or_default();
    if trimmed.is_empty() {
        return Ok(thread_type.default_title().to_string());
    }
    if trimmed.chars().count() > MAX_TITLE_CHARS {
        return Err(ValidationError { field: "title", reason: format!("longer than {MAX_TITLE_CHARS} characters") });
    }
    Ok(trimmed.to_string())
}

/// Attachment ids must be non-blank; metadata, when present, must be a JSON object.
pub fn validate_extras(attachments: &[String], metadata: Option<&Value>) -> Result<(), ValidationError> {
    if attachments.iter().any(|a| a.trim().is_empty()) {
        return Err(ValidationError { field: "attachments", reason: "blank attachment id".into() });
    }
    if metadata.is_some_and(|m| !m.is_object()) {
        return Err(ValidationError { field: "metadata", reason: "must be a JSON object".into() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_is_trimmed_and_bounded() {
        assert_eq!(validate_content("  bonjour \n").unwrap(), "bonjour");
        assert!(validate_content("   \t ").is_err());
        let at_limit = "é".repeat(MAX_CONTENT_CHARS);
        assert!(validate_content(&at_limit).is_ok());
        let over = format!("{at_limit}x");
        let err = validate_content(&over).unwrap_err();
        assert_eq!(err.field, "content");
    }

    #[test]
    fn titles_default_per_type() {
        assert_eq!(resolve_title(None, ThreadType::Group).unwrap(), "Discussion générale");
        assert_eq!(resolve_title(Some("  "), ThreadType::TenantToManagers).unwrap(), "Locataire ↔ Gestionnaires");
        assert_eq!(resolve_title(Some(" Fuite "), ThreadType::Group).unwrap(), "Fuite");
        assert!(resolve_title(Some(&"x".repeat(MAX_TITLE_CHARS + 1)), ThreadType::Group).is_err());
    }

    #[test]
    fn extras_reject_blank_ids_and_scalar_metadata() {
        assert!(validate_extras(&["a1".into()], Some(&serde_json::json!({"k": 1}))).is_ok());
        assert_eq!(validate_extras(&[" ".into()], None).unwrap_err().field, "attachments");
        assert_eq!(validate_extras(&[], Some(&serde_json::json!(3))).unwrap_err().field, "metadata");
    }

    #[test]
    fn thread_type_parses_its_wire_name() {
        for t in ThreadType::ALL {
            assert_eq!(t.as_str().parse::<ThreadType>().unwrap(), t);
        }
        assert!("managers_only".parse::<ThreadType>().is_err());
    }
}
