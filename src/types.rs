//! Record types, routing modes and migration strategies.
//!
//! `Record` is the closed set of payloads the coordinator moves between
//! stores. Loosely-typed JSON is parsed into it at the boundary and validated
//! there, so everything downstream can match exhaustively.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Record kinds
// ============================================================================

/// The two persisted record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    List,
    Item,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::List => write!(f, "list"),
            Self::Item => write!(f, "item"),
        }
    }
}

/// Generate a random record identifier (UUID v4).
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ============================================================================
// ListRecord
// ============================================================================

/// A named, ordered collection owned by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRecord {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Free-form type tag (e.g. "tasks", "habits").
    #[serde(default)]
    pub list_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Tombstone flag. Deleted lists stay in both stores for reconciliation.
    #[serde(default)]
    pub deleted: bool,
}

impl ListRecord {
    /// Create a fresh list with a generated id and `created_at == updated_at == now`.
    pub fn new(owner_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id(),
            owner_id: owner_id.into(),
            title: title.into(),
            description: None,
            list_type: String::new(),
            created_at: now,
            updated_at: now,
            deleted: false,
        }
    }

    /// Mark as deleted and bump `updated_at` so the tombstone wins later merges.
    pub fn tombstone(&mut self, at: DateTime<Utc>) {
        self.deleted = true;
        self.updated_at = at.max(self.created_at);
    }
}

// ============================================================================
// ItemRecord
// ============================================================================

/// A unit of work belonging to exactly one list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRecord {
    pub id: String,
    /// Parent list. Never changes after creation.
    pub list_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Ranking score used for ordering within the list.
    #[serde(default)]
    pub rank: f64,
    #[serde(default)]
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Set when tombstoned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ItemRecord {
    pub fn new(list_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            list_id: list_id.into(),
            title: title.into(),
            description: None,
            category: None,
            rank: 0.0,
            completed: false,
            created_at: Utc::now(),
            completed_at: None,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Set the completion flag, keeping `completed_at` in lockstep with it.
    pub fn set_completed(&mut self, completed: bool, at: DateTime<Utc>) {
        self.completed = completed;
        self.completed_at = completed.then(|| at.max(self.created_at));
    }

    pub fn tombstone(&mut self, at: DateTime<Utc>) {
        self.deleted_at = Some(at.max(self.created_at));
    }
}

// ============================================================================
// Versioned
// ============================================================================

/// Common view over both record kinds used by the resolver and deduplicator.
pub trait Versioned {
    const KIND: RecordKind;

    fn id(&self) -> &str;

    /// Timestamp compared under latest-timestamp-wins.
    fn version_timestamp(&self) -> DateTime<Utc>;

    fn is_tombstone(&self) -> bool;
}

impl Versioned for ListRecord {
    const KIND: RecordKind = RecordKind::List;

    fn id(&self) -> &str {
        &self.id
    }

    fn version_timestamp(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn is_tombstone(&self) -> bool {
        self.deleted
    }
}

impl Versioned for ItemRecord {
    const KIND: RecordKind = RecordKind::Item;

    fn id(&self) -> &str {
        &self.id
    }

    /// `deleted_at`, else `completed_at`, else `created_at`.
    fn version_timestamp(&self) -> DateTime<Utc> {
        self.deleted_at
            .or(self.completed_at)
            .unwrap_or(self.created_at)
    }

    fn is_tombstone(&self) -> bool {
        self.is_deleted()
    }
}

// ============================================================================
// Record (tagged union)
// ============================================================================

/// A list or an item, as accepted at the coordinator boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    List(ListRecord),
    Item(ItemRecord),
}

impl Record {
    /// Parse a loosely-typed payload (`{"kind": "list", ...}`) and validate it.
    pub fn from_json(value: Value) -> Result<Self, ValidationIssue> {
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let kind = match value.get("kind").and_then(Value::as_str) {
            Some("item") => RecordKind::Item,
            _ => RecordKind::List,
        };
        let record: Record = serde_json::from_value(value).map_err(|e| ValidationIssue {
            kind,
            id: id.clone(),
            reason: ValidationReason::Malformed(e.to_string()),
        })?;
        record.validate()?;
        Ok(record)
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            Self::List(_) => RecordKind::List,
            Self::Item(_) => RecordKind::Item,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::List(l) => &l.id,
            Self::Item(i) => &i.id,
        }
    }

    /// Structural validation that needs no other records.
    pub fn validate(&self) -> Result<(), ValidationIssue> {
        match self {
            Self::List(l) => validate_list(l),
            Self::Item(i) => validate_item(i),
        }
    }
}

impl From<ListRecord> for Record {
    fn from(list: ListRecord) -> Self {
        Self::List(list)
    }
}

impl From<ItemRecord> for Record {
    fn from(item: ItemRecord) -> Self {
        Self::Item(item)
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Why a record was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum ValidationReason {
    EmptyId,
    EmptyTitle,
    /// `updated_at` precedes `created_at`.
    TimestampOrder,
    /// `completed_at` present without the completion flag, or vice versa.
    CompletionMismatch,
    /// Item references a list that is not known.
    DanglingList(String),
    Malformed(String),
}

impl fmt::Display for ValidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyId => write!(f, "identifier is empty"),
            Self::EmptyTitle => write!(f, "title is empty"),
            Self::TimestampOrder => write!(f, "updatedAt is earlier than createdAt"),
            Self::CompletionMismatch => {
                write!(f, "completedAt must be set exactly when the item is completed")
            }
            Self::DanglingList(list_id) => write!(f, "parent list {list_id} does not exist"),
            Self::Malformed(msg) => write!(f, "malformed record: {msg}"),
        }
    }
}

/// A single rejected record. Collected, never thrown, by batch callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub kind: RecordKind,
    pub id: String,
    pub reason: ValidationReason,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id.is_empty() {
            write!(f, "{}: {}", self.kind, self.reason)
        } else {
            write!(f, "{} {}: {}", self.kind, self.id, self.reason)
        }
    }
}

pub(crate) fn validate_list(list: &ListRecord) -> Result<(), ValidationIssue> {
    let issue = |reason| ValidationIssue {
        kind: RecordKind::List,
        id: list.id.clone(),
        reason,
    };
    if list.id.trim().is_empty() {
        return Err(issue(ValidationReason::EmptyId));
    }
    if list.title.trim().is_empty() {
        return Err(issue(ValidationReason::EmptyTitle));
    }
    if list.updated_at < list.created_at {
        return Err(issue(ValidationReason::TimestampOrder));
    }
    Ok(())
}

pub(crate) fn validate_item(item: &ItemRecord) -> Result<(), ValidationIssue> {
    let issue = |reason| ValidationIssue {
        kind: RecordKind::Item,
        id: item.id.clone(),
        reason,
    };
    if item.id.trim().is_empty() {
        return Err(issue(ValidationReason::EmptyId));
    }
    if item.title.trim().is_empty() {
        return Err(issue(ValidationReason::EmptyTitle));
    }
    if item.list_id.trim().is_empty() {
        return Err(issue(ValidationReason::DanglingList(String::new())));
    }
    if item.completed != item.completed_at.is_some() {
        return Err(issue(ValidationReason::CompletionMismatch));
    }
    Ok(())
}

// ============================================================================
// Persistence mode & migration strategy
// ============================================================================

/// Routing policy selecting which store(s) serve reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistenceMode {
    LocalOnly,
    CloudWithLocalBackup,
    Hybrid,
}

impl PersistenceMode {
    pub fn uses_cloud(self) -> bool {
        !matches!(self, Self::LocalOnly)
    }
}

impl fmt::Display for PersistenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalOnly => write!(f, "local_only"),
            Self::CloudWithLocalBackup => write!(f, "cloud_with_local_backup"),
            Self::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// Policy for moving a dataset when a guest session becomes authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MigrationStrategy {
    MigrateAllToCloud,
    /// Migration needed but not yet authorized. Never acted on automatically.
    #[default]
    AskUser,
    /// Discard local data in favor of the cloud copy.
    CloudOnly,
    /// Per-record conflict resolution across both stores.
    IntelligentMerge,
}

impl fmt::Display for MigrationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MigrateAllToCloud => write!(f, "migrate_all_to_cloud"),
            Self::AskUser => write!(f, "ask_user"),
            Self::CloudOnly => write!(f, "cloud_only"),
            Self::IntelligentMerge => write!(f, "intelligent_merge"),
        }
    }
}

/// Last successful reconciliation point between the two stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncCursor {
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl SyncCursor {
    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            last_sync_at: Some(at),
        }
    }

    /// Whether a store watermark is newer than this cursor.
    pub fn is_behind(&self, watermark: Option<DateTime<Utc>>) -> bool {
        match (self.last_sync_at, watermark) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(cursor), Some(mark)) => mark > cursor,
        }
    }
}

/// Full set of live lists and items, as served to callers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub lists: Vec<ListRecord>,
    pub items: Vec<ItemRecord>,
}
