//! Memory Type Definitions
//!
//! Defines the core records of the conversational memory: turns, summaries,
//! index entries and per-conversation state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::MemoryError;

/// Monotonic turn identifier (global across conversations)
pub type TurnId = i64;

/// Summary identifier
pub type SummaryId = i64;

/// Speaker of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Convert to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(MemoryError::validation(format!("unrecognized role: {other}"))),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Conversation key: one persona talking to one user
///
/// Renders as `"{avatar}:{user_id}"`, the id used by every store operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey(String);

impl ConversationKey {
    pub fn new(avatar: &str, user_id: &str) -> Self {
        Self(format!("{}:{}", avatar.trim(), user_id.trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ConversationKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<ConversationKey> for String {
    fn from(key: ConversationKey) -> Self {
        key.0
    }
}

/// Reference to an image or file sent alongside a turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Attachment kind (e.g. "image", "file", "emoji")
    pub kind: String,
    /// Opaque locator (path or URL) owned by the transport layer
    pub reference: String,
    /// Optional caption or recognized description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Attachment {
    pub fn image(reference: impl Into<String>) -> Self {
        Self {
            kind: "image".into(),
            reference: reference.into(),
            description: None,
        }
    }
}

/// Input for appending a turn
#[derive(Debug, Clone)]
pub struct NewTurn {
    pub conversation_id: String,
    pub role: Role,
    pub text: String,
    pub attachment: Option<Attachment>,
}

impl NewTurn {
    pub fn new(conversation_id: impl Into<String>, role: Role, text: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            role,
            text: text.into(),
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }
}

/// A persisted conversational turn (immutable)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub conversation_id: String,
    pub role: Role,
    pub text: String,
    pub attachment: Option<Attachment>,
    pub token_count: usize,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    /// Line used in transcripts and assembled context
    pub fn render(&self) -> String {
        match &self.attachment {
            Some(attachment) => format!(
                "{}: {} [{}: {}]",
                self.role,
                self.text,
                attachment.kind,
                attachment.description.as_deref().unwrap_or(&attachment.reference)
            ),
            None => format!("{}: {}", self.role, self.text),
        }
    }
}

/// A condensed record replacing a contiguous range of turns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub id: SummaryId,
    pub conversation_id: String,
    /// First covered turn (inclusive)
    pub start_turn_id: TurnId,
    /// Last covered turn (inclusive)
    pub end_turn_id: TurnId,
    pub turn_count: usize,
    pub text: String,
    pub token_count: usize,
    pub created_at: DateTime<Utc>,
}

impl Summary {
    pub fn covers(&self, turn_id: TurnId) -> bool {
        (self.start_turn_id..=self.end_turn_id).contains(&turn_id)
    }
}

/// Kind of an indexed unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Turn,
    Summary,
}

impl SourceKind {
    /// Convert from string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "turn" => Some(Self::Turn),
            "summary" => Some(Self::Summary),
            _ => None,
        }
    }

    /// Convert to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Turn => "turn",
            Self::Summary => "summary",
        }
    }
}

/// Identity of an indexed source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceRef {
    pub kind: SourceKind,
    pub id: i64,
}

impl SourceRef {
    pub fn turn(id: TurnId) -> Self {
        Self {
            kind: SourceKind::Turn,
            id,
        }
    }

    pub fn summary(id: SummaryId) -> Self {
        Self {
            kind: SourceKind::Summary,
            id,
        }
    }
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.kind.as_str(), self.id)
    }
}

/// One embedded unit in the memory index
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub source: SourceRef,
    pub conversation_id: String,
    pub vector: Vec<f32>,
    /// L2 norm of `vector`, precomputed for search
    pub norm: f32,
    /// Embedding model that produced the vector
    pub model: String,
    pub content_hash: String,
    /// Tie-break key: turn id, or the last covered turn id for summaries
    pub recency: i64,
    pub created_at: DateTime<Utc>,
}

/// Text waiting to be embedded
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSource {
    pub source: SourceRef,
    pub conversation_id: String,
    pub text: String,
    pub recency: i64,
}

impl IndexSource {
    pub fn from_turn(turn: &Turn) -> Self {
        Self {
            source: SourceRef::turn(turn.id),
            conversation_id: turn.conversation_id.clone(),
            text: match turn.attachment.as_ref().and_then(|a| a.description.as_deref()) {
                Some(description) => format!("{} {}", turn.text, description),
                None => turn.text.clone(),
            },
            recency: turn.id,
        }
    }

    pub fn from_summary(summary: &Summary) -> Self {
        Self {
            source: SourceRef::summary(summary.id),
            conversation_id: summary.conversation_id.clone(),
            text: summary.text.clone(),
            recency: summary.end_turn_id,
        }
    }
}

/// Per-conversation bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub conversation_id: String,
    /// Last turn folded into a summary; turns after it form the active window
    pub summarized_through: Option<TurnId>,
    /// Ordered ids of unsummarized turns
    pub active_turn_window: Vec<TurnId>,
    /// Estimated tokens of the active window
    pub active_tokens: usize,
    pub last_compression_at: Option<DateTime<Utc>>,
    pub halted: bool,
    pub halt_reason: Option<String>,
}

/// The oldest contiguous run of active turns selected for compression
#[derive(Debug, Clone, PartialEq)]
pub struct TurnBlock {
    pub conversation_id: String,
    pub turns: Vec<Turn>,
}

impl TurnBlock {
    pub fn start_id(&self) -> Option<TurnId> {
        self.turns.first().map(|t| t.id)
    }

    pub fn end_id(&self) -> Option<TurnId> {
        self.turns.last().map(|t| t.id)
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// Outcome of a summary commit
#[derive(Debug, Clone, PartialEq)]
pub enum SummaryCommit {
    /// A new summary replaced the block
    Committed {
        summary: Summary,
        /// Index entries removed with the covered turns
        removed: Vec<SourceRef>,
    },
    /// The block was already covered; nothing changed
    AlreadySummarized,
    /// Another commit covered the start of the block after it was selected
    Stale,
}

/// Rolling profile of the user in one conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreMemory {
    pub conversation_id: String,
    pub text: String,
    /// Last turn considered by the latest regeneration
    pub updated_through: TurnId,
    pub updated_at: DateTime<Utc>,
}

/// Counts removed by a conversation deletion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedConversation {
    pub turns: usize,
    pub summaries: usize,
    pub index_entries: usize,
}

/// Memory statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub conversations: usize,
    pub turns: usize,
    pub active_turns: usize,
    pub summaries: usize,
    pub index_entries: usize,
    pub core_memories: usize,
    pub halted_conversations: usize,
    pub pending_index_jobs: usize,
}

/// Result of checking a conversation's structural invariants
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantReport {
    pub conversation_id: String,
    pub total_turns: usize,
    pub active_turns: usize,
    pub summaries: usize,
    /// Turns at or before `summarized_through` that no summary covers
    pub uncovered_turns: Vec<TurnId>,
    /// Turns covered by more than one summary
    pub overlapping_turns: Vec<TurnId>,
    /// Active turns that a summary also covers
    pub summarized_active_turns: Vec<TurnId>,
    /// Index rows whose source no longer exists or was summarized
    pub orphan_index_entries: Vec<SourceRef>,
    pub halted: bool,
    pub halt_reason: Option<String>,
}

impl InvariantReport {
    /// True when coverage is exact and the index holds no orphans
    pub fn is_clean(&self) -> bool {
        self.uncovered_turns.is_empty()
            && self.overlapping_turns.is_empty()
            && self.summarized_active_turns.is_empty()
            && self.orphan_index_entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parsing() {
        assert_eq!("user".parse::<Role>().unwrap(), Role::User);
        assert_eq!(" Assistant ".parse::<Role>().unwrap(), Role::Assistant);
        let err = "narrator".parse::<Role>().unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_conversation_key() {
        let key = ConversationKey::new("MONO", "wxid_abc");
        assert_eq!(key.as_str(), "MONO:wxid_abc");
        assert_eq!(key.to_string(), "MONO:wxid_abc");
        let id: String = key.into();
        assert_eq!(id, "MONO:wxid_abc");
    }

    #[test]
    fn test_source_kind_roundtrip() {
        for kind in [SourceKind::Turn, SourceKind::Summary] {
            assert_eq!(SourceKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(SourceKind::parse("image"), None);
        assert_eq!(SourceRef::summary(4).to_string(), "summary#4");
    }

    #[test]
    fn test_turn_render_with_attachment() {
        let turn = Turn {
            id: 1,
            conversation_id: "a:b".into(),
            role: Role::User,
            text: "看看这个".into(),
            attachment: Some(Attachment {
                kind: "image".into(),
                reference: "/tmp/cat.png".into(),
                description: Some("a sleeping cat".into()),
            }),
            token_count: 4,
            created_at: Utc::now(),
        };
        assert_eq!(turn.render(), "user: 看看这个 [image: a sleeping cat]");
    }

    #[test]
    fn test_report_cleanliness() {
        let mut report = InvariantReport::default();
        assert!(report.is_clean());
        report.orphan_index_entries.push(SourceRef::turn(3));
        assert!(!report.is_clean());
    }

    #[test]
    fn test_summary_covers() {
        let summary = Summary {
            id: 1,
            conversation_id: "a:b".into(),
            start_turn_id: 3,
            end_turn_id: 7,
            turn_count: 5,
            text: "s".into(),
            token_count: 1,
            created_at: Utc::now(),
        };
        assert!(summary.covers(3));
        assert!(summary.covers(7));
        assert!(!summary.covers(8));
    }
}
