use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// BeadId
// ---------------------------------------------------------------------------

/// Identifier of an externally-stored work item, shaped `<prefix>-<suffix>`.
///
/// The prefix decides which rig's store owns the bead; resolution against
/// the registered prefixes happens in [`crate::routes::Routes`]. The
/// accessor here is purely lexical.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BeadId(String);

impl BeadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Everything before the final dash segment, e.g. `hq-cv-abc12` -> `hq-cv`.
    ///
    /// Returns the whole id when there is no dash at all.
    pub fn lexical_prefix(&self) -> &str {
        match self.0.rfind('-') {
            Some(idx) => &self.0[..idx],
            None => &self.0,
        }
    }

    /// `true` when the id looks like a CLI flag rather than a bead id.
    pub fn is_flag_like(&self) -> bool {
        self.0.starts_with('-')
    }
}

impl fmt::Display for BeadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for BeadId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BeadId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// BeadType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeadType {
    Epic,
    Task,
    Bug,
    Feature,
    Chore,
    Convoy,
    Decision,
    Message,
    SlingContext,
    Other(String),
}

impl BeadType {
    pub fn parse(s: &str) -> Self {
        match s {
            "epic" => BeadType::Epic,
            "task" => BeadType::Task,
            "bug" => BeadType::Bug,
            "feature" => BeadType::Feature,
            "chore" => BeadType::Chore,
            "convoy" => BeadType::Convoy,
            "decision" => BeadType::Decision,
            "message" => BeadType::Message,
            "sling-context" => BeadType::SlingContext,
            other => BeadType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            BeadType::Epic => "epic",
            BeadType::Task => "task",
            BeadType::Bug => "bug",
            BeadType::Feature => "feature",
            BeadType::Chore => "chore",
            BeadType::Convoy => "convoy",
            BeadType::Decision => "decision",
            BeadType::Message => "message",
            BeadType::SlingContext => "sling-context",
            BeadType::Other(s) => s.as_str(),
        }
    }

    /// Dispatchable onto a polecat. Legacy beads with no recorded type count
    /// as slingable.
    pub fn is_slingable(&self) -> bool {
        matches!(
            self,
            BeadType::Task | BeadType::Bug | BeadType::Feature | BeadType::Chore
        ) || matches!(self, BeadType::Other(s) if s.is_empty())
    }

    /// Participates in wave ordering but never occupies a wave slot.
    pub fn is_gate(&self) -> bool {
        matches!(self, BeadType::Epic | BeadType::Decision)
    }
}

// ---------------------------------------------------------------------------
// BeadStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeadStatus {
    Open,
    Hooked,
    Pinned,
    Deferred,
    Closed,
    Tombstone,
    StagedReady,
    StagedWarnings,
    Other(String),
}

impl BeadStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "open" => BeadStatus::Open,
            "hooked" => BeadStatus::Hooked,
            "pinned" => BeadStatus::Pinned,
            "deferred" => BeadStatus::Deferred,
            "closed" => BeadStatus::Closed,
            "tombstone" => BeadStatus::Tombstone,
            "staged_ready" => BeadStatus::StagedReady,
            "staged_warnings" => BeadStatus::StagedWarnings,
            other => BeadStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            BeadStatus::Open => "open",
            BeadStatus::Hooked => "hooked",
            BeadStatus::Pinned => "pinned",
            BeadStatus::Deferred => "deferred",
            BeadStatus::Closed => "closed",
            BeadStatus::Tombstone => "tombstone",
            BeadStatus::StagedReady => "staged_ready",
            BeadStatus::StagedWarnings => "staged_warnings",
            BeadStatus::Other(s) => s.as_str(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BeadStatus::Closed | BeadStatus::Tombstone)
    }

    /// Only staged convoys may be launched; `open` and `closed` are not
    /// launchable.
    pub fn is_launchable(&self) -> bool {
        matches!(self, BeadStatus::StagedReady | BeadStatus::StagedWarnings)
    }
}

// ---------------------------------------------------------------------------
// Dependency edges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeType {
    Blocks,
    ConditionalBlocks,
    WaitsFor,
    ParentChild,
    Tracks,
    Other(String),
}

/// How the dispatch core treats an edge type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeClass {
    /// Induces wave ordering.
    Execution,
    /// Parent/child structure only; never orders execution.
    Hierarchy,
    /// Convoy membership.
    Membership,
    Ignored,
}

impl EdgeType {
    pub fn parse(s: &str) -> Self {
        match s {
            "blocks" => EdgeType::Blocks,
            "conditional-blocks" => EdgeType::ConditionalBlocks,
            "waits-for" => EdgeType::WaitsFor,
            "parent-child" => EdgeType::ParentChild,
            "tracks" => EdgeType::Tracks,
            other => EdgeType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EdgeType::Blocks => "blocks",
            EdgeType::ConditionalBlocks => "conditional-blocks",
            EdgeType::WaitsFor => "waits-for",
            EdgeType::ParentChild => "parent-child",
            EdgeType::Tracks => "tracks",
            EdgeType::Other(s) => s.as_str(),
        }
    }

    pub fn class(&self) -> EdgeClass {
        match self {
            EdgeType::Blocks | EdgeType::ConditionalBlocks | EdgeType::WaitsFor => {
                EdgeClass::Execution
            }
            EdgeType::ParentChild => EdgeClass::Hierarchy,
            EdgeType::Tracks => EdgeClass::Membership,
            EdgeType::Other(_) => EdgeClass::Ignored,
        }
    }
}

/// A typed dependency edge `from -> to` as stored by the tracker.
///
/// For execution edges the semantics are "`from` is blocked by `to`".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepEdge {
    pub from: BeadId,
    pub to: BeadId,
    pub edge_type: EdgeType,
}

// ---------------------------------------------------------------------------
// Bead
// ---------------------------------------------------------------------------

/// A work item as read from the issue store, annotated with its resolved
/// rig (empty when the id prefix is unregistered).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bead {
    pub id: BeadId,
    pub title: String,
    pub bead_type: BeadType,
    pub status: BeadStatus,
    #[serde(default)]
    pub assignee: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub description: String,
    /// Resolved owning rig; empty when the prefix is unknown.
    #[serde(default)]
    pub rig: String,
}

impl Bead {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

// ---------------------------------------------------------------------------
// Wave
// ---------------------------------------------------------------------------

/// A maximal antichain of slingable beads dispatchable in parallel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wave {
    /// 1-based wave number.
    pub number: usize,
    /// Member bead ids, ascending.
    pub tasks: Vec<BeadId>,
}

// ---------------------------------------------------------------------------
// Findings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// A validation finding. Errors block convoy creation; warnings stage the
/// convoy as `staged_warnings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub category: String,
    pub bead_ids: Vec<BeadId>,
    pub message: String,
    #[serde(default)]
    pub suggested_fix: String,
}

impl Finding {
    /// Stable ordering: first bead id, ties broken by category.
    pub fn sort_key(&self) -> (String, String) {
        let first = self
            .bead_ids
            .first()
            .map(|b| b.as_str().to_string())
            .unwrap_or_default();
        (first, self.category.clone())
    }
}

// ---------------------------------------------------------------------------
// Stage result envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Error,
    StagedReady,
    StagedWarnings,
}

/// Result of a staging run, emitted verbatim in `--json` mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub convoy_id: Option<BeadId>,
    #[serde(default)]
    pub restaged: bool,
    pub errors: Vec<Finding>,
    pub warnings: Vec<Finding>,
    pub waves: Vec<Wave>,
}

// ---------------------------------------------------------------------------
// Sling options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Direct,
    Mr,
    Local,
}

impl MergeStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(MergeStrategy::Direct),
            "mr" => Some(MergeStrategy::Mr),
            "local" => Some(MergeStrategy::Local),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MergeStrategy::Direct => "direct",
            MergeStrategy::Mr => "mr",
            MergeStrategy::Local => "local",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlingMode {
    #[default]
    Normal,
    Ralph,
}

impl SlingMode {
    pub fn as_str(&self) -> &str {
        match self {
            SlingMode::Normal => "",
            SlingMode::Ralph => "ralph",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "ralph" => SlingMode::Ralph,
            _ => SlingMode::Normal,
        }
    }
}

// ---------------------------------------------------------------------------
// SlingContext
// ---------------------------------------------------------------------------

/// Persistent record of a pending (deferred) sling. Stored as a bead of type
/// `sling-context` in the town store so it survives restarts.
///
/// Invariant: at most one open context per work bead at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlingContext {
    pub version: u32,
    pub work_bead: BeadId,
    pub target_rig: String,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub formula: Option<String>,
    #[serde(default)]
    pub args: Option<String>,
    #[serde(default)]
    pub vars: Vec<(String, String)>,
    #[serde(default)]
    pub merge: Option<MergeStrategy>,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub agent_override: Option<String>,
    #[serde(default)]
    pub no_merge: bool,
    #[serde(default)]
    pub hook_raw: bool,
    #[serde(default)]
    pub mode: SlingMode,
    #[serde(default)]
    pub owned: bool,
    #[serde(default)]
    pub convoy: Option<BeadId>,
}

impl SlingContext {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(work_bead: BeadId, target_rig: impl Into<String>) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            work_bead,
            target_rig: target_rig.into(),
            enqueued_at: Utc::now(),
            formula: None,
            args: None,
            vars: Vec::new(),
            merge: None,
            base_branch: None,
            account: None,
            agent_override: None,
            no_merge: false,
            hook_raw: false,
            mode: SlingMode::Normal,
            owned: false,
            convoy: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Attachment fields
// ---------------------------------------------------------------------------

/// Structured sub-record embedded in a hooked bead's description. Written by
/// the sling executor, read back by the polecat and by reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentFields {
    #[serde(default)]
    pub dispatcher: String,
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub molecule: String,
    #[serde(default)]
    pub no_merge: bool,
    #[serde(default)]
    pub mode: SlingMode,
}

// ---------------------------------------------------------------------------
// Rig availability
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RigAvailability {
    Active,
    Parked,
    Docked,
}

impl RigAvailability {
    /// Parked and docked rigs refuse new work unless forced.
    pub fn is_blocked(&self) -> bool {
        !matches!(self, RigAvailability::Active)
    }

    pub fn as_str(&self) -> &str {
        match self {
            RigAvailability::Active => "active",
            RigAvailability::Parked => "parked",
            RigAvailability::Docked => "docked",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
