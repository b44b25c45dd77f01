//! Core domain model for the parliament open-data ranker.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "polirank-core";

/// Entity families the sync pipeline knows how to ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Parties,
    Legislators,
    Bills,
    Committees,
    GovernmentRoles,
    Votes,
    VoteRecords,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Parties => "parties",
            EntityKind::Legislators => "legislators",
            EntityKind::Bills => "bills",
            EntityKind::Committees => "committees",
            EntityKind::GovernmentRoles => "government_roles",
            EntityKind::Votes => "votes",
            EntityKind::VoteRecords => "vote_records",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed legislative-stage set; feed codes outside the table collapse to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillStatus {
    Submitted,
    FirstReading,
    CommitteeReview,
    SecondReading,
    ThirdReading,
    Passed,
    Rejected,
    Withdrawn,
    Unknown,
}

impl BillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillStatus::Submitted => "submitted",
            BillStatus::FirstReading => "first_reading",
            BillStatus::CommitteeReview => "committee_review",
            BillStatus::SecondReading => "second_reading",
            BillStatus::ThirdReading => "third_reading",
            BillStatus::Passed => "passed",
            BillStatus::Rejected => "rejected",
            BillStatus::Withdrawn => "withdrawn",
            BillStatus::Unknown => "unknown",
        }
    }

    pub fn from_slug(slug: &str) -> Self {
        match slug {
            "submitted" => BillStatus::Submitted,
            "first_reading" => BillStatus::FirstReading,
            "committee_review" => BillStatus::CommitteeReview,
            "second_reading" => BillStatus::SecondReading,
            "third_reading" => BillStatus::ThirdReading,
            "passed" => BillStatus::Passed,
            "rejected" => BillStatus::Rejected,
            "withdrawn" => BillStatus::Withdrawn,
            _ => BillStatus::Unknown,
        }
    }
}

impl std::fmt::Display for BillStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregation topics. `Other` is a real bucket (keyword scan ran, nothing
/// matched), distinct from a bill with no classifiable text at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Housing,
    Economy,
    Education,
    Health,
    Environment,
    Security,
    Justice,
    Agriculture,
    Infrastructure,
    Other,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Housing => "housing",
            Topic::Economy => "economy",
            Topic::Education => "education",
            Topic::Health => "health",
            Topic::Environment => "environment",
            Topic::Security => "security",
            Topic::Justice => "justice",
            Topic::Agriculture => "agriculture",
            Topic::Infrastructure => "infrastructure",
            Topic::Other => "other",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug {
            "housing" => Some(Topic::Housing),
            "economy" => Some(Topic::Economy),
            "education" => Some(Topic::Education),
            "health" => Some(Topic::Health),
            "environment" => Some(Topic::Environment),
            "security" => Some(Topic::Security),
            "justice" => Some(Topic::Justice),
            "agriculture" => Some(Topic::Agriculture),
            "infrastructure" => Some(Topic::Infrastructure),
            "other" => Some(Topic::Other),
            _ => None,
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a legislator relates to a bill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillRole {
    Initiator,
    Cosponsor,
    Rapporteur,
    Unknown,
}

impl BillRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillRole::Initiator => "initiator",
            BillRole::Cosponsor => "cosponsor",
            BillRole::Rapporteur => "rapporteur",
            BillRole::Unknown => "unknown",
        }
    }

    pub fn from_slug(slug: &str) -> Self {
        match slug {
            "initiator" => BillRole::Initiator,
            "cosponsor" => BillRole::Cosponsor,
            "rapporteur" => BillRole::Rapporteur,
            _ => BillRole::Unknown,
        }
    }
}

/// One legislator's position in one vote event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotePosition {
    For,
    Against,
    Abstain,
    Absent,
    Unknown,
}

impl VotePosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            VotePosition::For => "for",
            VotePosition::Against => "against",
            VotePosition::Abstain => "abstain",
            VotePosition::Absent => "absent",
            VotePosition::Unknown => "unknown",
        }
    }

    pub fn from_slug(slug: &str) -> Self {
        match slug {
            "for" => VotePosition::For,
            "against" => VotePosition::Against,
            "abstain" => VotePosition::Abstain,
            "absent" => VotePosition::Absent,
            _ => VotePosition::Unknown,
        }
    }
}

/// Lifecycle of a sync run. A process kill leaves `Running` behind; consumers
/// must treat such records as stale rather than in-progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

/// Per-entity ingestion tallies for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounters {
    pub fetched: u64,
    pub created: u64,
    pub updated: u64,
    pub failed: u64,
}

/// Audit record for one ingestion attempt: created at start, mutated by the
/// orchestrator only, immutable once finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub counters: BTreeMap<EntityKind, EntityCounters>,
    pub errors: Vec<String>,
}

impl SyncRun {
    pub fn begin() -> Self {
        Self {
            id: Uuid::new_v4(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            counters: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn counters_mut(&mut self, kind: EntityKind) -> &mut EntityCounters {
        self.counters.entry(kind).or_default()
    }

    pub fn push_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn finalize(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

/// A labelled upstream URL attached to an entity; facts without at least one
/// of these are excluded from user-facing evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLink {
    pub label: String,
    pub url: String,
    pub external_id: Option<String>,
}

/// Mapper handoff for a political party.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartyDraft {
    pub external_id: String,
    pub name: String,
    pub short_name: Option<String>,
    pub is_active: bool,
}

/// Mapper handoff for a legislator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegislatorDraft {
    pub external_id: String,
    pub full_name: String,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub is_active: bool,
}

/// Mapper handoff for a bill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillDraft {
    pub external_id: String,
    pub title: String,
    pub summary: Option<String>,
    pub number: Option<String>,
    pub status: BillStatus,
    pub topic: Option<Topic>,
    pub submitted_on: Option<NaiveDate>,
}

/// Mapper handoff for a committee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitteeDraft {
    pub external_id: String,
    pub name: String,
    pub is_active: bool,
}

/// Mapper handoff for a government role (ministerial post and similar).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernmentRoleDraft {
    pub external_id: String,
    pub title: String,
    pub holder_external_id: Option<String>,
    pub started_on: Option<NaiveDate>,
    pub ended_on: Option<NaiveDate>,
    pub is_current: bool,
}

/// Mapper handoff for a plenary vote event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteEventDraft {
    pub external_id: String,
    pub title: String,
    pub held_at: Option<DateTime<Utc>>,
    pub bill_external_id: Option<String>,
}

/// Legislator ↔ party affiliation with an explicit validity interval.
/// `is_current` is set at upsert time, never derived from the dates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipDraft {
    pub legislator_external_id: String,
    pub party_external_id: String,
    pub started_on: Option<NaiveDate>,
    pub ended_on: Option<NaiveDate>,
    pub is_current: bool,
}

/// Legislator ↔ bill sponsorship edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillRoleDraft {
    pub bill_external_id: String,
    pub legislator_external_id: String,
    pub role: BillRole,
}

/// Legislator ↔ committee seat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeMembershipDraft {
    pub committee_external_id: String,
    pub legislator_external_id: String,
    pub role: Option<String>,
    pub is_current: bool,
}

/// Legislator ↔ vote-event ballot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecordDraft {
    pub vote_external_id: String,
    pub legislator_external_id: String,
    pub position: VotePosition,
}

/// Stored party row as read back for scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartyRef {
    pub id: Uuid,
    pub external_id: String,
    pub name: String,
    pub short_name: Option<String>,
    pub is_active: bool,
}

/// One bill × sponsor-role × current-party edge consumed by the aggregation
/// engine. Only bills carrying a topic produce facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityFact {
    pub party_id: Uuid,
    pub bill_id: Uuid,
    pub topic: Topic,
    pub status: BillStatus,
    pub role: BillRole,
}

/// Precomputed (party, topic) activity score; a derived cache, fully replaced
/// by each aggregation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub party_id: Uuid,
    pub topic: Topic,
    pub raw_score: f64,
    pub bill_count: i64,
    pub computed_at: DateTime<Utc>,
}

/// Evidence candidate read back for highlight selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceBill {
    pub bill_id: Uuid,
    pub external_id: String,
    pub title: String,
    pub status: BillStatus,
    pub topic: Option<Topic>,
    pub source_links: Vec<SourceLink>,
}
