//! Pure mappers from raw feed records to canonical domain drafts.
//!
//! Every mapper takes one loosely-typed JSON record and either produces a
//! fully-typed draft plus any nested relationship/link intents, or fails for
//! that single record. Nothing here touches the network or the store.

use chrono::{DateTime, NaiveDate, Utc};
use polirank_core::{
    BillDraft, BillRole, BillRoleDraft, BillStatus, CommitteeDraft, CommitteeMembershipDraft,
    GovernmentRoleDraft, LegislatorDraft, MembershipDraft, PartyDraft, SourceLink, Topic,
    VoteEventDraft, VoteRecordDraft, VotePosition,
};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "polirank-adapters";

#[derive(Debug, Error)]
pub enum MapError {
    #[error("record is missing required field {field}")]
    MissingField { field: &'static str },
    #[error("field {field} carries an unusable value: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Walk a flat list of alternate field names, returning the first non-empty
/// string value.
fn str_field<'a>(value: &'a JsonValue, names: &[&str]) -> Option<&'a str> {
    for name in names {
        if let Some(s) = value.get(*name).and_then(JsonValue::as_str) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed);
            }
        }
    }
    None
}

/// Like `str_field` but coerces bare JSON numbers, for feeds that send ids as
/// integers in one version and strings in the next.
fn string_field(value: &JsonValue, names: &[&str]) -> Option<String> {
    for name in names {
        match value.get(*name) {
            Some(JsonValue::String(s)) if !s.trim().is_empty() => {
                return Some(s.trim().to_string())
            }
            Some(JsonValue::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

fn i64_field(value: &JsonValue, names: &[&str]) -> Option<i64> {
    for name in names {
        match value.get(*name) {
            Some(JsonValue::Number(n)) => return n.as_i64(),
            Some(JsonValue::String(s)) => {
                if let Ok(parsed) = s.trim().parse::<i64>() {
                    return Some(parsed);
                }
            }
            _ => {}
        }
    }
    None
}

fn bool_field(value: &JsonValue, names: &[&str]) -> Option<bool> {
    for name in names {
        match value.get(*name) {
            Some(JsonValue::Bool(b)) => return Some(*b),
            Some(JsonValue::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => return Some(true),
                "false" | "0" | "no" => return Some(false),
                _ => {}
            },
            Some(JsonValue::Number(n)) => {
                if let Some(v) = n.as_i64() {
                    return Some(v != 0);
                }
            }
            _ => {}
        }
    }
    None
}

fn date_field(value: &JsonValue, names: &[&str]) -> Option<NaiveDate> {
    str_field(value, names).and_then(parse_feed_date)
}

fn datetime_field(value: &JsonValue, names: &[&str]) -> Option<DateTime<Utc>> {
    str_field(value, names).and_then(parse_feed_datetime)
}

/// Entity references appear as bare scalars in some feed versions and as
/// nested objects in others.
fn ref_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Object(_) => string_field(value, &["id", "person_id", "member_id", "code"]),
        _ => None,
    }
}

fn ref_field(value: &JsonValue, names: &[&str]) -> Option<String> {
    for name in names {
        if let Some(found) = value.get(*name).and_then(ref_string) {
            return Some(found);
        }
    }
    None
}

fn ref_list(value: &JsonValue, names: &[&str]) -> Vec<String> {
    for name in names {
        match value.get(*name) {
            Some(JsonValue::Array(items)) => {
                return items.iter().filter_map(ref_string).collect();
            }
            Some(other) => {
                if let Some(single) = ref_string(other) {
                    return vec![single];
                }
            }
            None => {}
        }
    }
    Vec::new()
}

/// Accepts RFC 3339 timestamps, plain ISO dates, and the `DD.MM.YYYY` form
/// older feed versions still emit. Unparsable input is `None`, never an error.
pub fn parse_feed_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.naive_utc().date());
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(date);
    }
    NaiveDate::parse_from_str(trimmed, "%d.%m.%Y").ok()
}

pub fn parse_feed_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    parse_feed_date(trimmed).and_then(|date| date.and_hms_opt(0, 0, 0).map(|ndt| ndt.and_utc()))
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// Status-code table used by the feed; codes outside it fall back to text
/// matching, and everything else collapses to `Unknown`.
pub fn bill_status(code: Option<i64>, text: Option<&str>) -> BillStatus {
    if let Some(code) = code {
        match code {
            1 => return BillStatus::Submitted,
            2 => return BillStatus::FirstReading,
            3 => return BillStatus::CommitteeReview,
            4 => return BillStatus::SecondReading,
            5 => return BillStatus::ThirdReading,
            6 => return BillStatus::Passed,
            7 => return BillStatus::Rejected,
            8 => return BillStatus::Withdrawn,
            _ => {}
        }
    }
    match text {
        Some(text) => status_from_text(text),
        None => BillStatus::Unknown,
    }
}

fn status_from_text(text: &str) -> BillStatus {
    let lower = text.to_lowercase();
    // Terminal outcomes first so "rejected at third reading" lands on the
    // outcome, not the stage.
    if contains_any(&lower, &["passed", "adopted", "enacted"]) {
        BillStatus::Passed
    } else if contains_any(&lower, &["rejected", "defeated"]) {
        BillStatus::Rejected
    } else if contains_any(&lower, &["withdrawn", "recalled"]) {
        BillStatus::Withdrawn
    } else if contains_any(&lower, &["third reading", "third_reading"]) {
        BillStatus::ThirdReading
    } else if contains_any(&lower, &["second reading", "second_reading"]) {
        BillStatus::SecondReading
    } else if contains_any(&lower, &["committee"]) {
        BillStatus::CommitteeReview
    } else if contains_any(&lower, &["first reading", "first_reading"]) {
        BillStatus::FirstReading
    } else if contains_any(&lower, &["submitted", "registered", "introduced"]) {
        BillStatus::Submitted
    } else {
        BillStatus::Unknown
    }
}

const TOPIC_KEYWORDS: &[(Topic, &[&str])] = &[
    (
        Topic::Housing,
        &["housing", "tenant", "rent", "mortgage", "apartment", "homeless", "zoning"],
    ),
    (
        Topic::Economy,
        &["tax", "budget", "economy", "economic", "inflation", "wage", "employment", "trade", "pension"],
    ),
    (
        Topic::Education,
        &["school", "education", "student", "university", "kindergarten", "curriculum", "teacher"],
    ),
    (
        Topic::Health,
        &["health", "hospital", "medic", "patient", "pharma", "vaccin"],
    ),
    (
        Topic::Environment,
        &["climate", "environment", "emission", "pollution", "renewable", "forest", "wildlife", "waste"],
    ),
    (
        Topic::Security,
        &["defense", "defence", "police", "security", "military", "border", "terror"],
    ),
    (
        Topic::Justice,
        &["court", "justice", "judicial", "penal", "criminal", "prosecut", "prison"],
    ),
    (
        Topic::Agriculture,
        &["farm", "agricultur", "livestock", "crop", "fishery", "rural"],
    ),
    (
        Topic::Infrastructure,
        &["road", "rail", "transport", "infrastructure", "broadband", "bridge", "grid"],
    ),
];

/// Keyword scan over title + summary. Empty text yields `None` (nothing to
/// classify); text with no keyword hit yields `Other`.
pub fn infer_topic(title: &str, summary: Option<&str>) -> Option<Topic> {
    let combined = match summary {
        Some(summary) => format!("{title} {summary}"),
        None => title.to_string(),
    };
    let text = combined.trim().to_lowercase();
    if text.is_empty() {
        return None;
    }
    for (topic, keywords) in TOPIC_KEYWORDS {
        if contains_any(&text, keywords) {
            return Some(*topic);
        }
    }
    Some(Topic::Other)
}

/// Human-facing URLs found on the raw record, deduplicated by URL.
fn source_links(raw: &JsonValue, external_id: &str) -> Vec<SourceLink> {
    let mut links: Vec<SourceLink> = Vec::new();
    let mut push = |label: &str, url: Option<&str>| {
        if let Some(url) = url {
            if links.iter().any(|l| l.url == url) {
                return;
            }
            links.push(SourceLink {
                label: label.to_string(),
                url: url.to_string(),
                external_id: Some(external_id.to_string()),
            });
        }
    };
    push("profile", str_field(raw, &["profile_url", "source_url", "page_url", "permalink"]));
    push("website", str_field(raw, &["url", "website", "homepage", "link"]));
    push("document", str_field(raw, &["document_url", "text_url", "pdf_url"]));
    links
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappedParty {
    pub party: PartyDraft,
    pub links: Vec<SourceLink>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappedLegislator {
    pub legislator: LegislatorDraft,
    pub membership: Option<MembershipDraft>,
    pub links: Vec<SourceLink>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappedBill {
    pub bill: BillDraft,
    pub roles: Vec<BillRoleDraft>,
    pub links: Vec<SourceLink>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappedCommittee {
    pub committee: CommitteeDraft,
    pub members: Vec<CommitteeMembershipDraft>,
    pub links: Vec<SourceLink>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappedGovernmentRole {
    pub role: GovernmentRoleDraft,
    pub links: Vec<SourceLink>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappedVoteEvent {
    pub vote: VoteEventDraft,
    pub links: Vec<SourceLink>,
}

pub fn map_party(raw: &JsonValue) -> Result<MappedParty, MapError> {
    let external_id = string_field(raw, &["id", "party_id", "uuid", "code"])
        .ok_or(MapError::MissingField { field: "id" })?;
    let name = string_field(raw, &["name", "full_name", "title", "name_en"])
        .ok_or(MapError::MissingField { field: "name" })?;
    let short_name = string_field(raw, &["short_name", "abbreviation", "abbr", "acronym"]);
    let is_active = bool_field(raw, &["is_active", "active"])
        .unwrap_or_else(|| date_field(raw, &["dissolved_on", "dissolution_date"]).is_none());

    let links = source_links(raw, &external_id);
    Ok(MappedParty {
        party: PartyDraft {
            external_id,
            name,
            short_name,
            is_active,
        },
        links,
    })
}

pub fn map_legislator(raw: &JsonValue) -> Result<MappedLegislator, MapError> {
    let external_id = string_field(raw, &["id", "person_id", "member_id"])
        .ok_or(MapError::MissingField { field: "id" })?;
    let given_name = string_field(raw, &["given_name", "first_name", "forename"]);
    let family_name = string_field(raw, &["family_name", "last_name", "surname"]);
    let full_name = string_field(raw, &["full_name", "name", "display_name"]).or_else(|| {
        match (&given_name, &family_name) {
            (Some(given), Some(family)) => Some(format!("{given} {family}")),
            (Some(given), None) => Some(given.clone()),
            (None, Some(family)) => Some(family.clone()),
            (None, None) => None,
        }
    });
    let full_name = full_name.ok_or(MapError::MissingField { field: "name" })?;
    let is_active = bool_field(raw, &["is_active", "active", "in_office"]).unwrap_or(true);

    let membership = ref_field(raw, &["party_id", "party", "faction_id", "faction"]).map(|party| {
        let started_on = date_field(raw, &["membership_started_on", "party_since", "faction_since"]);
        let ended_on = date_field(raw, &["membership_ended_on", "party_until", "faction_until"]);
        MembershipDraft {
            legislator_external_id: external_id.clone(),
            party_external_id: party,
            started_on,
            ended_on,
            is_current: ended_on.is_none() && is_active,
        }
    });

    let links = source_links(raw, &external_id);
    Ok(MappedLegislator {
        legislator: LegislatorDraft {
            external_id,
            full_name,
            given_name,
            family_name,
            is_active,
        },
        membership,
        links,
    })
}

pub fn map_bill(raw: &JsonValue) -> Result<MappedBill, MapError> {
    let external_id = string_field(raw, &["id", "bill_id", "document_id", "doc_id"])
        .ok_or(MapError::MissingField { field: "id" })?;
    let title = string_field(raw, &["title", "name", "short_title"])
        .ok_or(MapError::MissingField { field: "title" })?;
    let summary = string_field(raw, &["summary", "description", "abstract", "annotation"]);
    let number = string_field(raw, &["number", "bill_number", "registration_number"]);

    let status_code = i64_field(raw, &["status_code", "status", "stage"]);
    let status_text = str_field(raw, &["status_text", "status_name", "stage_name", "status"]);
    let status = bill_status(status_code, status_text);

    let topic = infer_topic(&title, summary.as_deref());
    let submitted_on = date_field(
        raw,
        &["submitted_on", "introduced_on", "registration_date", "date_submitted", "submitted"],
    );

    let mut roles: Vec<BillRoleDraft> = Vec::new();
    let mut push_roles = |ids: Vec<String>, role: BillRole| {
        for legislator in ids {
            let draft = BillRoleDraft {
                bill_external_id: external_id.clone(),
                legislator_external_id: legislator,
                role,
            };
            if !roles.contains(&draft) {
                roles.push(draft);
            }
        }
    };
    push_roles(
        ref_list(raw, &["initiators", "initiator", "sponsors", "sponsor", "authors", "author"]),
        BillRole::Initiator,
    );
    push_roles(
        ref_list(raw, &["cosponsors", "co_sponsors", "cosigners", "co_authors"]),
        BillRole::Cosponsor,
    );
    push_roles(ref_list(raw, &["rapporteurs", "rapporteur"]), BillRole::Rapporteur);

    let links = source_links(raw, &external_id);
    Ok(MappedBill {
        bill: BillDraft {
            external_id,
            title,
            summary,
            number,
            status,
            topic,
            submitted_on,
        },
        roles,
        links,
    })
}

pub fn map_committee(raw: &JsonValue) -> Result<MappedCommittee, MapError> {
    let external_id = string_field(raw, &["id", "committee_id", "code"])
        .ok_or(MapError::MissingField { field: "id" })?;
    let name = string_field(raw, &["name", "title"])
        .ok_or(MapError::MissingField { field: "name" })?;
    let is_active = bool_field(raw, &["is_active", "active"]).unwrap_or(true);

    let mut members = Vec::new();
    if let Some(entries) = raw
        .get("members")
        .or_else(|| raw.get("membership"))
        .and_then(JsonValue::as_array)
    {
        for entry in entries {
            let Some(legislator) = ref_string(entry).or_else(|| {
                ref_field(entry, &["person_id", "member_id", "person", "legislator_id"])
            }) else {
                continue;
            };
            members.push(CommitteeMembershipDraft {
                committee_external_id: external_id.clone(),
                legislator_external_id: legislator,
                role: string_field(entry, &["role", "position", "function"]),
                is_current: bool_field(entry, &["is_current", "current", "active"]).unwrap_or(true),
            });
        }
    }

    let links = source_links(raw, &external_id);
    Ok(MappedCommittee {
        committee: CommitteeDraft {
            external_id,
            name,
            is_active,
        },
        members,
        links,
    })
}

pub fn map_government_role(raw: &JsonValue) -> Result<MappedGovernmentRole, MapError> {
    let external_id = string_field(raw, &["id", "role_id", "position_id"])
        .ok_or(MapError::MissingField { field: "id" })?;
    let title = string_field(raw, &["title", "name", "position"])
        .ok_or(MapError::MissingField { field: "title" })?;
    let holder_external_id = ref_field(raw, &["holder", "person", "person_id", "member_id", "minister"]);
    let started_on = date_field(raw, &["started_on", "start_date", "since"]);
    let ended_on = date_field(raw, &["ended_on", "end_date", "until"]);
    let is_current =
        bool_field(raw, &["is_current", "current", "active"]).unwrap_or(ended_on.is_none());

    let links = source_links(raw, &external_id);
    Ok(MappedGovernmentRole {
        role: GovernmentRoleDraft {
            external_id,
            title,
            holder_external_id,
            started_on,
            ended_on,
            is_current,
        },
        links,
    })
}

pub fn map_vote_event(raw: &JsonValue) -> Result<MappedVoteEvent, MapError> {
    let external_id = string_field(raw, &["id", "vote_id", "voting_id"])
        .ok_or(MapError::MissingField { field: "id" })?;
    let title = string_field(raw, &["title", "name", "subject"])
        .ok_or(MapError::MissingField { field: "title" })?;
    let held_at = datetime_field(raw, &["held_at", "date", "voted_at", "vote_date", "timestamp"]);
    let bill_external_id = ref_field(raw, &["bill_id", "bill", "document_id", "doc_id"]);

    let links = source_links(raw, &external_id);
    Ok(MappedVoteEvent {
        vote: VoteEventDraft {
            external_id,
            title,
            held_at,
            bill_external_id,
        },
        links,
    })
}

pub fn map_vote_record(raw: &JsonValue) -> Result<VoteRecordDraft, MapError> {
    let vote_external_id = ref_field(raw, &["vote_id", "voting_id", "vote"])
        .ok_or(MapError::MissingField { field: "vote_id" })?;
    let legislator_external_id =
        ref_field(raw, &["person_id", "member_id", "legislator_id", "person", "voter"])
            .ok_or(MapError::MissingField { field: "person_id" })?;

    Ok(VoteRecordDraft {
        vote_external_id,
        legislator_external_id,
        position: vote_position(raw),
    })
}

fn vote_position(raw: &JsonValue) -> VotePosition {
    if let Some(code) = i64_field(raw, &["position_code", "vote_code", "result_code"]) {
        match code {
            1 => return VotePosition::For,
            2 => return VotePosition::Against,
            3 => return VotePosition::Abstain,
            4 => return VotePosition::Absent,
            _ => {}
        }
    }
    if let Some(text) = str_field(raw, &["position", "vote", "result", "decision"]) {
        return match text.to_lowercase().as_str() {
            "for" | "yes" | "aye" | "in favor" | "in favour" => VotePosition::For,
            "against" | "no" | "nay" => VotePosition::Against,
            "abstain" | "abstained" | "abstention" => VotePosition::Abstain,
            "absent" | "did not vote" | "not present" => VotePosition::Absent,
            _ => VotePosition::Unknown,
        };
    }
    VotePosition::Unknown
}
