//! Party activity scoring: folds stored sponsorship facts into per-topic
//! aggregates and ranks parties against a user's weighted topic preferences.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use polirank_core::{ActivityFact, AggregateRow, BillRole, BillStatus, EvidenceBill, PartyRef, Topic};
use polirank_store::Store;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "polirank-rank";

/// How far a bill travelled through the legislature, as points.
pub fn status_points(status: BillStatus) -> f64 {
    match status {
        BillStatus::Passed => 5.0,
        BillStatus::SecondReading | BillStatus::ThirdReading => 3.0,
        BillStatus::CommitteeReview | BillStatus::FirstReading => 2.0,
        BillStatus::Submitted => 1.0,
        BillStatus::Rejected | BillStatus::Withdrawn | BillStatus::Unknown => 0.0,
    }
}

/// How much a sponsorship role counts towards a party's activity.
pub fn role_weight(role: BillRole) -> f64 {
    match role {
        BillRole::Initiator => 1.0,
        BillRole::Cosponsor => 0.5,
        BillRole::Rapporteur | BillRole::Unknown => 0.0,
    }
}

/// Static map from user-facing concern slugs to aggregation topics. A slug
/// naming an aggregation topic directly also resolves, to itself.
const USER_TOPIC_MAP: &[(&str, &[Topic])] = &[
    ("housing_prices", &[Topic::Housing]),
    ("cost_of_living", &[Topic::Economy]),
    ("jobs_and_wages", &[Topic::Economy]),
    ("schools", &[Topic::Education]),
    ("healthcare", &[Topic::Health]),
    ("climate", &[Topic::Environment]),
    ("public_safety", &[Topic::Security, Topic::Justice]),
    ("rule_of_law", &[Topic::Justice]),
    ("farming", &[Topic::Agriculture]),
    ("roads_and_transit", &[Topic::Infrastructure]),
];

pub fn expand_user_topic(slug: &str) -> Option<Vec<Topic>> {
    let normalized = slug.trim().to_ascii_lowercase();
    for (name, topics) in USER_TOPIC_MAP {
        if *name == normalized {
            return Some(topics.to_vec());
        }
    }
    Topic::from_slug(&normalized).map(|t| vec![t])
}

/// Min-max scale scores to [0, 1]. All-zero input stays zero; an all-equal
/// non-zero input maps to 1 for everyone.
pub fn min_max_normalize(scores: &[f64]) -> Vec<f64> {
    let Some(min) = scores.iter().copied().reduce(f64::min) else {
        return Vec::new();
    };
    let max = scores.iter().copied().reduce(f64::max).unwrap_or(min);
    let span = max - min;
    scores
        .iter()
        .map(|score| {
            if span > f64::EPSILON {
                (score - min) / span
            } else if max.abs() > f64::EPSILON {
                1.0
            } else {
                0.0
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct AggregationConfig {
    pub batch_size: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self { batch_size: 100 }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregationSummary {
    pub facts: usize,
    pub rows_computed: usize,
    pub rows_written: usize,
    pub batches_failed: usize,
    pub computed_at: DateTime<Utc>,
}

/// Fold activity facts into one aggregate row per (party, topic). Zero-weight
/// roles contribute nothing; rows that sum to zero are dropped so an aggregate
/// row always records real activity.
pub fn fold_facts(facts: &[ActivityFact], computed_at: DateTime<Utc>) -> Vec<AggregateRow> {
    let mut acc: BTreeMap<(Uuid, Topic), (f64, HashSet<Uuid>)> = BTreeMap::new();
    for fact in facts {
        let weight = role_weight(fact.role);
        if weight <= 0.0 {
            continue;
        }
        let entry = acc
            .entry((fact.party_id, fact.topic))
            .or_insert_with(|| (0.0, HashSet::new()));
        entry.0 += status_points(fact.status) * weight;
        entry.1.insert(fact.bill_id);
    }

    acc.into_iter()
        .filter(|(_, (raw_score, _))| *raw_score > 0.0)
        .map(|((party_id, topic), (raw_score, bills))| AggregateRow {
            party_id,
            topic,
            raw_score,
            bill_count: bills.len() as i64,
            computed_at,
        })
        .collect()
}

pub struct AggregationEngine {
    config: AggregationConfig,
}

impl AggregationEngine {
    pub fn new(config: AggregationConfig) -> Self {
        Self { config }
    }

    /// Recompute all aggregate rows and write them in fixed-size batches.
    /// A failed batch is logged and counted; batches already committed stand.
    pub async fn run(&self, store: &dyn Store) -> Result<AggregationSummary> {
        let facts = store
            .load_activity_facts()
            .await
            .context("loading activity facts")?;
        let computed_at = Utc::now();
        let rows = fold_facts(&facts, computed_at);

        let mut rows_written = 0usize;
        let mut batches_failed = 0usize;
        for batch in rows.chunks(self.config.batch_size.max(1)) {
            match store.upsert_aggregates(batch).await {
                Ok(()) => rows_written += batch.len(),
                Err(err) => {
                    batches_failed += 1;
                    warn!(error = %err, batch_len = batch.len(), "aggregate batch write failed");
                }
            }
        }

        let summary = AggregationSummary {
            facts: facts.len(),
            rows_computed: rows.len(),
            rows_written,
            batches_failed,
            computed_at,
        };
        info!(
            facts = summary.facts,
            rows = summary.rows_written,
            failed_batches = summary.batches_failed,
            "aggregation pass finished"
        );
        Ok(summary)
    }
}

/// One user concern with its importance weight (expected range 1 to 5).
#[derive(Debug, Clone, PartialEq)]
pub struct TopicPreference {
    pub topic: String,
    pub weight: f64,
}

impl TopicPreference {
    pub fn new(topic: impl Into<String>, weight: f64) -> Self {
        Self {
            topic: topic.into(),
            weight,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

fn confidence_for(coverage: f64) -> Confidence {
    if coverage >= 0.75 {
        Confidence::High
    } else if coverage >= 0.40 {
        Confidence::Medium
    } else {
        Confidence::Low
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedParty {
    pub party: PartyRef,
    pub personal_score: f64,
    pub coverage: f64,
    pub confidence: Confidence,
    pub evidence: Vec<EvidenceBill>,
}

/// Outcome of a scoring request. `NotComputed` means the aggregation pass has
/// never produced any rows, which callers must distinguish from a ranked
/// result with zero activity.
#[derive(Debug, Clone, Serialize)]
pub enum ScoreOutcome {
    NotComputed,
    Ranked(Vec<RankedParty>),
}

#[derive(Debug, Clone, Copy)]
pub struct RecommendationConfig {
    pub top_parties: usize,
    pub max_evidence: usize,
}

impl Default for RecommendationConfig {
    fn default() -> Self {
        Self {
            top_parties: 3,
            max_evidence: 4,
        }
    }
}

pub struct RecommendationEngine {
    config: RecommendationConfig,
}

impl RecommendationEngine {
    pub fn new(config: RecommendationConfig) -> Self {
        Self { config }
    }

    /// Rank active parties against the user's weighted topics.
    ///
    /// Normalization is per underlying topic across active parties; a user
    /// topic spanning several underlying topics takes the mean of their
    /// normalized scores. Evidence bills are initiator-sponsored, restricted
    /// to the requested topics, best-progressed first, and must carry at
    /// least one source link; an unsourced candidate is skipped in favor of
    /// the next sourced one.
    pub async fn score(
        &self,
        store: &dyn Store,
        preferences: &[TopicPreference],
    ) -> Result<ScoreOutcome> {
        let mut scoring: Vec<(Vec<Topic>, f64)> = Vec::new();
        for pref in preferences {
            match expand_user_topic(&pref.topic) {
                Some(topics) => scoring.push((topics, pref.weight)),
                None => warn!(topic = %pref.topic, "no aggregation topics for user topic, ignoring"),
            }
        }

        if !store
            .aggregates_present()
            .await
            .context("checking aggregate presence")?
        {
            return Ok(ScoreOutcome::NotComputed);
        }

        let total_weight: f64 = scoring.iter().map(|(_, weight)| weight).sum();
        if scoring.is_empty() || total_weight <= 0.0 {
            return Ok(ScoreOutcome::Ranked(Vec::new()));
        }

        let parties = store
            .active_parties()
            .await
            .context("loading active parties")?;
        if parties.is_empty() {
            return Ok(ScoreOutcome::Ranked(Vec::new()));
        }

        let mut underlying: Vec<Topic> = scoring
            .iter()
            .flat_map(|(topics, _)| topics.iter().copied())
            .collect();
        underlying.sort();
        underlying.dedup();

        let active_ids: HashSet<Uuid> = parties.iter().map(|p| p.id).collect();
        let mut raw: HashMap<(Uuid, Topic), f64> = HashMap::new();
        let mut bill_counts: HashMap<(Uuid, Topic), i64> = HashMap::new();
        for row in store
            .load_aggregates(&underlying)
            .await
            .context("loading aggregate rows")?
        {
            if !active_ids.contains(&row.party_id) {
                continue;
            }
            raw.insert((row.party_id, row.topic), row.raw_score);
            bill_counts.insert((row.party_id, row.topic), row.bill_count);
        }

        let mut norms: HashMap<(Uuid, Topic), f64> = HashMap::new();
        for topic in &underlying {
            let scores: Vec<f64> = parties
                .iter()
                .map(|p| raw.get(&(p.id, *topic)).copied().unwrap_or(0.0))
                .collect();
            for (party, normalized) in parties.iter().zip(min_max_normalize(&scores)) {
                norms.insert((party.id, *topic), normalized);
            }
        }

        let mut ranked: Vec<RankedParty> = Vec::with_capacity(parties.len());
        for party in &parties {
            let mut weighted = 0.0;
            let mut covered = 0usize;
            for (topics, weight) in &scoring {
                let avg_norm = topics
                    .iter()
                    .map(|t| norms.get(&(party.id, *t)).copied().unwrap_or(0.0))
                    .sum::<f64>()
                    / topics.len() as f64;
                weighted += weight * avg_norm;

                let bills: i64 = topics
                    .iter()
                    .map(|t| bill_counts.get(&(party.id, *t)).copied().unwrap_or(0))
                    .sum();
                if bills >= 2 {
                    covered += 1;
                }
            }
            let coverage = covered as f64 / scoring.len() as f64;
            ranked.push(RankedParty {
                party: party.clone(),
                personal_score: 100.0 * weighted / total_weight,
                coverage,
                confidence: confidence_for(coverage),
                evidence: Vec::new(),
            });
        }

        ranked.sort_by(|a, b| {
            b.personal_score
                .total_cmp(&a.personal_score)
                .then_with(|| a.party.name.cmp(&b.party.name))
        });
        ranked.truncate(self.config.top_parties);

        for entry in &mut ranked {
            let mut candidates = store
                .evidence_bills(entry.party.id, &underlying)
                .await
                .context("loading evidence bills")?;
            candidates.sort_by(|a, b| {
                status_points(b.status)
                    .total_cmp(&status_points(a.status))
                    .then_with(|| a.title.cmp(&b.title))
            });
            entry.evidence = candidates
                .into_iter()
                .filter(|bill| !bill.source_links.is_empty())
                .take(self.config.max_evidence)
                .collect();
        }

        Ok(ScoreOutcome::Ranked(ranked))
    }
}
