//! Persistence for the ranker: the `Store` contract, the Postgres-backed
//! implementation, and an in-memory implementation used by tests and dry
//! runs. All writes are idempotent by natural key.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use polirank_core::{
    ActivityFact, AggregateRow, BillDraft, BillRole, BillStatus, CommitteeDraft, EntityKind,
    EvidenceBill, GovernmentRoleDraft, LegislatorDraft, MembershipDraft, PartyDraft, PartyRef,
    SourceLink, SyncRun, Topic, VoteEventDraft, VotePosition,
};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "polirank-store";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("encoding stored value failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result of one idempotent upsert: the stable internal id plus whether this
/// call inserted the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: Uuid,
    pub created: bool,
}

/// Persistence contract shared by `PgStore` and `MemStore`.
///
/// Entity upserts are keyed by `(external_source, external_id)`; repeated
/// calls with identical input return the same id and never duplicate rows.
/// Relationship upserts are keyed by their composite natural keys.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_run(&self, run: &SyncRun) -> Result<(), StoreError>;
    async fn finalize_run(&self, run: &SyncRun) -> Result<(), StoreError>;

    async fn upsert_party(
        &self,
        source: &str,
        draft: &PartyDraft,
    ) -> Result<UpsertOutcome, StoreError>;
    async fn upsert_legislator(
        &self,
        source: &str,
        draft: &LegislatorDraft,
    ) -> Result<UpsertOutcome, StoreError>;
    async fn upsert_bill(
        &self,
        source: &str,
        draft: &BillDraft,
    ) -> Result<UpsertOutcome, StoreError>;
    async fn upsert_committee(
        &self,
        source: &str,
        draft: &CommitteeDraft,
    ) -> Result<UpsertOutcome, StoreError>;
    async fn upsert_government_role(
        &self,
        source: &str,
        draft: &GovernmentRoleDraft,
        holder_id: Option<Uuid>,
    ) -> Result<UpsertOutcome, StoreError>;
    async fn upsert_vote_event(
        &self,
        source: &str,
        draft: &VoteEventDraft,
        bill_id: Option<Uuid>,
    ) -> Result<UpsertOutcome, StoreError>;

    async fn upsert_membership(
        &self,
        legislator_id: Uuid,
        party_id: Uuid,
        draft: &MembershipDraft,
    ) -> Result<(), StoreError>;
    async fn upsert_bill_role(
        &self,
        bill_id: Uuid,
        legislator_id: Uuid,
        role: BillRole,
    ) -> Result<(), StoreError>;
    async fn upsert_committee_membership(
        &self,
        committee_id: Uuid,
        legislator_id: Uuid,
        role: Option<&str>,
        is_current: bool,
    ) -> Result<(), StoreError>;
    async fn upsert_vote_record(
        &self,
        vote_id: Uuid,
        legislator_id: Uuid,
        position: VotePosition,
    ) -> Result<(), StoreError>;

    async fn save_snapshot(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
        external_id: &str,
        run_id: Uuid,
        payload: &JsonValue,
    ) -> Result<(), StoreError>;
    async fn record_source_links(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
        links: &[SourceLink],
    ) -> Result<(), StoreError>;

    async fn active_parties(&self) -> Result<Vec<PartyRef>, StoreError>;
    async fn load_activity_facts(&self) -> Result<Vec<ActivityFact>, StoreError>;
    async fn upsert_aggregates(&self, rows: &[AggregateRow]) -> Result<(), StoreError>;
    async fn aggregates_present(&self) -> Result<bool, StoreError>;
    async fn load_aggregates(&self, topics: &[Topic]) -> Result<Vec<AggregateRow>, StoreError>;
    async fn evidence_bills(
        &self,
        party_id: Uuid,
        topics: &[Topic],
    ) -> Result<Vec<EvidenceBill>, StoreError>;
}

/// Attempt a snapshot write and swallow any failure after logging it. A lost
/// snapshot never rolls back the upsert it documents.
pub async fn snapshot_best_effort(
    store: &dyn Store,
    kind: EntityKind,
    entity_id: Uuid,
    external_id: &str,
    run_id: Uuid,
    payload: &JsonValue,
) {
    if let Err(err) = store
        .save_snapshot(kind, entity_id, external_id, run_id, payload)
        .await
    {
        warn!(kind = %kind, %entity_id, error = %err, "snapshot write failed");
    }
}

/// Postgres-backed store. Queries are runtime-bound; the schema lives in
/// `migrations/`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct PartyRow {
    id: Uuid,
    external_id: String,
    name: String,
    short_name: Option<String>,
    is_active: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct FactRow {
    party_id: Uuid,
    bill_id: Uuid,
    topic: String,
    status: String,
    role: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct AggRow {
    party_id: Uuid,
    topic: String,
    raw_score: f64,
    bill_count: i64,
    computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct EvidenceRow {
    id: Uuid,
    external_id: String,
    title: String,
    status: String,
    topic: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct LinkRow {
    entity_id: Uuid,
    label: String,
    url: String,
    external_id: Option<String>,
}

#[async_trait]
impl Store for PgStore {
    async fn insert_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_runs (id, status, started_at, finished_at, counters, errors)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(run.id)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(serde_json::to_value(&run.counters)?)
        .bind(serde_json::to_value(&run.errors)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finalize_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE sync_runs
            SET status = $2, finished_at = $3, counters = $4, errors = $5
            WHERE id = $1
            "#,
        )
        .bind(run.id)
        .bind(run.status.as_str())
        .bind(run.finished_at)
        .bind(serde_json::to_value(&run.counters)?)
        .bind(serde_json::to_value(&run.errors)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_party(
        &self,
        source: &str,
        draft: &PartyDraft,
    ) -> Result<UpsertOutcome, StoreError> {
        // Insert-if-absent then refresh, so creations and updates are counted
        // exactly. Concurrent calls for the same key converge on the update.
        let inserted = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO parties
                (id, external_id, external_source, name, short_name, is_active,
                 first_seen_at, last_seen_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW())
            ON CONFLICT (external_source, external_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&draft.external_id)
        .bind(source)
        .bind(&draft.name)
        .bind(&draft.short_name)
        .bind(draft.is_active)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(id) = inserted {
            return Ok(UpsertOutcome { id, created: true });
        }

        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE parties
            SET name = $3, short_name = $4, is_active = $5, last_seen_at = NOW()
            WHERE external_source = $1 AND external_id = $2
            RETURNING id
            "#,
        )
        .bind(source)
        .bind(&draft.external_id)
        .bind(&draft.name)
        .bind(&draft.short_name)
        .bind(draft.is_active)
        .fetch_one(&self.pool)
        .await?;
        Ok(UpsertOutcome { id, created: false })
    }

    async fn upsert_legislator(
        &self,
        source: &str,
        draft: &LegislatorDraft,
    ) -> Result<UpsertOutcome, StoreError> {
        let inserted = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO legislators
                (id, external_id, external_source, full_name, given_name, family_name,
                 is_active, first_seen_at, last_seen_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW())
            ON CONFLICT (external_source, external_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&draft.external_id)
        .bind(source)
        .bind(&draft.full_name)
        .bind(&draft.given_name)
        .bind(&draft.family_name)
        .bind(draft.is_active)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(id) = inserted {
            return Ok(UpsertOutcome { id, created: true });
        }

        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE legislators
            SET full_name = $3, given_name = $4, family_name = $5, is_active = $6,
                last_seen_at = NOW()
            WHERE external_source = $1 AND external_id = $2
            RETURNING id
            "#,
        )
        .bind(source)
        .bind(&draft.external_id)
        .bind(&draft.full_name)
        .bind(&draft.given_name)
        .bind(&draft.family_name)
        .bind(draft.is_active)
        .fetch_one(&self.pool)
        .await?;
        Ok(UpsertOutcome { id, created: false })
    }

    async fn upsert_bill(
        &self,
        source: &str,
        draft: &BillDraft,
    ) -> Result<UpsertOutcome, StoreError> {
        let topic = draft.topic.map(|t| t.as_str());
        let inserted = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO bills
                (id, external_id, external_source, title, summary, number, status, topic,
                 submitted_on, first_seen_at, last_seen_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), NOW())
            ON CONFLICT (external_source, external_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&draft.external_id)
        .bind(source)
        .bind(&draft.title)
        .bind(&draft.summary)
        .bind(&draft.number)
        .bind(draft.status.as_str())
        .bind(topic)
        .bind(draft.submitted_on)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(id) = inserted {
            return Ok(UpsertOutcome { id, created: true });
        }

        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE bills
            SET title = $3, summary = $4, number = $5, status = $6, topic = $7,
                submitted_on = $8, last_seen_at = NOW()
            WHERE external_source = $1 AND external_id = $2
            RETURNING id
            "#,
        )
        .bind(source)
        .bind(&draft.external_id)
        .bind(&draft.title)
        .bind(&draft.summary)
        .bind(&draft.number)
        .bind(draft.status.as_str())
        .bind(topic)
        .bind(draft.submitted_on)
        .fetch_one(&self.pool)
        .await?;
        Ok(UpsertOutcome { id, created: false })
    }

    async fn upsert_committee(
        &self,
        source: &str,
        draft: &CommitteeDraft,
    ) -> Result<UpsertOutcome, StoreError> {
        let inserted = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO committees
                (id, external_id, external_source, name, is_active, first_seen_at, last_seen_at)
            VALUES ($1, $2, $3, $4, $5, NOW(), NOW())
            ON CONFLICT (external_source, external_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&draft.external_id)
        .bind(source)
        .bind(&draft.name)
        .bind(draft.is_active)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(id) = inserted {
            return Ok(UpsertOutcome { id, created: true });
        }

        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE committees
            SET name = $3, is_active = $4, last_seen_at = NOW()
            WHERE external_source = $1 AND external_id = $2
            RETURNING id
            "#,
        )
        .bind(source)
        .bind(&draft.external_id)
        .bind(&draft.name)
        .bind(draft.is_active)
        .fetch_one(&self.pool)
        .await?;
        Ok(UpsertOutcome { id, created: false })
    }

    async fn upsert_government_role(
        &self,
        source: &str,
        draft: &GovernmentRoleDraft,
        holder_id: Option<Uuid>,
    ) -> Result<UpsertOutcome, StoreError> {
        let inserted = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO government_roles
                (id, external_id, external_source, title, holder_id, started_on, ended_on,
                 is_current, first_seen_at, last_seen_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), NOW())
            ON CONFLICT (external_source, external_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&draft.external_id)
        .bind(source)
        .bind(&draft.title)
        .bind(holder_id)
        .bind(draft.started_on)
        .bind(draft.ended_on)
        .bind(draft.is_current)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(id) = inserted {
            return Ok(UpsertOutcome { id, created: true });
        }

        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE government_roles
            SET title = $3, holder_id = $4, started_on = $5, ended_on = $6, is_current = $7,
                last_seen_at = NOW()
            WHERE external_source = $1 AND external_id = $2
            RETURNING id
            "#,
        )
        .bind(source)
        .bind(&draft.external_id)
        .bind(&draft.title)
        .bind(holder_id)
        .bind(draft.started_on)
        .bind(draft.ended_on)
        .bind(draft.is_current)
        .fetch_one(&self.pool)
        .await?;
        Ok(UpsertOutcome { id, created: false })
    }

    async fn upsert_vote_event(
        &self,
        source: &str,
        draft: &VoteEventDraft,
        bill_id: Option<Uuid>,
    ) -> Result<UpsertOutcome, StoreError> {
        let inserted = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO votes
                (id, external_id, external_source, title, held_at, bill_id,
                 first_seen_at, last_seen_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW())
            ON CONFLICT (external_source, external_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&draft.external_id)
        .bind(source)
        .bind(&draft.title)
        .bind(draft.held_at)
        .bind(bill_id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(id) = inserted {
            return Ok(UpsertOutcome { id, created: true });
        }

        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE votes
            SET title = $3, held_at = $4, bill_id = $5, last_seen_at = NOW()
            WHERE external_source = $1 AND external_id = $2
            RETURNING id
            "#,
        )
        .bind(source)
        .bind(&draft.external_id)
        .bind(&draft.title)
        .bind(draft.held_at)
        .bind(bill_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(UpsertOutcome { id, created: false })
    }

    async fn upsert_membership(
        &self,
        legislator_id: Uuid,
        party_id: Uuid,
        draft: &MembershipDraft,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO memberships (legislator_id, party_id, started_on, ended_on, is_current)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (legislator_id, party_id) DO UPDATE
            SET started_on = EXCLUDED.started_on,
                ended_on = EXCLUDED.ended_on,
                is_current = EXCLUDED.is_current
            "#,
        )
        .bind(legislator_id)
        .bind(party_id)
        .bind(draft.started_on)
        .bind(draft.ended_on)
        .bind(draft.is_current)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_bill_role(
        &self,
        bill_id: Uuid,
        legislator_id: Uuid,
        role: BillRole,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO bill_roles (bill_id, legislator_id, role)
            VALUES ($1, $2, $3)
            ON CONFLICT (bill_id, legislator_id, role) DO NOTHING
            "#,
        )
        .bind(bill_id)
        .bind(legislator_id)
        .bind(role.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_committee_membership(
        &self,
        committee_id: Uuid,
        legislator_id: Uuid,
        role: Option<&str>,
        is_current: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO committee_memberships (committee_id, legislator_id, role, is_current)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (committee_id, legislator_id) DO UPDATE
            SET role = EXCLUDED.role, is_current = EXCLUDED.is_current
            "#,
        )
        .bind(committee_id)
        .bind(legislator_id)
        .bind(role)
        .bind(is_current)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_vote_record(
        &self,
        vote_id: Uuid,
        legislator_id: Uuid,
        position: VotePosition,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO vote_records (vote_id, legislator_id, position)
            VALUES ($1, $2, $3)
            ON CONFLICT (vote_id, legislator_id) DO UPDATE
            SET position = EXCLUDED.position
            "#,
        )
        .bind(vote_id)
        .bind(legislator_id)
        .bind(position.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_snapshot(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
        external_id: &str,
        run_id: Uuid,
        payload: &JsonValue,
    ) -> Result<(), StoreError> {
        let content_hash = sha256_hex(&serde_json::to_vec(payload)?);
        sqlx::query(
            r#"
            INSERT INTO snapshots
                (id, entity_kind, entity_id, external_id, run_id, content_hash, payload, fetched_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(kind.as_str())
        .bind(entity_id)
        .bind(external_id)
        .bind(run_id)
        .bind(content_hash)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_source_links(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
        links: &[SourceLink],
    ) -> Result<(), StoreError> {
        for link in links {
            sqlx::query(
                r#"
                INSERT INTO source_links (entity_kind, entity_id, label, url, external_id)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (entity_kind, entity_id, url) DO UPDATE
                SET label = EXCLUDED.label, external_id = EXCLUDED.external_id
                "#,
            )
            .bind(kind.as_str())
            .bind(entity_id)
            .bind(&link.label)
            .bind(&link.url)
            .bind(&link.external_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn active_parties(&self) -> Result<Vec<PartyRef>, StoreError> {
        let rows = sqlx::query_as::<_, PartyRow>(
            r#"
            SELECT id, external_id, name, short_name, is_active
            FROM parties
            WHERE is_active
            ORDER BY name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| PartyRef {
                id: row.id,
                external_id: row.external_id,
                name: row.name,
                short_name: row.short_name,
                is_active: row.is_active,
            })
            .collect())
    }

    async fn load_activity_facts(&self) -> Result<Vec<ActivityFact>, StoreError> {
        let rows = sqlx::query_as::<_, FactRow>(
            r#"
            SELECT m.party_id, br.bill_id, b.topic, b.status, br.role
            FROM bill_roles br
            JOIN bills b ON b.id = br.bill_id
            JOIN memberships m ON m.legislator_id = br.legislator_id AND m.is_current
            WHERE b.topic IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let topic = Topic::from_slug(&row.topic)?;
                Some(ActivityFact {
                    party_id: row.party_id,
                    bill_id: row.bill_id,
                    topic,
                    status: BillStatus::from_slug(&row.status),
                    role: BillRole::from_slug(&row.role),
                })
            })
            .collect())
    }

    async fn upsert_aggregates(&self, rows: &[AggregateRow]) -> Result<(), StoreError> {
        // One short transaction per batch; the caller chooses the batch size.
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO aggregates (party_id, topic, raw_score, bill_count, computed_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (party_id, topic) DO UPDATE
                SET raw_score = EXCLUDED.raw_score,
                    bill_count = EXCLUDED.bill_count,
                    computed_at = EXCLUDED.computed_at
                "#,
            )
            .bind(row.party_id)
            .bind(row.topic.as_str())
            .bind(row.raw_score)
            .bind(row.bill_count)
            .bind(row.computed_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn aggregates_present(&self) -> Result<bool, StoreError> {
        let present = sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM aggregates)")
            .fetch_one(&self.pool)
            .await?;
        Ok(present)
    }

    async fn load_aggregates(&self, topics: &[Topic]) -> Result<Vec<AggregateRow>, StoreError> {
        let slugs: Vec<String> = topics.iter().map(|t| t.as_str().to_string()).collect();
        let rows = sqlx::query_as::<_, AggRow>(
            r#"
            SELECT party_id, topic, raw_score, bill_count, computed_at
            FROM aggregates
            WHERE topic = ANY($1)
            "#,
        )
        .bind(&slugs)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                Some(AggregateRow {
                    party_id: row.party_id,
                    topic: Topic::from_slug(&row.topic)?,
                    raw_score: row.raw_score,
                    bill_count: row.bill_count,
                    computed_at: row.computed_at,
                })
            })
            .collect())
    }

    async fn evidence_bills(
        &self,
        party_id: Uuid,
        topics: &[Topic],
    ) -> Result<Vec<EvidenceBill>, StoreError> {
        let slugs: Vec<String> = topics.iter().map(|t| t.as_str().to_string()).collect();
        let rows = sqlx::query_as::<_, EvidenceRow>(
            r#"
            SELECT DISTINCT b.id, b.external_id, b.title, b.status, b.topic
            FROM bills b
            JOIN bill_roles br ON br.bill_id = b.id AND br.role = 'initiator'
            JOIN memberships m ON m.legislator_id = br.legislator_id AND m.is_current
            WHERE m.party_id = $1 AND b.topic = ANY($2)
            "#,
        )
        .bind(party_id)
        .bind(&slugs)
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
        let link_rows = sqlx::query_as::<_, LinkRow>(
            r#"
            SELECT entity_id, label, url, external_id
            FROM source_links
            WHERE entity_kind = 'bills' AND entity_id = ANY($1)
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut links_by_bill: HashMap<Uuid, Vec<SourceLink>> = HashMap::new();
        for link in link_rows {
            links_by_bill
                .entry(link.entity_id)
                .or_default()
                .push(SourceLink {
                    label: link.label,
                    url: link.url,
                    external_id: link.external_id,
                });
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let source_links = links_by_bill.remove(&row.id).unwrap_or_default();
                EvidenceBill {
                    bill_id: row.id,
                    external_id: row.external_id,
                    title: row.title,
                    status: BillStatus::from_slug(&row.status),
                    topic: row.topic.as_deref().and_then(Topic::from_slug),
                    source_links,
                }
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
struct MemEntity<D> {
    id: Uuid,
    draft: D,
}

#[derive(Debug, Clone)]
struct MemSnapshot {
    kind: EntityKind,
    entity_id: Uuid,
    external_id: String,
    run_id: Uuid,
    content_hash: String,
}

type EntityMap<D> = HashMap<(String, String), MemEntity<D>>;

#[derive(Debug, Default)]
struct MemInner {
    parties: EntityMap<PartyDraft>,
    legislators: EntityMap<LegislatorDraft>,
    bills: EntityMap<BillDraft>,
    committees: EntityMap<CommitteeDraft>,
    government_roles: EntityMap<GovernmentRoleDraft>,
    votes: EntityMap<VoteEventDraft>,
    memberships: HashMap<(Uuid, Uuid), bool>,
    bill_roles: HashSet<(Uuid, Uuid, BillRole)>,
    committee_memberships: HashSet<(Uuid, Uuid)>,
    vote_records: HashSet<(Uuid, Uuid)>,
    snapshots: Vec<MemSnapshot>,
    source_links: HashMap<(EntityKind, Uuid), Vec<SourceLink>>,
    runs: HashMap<Uuid, SyncRun>,
    aggregates: HashMap<(Uuid, Topic), AggregateRow>,
}

/// Row counts for assertions and dry-run summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemStats {
    pub parties: usize,
    pub legislators: usize,
    pub bills: usize,
    pub committees: usize,
    pub government_roles: usize,
    pub votes: usize,
    pub memberships: usize,
    pub bill_roles: usize,
    pub committee_memberships: usize,
    pub vote_records: usize,
    pub snapshots: usize,
    pub source_links: usize,
    pub runs: usize,
}

/// In-memory store with the same observable upsert semantics as `PgStore`.
#[derive(Debug, Default)]
pub struct MemStore {
    inner: RwLock<MemInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn stats(&self) -> MemStats {
        let inner = self.inner.read().await;
        MemStats {
            parties: inner.parties.len(),
            legislators: inner.legislators.len(),
            bills: inner.bills.len(),
            committees: inner.committees.len(),
            government_roles: inner.government_roles.len(),
            votes: inner.votes.len(),
            memberships: inner.memberships.len(),
            bill_roles: inner.bill_roles.len(),
            committee_memberships: inner.committee_memberships.len(),
            vote_records: inner.vote_records.len(),
            snapshots: inner.snapshots.len(),
            source_links: inner.source_links.values().map(Vec::len).sum(),
            runs: inner.runs.len(),
        }
    }

    pub async fn run(&self, id: Uuid) -> Option<SyncRun> {
        self.inner.read().await.runs.get(&id).cloned()
    }

    pub async fn snapshot_count_for(&self, kind: EntityKind) -> usize {
        self.inner
            .read()
            .await
            .snapshots
            .iter()
            .filter(|s| s.kind == kind)
            .count()
    }

    pub async fn snapshot_hashes(&self, kind: EntityKind) -> Vec<String> {
        self.inner
            .read()
            .await
            .snapshots
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| s.content_hash.clone())
            .collect()
    }

    /// (kind, entity id, external id) of every snapshot a run persisted, in
    /// insertion order.
    pub async fn snapshots_for_run(&self, run_id: Uuid) -> Vec<(EntityKind, Uuid, String)> {
        self.inner
            .read()
            .await
            .snapshots
            .iter()
            .filter(|s| s.run_id == run_id)
            .map(|s| (s.kind, s.entity_id, s.external_id.clone()))
            .collect()
    }
}

fn mem_upsert<D: Clone>(
    map: &mut EntityMap<D>,
    source: &str,
    external_id: &str,
    draft: &D,
) -> UpsertOutcome {
    let key = (source.to_string(), external_id.to_string());
    match map.get_mut(&key) {
        Some(existing) => {
            existing.draft = draft.clone();
            UpsertOutcome {
                id: existing.id,
                created: false,
            }
        }
        None => {
            let id = Uuid::new_v4();
            map.insert(
                key,
                MemEntity {
                    id,
                    draft: draft.clone(),
                },
            );
            UpsertOutcome { id, created: true }
        }
    }
}

#[async_trait]
impl Store for MemStore {
    async fn insert_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        self.inner.write().await.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn finalize_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        self.inner.write().await.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn upsert_party(
        &self,
        source: &str,
        draft: &PartyDraft,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(mem_upsert(
            &mut inner.parties,
            source,
            &draft.external_id,
            draft,
        ))
    }

    async fn upsert_legislator(
        &self,
        source: &str,
        draft: &LegislatorDraft,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(mem_upsert(
            &mut inner.legislators,
            source,
            &draft.external_id,
            draft,
        ))
    }

    async fn upsert_bill(
        &self,
        source: &str,
        draft: &BillDraft,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(mem_upsert(
            &mut inner.bills,
            source,
            &draft.external_id,
            draft,
        ))
    }

    async fn upsert_committee(
        &self,
        source: &str,
        draft: &CommitteeDraft,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(mem_upsert(
            &mut inner.committees,
            source,
            &draft.external_id,
            draft,
        ))
    }

    async fn upsert_government_role(
        &self,
        source: &str,
        draft: &GovernmentRoleDraft,
        _holder_id: Option<Uuid>,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(mem_upsert(
            &mut inner.government_roles,
            source,
            &draft.external_id,
            draft,
        ))
    }

    async fn upsert_vote_event(
        &self,
        source: &str,
        draft: &VoteEventDraft,
        _bill_id: Option<Uuid>,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(mem_upsert(
            &mut inner.votes,
            source,
            &draft.external_id,
            draft,
        ))
    }

    async fn upsert_membership(
        &self,
        legislator_id: Uuid,
        party_id: Uuid,
        draft: &MembershipDraft,
    ) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .memberships
            .insert((legislator_id, party_id), draft.is_current);
        Ok(())
    }

    async fn upsert_bill_role(
        &self,
        bill_id: Uuid,
        legislator_id: Uuid,
        role: BillRole,
    ) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .bill_roles
            .insert((bill_id, legislator_id, role));
        Ok(())
    }

    async fn upsert_committee_membership(
        &self,
        committee_id: Uuid,
        legislator_id: Uuid,
        _role: Option<&str>,
        _is_current: bool,
    ) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .committee_memberships
            .insert((committee_id, legislator_id));
        Ok(())
    }

    async fn upsert_vote_record(
        &self,
        vote_id: Uuid,
        legislator_id: Uuid,
        _position: VotePosition,
    ) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .vote_records
            .insert((vote_id, legislator_id));
        Ok(())
    }

    async fn save_snapshot(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
        external_id: &str,
        run_id: Uuid,
        payload: &JsonValue,
    ) -> Result<(), StoreError> {
        let content_hash = sha256_hex(&serde_json::to_vec(payload)?);
        self.inner.write().await.snapshots.push(MemSnapshot {
            kind,
            entity_id,
            external_id: external_id.to_string(),
            run_id,
            content_hash,
        });
        Ok(())
    }

    async fn record_source_links(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
        links: &[SourceLink],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let slot = inner.source_links.entry((kind, entity_id)).or_default();
        for link in links {
            if let Some(existing) = slot.iter_mut().find(|l| l.url == link.url) {
                *existing = link.clone();
            } else {
                slot.push(link.clone());
            }
        }
        Ok(())
    }

    async fn active_parties(&self) -> Result<Vec<PartyRef>, StoreError> {
        let inner = self.inner.read().await;
        let mut parties: Vec<PartyRef> = inner
            .parties
            .iter()
            .filter(|(_, entity)| entity.draft.is_active)
            .map(|((_, external_id), entity)| PartyRef {
                id: entity.id,
                external_id: external_id.clone(),
                name: entity.draft.name.clone(),
                short_name: entity.draft.short_name.clone(),
                is_active: entity.draft.is_active,
            })
            .collect();
        parties.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(parties)
    }

    async fn load_activity_facts(&self) -> Result<Vec<ActivityFact>, StoreError> {
        let inner = self.inner.read().await;
        let mut facts = Vec::new();
        for (bill_id, legislator_id, role) in &inner.bill_roles {
            let Some(bill) = inner.bills.values().find(|b| b.id == *bill_id) else {
                continue;
            };
            let Some(topic) = bill.draft.topic else {
                continue;
            };
            for ((member, party_id), is_current) in &inner.memberships {
                if member == legislator_id && *is_current {
                    facts.push(ActivityFact {
                        party_id: *party_id,
                        bill_id: *bill_id,
                        topic,
                        status: bill.draft.status,
                        role: *role,
                    });
                }
            }
        }
        Ok(facts)
    }

    async fn upsert_aggregates(&self, rows: &[AggregateRow]) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        for row in rows {
            inner
                .aggregates
                .insert((row.party_id, row.topic), row.clone());
        }
        Ok(())
    }

    async fn aggregates_present(&self) -> Result<bool, StoreError> {
        Ok(!self.inner.read().await.aggregates.is_empty())
    }

    async fn load_aggregates(&self, topics: &[Topic]) -> Result<Vec<AggregateRow>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .aggregates
            .values()
            .filter(|row| topics.contains(&row.topic))
            .cloned()
            .collect())
    }

    async fn evidence_bills(
        &self,
        party_id: Uuid,
        topics: &[Topic],
    ) -> Result<Vec<EvidenceBill>, StoreError> {
        let inner = self.inner.read().await;
        let mut out = Vec::new();
        for ((_, external_id), bill) in &inner.bills {
            let Some(topic) = bill.draft.topic else {
                continue;
            };
            if !topics.contains(&topic) {
                continue;
            }
            let initiated_by_member = inner.bill_roles.iter().any(|(b, l, r)| {
                *b == bill.id
                    && *r == BillRole::Initiator
                    && inner
                        .memberships
                        .get(&(*l, party_id))
                        .copied()
                        .unwrap_or(false)
            });
            if !initiated_by_member {
                continue;
            }
            out.push(EvidenceBill {
                bill_id: bill.id,
                external_id: external_id.clone(),
                title: bill.draft.title.clone(),
                status: bill.draft.status,
                topic: Some(topic),
                source_links: inner
                    .source_links
                    .get(&(EntityKind::Bills, bill.id))
                    .cloned()
                    .unwrap_or_default(),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SOURCE: &str = "parliament_api";

    fn party(external_id: &str, name: &str) -> PartyDraft {
        PartyDraft {
            external_id: external_id.to_string(),
            name: name.to_string(),
            short_name: None,
            is_active: true,
        }
    }

    fn bill(external_id: &str, topic: Option<Topic>, status: BillStatus) -> BillDraft {
        BillDraft {
            external_id: external_id.to_string(),
            title: format!("bill {external_id}"),
            summary: None,
            number: None,
            status,
            topic,
            submitted_on: None,
        }
    }

    fn legislator(external_id: &str) -> LegislatorDraft {
        LegislatorDraft {
            external_id: external_id.to_string(),
            full_name: format!("member {external_id}"),
            given_name: None,
            family_name: None,
            is_active: true,
        }
    }

    fn membership(legislator: &str, party: &str, current: bool) -> MembershipDraft {
        MembershipDraft {
            legislator_external_id: legislator.to_string(),
            party_external_id: party.to_string(),
            started_on: None,
            ended_on: None,
            is_current: current,
        }
    }

    #[test]
    fn content_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn repeated_upsert_keeps_one_row_and_a_stable_id() {
        let store = MemStore::new();
        let draft = party("P-1", "Green Alliance");

        let first = store.upsert_party(SOURCE, &draft).await.expect("insert");
        let second = store.upsert_party(SOURCE, &draft).await.expect("update");

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_eq!(store.stats().await.parties, 1);

        // Same external id under a different source is a different row.
        let other = store
            .upsert_party("other_feed", &draft)
            .await
            .expect("insert");
        assert!(other.created);
        assert_ne!(other.id, first.id);
        assert_eq!(store.stats().await.parties, 2);
    }

    #[tokio::test]
    async fn updates_replace_mutable_fields_in_place() {
        let store = MemStore::new();
        store
            .upsert_party(SOURCE, &party("P-1", "Old Name"))
            .await
            .expect("insert");
        let outcome = store
            .upsert_party(SOURCE, &party("P-1", "New Name"))
            .await
            .expect("update");
        assert!(!outcome.created);

        let parties = store.active_parties().await.expect("read");
        assert_eq!(parties.len(), 1);
        assert_eq!(parties[0].name, "New Name");
    }

    #[tokio::test]
    async fn relationship_upserts_deduplicate_by_composite_key() {
        let store = MemStore::new();
        let p = store
            .upsert_party(SOURCE, &party("P-1", "A"))
            .await
            .expect("p");
        let l = store
            .upsert_legislator(SOURCE, &legislator("L-1"))
            .await
            .expect("l");
        let b = store
            .upsert_bill(SOURCE, &bill("B-1", Some(Topic::Housing), BillStatus::Passed))
            .await
            .expect("b");

        for _ in 0..2 {
            store
                .upsert_membership(l.id, p.id, &membership("L-1", "P-1", true))
                .await
                .expect("membership");
            store
                .upsert_bill_role(b.id, l.id, BillRole::Initiator)
                .await
                .expect("role");
        }
        let stats = store.stats().await;
        assert_eq!(stats.memberships, 1);
        assert_eq!(stats.bill_roles, 1);

        // Same pair with a different role is a distinct edge.
        store
            .upsert_bill_role(b.id, l.id, BillRole::Rapporteur)
            .await
            .expect("role");
        assert_eq!(store.stats().await.bill_roles, 2);
    }

    #[tokio::test]
    async fn snapshots_append_and_never_replace() {
        let store = MemStore::new();
        let run_id = Uuid::new_v4();
        let entity_id = Uuid::new_v4();
        let payload = json!({"id": "P-1", "name": "Green Alliance"});

        for _ in 0..2 {
            store
                .save_snapshot(EntityKind::Parties, entity_id, "P-1", run_id, &payload)
                .await
                .expect("snapshot");
        }
        assert_eq!(store.stats().await.snapshots, 2);
        let hashes = store.snapshot_hashes(EntityKind::Parties).await;
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0], hashes[1]);
    }

    #[tokio::test]
    async fn snapshots_trace_back_to_the_run_that_saved_them() {
        let store = MemStore::new();
        let first_run = Uuid::new_v4();
        let second_run = Uuid::new_v4();
        let p = store
            .upsert_party(SOURCE, &party("P-1", "Green Alliance"))
            .await
            .expect("party");
        let payload = json!({"id": "P-1", "name": "Green Alliance"});

        for run_id in [first_run, second_run] {
            store
                .save_snapshot(EntityKind::Parties, p.id, "P-1", run_id, &payload)
                .await
                .expect("snapshot");
        }

        let traced = store.snapshots_for_run(first_run).await;
        assert_eq!(traced, vec![(EntityKind::Parties, p.id, "P-1".to_string())]);
        assert_eq!(store.snapshots_for_run(second_run).await.len(), 1);
        assert!(store.snapshots_for_run(Uuid::new_v4()).await.is_empty());
    }

    #[tokio::test]
    async fn activity_facts_require_a_current_membership_and_a_topic() {
        let store = MemStore::new();
        let p = store
            .upsert_party(SOURCE, &party("P-1", "A"))
            .await
            .expect("p");
        let current = store
            .upsert_legislator(SOURCE, &legislator("L-1"))
            .await
            .expect("l1");
        let former = store
            .upsert_legislator(SOURCE, &legislator("L-2"))
            .await
            .expect("l2");
        store
            .upsert_membership(current.id, p.id, &membership("L-1", "P-1", true))
            .await
            .expect("m1");
        store
            .upsert_membership(former.id, p.id, &membership("L-2", "P-1", false))
            .await
            .expect("m2");

        let topical = store
            .upsert_bill(SOURCE, &bill("B-1", Some(Topic::Housing), BillStatus::Passed))
            .await
            .expect("b1");
        let untopical = store
            .upsert_bill(SOURCE, &bill("B-2", None, BillStatus::Passed))
            .await
            .expect("b2");
        for b in [topical.id, untopical.id] {
            store
                .upsert_bill_role(b, current.id, BillRole::Initiator)
                .await
                .expect("role");
            store
                .upsert_bill_role(b, former.id, BillRole::Cosponsor)
                .await
                .expect("role");
        }

        let facts = store.load_activity_facts().await.expect("facts");
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].party_id, p.id);
        assert_eq!(facts[0].bill_id, topical.id);
        assert_eq!(facts[0].role, BillRole::Initiator);
    }

    #[tokio::test]
    async fn aggregates_present_flips_only_when_rows_exist() {
        let store = MemStore::new();
        assert!(!store.aggregates_present().await.expect("empty"));

        let row = AggregateRow {
            party_id: Uuid::new_v4(),
            topic: Topic::Housing,
            raw_score: 5.0,
            bill_count: 2,
            computed_at: Utc::now(),
        };
        store
            .upsert_aggregates(&[row.clone()])
            .await
            .expect("write");
        assert!(store.aggregates_present().await.expect("present"));

        let loaded = store
            .load_aggregates(&[Topic::Housing, Topic::Economy])
            .await
            .expect("load");
        assert_eq!(loaded.len(), 1);
        assert!(store
            .load_aggregates(&[Topic::Economy])
            .await
            .expect("load")
            .is_empty());
    }

    #[tokio::test]
    async fn evidence_reads_attach_source_links() {
        let store = MemStore::new();
        let p = store
            .upsert_party(SOURCE, &party("P-1", "A"))
            .await
            .expect("p");
        let l = store
            .upsert_legislator(SOURCE, &legislator("L-1"))
            .await
            .expect("l");
        store
            .upsert_membership(l.id, p.id, &membership("L-1", "P-1", true))
            .await
            .expect("m");
        let b = store
            .upsert_bill(SOURCE, &bill("B-1", Some(Topic::Housing), BillStatus::Passed))
            .await
            .expect("b");
        store
            .upsert_bill_role(b.id, l.id, BillRole::Initiator)
            .await
            .expect("role");
        store
            .record_source_links(
                EntityKind::Bills,
                b.id,
                &[SourceLink {
                    label: "document".to_string(),
                    url: "https://parliament.example/bills/B-1".to_string(),
                    external_id: Some("B-1".to_string()),
                }],
            )
            .await
            .expect("links");

        let evidence = store
            .evidence_bills(p.id, &[Topic::Housing])
            .await
            .expect("evidence");
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].source_links.len(), 1);

        // A cosponsored bill is not evidence material.
        let b2 = store
            .upsert_bill(SOURCE, &bill("B-2", Some(Topic::Housing), BillStatus::Passed))
            .await
            .expect("b2");
        store
            .upsert_bill_role(b2.id, l.id, BillRole::Cosponsor)
            .await
            .expect("role");
        let evidence = store
            .evidence_bills(p.id, &[Topic::Housing])
            .await
            .expect("evidence");
        assert_eq!(evidence.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_source_links_collapse_by_url() {
        let store = MemStore::new();
        let id = Uuid::new_v4();
        let link = SourceLink {
            label: "profile".to_string(),
            url: "https://parliament.example/p/1".to_string(),
            external_id: None,
        };
        store
            .record_source_links(EntityKind::Parties, id, &[link.clone()])
            .await
            .expect("links");
        let relabeled = SourceLink {
            label: "website".to_string(),
            ..link
        };
        store
            .record_source_links(EntityKind::Parties, id, &[relabeled])
            .await
            .expect("links");
        assert_eq!(store.stats().await.source_links, 1);
    }
}
