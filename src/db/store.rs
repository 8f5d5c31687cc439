use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::warn;

use crate::db::models::{from_ms, to_ms, RawPayloadRow, TrackedEventRow};
use crate::error::Result;
use crate::types::{DerivedRecord, FetchedPayload, FinalMark, PayloadRef, RawPayload, TrackedEvent};

/// What an upsert did to the stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(PayloadRef),
    /// Body changed: revision bumped, row back to unprocessed.
    Updated(PayloadRef),
    /// Same body as stored. Nothing written.
    Unchanged,
}

/// Raw ingestion store plus derived-record and tracked-event persistence on
/// one SQLite pool. Cheap to clone; every method is safe under concurrent
/// callers writing different events.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `db_path` and run migrations.
    pub async fn connect(db_path: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(opts).await?;
        let store = Self::from_pool(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Raw payloads
    // -----------------------------------------------------------------------

    /// Idempotent on `(event_id, kind, body)`: re-storing an unchanged body
    /// leaves the row (and its processed flag) exactly as it was. With
    /// `keep_history` the row update and its history entry commit together.
    pub async fn upsert(&self, payload: &FetchedPayload, keep_history: bool) -> Result<UpsertOutcome> {
        let fetched_at = to_ms(payload.fetched_at);
        let mut tx = self.pool.begin().await?;
        let row: Option<(i64, i64)> = sqlx::query_as(
            r#"
            INSERT INTO raw_payloads (event_id, payload_kind, body, fetched_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(event_id, payload_kind) DO UPDATE SET
                body = excluded.body,
                fetched_at = excluded.fetched_at,
                revision = raw_payloads.revision + 1,
                processed = 0,
                processed_at = NULL,
                process_attempts = 0,
                last_error = NULL
            WHERE raw_payloads.body <> excluded.body
            RETURNING id, revision
            "#,
        )
        .bind(&payload.event_id)
        .bind(payload.kind.as_str())
        .bind(&payload.body)
        .bind(fetched_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((id, revision)) = row else {
            tx.commit().await?;
            return Ok(UpsertOutcome::Unchanged);
        };
        let payload_ref = PayloadRef { id, revision };

        if keep_history {
            sqlx::query(
                r#"
                INSERT INTO raw_payload_history
                    (payload_id, event_id, payload_kind, revision, body, fetched_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(id)
            .bind(&payload.event_id)
            .bind(payload.kind.as_str())
            .bind(revision)
            .bind(&payload.body)
            .bind(fetched_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(if revision == 1 {
            UpsertOutcome::Inserted(payload_ref)
        } else {
            UpsertOutcome::Updated(payload_ref)
        })
    }

    /// Oldest, least-failed first, so one poisoned payload cannot starve the rest.
    pub async fn list_unprocessed(&self, limit: i64) -> Result<Vec<RawPayload>> {
        let rows: Vec<RawPayloadRow> = sqlx::query_as(
            r#"
            SELECT id, event_id, payload_kind, body, fetched_at, revision, processed
            FROM raw_payloads
            WHERE processed = 0
            ORDER BY process_attempts ASC, fetched_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = row.id;
                let payload = row.into_payload();
                if payload.is_none() {
                    warn!(payload_id = id, "skipping raw payload with unknown kind");
                }
                payload
            })
            .collect())
    }

    /// Returns false when the row moved to a newer revision since it was
    /// read; that revision stays unprocessed.
    pub async fn mark_processed(&self, payload_ref: PayloadRef) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE raw_payloads
            SET processed = 1, processed_at = ?, last_error = NULL
            WHERE id = ? AND revision = ? AND processed = 0
            "#,
        )
        .bind(to_ms(Utc::now()))
        .bind(payload_ref.id)
        .bind(payload_ref.revision)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn record_failure(&self, payload_ref: PayloadRef, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE raw_payloads
            SET process_attempts = process_attempts + 1, last_error = ?
            WHERE id = ? AND revision = ?
            "#,
        )
        .bind(error)
        .bind(payload_ref.id)
        .bind(payload_ref.revision)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark every stored payload unprocessed so the derived set is rebuilt
    /// from stored bodies alone.
    pub async fn requeue_all(&self) -> Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE raw_payloads
            SET processed = 0, processed_at = NULL, process_attempts = 0, last_error = NULL
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    /// Delete processed payloads (and history) of events with no fetch since
    /// `cutoff`. Unprocessed payloads are never pruned.
    pub async fn prune(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let cutoff = to_ms(cutoff);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM raw_payload_history
            WHERE event_id IN (
                SELECT event_id FROM raw_payloads
                GROUP BY event_id
                HAVING MAX(fetched_at) < ? AND MIN(processed) = 1
            )
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        let res = sqlx::query(
            r#"
            DELETE FROM raw_payloads
            WHERE processed = 1 AND event_id IN (
                SELECT event_id FROM raw_payloads
                GROUP BY event_id
                HAVING MAX(fetched_at) < ?
            )
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(res.rows_affected())
    }

    pub async fn unprocessed_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_payloads WHERE processed = 0")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Derived records
    // -----------------------------------------------------------------------

    /// Overwrites any earlier record for the same source payload.
    pub async fn upsert_derived(&self, record: &DerivedRecord) -> Result<()> {
        let fields = serde_json::to_string(&record.fields)?;
        sqlx::query(
            r#"
            INSERT INTO derived_records (
                source_payload_id, source_revision, event_id, payload_kind,
                model_version, computed_at, fields
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_payload_id) DO UPDATE SET
                source_revision = excluded.source_revision,
                event_id = excluded.event_id,
                payload_kind = excluded.payload_kind,
                model_version = excluded.model_version,
                computed_at = excluded.computed_at,
                fields = excluded.fields
            "#,
        )
        .bind(record.source.id)
        .bind(record.source.revision)
        .bind(&record.event_id)
        .bind(record.kind.as_str())
        .bind(&record.model_version)
        .bind(to_ms(record.computed_at))
        .bind(fields)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stored `fields` text for one source payload, as written.
    pub async fn derived_fields(&self, source_payload_id: i64) -> Result<Option<String>> {
        let fields = sqlx::query_scalar("SELECT fields FROM derived_records WHERE source_payload_id = ?")
            .bind(source_payload_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(fields)
    }

    // -----------------------------------------------------------------------
    // Tracked events
    // -----------------------------------------------------------------------

    /// Upsert tracked events and, in the same transaction, the FINAL marks
    /// of any events among them.
    pub async fn save_tracked(&self, events: &[TrackedEvent], marks: &[FinalMark]) -> Result<()> {
        let now = to_ms(Utc::now());
        let mut tx = self.pool.begin().await?;
        for event in events {
            sqlx::query(
                r#"
                INSERT INTO tracked_events (event_id, scheduled_start, state, last_fetched_at, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(event_id) DO UPDATE SET
                    scheduled_start = excluded.scheduled_start,
                    state = excluded.state,
                    last_fetched_at = excluded.last_fetched_at,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&event.event_id)
            .bind(to_ms(event.scheduled_start))
            .bind(event.state.as_str())
            .bind(event.last_fetched_at.map(to_ms))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        for mark in marks {
            sqlx::query(
                r#"
                UPDATE tracked_events
                SET final_seen_at = ?, final_rechecked = ?
                WHERE event_id = ?
                "#,
            )
            .bind(to_ms(mark.seen_at))
            .bind(mark.rechecked)
            .bind(&mark.event_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// FINAL marks of events scheduled at or after `since`.
    pub async fn load_final_marks_since(&self, since: DateTime<Utc>) -> Result<Vec<FinalMark>> {
        let rows: Vec<(String, i64, bool)> = sqlx::query_as(
            r#"
            SELECT event_id, final_seen_at, final_rechecked
            FROM tracked_events
            WHERE scheduled_start >= ? AND final_seen_at IS NOT NULL
            ORDER BY event_id
            "#,
        )
        .bind(to_ms(since))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(event_id, seen_at, rechecked)| FinalMark {
                event_id,
                seen_at: from_ms(seen_at),
                rechecked,
            })
            .collect())
    }

    /// Most recently updated first.
    pub async fn load_tracked(&self, limit: i64) -> Result<Vec<TrackedEvent>> {
        let rows: Vec<TrackedEventRow> = sqlx::query_as(
            r#"
            SELECT event_id, scheduled_start, state, last_fetched_at
            FROM tracked_events
            ORDER BY updated_at DESC, scheduled_start DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().filter_map(TrackedEventRow::into_event).collect())
    }

    /// Events scheduled at or after `since`, for restoring state on startup.
    pub async fn load_tracked_since(&self, since: DateTime<Utc>) -> Result<Vec<TrackedEvent>> {
        let rows: Vec<TrackedEventRow> = sqlx::query_as(
            r#"
            SELECT event_id, scheduled_start, state, last_fetched_at
            FROM tracked_events
            WHERE scheduled_start >= ?
            ORDER BY scheduled_start ASC
            "#,
        )
        .bind(to_ms(since))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().filter_map(TrackedEventRow::into_event).collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{EventState, PayloadKind};
    use chrono::Duration;

    pub(crate) async fn memory_store() -> Store {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = Store::from_pool(pool);
        store.migrate().await.unwrap();
        store
    }

    fn payload(event_id: &str, kind: PayloadKind, body: &[u8]) -> FetchedPayload {
        FetchedPayload {
            event_id: event_id.to_string(),
            kind,
            body: body.to_vec(),
            fetched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn identical_upsert_is_a_noop() {
        let store = memory_store().await;
        let p = payload("g1", PayloadKind::PlayByPlay, b"{\"plays\":[]}");

        assert!(matches!(store.upsert(&p, false).await.unwrap(), UpsertOutcome::Inserted(_)));
        assert_eq!(store.upsert(&p, false).await.unwrap(), UpsertOutcome::Unchanged);

        let pending = store.list_unprocessed(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload_ref.revision, 1);
    }

    #[tokio::test]
    async fn unchanged_body_does_not_reopen_processed_row() {
        let store = memory_store().await;
        let p = payload("g1", PayloadKind::BoxScore, b"{}");
        let UpsertOutcome::Inserted(r) = store.upsert(&p, false).await.unwrap() else {
            panic!("expected insert");
        };
        assert!(store.mark_processed(r).await.unwrap());
        assert_eq!(store.upsert(&p, false).await.unwrap(), UpsertOutcome::Unchanged);
        assert!(store.list_unprocessed(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn changed_body_bumps_revision_and_reopens() {
        let store = memory_store().await;
        let UpsertOutcome::Inserted(first) =
            store.upsert(&payload("g1", PayloadKind::BoxScore, b"v1"), false).await.unwrap()
        else {
            panic!("expected insert");
        };
        store.mark_processed(first).await.unwrap();

        let outcome = store.upsert(&payload("g1", PayloadKind::BoxScore, b"v2"), false).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated(PayloadRef { id: first.id, revision: 2 }));

        let pending = store.list_unprocessed(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].body, b"v2");
    }

    #[tokio::test]
    async fn stale_revision_mark_is_ignored() {
        let store = memory_store().await;
        let UpsertOutcome::Inserted(stale) =
            store.upsert(&payload("g1", PayloadKind::PlayByPlay, b"v1"), false).await.unwrap()
        else {
            panic!("expected insert");
        };
        // A newer body lands while v1 is being scored.
        store.upsert(&payload("g1", PayloadKind::PlayByPlay, b"v2"), false).await.unwrap();

        assert!(!store.mark_processed(stale).await.unwrap());
        let pending = store.list_unprocessed(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload_ref.revision, 2);
    }

    #[tokio::test]
    async fn kinds_are_processed_independently() {
        let store = memory_store().await;
        store.upsert(&payload("g1", PayloadKind::PlayByPlay, b"a"), false).await.unwrap();
        store.upsert(&payload("g1", PayloadKind::BoxScore, b"b"), false).await.unwrap();

        let pending = store.list_unprocessed(10).await.unwrap();
        let boxscore = pending.iter().find(|p| p.kind == PayloadKind::BoxScore).unwrap();
        assert!(store.mark_processed(boxscore.payload_ref).await.unwrap());

        let pending = store.list_unprocessed(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, PayloadKind::PlayByPlay);
    }

    #[tokio::test]
    async fn failed_payloads_sort_last() {
        let store = memory_store().await;
        let mut early = payload("g1", PayloadKind::PlayByPlay, b"a");
        early.fetched_at = Utc::now() - Duration::minutes(5);
        store.upsert(&early, false).await.unwrap();
        store.upsert(&payload("g2", PayloadKind::PlayByPlay, b"b"), false).await.unwrap();

        let first = store.list_unprocessed(10).await.unwrap();
        assert_eq!(first[0].event_id, "g1");

        store.record_failure(first[0].payload_ref, "boom").await.unwrap();
        let next = store.list_unprocessed(10).await.unwrap();
        assert_eq!(next[0].event_id, "g2");
        assert_eq!(next[1].event_id, "g1");
    }

    #[tokio::test]
    async fn history_appends_distinct_bodies_only() {
        let store = memory_store().await;
        for body in [b"v1", b"v1", b"v2"] {
            store.upsert(&payload("g1", PayloadKind::BoxScore, body), true).await.unwrap();
        }
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_payload_history")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn failed_history_write_rolls_back_the_row_update() {
        let store = memory_store().await;
        store.upsert(&payload("g1", PayloadKind::BoxScore, b"v1"), true).await.unwrap();
        sqlx::query("DROP TABLE raw_payload_history")
            .execute(store.pool())
            .await
            .unwrap();

        let v2 = payload("g1", PayloadKind::BoxScore, b"v2");
        assert!(store.upsert(&v2, true).await.is_err());

        let pending = store.list_unprocessed(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].body, b"v1");
        assert_eq!(pending[0].payload_ref.revision, 1);

        // The body is still new to the store, so a later write lands it.
        assert!(matches!(store.upsert(&v2, false).await.unwrap(), UpsertOutcome::Updated(_)));
    }

    #[tokio::test]
    async fn prune_drops_only_old_processed_payloads() {
        let store = memory_store().await;
        let mut old = payload("old", PayloadKind::BoxScore, b"x");
        old.fetched_at = Utc::now() - Duration::days(30);
        let UpsertOutcome::Inserted(r) = store.upsert(&old, true).await.unwrap() else {
            panic!("expected insert");
        };
        store.mark_processed(r).await.unwrap();

        let mut old_pending = payload("old_pending", PayloadKind::BoxScore, b"y");
        old_pending.fetched_at = Utc::now() - Duration::days(30);
        store.upsert(&old_pending, false).await.unwrap();

        let pruned = store.prune(Utc::now() - Duration::days(14)).await.unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(store.unprocessed_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn requeue_reopens_everything() {
        let store = memory_store().await;
        let UpsertOutcome::Inserted(r) =
            store.upsert(&payload("g1", PayloadKind::BoxScore, b"x"), false).await.unwrap()
        else {
            panic!("expected insert");
        };
        store.mark_processed(r).await.unwrap();
        assert_eq!(store.requeue_all().await.unwrap(), 1);
        assert_eq!(store.unprocessed_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn tracked_events_round_trip() {
        let store = memory_store().await;
        let start = DateTime::from_timestamp_millis(1_730_588_400_000).unwrap();
        let mut live = TrackedEvent::new("g1", start, EventState::Live { paused: true });
        live.last_fetched_at = Some(start + Duration::minutes(20));
        store.save_tracked(&[live.clone()], &[]).await.unwrap();

        live.state = EventState::Final;
        let mark = FinalMark {
            event_id: "g1".to_string(),
            seen_at: start + Duration::hours(3),
            rechecked: true,
        };
        store.save_tracked(&[live.clone()], &[mark.clone()]).await.unwrap();

        let loaded = store.load_tracked(10).await.unwrap();
        assert_eq!(loaded, vec![live]);
        assert_eq!(store.load_final_marks_since(start).await.unwrap(), vec![mark]);
        assert!(store
            .load_final_marks_since(start + Duration::minutes(1))
            .await
            .unwrap()
            .is_empty());
    }
}
