//! Postgres-backed sourcing store, job queue, advisory lock, bus and dead-letter queue.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sdp_core::{DocumentType, ParseEnumError, SourceDataProvider, Sport};
use sdp_storage::StoreError;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::bus::{BusError, DeliveryMode, Envelope, MessageBus, DEFAULT_VISIBILITY_TIMEOUT};
use crate::catalog::ResourceCatalogEntry;
use crate::dead_letter::{DeadLetterMessage, DeadLetterQueue};
use crate::store::{
    ExecutionMode, JobKind, JobQueue, JobStatus, QueuedJob, ResourceIndexItem, ScheduledJob,
    SourcingLock, SourcingStore, VisitOutcome,
};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    MIGRATOR.run(pool).await
}

fn parse_enum<T>(raw: String) -> Result<T, StoreError>
where
    T: FromStr<Err = ParseEnumError>,
{
    T::from_str(&raw).map_err(|e| StoreError::Invalid(e.to_string()))
}

fn catalog_from_row(row: &PgRow) -> Result<ResourceCatalogEntry, StoreError> {
    Ok(ResourceCatalogEntry {
        id: row.try_get("id")?,
        provider: parse_enum(row.try_get("provider")?)?,
        sport: parse_enum(row.try_get("sport")?)?,
        document_type: parse_enum(row.try_get("document_type")?)?,
        endpoint: row.try_get("endpoint")?,
        season_year: row.try_get("season_year")?,
        is_season_specific: row.try_get("is_season_specific")?,
        is_recurring: row.try_get("is_recurring")?,
        is_enabled: row.try_get("is_enabled")?,
        ordinal: row.try_get("ordinal")?,
        cron_expression: row.try_get("cron_expression")?,
        last_accessed_utc: row.try_get("last_accessed_utc")?,
        created_utc: row.try_get("created_utc")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<ScheduledJob, StoreError> {
    Ok(ScheduledJob {
        id: row.try_get("id")?,
        catalog_entry_id: row.try_get("catalog_entry_id")?,
        href: row.try_get("href")?,
        provider: parse_enum(row.try_get("provider")?)?,
        sport: parse_enum(row.try_get("sport")?)?,
        document_type: parse_enum(row.try_get("document_type")?)?,
        season_year: row.try_get("season_year")?,
        execution_mode: ExecutionMode::parse(row.try_get("execution_mode")?)?,
        start_utc: row.try_get("start_utc")?,
        end_utc: row.try_get("end_utc")?,
        polling_interval_secs: row.try_get("polling_interval_secs")?,
        max_attempts: row.try_get("max_attempts")?,
        attempt_count: row.try_get("attempt_count")?,
        status: JobStatus::parse(row.try_get("status")?)?,
        last_enqueued_utc: row.try_get("last_enqueued_utc")?,
        last_completed_utc: row.try_get("last_completed_utc")?,
        page_cursor: row.try_get("page_cursor")?,
        timeout_after_utc: row.try_get("timeout_after_utc")?,
        resource_index_id: row.try_get("resource_index_id")?,
        correlation_id: row.try_get("correlation_id")?,
        bypass_cache: row.try_get("bypass_cache")?,
    })
}

fn item_from_row(row: &PgRow) -> Result<ResourceIndexItem, StoreError> {
    let depth: i32 = row.try_get("depth")?;
    Ok(ResourceIndexItem {
        id: row.try_get("id")?,
        resource_index_id: row.try_get("resource_index_id")?,
        url: row.try_get("url")?,
        url_hash: row.try_get("url_hash")?,
        parent_item_id: row.try_get("parent_item_id")?,
        depth: depth.max(0) as u32,
        document_type: parse_enum(row.try_get("document_type")?)?,
        created_utc: row.try_get("created_utc")?,
        last_accessed_utc: row.try_get("last_accessed_utc")?,
        completed_utc: row.try_get("completed_utc")?,
    })
}

fn queued_from_row(row: &PgRow) -> Result<QueuedJob, StoreError> {
    let Json(kind): Json<JobKind> = row.try_get("kind")?;
    let attempts: i32 = row.try_get("attempts")?;
    Ok(QueuedJob {
        id: row.try_get("id")?,
        kind,
        run_at: row.try_get("run_at")?,
        attempts: attempts.max(0) as u32,
    })
}

async fn insert_catalog(
    tx: &mut Transaction<'_, Postgres>,
    entries: &[ResourceCatalogEntry],
) -> Result<usize, StoreError> {
    let mut inserted = 0;
    for entry in entries {
        let result = sqlx::query(
            r#"
            INSERT INTO sourcing.resource_catalog
                (id, provider, sport, document_type, endpoint, season_year, is_season_specific,
                 is_recurring, is_enabled, ordinal, cron_expression, last_accessed_utc, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (provider, sport, document_type, endpoint, is_recurring) DO NOTHING
            "#,
        )
        .bind(entry.id)
        .bind(entry.provider.as_str())
        .bind(entry.sport.to_string())
        .bind(entry.document_type.to_string())
        .bind(&entry.endpoint)
        .bind(entry.season_year)
        .bind(entry.is_season_specific)
        .bind(entry.is_recurring)
        .bind(entry.is_enabled)
        .bind(entry.ordinal)
        .bind(&entry.cron_expression)
        .bind(entry.last_accessed_utc)
        .bind(entry.created_utc)
        .execute(&mut **tx)
        .await?;
        inserted += result.rows_affected() as usize;
    }
    Ok(inserted)
}

const INSERT_JOB: &str = r#"
    INSERT INTO sourcing.scheduled_jobs
        (id, catalog_entry_id, href, provider, sport, document_type, season_year,
         execution_mode, start_utc, end_utc, polling_interval_secs, max_attempts,
         attempt_count, status, last_enqueued_utc, last_completed_utc, page_cursor,
         timeout_after_utc, resource_index_id, correlation_id, bypass_cache)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
            $18, $19, $20, $21)
"#;

fn bind_job<'q>(
    query: Query<'q, Postgres, PgArguments>,
    job: &'q ScheduledJob,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(job.id)
        .bind(job.catalog_entry_id)
        .bind(&job.href)
        .bind(job.provider.as_str())
        .bind(job.sport.to_string())
        .bind(job.document_type.to_string())
        .bind(job.season_year)
        .bind(job.execution_mode.as_str())
        .bind(job.start_utc)
        .bind(job.end_utc)
        .bind(job.polling_interval_secs)
        .bind(job.max_attempts)
        .bind(job.attempt_count)
        .bind(job.status.as_str())
        .bind(job.last_enqueued_utc)
        .bind(job.last_completed_utc)
        .bind(job.page_cursor)
        .bind(job.timeout_after_utc)
        .bind(job.resource_index_id)
        .bind(job.correlation_id)
        .bind(job.bypass_cache)
}

async fn write_job(tx: &mut Transaction<'_, Postgres>, job: &ScheduledJob) -> Result<(), StoreError> {
    let sql = format!(
        r#"{INSERT_JOB}
        ON CONFLICT (id) DO UPDATE SET
            start_utc = EXCLUDED.start_utc,
            end_utc = EXCLUDED.end_utc,
            polling_interval_secs = EXCLUDED.polling_interval_secs,
            max_attempts = EXCLUDED.max_attempts,
            attempt_count = EXCLUDED.attempt_count,
            status = EXCLUDED.status,
            last_enqueued_utc = EXCLUDED.last_enqueued_utc,
            last_completed_utc = EXCLUDED.last_completed_utc,
            page_cursor = EXCLUDED.page_cursor,
            timeout_after_utc = EXCLUDED.timeout_after_utc,
            resource_index_id = EXCLUDED.resource_index_id,
            correlation_id = EXCLUDED.correlation_id,
            bypass_cache = EXCLUDED.bypass_cache
        "#
    );
    bind_job(sqlx::query(&sql), job).execute(&mut **tx).await?;
    Ok(())
}

/// Inserts a seasonal job unless its tier slot is taken. A concurrent insert
/// of the same slot blocks here until the other transaction settles.
async fn insert_season_job(
    tx: &mut Transaction<'_, Postgres>,
    job: &ScheduledJob,
) -> Result<bool, StoreError> {
    let sql = format!(
        r#"{INSERT_JOB}
        ON CONFLICT (provider, sport, season_year, document_type)
            WHERE season_year IS NOT NULL DO NOTHING
        "#
    );
    let result = bind_job(sqlx::query(&sql), job).execute(&mut **tx).await?;
    Ok(result.rows_affected() == 1)
}

async fn push_job(
    tx: &mut Transaction<'_, Postgres>,
    kind: &JobKind,
    run_at: DateTime<Utc>,
) -> Result<Uuid, StoreError> {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO sourcing.job_queue (id, kind, run_at) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(Json(kind))
        .bind(run_at)
        .execute(&mut **tx)
        .await?;
    Ok(id)
}

/// Sourcing state in the `sourcing` schema. Advisory locks are held on
/// dedicated pool connections until released.
pub struct PgSourcingStore {
    pool: PgPool,
    held_locks: Mutex<HashMap<i64, PoolConnection<Postgres>>>,
}

impl PgSourcingStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            held_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SourcingStore for PgSourcingStore {
    async fn upsert_catalog(&self, entries: &[ResourceCatalogEntry]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted = insert_catalog(&mut tx, entries).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn catalog(
        &self,
        provider: SourceDataProvider,
        sport: Sport,
    ) -> Result<Vec<ResourceCatalogEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM sourcing.resource_catalog WHERE provider = $1 AND sport = $2 ORDER BY ordinal",
        )
        .bind(provider.as_str())
        .bind(sport.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(catalog_from_row).collect()
    }

    async fn touch_catalog(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE sourcing.resource_catalog SET last_accessed_utc = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn jobs_for_season(
        &self,
        provider: SourceDataProvider,
        sport: Sport,
        season_year: i32,
    ) -> Result<Vec<ScheduledJob>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM sourcing.scheduled_jobs
             WHERE provider = $1 AND sport = $2 AND season_year = $3
             ORDER BY start_utc
            "#,
        )
        .bind(provider.as_str())
        .bind(sport.to_string())
        .bind(season_year)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn save_schedule(
        &self,
        entries: &[ResourceCatalogEntry],
        jobs: &[ScheduledJob],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        insert_catalog(&mut tx, entries).await?;
        for job in jobs {
            write_job(&mut tx, job).await?;
            push_job(
                &mut tx,
                &JobKind::FireScheduledJob {
                    scheduled_job_id: job.id,
                },
                job.start_utc,
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn create_season_schedule(
        &self,
        entries: &[ResourceCatalogEntry],
        jobs: &[ScheduledJob],
    ) -> Result<Option<Uuid>, StoreError> {
        let mut tx = self.pool.begin().await?;
        insert_catalog(&mut tx, entries).await?;
        for job in jobs {
            if !insert_season_job(&mut tx, job).await? {
                tx.rollback().await?;
                let existing: Option<Uuid> = sqlx::query_scalar(
                    r#"
                    SELECT correlation_id FROM sourcing.scheduled_jobs
                     WHERE provider = $1 AND sport = $2 AND season_year = $3 AND document_type = $4
                    "#,
                )
                .bind(job.provider.as_str())
                .bind(job.sport.to_string())
                .bind(job.season_year)
                .bind(job.document_type.to_string())
                .fetch_optional(&self.pool)
                .await?;
                debug!(document_type = %job.document_type, "season slot already taken");
                let existing = existing.ok_or_else(|| {
                    StoreError::Invalid(format!("season slot for {} conflicted but is empty", job.href))
                })?;
                return Ok(Some(existing));
            }
            push_job(
                &mut tx,
                &JobKind::FireScheduledJob {
                    scheduled_job_id: job.id,
                },
                job.start_utc,
            )
            .await?;
        }
        tx.commit().await?;
        Ok(None)
    }

    async fn job(&self, id: Uuid) -> Result<Option<ScheduledJob>, StoreError> {
        let row = sqlx::query("SELECT * FROM sourcing.scheduled_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn update_job(&self, job: &ScheduledJob) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        write_job(&mut tx, job).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_visit(&self, item: ResourceIndexItem) -> Result<VisitOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO sourcing.resource_index_items
                (id, resource_index_id, url, url_hash, parent_item_id, depth, document_type,
                 created_utc, last_accessed_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (resource_index_id, url_hash)
                DO UPDATE SET last_accessed_utc = EXCLUDED.last_accessed_utc
            RETURNING *, (xmax = 0) AS inserted
            "#,
        )
        .bind(item.id)
        .bind(item.resource_index_id)
        .bind(&item.url)
        .bind(&item.url_hash)
        .bind(item.parent_item_id)
        .bind(item.depth as i32)
        .bind(item.document_type.to_string())
        .bind(item.created_utc)
        .bind(item.last_accessed_utc)
        .fetch_one(&self.pool)
        .await?;

        let inserted: bool = row.try_get("inserted")?;
        let stored = item_from_row(&row)?;
        Ok(if inserted {
            VisitOutcome::New(stored)
        } else {
            VisitOutcome::Revisited(stored)
        })
    }

    async fn complete_visit(
        &self,
        resource_index_id: Uuid,
        url_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE sourcing.resource_index_items
               SET completed_utc = $3
             WHERE resource_index_id = $1 AND url_hash = $2
            "#,
        )
        .bind(resource_index_id)
        .bind(url_hash)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn index_items(&self, resource_index_id: Uuid) -> Result<Vec<ResourceIndexItem>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM sourcing.resource_index_items
             WHERE resource_index_id = $1
             ORDER BY depth, created_utc
            "#,
        )
        .bind(resource_index_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }
}

#[async_trait]
impl JobQueue for PgSourcingStore {
    async fn enqueue(&self, kind: JobKind, run_at: DateTime<Utc>) -> Result<Uuid, StoreError> {
        let mut tx = self.pool.begin().await?;
        let id = push_job(&mut tx, &kind, run_at).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn dequeue(&self, now: DateTime<Utc>) -> Result<Option<QueuedJob>, StoreError> {
        let row = sqlx::query(
            r#"
            WITH next_job AS (
                SELECT id
                  FROM sourcing.job_queue
                 WHERE state = 'pending' AND run_at <= $1
                 ORDER BY run_at
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
            )
            UPDATE sourcing.job_queue
               SET state = 'leased', leased_utc = now()
             WHERE id IN (SELECT id FROM next_job)
            RETURNING id, kind, run_at, attempts
            "#,
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(queued_from_row).transpose()
    }

    async fn complete(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE sourcing.job_queue SET state = 'done' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reschedule(&self, id: Uuid, run_at: DateTime<Utc>, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE sourcing.job_queue
               SET state = 'pending', run_at = $2, attempts = attempts + 1, last_error = $3,
                   leased_utc = NULL
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(run_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn requeue(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE sourcing.job_queue SET state = 'pending', leased_utc = NULL WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE sourcing.job_queue
               SET state = 'failed', attempts = attempts + 1, last_error = $2
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM sourcing.job_queue WHERE state = 'pending'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }
}

#[async_trait]
impl SourcingLock for PgSourcingStore {
    async fn try_acquire(&self, key: i64) -> Result<bool, StoreError> {
        let mut held = self.held_locks.lock().await;
        if held.contains_key(&key) {
            return Ok(false);
        }
        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;
        if acquired {
            held.insert(key, conn);
        }
        Ok(acquired)
    }

    async fn release(&self, key: i64) -> Result<(), StoreError> {
        let conn = self.held_locks.lock().await.remove(&key);
        if let Some(mut conn) = conn {
            sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
                .bind(key)
                .fetch_one(&mut *conn)
                .await?;
            debug!(lock_key = key, "advisory lock released");
        }
        Ok(())
    }
}

/// Durable bus on `sourcing.bus_messages`. Receiving leases rows; acking deletes them.
#[derive(Clone)]
pub struct PgBus {
    pool: PgPool,
    visibility: std::time::Duration,
}

impl PgBus {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            visibility: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }

    pub fn with_visibility_timeout(mut self, visibility: std::time::Duration) -> Self {
        self.visibility = visibility;
        self
    }
}

#[async_trait]
impl MessageBus for PgBus {
    async fn publish(&self, envelope: Envelope) -> Result<(), BusError> {
        sqlx::query(
            r#"
            INSERT INTO sourcing.bus_messages
                (message_id, message_type, body, correlation_id, causation_id, delivery, published_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(envelope.message_id)
        .bind(&envelope.message_type)
        .bind(Json(&envelope.body))
        .bind(envelope.correlation_id)
        .bind(envelope.causation_id)
        .bind(envelope.delivery.as_str())
        .bind(envelope.published_utc)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn receive(&self, max: usize) -> Result<Vec<Envelope>, BusError> {
        let rows = sqlx::query(
            r#"
            UPDATE sourcing.bus_messages
               SET leased_until = now() + make_interval(secs => $2)
             WHERE id IN (
                SELECT id FROM sourcing.bus_messages
                 WHERE leased_until IS NULL OR leased_until <= now()
                 ORDER BY id
                 LIMIT $1
                 FOR UPDATE SKIP LOCKED
             )
            RETURNING *
            "#,
        )
        .bind(max as i64)
        .bind(self.visibility.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id").map_err(StoreError::from)?;
            out.push((id, envelope_from_row(&row).map_err(BusError::Store)?));
        }
        out.sort_by_key(|(id, _)| *id);
        Ok(out.into_iter().map(|(_, envelope)| envelope).collect())
    }

    async fn ack(&self, message_id: Uuid) -> Result<(), BusError> {
        sqlx::query(
            "DELETE FROM sourcing.bus_messages WHERE message_id = $1 AND leased_until IS NOT NULL",
        )
        .bind(message_id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn nack(&self, message_id: Uuid) -> Result<(), BusError> {
        sqlx::query("UPDATE sourcing.bus_messages SET leased_until = NULL WHERE message_id = $1")
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }
}

fn envelope_from_row(row: &PgRow) -> Result<Envelope, StoreError> {
    let Json(body): Json<Value> = row.try_get("body")?;
    let delivery: String = row.try_get("delivery")?;
    Ok(Envelope {
        message_id: row.try_get("message_id")?,
        message_type: row.try_get("message_type")?,
        body,
        correlation_id: row.try_get("correlation_id")?,
        causation_id: row.try_get("causation_id")?,
        delivery: DeliveryMode::parse(&delivery),
        published_utc: row.try_get("published_utc")?,
    })
}

#[derive(Clone)]
pub struct PgDeadLetterQueue {
    pool: PgPool,
}

impl PgDeadLetterQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterQueue for PgDeadLetterQueue {
    async fn push(&self, queue: &str, message: DeadLetterMessage) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sourcing.dead_letters
                (queue_name, message_type, envelope, error, attempt_count, failed_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(queue)
        .bind(&message.message_type)
        .bind(Json(&message.envelope))
        .bind(&message.error)
        .bind(message.attempt_count as i32)
        .bind(message.failed_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pull(&self, queue: &str, max: usize) -> Result<Vec<DeadLetterMessage>, StoreError> {
        let rows = sqlx::query(
            r#"
            DELETE FROM sourcing.dead_letters
             WHERE id IN (
                SELECT id FROM sourcing.dead_letters
                 WHERE queue_name = $1
                 ORDER BY id
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
             )
            RETURNING *
            "#,
        )
        .bind(queue)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let Json(envelope): Json<Value> = row.try_get("envelope")?;
            let attempt_count: i32 = row.try_get("attempt_count")?;
            out.push((
                id,
                DeadLetterMessage {
                    message_type: row.try_get("message_type")?,
                    envelope,
                    error: row.try_get("error")?,
                    attempt_count: attempt_count.max(0) as u32,
                    failed_utc: row.try_get("failed_utc")?,
                },
            ));
        }
        out.sort_by_key(|(id, _)| *id);
        Ok(out.into_iter().map(|(_, message)| message).collect())
    }

    async fn depth(&self, queue: &str) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM sourcing.dead_letters WHERE queue_name = $1")
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }
}
