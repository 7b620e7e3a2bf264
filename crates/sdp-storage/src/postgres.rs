//! Postgres persistence context. Each sport family maps to its own schema.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sdp_core::{CanonicalEntity, IntegrationEvent, SourceDataProvider, SportFamily};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::context::{
    CommitReceipt, DataContext, FamilyMarker, OutboxMessage, OutboxStore, Query, SchemaFamily,
    StagedEvent, StoreError, TeamSportContext, TeamSportSchema, UnitOfWork,
};

pub struct PgContext<F> {
    pool: PgPool,
    _family: FamilyMarker<F>,
}

impl<F> Clone for PgContext<F> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _family: Default::default(),
        }
    }
}

impl<F: SchemaFamily> PgContext<F> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _family: Default::default(),
        }
    }

    fn schema() -> &'static str {
        F::FAMILY.schema()
    }
}

#[async_trait]
impl<F: SchemaFamily> DataContext for PgContext<F> {
    type Work = PgUnitOfWork;

    fn family(&self) -> SportFamily {
        F::FAMILY
    }

    async fn begin(&self) -> Result<Self::Work, StoreError> {
        Ok(PgUnitOfWork {
            tx: self.pool.begin().await?,
            schema: Self::schema(),
            staged: Vec::new(),
            written: 0,
        })
    }
}

impl TeamSportContext for PgContext<TeamSportSchema> {}

pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
    schema: &'static str,
    staged: Vec<StagedEvent>,
    written: usize,
}

fn decode<T: CanonicalEntity>(row: &sqlx::postgres::PgRow) -> Result<T, StoreError> {
    let Json(body): Json<Value> = row.try_get("body")?;
    Ok(serde_json::from_value(body)?)
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn find<T: CanonicalEntity>(&mut self, id: Uuid) -> Result<Option<T>, StoreError> {
        let sql = format!(
            "SELECT body FROM {}.canonical_entities WHERE id = $1 AND kind = $2",
            self.schema
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(T::KIND)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(decode::<T>).transpose()
    }

    async fn find_by_external_id<T: CanonicalEntity>(
        &mut self,
        provider: SourceDataProvider,
        value: &str,
    ) -> Result<Option<T>, StoreError> {
        let sql = format!(
            r#"
            SELECT e.body
              FROM {schema}.external_ids x
              JOIN {schema}.canonical_entities e ON e.id = x.entity_id
             WHERE x.kind = $1
               AND x.provider = $2
               AND x.value = $3
            "#,
            schema = self.schema
        );
        let row = sqlx::query(&sql)
            .bind(T::KIND)
            .bind(provider.as_str())
            .bind(value)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(decode::<T>).transpose()
    }

    async fn query<T: CanonicalEntity>(&mut self, query: &Query) -> Result<Vec<T>, StoreError> {
        let sql = format!(
            "SELECT body FROM {}.canonical_entities WHERE kind = $1 AND body @> $2",
            self.schema
        );
        let rows = sqlx::query(&sql)
            .bind(T::KIND)
            .bind(Json(query.as_json()))
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(decode::<T>).collect()
    }

    async fn upsert<T: CanonicalEntity>(&mut self, entity: &T) -> Result<(), StoreError> {
        let body = serde_json::to_value(entity)?;
        let sql = format!(
            r#"
            INSERT INTO {}.canonical_entities (id, kind, body, created_utc, modified_utc)
            VALUES ($1, $2, $3, now(), now())
            ON CONFLICT (id) DO UPDATE
               SET body = EXCLUDED.body,
                   modified_utc = now()
            "#,
            self.schema
        );
        sqlx::query(&sql)
            .bind(entity.id())
            .bind(T::KIND)
            .bind(Json(body))
            .execute(&mut *self.tx)
            .await?;

        let sql = format!(
            r#"
            INSERT INTO {}.external_ids (kind, provider, value, entity_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (kind, provider, value) DO UPDATE
               SET entity_id = external_ids.entity_id
            RETURNING entity_id
            "#,
            self.schema
        );
        for ext in entity.external_ids() {
            let owner: Uuid = sqlx::query(&sql)
                .bind(T::KIND)
                .bind(ext.provider.as_str())
                .bind(&ext.value)
                .bind(entity.id())
                .fetch_one(&mut *self.tx)
                .await?
                .try_get("entity_id")?;
            if owner != entity.id() {
                return Err(StoreError::ExternalIdConflict {
                    kind: T::KIND,
                    provider: ext.provider,
                    value: ext.value.clone(),
                    existing: owner,
                });
            }
        }

        self.written += 1;
        Ok(())
    }

    fn stage<E: IntegrationEvent>(&mut self, event: &E) -> Result<(), StoreError> {
        self.staged.push(StagedEvent::from_event(event)?);
        Ok(())
    }

    fn staged_count(&self) -> usize {
        self.staged.len()
    }

    async fn commit(mut self) -> Result<CommitReceipt, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO {}.outbox_messages
                (message_id, message_type, body, correlation_id, causation_id, enqueue_time)
            VALUES ($1, $2, $3, $4, $5, now())
            "#,
            self.schema
        );
        for event in &self.staged {
            sqlx::query(&sql)
                .bind(event.message_id)
                .bind(&event.message_type)
                .bind(Json(&event.body))
                .bind(event.correlation_id)
                .bind(event.causation_id)
                .execute(&mut *self.tx)
                .await?;
        }

        let receipt = CommitReceipt {
            entities_written: self.written,
            events_staged: self.staged.len(),
        };
        self.tx.commit().await?;
        Ok(receipt)
    }
}

#[async_trait]
impl<F: SchemaFamily> OutboxStore for PgContext<F> {
    async fn fetch_unsent(&self, limit: usize) -> Result<Vec<OutboxMessage>, StoreError> {
        let sql = format!(
            r#"
            SELECT sequence_number, message_id, message_type, body,
                   correlation_id, causation_id, enqueue_time, sent_time
              FROM {}.outbox_messages
             WHERE sent_time IS NULL
             ORDER BY sequence_number
             LIMIT $1
            "#,
            Self::schema()
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let Json(body): Json<Value> = row.try_get("body")?;
            out.push(OutboxMessage {
                sequence_number: row.try_get("sequence_number")?,
                message_id: row.try_get("message_id")?,
                message_type: row.try_get("message_type")?,
                body,
                correlation_id: row.try_get("correlation_id")?,
                causation_id: row.try_get("causation_id")?,
                enqueue_time: row.try_get("enqueue_time")?,
                sent_time: row.try_get("sent_time")?,
            });
        }
        Ok(out)
    }

    async fn mark_sent(
        &self,
        sequence_number: i64,
        sent_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {}.outbox_messages SET sent_time = $2 WHERE sequence_number = $1",
            Self::schema()
        );
        sqlx::query(&sql)
            .bind(sequence_number)
            .bind(sent_time)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_sent(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let sql = format!(
            "DELETE FROM {}.outbox_messages WHERE sent_time IS NOT NULL AND sent_time < $1",
            Self::schema()
        );
        let result = sqlx::query(&sql)
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
