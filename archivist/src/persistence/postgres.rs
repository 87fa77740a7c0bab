use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::debug;

use crate::config::PersistenceConfig;
use crate::entity::{AipEntity, AipId, AipState, SipEntity, SipId, SipState, Tenant};
use crate::store::{Changeset, EntityStore, PageRequest, SipFilter, StoreConflict};

const SCHEMA: &str = include_str!("../../migrations/0001_entities.sql");

const SIP_COLUMNS: &str =
    "id, sip_id, state, rejection_causes, session, provider_id, ingest_date, last_update, version";
const AIP_COLUMNS: &str = "id, aip_id, sip_id, state, error_message, last_update";

/// PostgreSQL-backed entity store.
///
/// Both tables carry a `tenant` column that every query filters on; a
/// [`Changeset`] is written in a single transaction. SIP upserts only touch
/// a row still at the snapshot's version, so a stale writer updates nothing
/// and the transaction is rolled back.
#[derive(Debug, Clone)]
pub struct PostgresEntityStore {
    pool: PgPool,
}

impl PostgresEntityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a connection pool sized by `config`.
    pub async fn connect(config: &PersistenceConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.connection_string)
            .await?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `sip_entity` and `aip_entity` tables if they are missing.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    fn sip_from_row(row: &PgRow) -> anyhow::Result<SipEntity> {
        let state: String = row.try_get("state")?;
        Ok(SipEntity::restore(
            row.try_get("id")?,
            SipId::new(row.try_get::<String, _>("sip_id")?),
            state.parse::<SipState>()?,
            row.try_get("rejection_causes")?,
            row.try_get("session")?,
            row.try_get("provider_id")?,
            row.try_get("ingest_date")?,
            row.try_get("last_update")?,
            row.try_get("version")?,
        ))
    }

    fn aip_from_row(row: &PgRow) -> anyhow::Result<AipEntity> {
        let state: String = row.try_get("state")?;
        Ok(AipEntity::restore(
            row.try_get("id")?,
            AipId::new(row.try_get::<String, _>("aip_id")?),
            SipId::new(row.try_get::<String, _>("sip_id")?),
            state.parse::<AipState>()?,
            row.try_get("error_message")?,
            row.try_get("last_update")?,
        ))
    }
}

#[async_trait]
impl EntityStore for PostgresEntityStore {
    async fn find_sip(
        &self,
        tenant: &Tenant,
        sip_id: &SipId,
    ) -> anyhow::Result<Option<SipEntity>> {
        let row = sqlx::query(&format!(
            "SELECT {SIP_COLUMNS} FROM sip_entity WHERE tenant = $1 AND sip_id = $2"
        ))
        .bind(tenant.as_str())
        .bind(sip_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::sip_from_row).transpose()
    }

    async fn search_sips(
        &self,
        tenant: &Tenant,
        filter: &SipFilter,
        page: PageRequest,
    ) -> anyhow::Result<Vec<SipEntity>> {
        let mut query = QueryBuilder::<Postgres>::new(format!(
            "SELECT {SIP_COLUMNS} FROM sip_entity WHERE tenant = "
        ));
        query.push_bind(tenant.as_str());

        if !filter.states.is_empty() {
            let states: Vec<&str> = filter.states.iter().map(SipState::as_str).collect();
            query.push(" AND state = ANY(");
            query.push_bind(states);
            query.push(")");
        }
        if let Some(session) = &filter.session {
            query.push(" AND session = ");
            query.push_bind(session.as_str());
        }
        if let Some(provider_id) = &filter.provider_id {
            query.push(" AND provider_id = ");
            query.push_bind(provider_id.as_str());
        }
        if let Some(ids) = &filter.sip_ids {
            let ids: Vec<&str> = ids.iter().map(SipId::as_str).collect();
            query.push(" AND sip_id = ANY(");
            query.push_bind(ids);
            query.push(")");
        }

        query.push(" ORDER BY id LIMIT ");
        query.push_bind(i64::try_from(page.limit)?);
        query.push(" OFFSET ");
        query.push_bind(i64::try_from(page.offset)?);

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::sip_from_row).collect()
    }

    async fn find_aip(
        &self,
        tenant: &Tenant,
        aip_id: &AipId,
    ) -> anyhow::Result<Option<AipEntity>> {
        let row = sqlx::query(&format!(
            "SELECT {AIP_COLUMNS} FROM aip_entity WHERE tenant = $1 AND aip_id = $2"
        ))
        .bind(tenant.as_str())
        .bind(aip_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::aip_from_row).transpose()
    }

    async fn find_aips_by_sip(
        &self,
        tenant: &Tenant,
        sip_id: &SipId,
    ) -> anyhow::Result<Vec<AipEntity>> {
        let rows = sqlx::query(&format!(
            "SELECT {AIP_COLUMNS} FROM aip_entity WHERE tenant = $1 AND sip_id = $2 ORDER BY id"
        ))
        .bind(tenant.as_str())
        .bind(sip_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::aip_from_row).collect()
    }

    async fn find_aips_by_state(
        &self,
        tenant: &Tenant,
        state: AipState,
        limit: usize,
    ) -> anyhow::Result<Vec<AipEntity>> {
        let rows = sqlx::query(&format!(
            "SELECT {AIP_COLUMNS} FROM aip_entity WHERE tenant = $1 AND state = $2 ORDER BY id LIMIT $3"
        ))
        .bind(tenant.as_str())
        .bind(state.as_str())
        .bind(i64::try_from(limit)?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::aip_from_row).collect()
    }

    async fn apply(&self, tenant: &Tenant, changes: Changeset) -> anyhow::Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;

        for sip in &changes.sips {
            let written = sqlx::query(
                r#"
                INSERT INTO sip_entity (
                    id, tenant, sip_id, state, rejection_causes,
                    session, provider_id, ingest_date, last_update, version
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10 + 1)
                ON CONFLICT (tenant, sip_id) DO UPDATE
                SET state = EXCLUDED.state,
                    rejection_causes = EXCLUDED.rejection_causes,
                    session = EXCLUDED.session,
                    provider_id = EXCLUDED.provider_id,
                    last_update = EXCLUDED.last_update,
                    version = EXCLUDED.version
                WHERE sip_entity.version = $10
                "#,
            )
            .bind(sip.id())
            .bind(tenant.as_str())
            .bind(sip.sip_id().as_str())
            .bind(sip.state().as_str())
            .bind(sip.rejection_causes())
            .bind(sip.session())
            .bind(sip.provider_id())
            .bind(sip.ingest_date())
            .bind(sip.last_update())
            .bind(sip.version())
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if written == 0 {
                // Dropping `tx` rolls back whatever this changeset wrote so far.
                debug!(tenant = %tenant, sip_id = %sip.sip_id(), "stale SIP snapshot");
                return Err(StoreConflict {
                    sip_id: sip.sip_id().clone(),
                    expected: sip.version(),
                }
                .into());
            }
        }

        for aip in &changes.aips {
            sqlx::query(
                r#"
                INSERT INTO aip_entity (
                    id, tenant, aip_id, sip_id, state, error_message, last_update
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (tenant, aip_id) DO UPDATE
                SET state = EXCLUDED.state,
                    error_message = EXCLUDED.error_message,
                    last_update = EXCLUDED.last_update
                "#,
            )
            .bind(aip.id())
            .bind(tenant.as_str())
            .bind(aip.aip_id().as_str())
            .bind(aip.sip_id().as_str())
            .bind(aip.state().as_str())
            .bind(aip.error_message())
            .bind(aip.last_update())
            .execute(&mut *tx)
            .await?;
        }

        if !changes.removed_aips.is_empty() {
            let ids: Vec<&str> = changes.removed_aips.iter().map(AipId::as_str).collect();
            let removed = sqlx::query("DELETE FROM aip_entity WHERE tenant = $1 AND aip_id = ANY($2)")
                .bind(tenant.as_str())
                .bind(&ids)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            debug!(tenant = %tenant, removed, "AIP rows removed");
        }

        tx.commit().await?;
        Ok(())
    }
}
