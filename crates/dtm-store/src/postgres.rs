//! Postgres-backed store.
//!
//! Feature-gated behind `postgres`; grounded on the schema-bootstrap and
//! unique-violation-detection pattern of this workspace's ancestor
//! Postgres repository, adapted to the globals/branches schema and made
//! natively async since the coordinator is tokio-based end to end.

use std::str::FromStr;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dtm_types::{
    Branch, BranchOp, BranchStatus, CustomData, DtmError, DtmResult, Ext, Global, GlobalStatus,
    Protocol, Step, TransOptions, TransType,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::{dispatchable_statuses, gen_owner, GlobalPage, Store, StatusUpdate};

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(e) if e.code().as_deref() == Some("23505"))
}

fn parse_global_row(row: &sqlx::postgres::PgRow) -> DtmResult<Global> {
    Ok(Global {
        id: row.try_get("id")?,
        gid: row.try_get("gid")?,
        trans_type: TransType::from_str(row.try_get::<String, _>("trans_type")?.as_str())?,
        status: GlobalStatus::from_str(row.try_get::<String, _>("status")?.as_str())?,
        protocol: Protocol::from_str(row.try_get::<String, _>("protocol")?.as_str())?,
        query_prepared: row.try_get("query_prepared")?,
        steps: serde_json::from_str::<Vec<Step>>(row.try_get::<String, _>("steps_json")?.as_str())
            .map_err(DtmError::driver)?,
        options: serde_json::from_str::<TransOptions>(row.try_get::<String, _>("options_json")?.as_str())
            .map_err(DtmError::driver)?,
        custom_data: serde_json::from_str::<CustomData>(row.try_get::<String, _>("custom_data_json")?.as_str())
            .map_err(DtmError::driver)?,
        ext: serde_json::from_str::<Ext>(row.try_get::<String, _>("ext_json")?.as_str()).map_err(DtmError::driver)?,
        owner: row.try_get("owner")?,
        next_cron_time: row.try_get("next_cron_time")?,
        next_cron_interval: row.try_get("next_cron_interval")?,
        create_time: row.try_get("create_time")?,
        update_time: row.try_get("update_time")?,
        finish_time: row.try_get("finish_time")?,
        rollback_time: row.try_get("rollback_time")?,
    })
}

fn parse_branch_row(row: &sqlx::postgres::PgRow) -> DtmResult<Branch> {
    Ok(Branch {
        id: row.try_get("id")?,
        gid: row.try_get("gid")?,
        branch_id: row.try_get("branch_id")?,
        op: BranchOp::from_str(row.try_get::<String, _>("op")?.as_str())?,
        url: row.try_get("url")?,
        bin_data: serde_json::from_str(row.try_get::<String, _>("bin_data_json")?.as_str()).map_err(DtmError::driver)?,
        status: BranchStatus::from_str(row.try_get::<String, _>("status")?.as_str())?,
        finish_time: row.try_get("finish_time")?,
        rollback_time: row.try_get("rollback_time")?,
    })
}

pub struct PostgresStore {
    pool: PgPool,
    schema_ready: OnceLock<Result<(), String>>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, schema_ready: OnceLock::new() }
    }

    pub async fn connect(database_url: &str) -> DtmResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| DtmError::driver(format!("connect postgres: {e}")))?;
        Ok(Self::new(pool))
    }

    /// Embedded schema bootstrap: `CREATE TABLE IF NOT EXISTS`, run once per
    /// process and re-runnable via the CLI's `-r` flag. This is the
    /// in-process substitute for an external `.sql` migration runner.
    pub async fn ensure_schema(&self) -> DtmResult<()> {
        if let Some(result) = self.schema_ready.get() {
            return result.clone().map_err(DtmError::driver);
        }
        let result = self.create_schema().await.map_err(|e| e.to_string());
        let _ = self.schema_ready.set(result.clone());
        result.map_err(DtmError::driver)
    }

    /// Drops and recreates both tables, the counterpart of `PopulateDB`'s
    /// `skipDrop: false` path. Only ever called from the `-r` CLI flag.
    pub async fn reset_schema(&self) -> DtmResult<()> {
        sqlx::query("DROP TABLE IF EXISTS branches").execute(&self.pool).await?;
        sqlx::query("DROP TABLE IF EXISTS globals").execute(&self.pool).await?;
        self.create_schema().await.map_err(DtmError::from)?;
        let _ = self.schema_ready.set(Ok(()));
        Ok(())
    }

    async fn create_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS globals (
                id BIGSERIAL PRIMARY KEY,
                gid TEXT NOT NULL UNIQUE,
                trans_type TEXT NOT NULL,
                status TEXT NOT NULL,
                protocol TEXT NOT NULL,
                query_prepared TEXT NOT NULL DEFAULT '',
                steps_json TEXT NOT NULL DEFAULT '[]',
                options_json TEXT NOT NULL DEFAULT '{}',
                custom_data_json TEXT NOT NULL DEFAULT '{}',
                ext_json TEXT NOT NULL DEFAULT '{}',
                owner TEXT NOT NULL DEFAULT '',
                next_cron_time TIMESTAMPTZ NOT NULL,
                next_cron_interval BIGINT NOT NULL,
                create_time TIMESTAMPTZ NOT NULL,
                update_time TIMESTAMPTZ NOT NULL,
                finish_time TIMESTAMPTZ,
                rollback_time TIMESTAMPTZ
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_globals_status_cron ON globals(status, next_cron_time)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS branches (
                id BIGSERIAL PRIMARY KEY,
                gid TEXT NOT NULL,
                branch_id TEXT NOT NULL,
                op TEXT NOT NULL,
                url TEXT NOT NULL DEFAULT '',
                bin_data_json TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL,
                finish_time TIMESTAMPTZ,
                rollback_time TIMESTAMPTZ,
                UNIQUE(gid, branch_id, op)
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_branches_gid ON branches(gid)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn find_global(&self, gid: &str) -> DtmResult<Option<Global>> {
        self.ensure_schema().await?;
        let row = sqlx::query("SELECT * FROM globals WHERE gid = $1")
            .bind(gid)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_global_row).transpose()
    }

    async fn scan_globals(&self, cursor: Option<i64>, limit: i64) -> DtmResult<GlobalPage> {
        self.ensure_schema().await?;
        let cursor = cursor.unwrap_or(i64::MAX);
        let rows = sqlx::query("SELECT * FROM globals WHERE id < $1 ORDER BY id DESC LIMIT $2")
            .bind(cursor)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        let globals = rows.iter().map(parse_global_row).collect::<DtmResult<Vec<_>>>()?;
        let next_cursor = if (globals.len() as i64) < limit { None } else { globals.last().map(|g| g.id) };
        Ok(GlobalPage { globals, next_cursor })
    }

    async fn find_branches(&self, gid: &str) -> DtmResult<Vec<Branch>> {
        self.ensure_schema().await?;
        let rows = sqlx::query("SELECT * FROM branches WHERE gid = $1 ORDER BY id ASC")
            .bind(gid)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(parse_branch_row).collect()
    }

    async fn save_new(&self, global: &Global, branches: &[Branch]) -> DtmResult<()> {
        self.ensure_schema().await?;
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO globals (gid, trans_type, status, protocol, query_prepared, steps_json,
                options_json, custom_data_json, ext_json, owner, next_cron_time, next_cron_interval,
                create_time, update_time)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)
             ON CONFLICT (gid) DO NOTHING",
        )
        .bind(&global.gid)
        .bind(global.trans_type.as_str())
        .bind(global.status.as_str())
        .bind(global.protocol.as_str())
        .bind(&global.query_prepared)
        .bind(serde_json::to_string(&global.steps).map_err(DtmError::driver)?)
        .bind(serde_json::to_string(&global.options).map_err(DtmError::driver)?)
        .bind(serde_json::to_string(&global.custom_data).map_err(DtmError::driver)?)
        .bind(serde_json::to_string(&global.ext).map_err(DtmError::driver)?)
        .bind(&global.owner)
        .bind(global.next_cron_time)
        .bind(global.next_cron_interval)
        .bind(global.create_time)
        .bind(global.update_time)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(DtmError::UniqueConflict);
        }

        for b in branches {
            sqlx::query(
                "INSERT INTO branches (gid, branch_id, op, url, bin_data_json, status)
                 VALUES ($1,$2,$3,$4,$5,$6)
                 ON CONFLICT (gid, branch_id, op) DO NOTHING",
            )
            .bind(&b.gid)
            .bind(&b.branch_id)
            .bind(b.op.as_str())
            .bind(&b.url)
            .bind(serde_json::to_string(&b.bin_data).map_err(DtmError::driver)?)
            .bind(b.status.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| if is_unique_violation(&e) { DtmError::UniqueConflict } else { e.into() })?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update_branches(&self, branches: &[Branch], updated_columns: &[&str]) -> DtmResult<u64> {
        self.ensure_schema().await?;
        let mut total = 0u64;
        for b in branches {
            let mut set_clauses = Vec::new();
            for (i, col) in updated_columns.iter().enumerate() {
                set_clauses.push(format!("{col} = ${}", i + 4));
            }
            let sql = format!(
                "UPDATE branches SET {} WHERE gid = $1 AND branch_id = $2 AND op = $3",
                set_clauses.join(", ")
            );
            let mut q = sqlx::query(&sql).bind(&b.gid).bind(&b.branch_id).bind(b.op.as_str());
            for col in updated_columns {
                q = match *col {
                    "status" => q.bind(b.status.as_str()),
                    "finish_time" => q.bind(b.finish_time),
                    "rollback_time" => q.bind(b.rollback_time),
                    "update_time" => q.bind(Utc::now()),
                    other => return Err(DtmError::driver(format!("unsupported branch column: {other}"))),
                };
            }
            total += q.execute(&self.pool).await?.rows_affected();
        }
        Ok(total)
    }

    async fn lock_global_save_branches(
        &self,
        gid: &str,
        expected_status: GlobalStatus,
        branches: &[Branch],
    ) -> DtmResult<()> {
        self.ensure_schema().await?;
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT id FROM globals WHERE gid = $1 AND status = $2 FOR UPDATE")
            .bind(gid)
            .bind(expected_status.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        if row.is_none() {
            return Err(DtmError::NotFound);
        }
        for b in branches {
            sqlx::query(
                "INSERT INTO branches (gid, branch_id, op, url, bin_data_json, status)
                 VALUES ($1,$2,$3,$4,$5,$6)
                 ON CONFLICT (gid, branch_id, op) DO UPDATE SET
                    url = excluded.url, bin_data_json = excluded.bin_data_json, status = excluded.status",
            )
            .bind(&b.gid)
            .bind(&b.branch_id)
            .bind(b.op.as_str())
            .bind(&b.url)
            .bind(serde_json::to_string(&b.bin_data).map_err(DtmError::driver)?)
            .bind(b.status.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn change_global_status(
        &self,
        gid: &str,
        old_status: GlobalStatus,
        new_status: GlobalStatus,
        updates: StatusUpdate,
    ) -> DtmResult<()> {
        self.ensure_schema().await?;
        let affected = sqlx::query(
            "UPDATE globals SET status = $1, update_time = $2,
                finish_time = COALESCE($3, finish_time),
                rollback_time = COALESCE($4, rollback_time)
             WHERE gid = $5 AND status = $6",
        )
        .bind(new_status.as_str())
        .bind(Utc::now())
        .bind(updates.finish_time)
        .bind(updates.rollback_time)
        .bind(gid)
        .bind(old_status.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if affected == 0 {
            return Err(DtmError::NotFound);
        }
        Ok(())
    }

    async fn touch_cron_time(
        &self,
        gid: &str,
        status: GlobalStatus,
        next_cron_time: DateTime<Utc>,
        next_cron_interval: i64,
    ) -> DtmResult<()> {
        self.ensure_schema().await?;
        let affected = sqlx::query(
            "UPDATE globals SET next_cron_time = $1, next_cron_interval = $2, update_time = $3
             WHERE gid = $4 AND status = $5",
        )
        .bind(next_cron_time)
        .bind(next_cron_interval)
        .bind(Utc::now())
        .bind(gid)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if affected == 0 {
            return Err(DtmError::NotFound);
        }
        Ok(())
    }

    async fn lock_one_global(&self, expire_in: i64, retry_interval: i64) -> DtmResult<Option<Global>> {
        self.ensure_schema().await?;
        let owner = gen_owner();
        let statuses: Vec<&str> = dispatchable_statuses().iter().map(|s| s.as_str()).collect();
        let next_cron_time = Utc::now() + chrono::Duration::seconds(retry_interval);
        let affected = sqlx::query(
            "UPDATE globals SET owner = $1, next_cron_time = $2
             WHERE id = (
                SELECT id FROM globals
                WHERE status = ANY($3) AND next_cron_time < $4
                ORDER BY id ASC LIMIT 1 FOR UPDATE SKIP LOCKED
             )",
        )
        .bind(&owner)
        .bind(next_cron_time)
        .bind(&statuses)
        .bind(Utc::now() + chrono::Duration::seconds(expire_in))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Ok(None);
        }

        let row = sqlx::query("SELECT * FROM globals WHERE owner = $1")
            .bind(&owner)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_global_row).transpose()
    }
}

#[cfg(test)]
mod tests {
    //! Exercised via `dtm-store`'s shared contract test in `sqlite.rs`; a
    //! live Postgres suite would additionally run `assert_store_contract`
    //! here behind a `DTM_TEST_POSTGRES_URL` environment variable, mirroring
    //! the ancestor repository's opt-in Postgres test gate.
}
