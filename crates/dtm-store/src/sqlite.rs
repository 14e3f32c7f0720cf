//! SQLite-backed store, feature-gated behind `sqlite`. Used for local
//! development and as the fast contract-test backend, the same role the
//! SQLite implementation plays in this workspace's ancestor crate.

use std::str::FromStr;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dtm_types::{
    Branch, BranchOp, BranchStatus, CustomData, DtmError, DtmResult, Ext, Global, GlobalStatus,
    Protocol, Step, TransOptions, TransType,
};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use crate::{dispatchable_statuses, gen_owner, GlobalPage, Store, StatusUpdate};

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(e) if e.code().as_deref() == Some("2067") || e.code().as_deref() == Some("1555"))
}

fn parse_global_row(row: &sqlx::sqlite::SqliteRow) -> DtmResult<Global> {
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

fn parse_branch_row(row: &sqlx::sqlite::SqliteRow) -> DtmResult<Branch> {
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

pub struct SqliteStore {
    pool: SqlitePool,
    schema_ready: OnceLock<Result<(), String>>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, schema_ready: OnceLock::new() }
    }

    pub async fn connect(database_url: &str) -> DtmResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .map_err(|e| DtmError::driver(format!("connect sqlite: {e}")))?;
        Ok(Self::new(pool))
    }

    pub async fn in_memory() -> DtmResult<Self> {
        Self::connect("sqlite::memory:").await
    }

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
                id INTEGER PRIMARY KEY AUTOINCREMENT,
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
                next_cron_time TEXT NOT NULL,
                next_cron_interval INTEGER NOT NULL,
                create_time TEXT NOT NULL,
                update_time TEXT NOT NULL,
                finish_time TEXT,
                rollback_time TEXT
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_globals_status_cron ON globals(status, next_cron_time)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS branches (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                gid TEXT NOT NULL,
                branch_id TEXT NOT NULL,
                op TEXT NOT NULL,
                url TEXT NOT NULL DEFAULT '',
                bin_data_json TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL,
                update_time TEXT,
                finish_time TEXT,
                rollback_time TEXT,
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
impl Store for SqliteStore {
    async fn find_global(&self, gid: &str) -> DtmResult<Option<Global>> {
        self.ensure_schema().await?;
        let row = sqlx::query("SELECT * FROM globals WHERE gid = ?")
            .bind(gid)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_global_row).transpose()
    }

    async fn scan_globals(&self, cursor: Option<i64>, limit: i64) -> DtmResult<GlobalPage> {
        self.ensure_schema().await?;
        let cursor = cursor.unwrap_or(i64::MAX);
        let rows = sqlx::query("SELECT * FROM globals WHERE id < ? ORDER BY id DESC LIMIT ?")
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
        let rows = sqlx::query("SELECT * FROM branches WHERE gid = ? ORDER BY id ASC")
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
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?)
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
                 VALUES (?,?,?,?,?,?)
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
            let set_clauses: Vec<String> = updated_columns.iter().map(|c| format!("{c} = ?")).collect();
            let sql = format!(
                "UPDATE branches SET {} WHERE gid = ? AND branch_id = ? AND op = ?",
                set_clauses.join(", ")
            );
            let mut q = sqlx::query(&sql);
            for col in updated_columns {
                q = match *col {
                    "status" => q.bind(b.status.as_str()),
                    "finish_time" => q.bind(b.finish_time),
                    "rollback_time" => q.bind(b.rollback_time),
                    "update_time" => q.bind(Utc::now()),
                    other => return Err(DtmError::driver(format!("unsupported branch column: {other}"))),
                };
            }
            q = q.bind(&b.gid).bind(&b.branch_id).bind(b.op.as_str());
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
        let row = sqlx::query("SELECT id FROM globals WHERE gid = ? AND status = ?")
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
                 VALUES (?,?,?,?,?,?)
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
            "UPDATE globals SET status = ?, update_time = ?,
                finish_time = COALESCE(?, finish_time),
                rollback_time = COALESCE(?, rollback_time)
             WHERE gid = ? AND status = ?",
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
            "UPDATE globals SET next_cron_time = ?, next_cron_interval = ?, update_time = ?
             WHERE gid = ? AND status = ?",
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
        let statuses = dispatchable_statuses();
        let next_cron_time = Utc::now() + chrono::Duration::seconds(retry_interval);
        let expire_at = Utc::now() + chrono::Duration::seconds(expire_in);

        let affected = sqlx::query(
            "UPDATE globals SET owner = ?, next_cron_time = ?
             WHERE id = (
                SELECT id FROM globals
                WHERE status IN (?, ?, ?) AND next_cron_time < ?
                ORDER BY id ASC LIMIT 1
             )",
        )
        .bind(&owner)
        .bind(next_cron_time)
        .bind(statuses[0].as_str())
        .bind(statuses[1].as_str())
        .bind(statuses[2].as_str())
        .bind(expire_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Ok(None);
        }

        let row = sqlx::query("SELECT * FROM globals WHERE owner = ?")
            .bind(&owner)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_global_row).transpose()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use dtm_types::{BranchOp, Protocol, TransType};

    use super::*;

    async fn assert_store_contract(store: &SqliteStore) {
        let gid = dtm_types::gen_gid();
        let mut global = Global::new(gid.clone(), TransType::Saga, Protocol::Http);
        global.next_cron_time = Utc::now() - Duration::seconds(1);
        let branches = vec![
            Branch::new(&gid, "01", BranchOp::Compensate, "", serde_json::json!({})),
            Branch::new(&gid, "01", BranchOp::Action, "http://a", serde_json::json!({"x":1})),
        ];

        store.save_new(&global, &branches).await.expect("save_new");
        assert!(matches!(store.save_new(&global, &branches).await, Err(DtmError::UniqueConflict)));

        let found = store.find_global(&gid).await.expect("find_global").expect("present");
        assert_eq!(found.status, GlobalStatus::Prepared);

        let found_branches = store.find_branches(&gid).await.expect("find_branches");
        assert_eq!(found_branches.len(), 2);
        assert_eq!(found_branches[0].op, BranchOp::Compensate);

        store
            .change_global_status(&gid, GlobalStatus::Prepared, GlobalStatus::Submitted, StatusUpdate::default())
            .await
            .expect("change status");
        assert!(matches!(
            store
                .change_global_status(&gid, GlobalStatus::Prepared, GlobalStatus::Submitted, StatusUpdate::default())
                .await,
            Err(DtmError::NotFound)
        ));

        let locked = store.lock_one_global(3600, 10).await.expect("lock_one_global").expect("a row");
        assert_eq!(locked.gid, gid);
        assert!(!locked.owner.is_empty());

        let locked_again = store.lock_one_global(0, 10).await.expect("lock_one_global second call");
        assert!(locked_again.is_none() || locked_again.unwrap().gid != gid);
    }

    #[tokio::test]
    async fn store_contract_holds_on_sqlite() {
        let store = SqliteStore::in_memory().await.expect("in-memory sqlite");
        assert_store_contract(&store).await;
    }

    #[tokio::test]
    async fn lock_global_save_branches_rejects_wrong_status() {
        let store = SqliteStore::in_memory().await.expect("in-memory sqlite");
        let gid = dtm_types::gen_gid();
        let global = Global::new(gid.clone(), TransType::Tcc, Protocol::Http);
        store.save_new(&global, &[]).await.expect("save_new");

        let result = store
            .lock_global_save_branches(&gid, GlobalStatus::Submitted, &[])
            .await;
        assert!(matches!(result, Err(DtmError::NotFound)));

        store
            .lock_global_save_branches(&gid, GlobalStatus::Prepared, &[
                Branch::new(&gid, "01", BranchOp::Cancel, "", serde_json::json!({})),
                Branch::new(&gid, "01", BranchOp::Confirm, "", serde_json::json!({})),
            ])
            .await
            .expect("lock_global_save_branches");

        let branches = store.find_branches(&gid).await.expect("find_branches");
        assert_eq!(branches.len(), 2);
    }
}
