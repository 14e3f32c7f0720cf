//! SQLite-backed `BarrierExecutor`, feature-gated behind `sqlite`.

use async_trait::async_trait;
use dtm_types::{DtmError, DtmResult};
use sqlx::{Row, SqlitePool};

use crate::BarrierExecutor;

pub struct SqliteBarrierExecutor {
    tx: sqlx::Transaction<'static, sqlx::Sqlite>,
}

impl SqliteBarrierExecutor {
    pub async fn begin(pool: &SqlitePool) -> DtmResult<Self> {
        let tx = pool.begin().await?;
        Ok(SqliteBarrierExecutor { tx })
    }

    pub async fn ensure_schema_on(pool: &SqlitePool) -> DtmResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS barrier (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trans_type TEXT NOT NULL,
                gid TEXT NOT NULL,
                branch_id TEXT NOT NULL,
                op TEXT NOT NULL,
                barrier_id TEXT NOT NULL,
                reason TEXT NOT NULL,
                UNIQUE (gid, branch_id, op, barrier_id)
            )",
        )
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BarrierExecutor for SqliteBarrierExecutor {
    async fn ensure_schema(&mut self) -> DtmResult<()> {
        Ok(())
    }

    async fn insert_ignore(
        &mut self,
        trans_type: &str,
        gid: &str,
        branch_id: &str,
        op: &str,
        barrier_id: &str,
        reason: &str,
    ) -> DtmResult<u64> {
        let affected = sqlx::query(
            "INSERT INTO barrier (trans_type, gid, branch_id, op, barrier_id, reason)
             VALUES (?,?,?,?,?,?)
             ON CONFLICT (gid, branch_id, op, barrier_id) DO NOTHING",
        )
        .bind(trans_type)
        .bind(gid)
        .bind(branch_id)
        .bind(op)
        .bind(barrier_id)
        .bind(reason)
        .execute(&mut *self.tx)
        .await
        .map_err(DtmError::from)?
        .rows_affected();
        Ok(affected)
    }

    async fn read_reason(&mut self, gid: &str, branch_id: &str, op: &str, barrier_id: &str) -> DtmResult<Option<String>> {
        let row = sqlx::query("SELECT reason FROM barrier WHERE gid=? AND branch_id=? AND op=? AND barrier_id=?")
            .bind(gid)
            .bind(branch_id)
            .bind(op)
            .bind(barrier_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("reason")))
    }

    async fn commit(self) -> DtmResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> DtmResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use dtm_types::BranchOp;
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;
    use crate::BranchBarrier;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new().max_connections(1).connect("sqlite::memory:").await.unwrap();
        SqliteBarrierExecutor::ensure_schema_on(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn action_then_compensate_on_real_sqlite_is_total() {
        let pool = pool().await;
        let gid = dtm_types::gen_gid();

        let mut action = BranchBarrier::new("saga", &gid, "01", BranchOp::Action);
        action
            .call(SqliteBarrierExecutor::begin(&pool).await.unwrap(), || async { Ok(()) })
            .await
            .unwrap();

        let mut compensate = BranchBarrier::new("saga", &gid, "01", BranchOp::Compensate);
        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let r = ran.clone();
        compensate
            .call(SqliteBarrierExecutor::begin(&pool).await.unwrap(), || async move {
                r.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst), "compensate after a real action must run");
    }

    #[tokio::test]
    async fn query_prepared_reports_failure_once_rollback_row_exists() {
        let pool = pool().await;
        let gid = dtm_types::gen_gid();
        let bb = BranchBarrier::new("msg", &gid, "00", BranchOp::Msg);

        bb.query_prepared(SqliteBarrierExecutor::begin(&pool).await.unwrap()).await.unwrap();
        let result = bb.query_prepared(SqliteBarrierExecutor::begin(&pool).await.unwrap()).await;
        assert!(matches!(result, Err(DtmError::Failure)));
    }
}
