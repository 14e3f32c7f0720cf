//! Postgres-backed `BarrierExecutor`, feature-gated behind `postgres`.

use async_trait::async_trait;
use dtm_types::{DtmError, DtmResult};
use sqlx::{PgPool, Row};

use crate::BarrierExecutor;

pub struct PostgresBarrierExecutor {
    tx: sqlx::Transaction<'static, sqlx::Postgres>,
}

impl PostgresBarrierExecutor {
    pub async fn begin(pool: &PgPool) -> DtmResult<Self> {
        let tx = pool.begin().await?;
        Ok(PostgresBarrierExecutor { tx })
    }

    pub async fn ensure_schema_on(pool: &PgPool) -> DtmResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS barrier (
                id BIGSERIAL PRIMARY KEY,
                trans_type TEXT NOT NULL,
                gid TEXT NOT NULL,
                branch_id TEXT NOT NULL,
                op TEXT NOT NULL,
                barrier_id TEXT NOT NULL,
                reason TEXT NOT NULL,
                create_time TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE (gid, branch_id, op, barrier_id)
            )",
        )
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BarrierExecutor for PostgresBarrierExecutor {
    async fn ensure_schema(&mut self) -> DtmResult<()> {
        // Schema is bootstrapped once per pool via `ensure_schema_on`, not
        // per transaction; a participant wires that call into its own
        // startup alongside its business schema migrations.
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
             VALUES ($1,$2,$3,$4,$5,$6)
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
        let row = sqlx::query("SELECT reason FROM barrier WHERE gid=$1 AND branch_id=$2 AND op=$3 AND barrier_id=$4")
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
