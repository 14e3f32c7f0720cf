//! The branch barrier (component C2): a participant-side library that makes
//! a business service's local DB work idempotent, null-compensation-safe,
//! suspension-safe, and exactly-once for messages. No coupling to the
//! coordinator except via the shared `barrier` table's insert-ignore
//! semantics, grounded on `dtmcli/barrier.go`.

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub mod client;

use async_trait::async_trait;
use dtm_types::{BranchOp, DtmError, DtmResult};

#[cfg(feature = "postgres")]
pub use postgres::PostgresBarrierExecutor;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBarrierExecutor;

const MSG_RECOVERY_BRANCH_ID: &str = "00";
const MSG_RECOVERY_BARRIER_ID: &str = "01";

/// A participant DB transaction capable of the two primitives the barrier
/// needs: an insert-ignore into the barrier table, and reading back a
/// committed row's `reason`. Implementations own the local transaction and
/// commit or roll it back when `call` finishes.
#[async_trait]
pub trait BarrierExecutor: Send + Sized {
    async fn ensure_schema(&mut self) -> DtmResult<()>;

    /// Returns the number of rows the insert affected (0 if the unique key
    /// already existed).
    async fn insert_ignore(
        &mut self,
        trans_type: &str,
        gid: &str,
        branch_id: &str,
        op: &str,
        barrier_id: &str,
        reason: &str,
    ) -> DtmResult<u64>;

    async fn read_reason(&mut self, gid: &str, branch_id: &str, op: &str, barrier_id: &str) -> DtmResult<Option<String>>;

    async fn commit(self) -> DtmResult<()>;

    async fn rollback(self) -> DtmResult<()>;
}

/// Per-branch barrier state: the four-part key prefix plus a monotonically
/// incrementing `barrier_id` counter, one per participant call within this
/// branch's local process.
pub struct BranchBarrier {
    pub trans_type: String,
    pub gid: String,
    pub branch_id: String,
    pub op: BranchOp,
    next_barrier_id: u32,
}

impl BranchBarrier {
    pub fn new(trans_type: impl Into<String>, gid: impl Into<String>, branch_id: impl Into<String>, op: BranchOp) -> Self {
        BranchBarrier {
            trans_type: trans_type.into(),
            gid: gid.into(),
            branch_id: branch_id.into(),
            op,
            next_barrier_id: 0,
        }
    }

    fn new_barrier_id(&mut self) -> String {
        self.next_barrier_id += 1;
        format!("{:02}", self.next_barrier_id)
    }

    /// Runs `busi` inside the barrier's decision table:
    ///
    /// - null-compensation: `cancel`/`compensate` whose origin op's row was
    ///   freshly inserted (the forward call never ran) is a no-op success.
    /// - suspension / repeated request: a zero-affected insert on the
    ///   current op means an earlier call already handled this branch.
    /// - message exactly-once: `op = msg` with a zero-affected insert
    ///   returns `DtmError::Duplicated`.
    /// - otherwise `busi` runs, and the executor commits or rolls back
    ///   depending on its outcome.
    pub async fn call<E, F, Fut>(&mut self, mut exec: E, busi: F) -> DtmResult<()>
    where
        E: BarrierExecutor,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = DtmResult<()>>,
    {
        exec.ensure_schema().await?;
        let bid = self.new_barrier_id();

        let origin_affected = match self.op.origin_op() {
            Some(origin_op) => {
                exec.insert_ignore(&self.trans_type, &self.gid, &self.branch_id, origin_op.as_str(), &bid, self.op.as_str())
                    .await?
            }
            None => 0,
        };
        let current_affected = exec
            .insert_ignore(&self.trans_type, &self.gid, &self.branch_id, self.op.as_str(), &bid, self.op.as_str())
            .await?;

        if self.op == BranchOp::Msg && current_affected == 0 {
            exec.commit().await?;
            return Err(DtmError::Duplicated);
        }

        let null_compensation = matches!(self.op, BranchOp::Cancel | BranchOp::Compensate) && origin_affected > 0;
        let suspended = current_affected == 0;
        if null_compensation || suspended {
            exec.commit().await?;
            return Ok(());
        }

        match busi().await {
            Ok(()) => {
                exec.commit().await?;
                Ok(())
            }
            Err(e) => {
                exec.rollback().await?;
                Err(e)
            }
        }
    }

    /// The message recovery probe: inserts a sentinel `(gid, "00", "msg",
    /// "01")` row tagged `reason="rollback"`. If that row already existed
    /// with `reason="rollback"`, a prior failure was committed and the
    /// caller must treat the business call as failed.
    pub async fn query_prepared<E: BarrierExecutor>(&self, mut exec: E) -> DtmResult<()> {
        exec.ensure_schema().await?;
        exec.insert_ignore(&self.trans_type, &self.gid, MSG_RECOVERY_BRANCH_ID, "msg", MSG_RECOVERY_BARRIER_ID, "rollback")
            .await?;
        let reason = exec
            .read_reason(&self.gid, MSG_RECOVERY_BRANCH_ID, "msg", MSG_RECOVERY_BARRIER_ID)
            .await?;
        exec.commit().await?;
        if reason.as_deref() == Some("rollback") {
            return Err(DtmError::Failure);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// An in-memory `BarrierExecutor` for exercising the decision table
    /// without a real database, mirroring a hand-rolled fake rather than a
    /// live backend.
    struct FakeExecutor {
        rows: std::collections::HashSet<(String, String, String, String)>,
        reasons: std::collections::HashMap<(String, String, String, String), String>,
        committed: std::cell::Cell<bool>,
    }

    impl FakeExecutor {
        fn new() -> Self {
            FakeExecutor {
                rows: Default::default(),
                reasons: Default::default(),
                committed: std::cell::Cell::new(false),
            }
        }
    }

    #[async_trait]
    impl BarrierExecutor for FakeExecutor {
        async fn ensure_schema(&mut self) -> DtmResult<()> {
            Ok(())
        }

        async fn insert_ignore(
            &mut self,
            _trans_type: &str,
            gid: &str,
            branch_id: &str,
            op: &str,
            barrier_id: &str,
            reason: &str,
        ) -> DtmResult<u64> {
            let key = (gid.to_string(), branch_id.to_string(), op.to_string(), barrier_id.to_string());
            if self.rows.insert(key.clone()) {
                self.reasons.insert(key, reason.to_string());
                Ok(1)
            } else {
                Ok(0)
            }
        }

        async fn read_reason(&mut self, gid: &str, branch_id: &str, op: &str, barrier_id: &str) -> DtmResult<Option<String>> {
            let key = (gid.to_string(), branch_id.to_string(), op.to_string(), barrier_id.to_string());
            Ok(self.reasons.get(&key).cloned())
        }

        async fn commit(self) -> DtmResult<()> {
            self.committed.set(true);
            Ok(())
        }

        async fn rollback(self) -> DtmResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn forward_action_runs_busi_once() {
        let mut bb = BranchBarrier::new("saga", "g1", "01", BranchOp::Action);
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = calls.clone();
        bb.call(FakeExecutor::new(), || async move {
            c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn compensate_before_action_is_null_compensation() {
        let mut bb = BranchBarrier::new("saga", "g1", "01", BranchOp::Compensate);
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = calls.clone();
        bb.call(FakeExecutor::new(), || async move {
            c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0, "null-compensation must skip busi");
    }

    #[tokio::test]
    async fn repeated_action_is_suspended_after_compensate() {
        let mut exec_rows = FakeExecutor::new();
        // Simulate a compensate having already run by pre-populating its row.
        exec_rows
            .insert_ignore("saga", "g1", "01", "action", "01", "compensate")
            .await
            .unwrap();

        let mut bb = BranchBarrier::new("saga", "g1", "01", BranchOp::Action);
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = calls.clone();
        bb.call(exec_rows, || async move {
            c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0, "suspended forward call must skip busi");
    }

    #[tokio::test]
    async fn repeated_msg_returns_duplicated() {
        let mut exec = FakeExecutor::new();
        exec.insert_ignore("msg", "g1", "01", "msg", "01", "msg").await.unwrap();

        let mut bb = BranchBarrier::new("msg", "g1", "01", BranchOp::Msg);
        let result = bb.call(exec, || async { Ok(()) }).await;
        assert!(matches!(result, Err(DtmError::Duplicated)));
    }
}
