//! Durable persistence for globals and branches, and the conditional-update
//! discipline (`change_global_status`, `lock_global_save_branches`,
//! `lock_one_global`) every cross-row invariant in the engine rides on.
//!
//! Two backends live behind the `postgres` and `sqlite` Cargo features,
//! mirroring the way the workspace's ancestor crate split storage drivers.

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dtm_types::{Branch, DtmResult, Global, GlobalStatus};

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// A page of `scan_globals`: the rows plus the cursor to pass for the next
/// page, `None` once exhausted.
pub struct GlobalPage {
    pub globals: Vec<Global>,
    pub next_cursor: Option<i64>,
}

/// The mutation bundle for `change_global_status`: the new status plus the
/// terminal timestamps it may also set in the same conditional update.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub finish_time: Option<DateTime<Utc>>,
    pub rollback_time: Option<DateTime<Utc>>,
}

/// Durable store contract (component C1). Every write that touches a
/// `status` column is conditional on the caller's expected prior status so
/// that a preempted lease holder observes `DtmError::NotFound` instead of
/// silently clobbering a newer write.
#[async_trait]
pub trait Store: Send + Sync {
    async fn find_global(&self, gid: &str) -> DtmResult<Option<Global>>;

    async fn scan_globals(&self, cursor: Option<i64>, limit: i64) -> DtmResult<GlobalPage>;

    /// Ordered by insertion id, which pairs SAGA `(compensate, action)` rows
    /// per step; drivers rely on this ordering.
    async fn find_branches(&self, gid: &str) -> DtmResult<Vec<Branch>>;

    /// Atomically inserts `global` and `branches`. A duplicate `gid` is
    /// reported as `DtmError::UniqueConflict` and nothing is written.
    async fn save_new(&self, global: &Global, branches: &[Branch]) -> DtmResult<()>;

    /// Upserts by branch primary key `(gid, branch_id, op)`, writing only
    /// `updated_columns`. Returns the number of rows touched.
    async fn update_branches(&self, branches: &[Branch], updated_columns: &[&str]) -> DtmResult<u64>;

    /// Acquires a row-level write lock on the global confirming
    /// `status = expected_status`, then inserts/overwrites `branches` in the
    /// same transaction. `DtmError::NotFound` if the global is absent or its
    /// status differs.
    async fn lock_global_save_branches(
        &self,
        gid: &str,
        expected_status: GlobalStatus,
        branches: &[Branch],
    ) -> DtmResult<()>;

    /// Conditional update: matches on `(gid, status = old_status)`. Fails
    /// with `DtmError::NotFound` if zero rows were affected.
    async fn change_global_status(
        &self,
        gid: &str,
        old_status: GlobalStatus,
        new_status: GlobalStatus,
        updates: StatusUpdate,
    ) -> DtmResult<()>;

    /// Updates `next_cron_time`/`next_cron_interval`/`update_time`
    /// conditional on `(gid, status)`.
    async fn touch_cron_time(
        &self,
        gid: &str,
        status: GlobalStatus,
        next_cron_time: DateTime<Utc>,
        next_cron_interval: i64,
    ) -> DtmResult<()>;

    /// The lease acquisition: selects one global whose status is
    /// dispatchable and whose `next_cron_time` is within `expire_in`
    /// seconds, sets a fresh `owner` token and pushes `next_cron_time`
    /// forward by `retry_interval` seconds, all in one conditional UPDATE.
    async fn lock_one_global(&self, expire_in: i64, retry_interval: i64) -> DtmResult<Option<Global>>;
}

/// A fresh random lease-owner token, the Rust counterpart of the original's
/// per-acquisition UUID.
pub fn gen_owner() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub(crate) fn dispatchable_statuses() -> [GlobalStatus; 3] {
    [GlobalStatus::Prepared, GlobalStatus::Submitted, GlobalStatus::Aborting]
}
