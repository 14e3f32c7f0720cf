//! The transaction engine (component C5): the four public operations a
//! coordinator exposes to clients — `prepare`, `submit`, `abort`,
//! `register_branch` — grounded on `dtmsvr/api.go`. `submit`/`abort` hand the
//! global straight to its driver for a first pass: with `wait_result` set the
//! caller blocks for it and gets `Failure` unless the global actually reached
//! its target terminal status; otherwise the pass runs in the background and
//! the caller returns immediately, leaving the outcome to the next cron tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dtm_store::{Store, StatusUpdate};
use dtm_types::{Branch, BranchOp, DtmError, DtmResult, Global, GlobalStatus, TransType};

use crate::dispatcher::Dispatcher;
use crate::drivers::{driver_for, DriverContext};
use crate::flusher::FlushHandle;

pub struct TransactionEngine {
    store: Arc<dyn Store>,
    dispatcher: Dispatcher,
    flusher: FlushHandle,
    update_branch_sync: bool,
}

impl TransactionEngine {
    pub fn new(store: Arc<dyn Store>, dispatcher: Dispatcher, flusher: FlushHandle, update_branch_sync: bool) -> Self {
        TransactionEngine { store, dispatcher, flusher, update_branch_sync }
    }

    fn ctx(&self, global: &Global) -> DriverContext {
        let request_timeout = if global.options.request_timeout > 0 {
            Duration::from_secs(global.options.request_timeout as u64)
        } else {
            Duration::from_secs(10)
        };
        DriverContext {
            store: self.store.clone(),
            dispatcher: self.dispatcher.clone(),
            request_timeout,
            flusher: self.flusher.clone(),
            update_branch_sync: self.update_branch_sync,
        }
    }

    /// Runs one driver pass for `global`. When `wait_result` is unset the
    /// pass moves to a background task and the caller is told `Ok` right
    /// away; when set, the caller blocks for the pass and then re-checks
    /// the persisted status, reporting `Failure` unless it reached
    /// `want_status` — a completed pass is not the same as a successful one.
    async fn drive(&self, global: Global, branches: Vec<Branch>, want_status: GlobalStatus) -> DtmResult<()> {
        let wait_result = global.options.wait_result;
        let ctx = self.ctx(&global);
        let driver = driver_for(global.trans_type);

        if !wait_result {
            let gid = global.gid.clone();
            tokio::spawn(async move {
                if let Err(e) = driver.process_once(&ctx, &global, branches).await {
                    tracing::warn!(gid = %gid, error = %e, "background driver pass failed, cron will retry");
                }
            });
            return Ok(());
        }

        let gid = global.gid.clone();
        driver.process_once(&ctx, &global, branches).await?;
        let refreshed = self.store.find_global(&gid).await?.ok_or(DtmError::NotFound)?;
        if refreshed.status == want_status {
            Ok(())
        } else {
            Err(DtmError::Failure)
        }
    }

    /// Saves `global` with status `prepared`. A repeat `prepare` for an
    /// already-`prepared` gid is idempotent; any other existing status is a
    /// `Failure`.
    pub async fn prepare(&self, mut global: Global) -> DtmResult<()> {
        global.status = GlobalStatus::Prepared;
        let branches = driver_for(global.trans_type).gen_branches(&global);
        match self.store.save_new(&global, &branches).await {
            Ok(()) => Ok(()),
            Err(DtmError::UniqueConflict) => {
                let existing = self.store.find_global(&global.gid).await?.ok_or(DtmError::NotFound)?;
                if existing.status == GlobalStatus::Prepared {
                    Ok(())
                } else {
                    Err(DtmError::Failure)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Saves `global` with status `submitted`, or promotes an existing
    /// `prepared` row to `submitted`, then drives one synchronous pass.
    pub async fn submit(&self, mut global: Global) -> DtmResult<()> {
        global.status = GlobalStatus::Submitted;
        let branches = driver_for(global.trans_type).gen_branches(&global);

        let branches = match self.store.save_new(&global, &branches).await {
            Ok(()) => branches,
            Err(DtmError::UniqueConflict) => {
                let existing = self.store.find_global(&global.gid).await?.ok_or(DtmError::NotFound)?;
                if existing.status == GlobalStatus::Prepared {
                    self.store
                        .change_global_status(&global.gid, GlobalStatus::Prepared, GlobalStatus::Submitted, StatusUpdate::default())
                        .await?;
                    self.store.find_branches(&global.gid).await?
                } else if existing.status == GlobalStatus::Submitted {
                    self.store.find_branches(&global.gid).await?
                } else {
                    return Err(DtmError::Failure);
                }
            }
            Err(e) => return Err(e),
        };

        self.drive(global, branches, GlobalStatus::Succeed).await
    }

    /// Rolls back a transaction. A `msg` transaction still in `prepared`
    /// never ran its second phase, so it moves straight to `failed`: there
    /// is nothing to compensate. `saga` cannot be aborted directly — only
    /// a branch failure drives it into `aborting`.
    pub async fn abort(&self, gid: &str) -> DtmResult<()> {
        let global = self.store.find_global(gid).await?.ok_or(DtmError::NotFound)?;

        if global.trans_type == TransType::Msg && global.status == GlobalStatus::Prepared {
            return self
                .store
                .change_global_status(gid, GlobalStatus::Prepared, GlobalStatus::Failed, StatusUpdate { rollback_time: Some(chrono::Utc::now()), ..Default::default() })
                .await;
        }

        if !matches!(global.trans_type, TransType::Tcc | TransType::Xa) || !matches!(global.status, GlobalStatus::Prepared | GlobalStatus::Aborting) {
            return Err(DtmError::Failure);
        }

        if global.status == GlobalStatus::Prepared {
            self.store.change_global_status(gid, GlobalStatus::Prepared, GlobalStatus::Aborting, StatusUpdate::default()).await?;
        }

        let mut global = global;
        global.status = GlobalStatus::Aborting;
        let branches = self.store.find_branches(gid).await?;
        self.drive(global, branches, GlobalStatus::Failed).await
    }

    /// Registers the confirm/cancel (TCC) or commit/rollback (XA) endpoints
    /// for one `try`-phase branch, conditional on the global still being
    /// `prepared`. Grounded on `svcRegisterBranch`.
    pub async fn register_branch(&self, trans_type: TransType, branch: &Branch, data: &HashMap<String, String>) -> DtmResult<()> {
        let (backward_op, forward_op) = match trans_type {
            TransType::Tcc => (BranchOp::Cancel, BranchOp::Confirm),
            TransType::Xa => (BranchOp::Rollback, BranchOp::Commit),
            _ => return Err(DtmError::driver(format!("unknown trans type for register_branch: {}", trans_type.as_str()))),
        };

        let backward_url = data.get(backward_op.as_str()).or_else(|| data.get("url")).cloned().unwrap_or_default();
        let forward_url = data.get(forward_op.as_str()).or_else(|| data.get("url")).cloned().unwrap_or_default();

        let mut cancel_branch = branch.clone();
        cancel_branch.op = backward_op;
        cancel_branch.url = backward_url;
        let mut confirm_branch = branch.clone();
        confirm_branch.op = forward_op;
        confirm_branch.url = forward_url;

        match self.store.lock_global_save_branches(&branch.gid, GlobalStatus::Prepared, &[cancel_branch, confirm_branch]).await {
            Ok(()) => Ok(()),
            Err(DtmError::NotFound) => Err(DtmError::Failure),
            Err(e) => Err(e),
        }
    }
}
