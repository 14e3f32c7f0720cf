//! The TCC driver, grounded on `dtmsvr/trans_type_tcc.go`. XA reuses this
//! driver's drive loop unchanged; only the op pair it confirms/cancels
//! through differs (`Commit`/`Rollback` for XA, registered by
//! `register_branch` per the data-model distinction at the client SDK
//! layer, not here).

use chrono::Utc;
use dtm_store::StatusUpdate;
use dtm_types::{Branch, BranchOp, BranchStatus, DtmResult, Global, GlobalStatus, TransType};

use crate::dispatcher::DispatchOutcome;

use super::{Driver, DriverContext};

pub struct TccDriver;

#[async_trait::async_trait]
impl Driver for TccDriver {
    fn gen_branches(&self, _global: &Global) -> Vec<Branch> {
        // TCC branches are registered incrementally via `register_branch`
        // as each Try succeeds, not generated up front from a step list.
        Vec::new()
    }

    async fn process_once(&self, ctx: &DriverContext, global: &Global, branches: Vec<Branch>) -> DtmResult<()> {
        if global.status.is_terminal() {
            return Ok(());
        }

        let mut global = global.clone();
        if global.status == GlobalStatus::Prepared {
            if Utc::now() >= global.create_time + chrono::Duration::seconds(global.options.timeout_to_fail) {
                ctx.store
                    .change_global_status(&global.gid, GlobalStatus::Prepared, GlobalStatus::Aborting, StatusUpdate::default())
                    .await?;
                global.status = GlobalStatus::Aborting;
            } else {
                return Ok(());
            }
        }

        let (forward_op, backward_op) = match global.trans_type {
            TransType::Xa => (BranchOp::Commit, BranchOp::Rollback),
            _ => (BranchOp::Confirm, BranchOp::Cancel),
        };
        let op = if global.status == GlobalStatus::Submitted { forward_op } else { backward_op };

        let mut targets: Vec<&Branch> = branches.iter().filter(|b| b.op == op && b.status == BranchStatus::Prepared).collect();
        targets.sort_by(|a, b| b.id.cmp(&a.id));

        for branch in targets {
            let outcome = ctx.dispatcher.exec_branch_and_touch(&ctx.store, &global, branch, ctx.request_timeout).await;
            match outcome {
                Ok(DispatchOutcome::Succeed) => {
                    let mut done = branch.clone();
                    done.status = BranchStatus::Succeed;
                    done.finish_time = Some(Utc::now());
                    if ctx.writes_branch_status_synchronously(&global) {
                        ctx.store.update_branches(std::slice::from_ref(&done), &["status", "finish_time"]).await?;
                    } else {
                        ctx.flusher.try_enqueue(done);
                    }
                }
                Ok(DispatchOutcome::Ongoing) | Err(_) => {
                    // leave prepared; cron retries the whole pass later
                    return Ok(());
                }
                Ok(DispatchOutcome::Failure) => {
                    // confirm/cancel endpoints are not supposed to report
                    // business failure; treat identically to ongoing and retry.
                    return Ok(());
                }
            }
        }

        let all_done = branches.iter().filter(|b| b.op == op).all(|b| b.status == BranchStatus::Succeed);
        if !all_done {
            return Ok(());
        }

        match global.status {
            GlobalStatus::Submitted => {
                ctx.store
                    .change_global_status(
                        &global.gid,
                        GlobalStatus::Submitted,
                        GlobalStatus::Succeed,
                        StatusUpdate { finish_time: Some(Utc::now()), rollback_time: None },
                    )
                    .await
            }
            GlobalStatus::Aborting => {
                ctx.store
                    .change_global_status(
                        &global.gid,
                        GlobalStatus::Aborting,
                        GlobalStatus::Failed,
                        StatusUpdate { finish_time: None, rollback_time: Some(Utc::now()) },
                    )
                    .await
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtm_types::{Protocol, TransType};

    #[test]
    fn xa_uses_commit_rollback_tcc_uses_confirm_cancel() {
        let tcc_pair = match TransType::Tcc {
            TransType::Xa => (BranchOp::Commit, BranchOp::Rollback),
            _ => (BranchOp::Confirm, BranchOp::Cancel),
        };
        assert_eq!(tcc_pair, (BranchOp::Confirm, BranchOp::Cancel));
        let xa_pair = match TransType::Xa {
            TransType::Xa => (BranchOp::Commit, BranchOp::Rollback),
            _ => (BranchOp::Confirm, BranchOp::Cancel),
        };
        assert_eq!(xa_pair, (BranchOp::Commit, BranchOp::Rollback));
    }

    #[test]
    fn gen_branches_is_empty_for_tcc() {
        let g = Global::new("g1".into(), TransType::Tcc, Protocol::Http);
        assert!(TccDriver.gen_branches(&g).is_empty());
    }
}
