//! The reliable-message driver, grounded on `dtmsvr/trans_type_msg.go`: a
//! single forward pass over action-only branches, dispatched in creation
//! order, with no compensation phase at all.

use chrono::Utc;
use dtm_store::StatusUpdate;
use dtm_types::{Branch, BranchOp, BranchStatus, DtmResult, Global, GlobalStatus};

use crate::dispatcher::DispatchOutcome;

use super::{Driver, DriverContext};

pub struct MsgDriver;

#[async_trait::async_trait]
impl Driver for MsgDriver {
    fn gen_branches(&self, global: &Global) -> Vec<Branch> {
        global
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| Branch::new(&global.gid, Branch::format_branch_id(i + 1), BranchOp::Msg, step.action.clone(), step.payload.clone()))
            .collect()
    }

    async fn process_once(&self, ctx: &DriverContext, global: &Global, branches: Vec<Branch>) -> DtmResult<()> {
        if global.status != GlobalStatus::Submitted {
            return Ok(());
        }

        let mut ordered = branches;
        ordered.sort_by_key(|b| b.id);

        for i in 0..ordered.len() {
            if ordered[i].status != BranchStatus::Prepared {
                continue;
            }
            match ctx.dispatcher.exec_branch_and_touch(&ctx.store, global, &ordered[i], ctx.request_timeout).await {
                Ok(DispatchOutcome::Succeed) => {
                    ordered[i].status = BranchStatus::Succeed;
                    ordered[i].finish_time = Some(Utc::now());
                    let done = ordered[i].clone();
                    if ctx.writes_branch_status_synchronously(global) {
                        ctx.store.update_branches(std::slice::from_ref(&done), &["status", "finish_time"]).await?;
                    } else {
                        ctx.flusher.try_enqueue(done);
                    }
                }
                // messages retry forever until they succeed; a branch
                // endpoint that durably fails is a bug in the participant,
                // not a coordinator-level abort signal.
                Ok(DispatchOutcome::Ongoing) | Ok(DispatchOutcome::Failure) | Err(_) => return Ok(()),
            }
        }

        let all_done = ordered.iter().all(|b| b.status == BranchStatus::Succeed);
        if all_done {
            ctx.store
                .change_global_status(
                    &global.gid,
                    GlobalStatus::Submitted,
                    GlobalStatus::Succeed,
                    StatusUpdate { finish_time: Some(Utc::now()), rollback_time: None },
                )
                .await
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtm_types::{Protocol, Step, TransType};

    #[test]
    fn gen_branches_has_no_compensate_rows() {
        let mut g = Global::new("g1".into(), TransType::Msg, Protocol::Http);
        g.steps = vec![Step { action: "http://a".into(), compensate: None, payload: serde_json::json!({}) }];
        let branches = MsgDriver.gen_branches(&g);
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].op, BranchOp::Msg);
    }
}
