//! The SAGA driver, grounded on `dtmsvr/trans_type_saga.go`: a forward pass
//! of actions, a compensation pass of compensates on failure, both gated by
//! the optional concurrency hints in `custom_data`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dtm_store::StatusUpdate;
use dtm_types::{Branch, BranchOp, BranchStatus, DtmResult, Global, GlobalStatus};
use tokio::task::JoinSet;

use crate::dispatcher::DispatchOutcome;

use super::{Driver, DriverContext};

pub struct SagaDriver;

/// `orders[k]` lists the step indices step `k`'s action must wait for.
/// The compensation pass needs the inverse: which steps must be compensated
/// before step `p` can be.
fn inverse_orders(orders: &HashMap<usize, Vec<usize>>) -> HashMap<usize, Vec<usize>> {
    let mut inverse: HashMap<usize, Vec<usize>> = HashMap::new();
    for (&k, deps) in orders {
        for &p in deps {
            inverse.entry(p).or_default().push(k);
        }
    }
    inverse
}

#[async_trait]
impl Driver for SagaDriver {
    fn gen_branches(&self, global: &Global) -> Vec<Branch> {
        let mut branches = Vec::with_capacity(global.steps.len() * 2);
        for (i, step) in global.steps.iter().enumerate() {
            let branch_id = Branch::format_branch_id(i + 1);
            branches.push(Branch::new(
                &global.gid,
                branch_id.clone(),
                BranchOp::Compensate,
                step.compensate.clone().unwrap_or_default(),
                step.payload.clone(),
            ));
            branches.push(Branch::new(&global.gid, branch_id, BranchOp::Action, step.action.clone(), step.payload.clone()));
        }
        branches
    }

    async fn process_once(&self, ctx: &DriverContext, global: &Global, branches: Vec<Branch>) -> DtmResult<()> {
        let deadline = Instant::now() + ctx.request_timeout + Duration::from_secs(2);
        match global.status {
            GlobalStatus::Submitted => forward_pass(ctx, global, branches, deadline).await,
            GlobalStatus::Aborting => compensate_pass(ctx, global, branches, deadline).await,
            _ => Ok(()),
        }
    }
}

fn action_of(branches: &[Branch], k: usize) -> &Branch {
    &branches[2 * k + 1]
}

fn compensate_of(branches: &[Branch], k: usize) -> &Branch {
    &branches[2 * k]
}

async fn forward_pass(ctx: &DriverContext, global: &Global, mut branches: Vec<Branch>, deadline: Instant) -> DtmResult<()> {
    let steps = branches.len() / 2;
    let orders = &global.custom_data.orders;
    let concurrent = global.custom_data.concurrent;
    let mut started = vec![false; steps];
    let mut any_failed = false;

    while Instant::now() < deadline {
        let runnable: Vec<usize> = (0..steps)
            .filter(|&k| {
                if started[k] || action_of(&branches, k).status != BranchStatus::Prepared {
                    return false;
                }
                if concurrent {
                    orders.get(&k).map(|deps| deps.iter().all(|&p| action_of(&branches, p).status == BranchStatus::Succeed)).unwrap_or(true)
                } else {
                    k == 0 || action_of(&branches, k - 1).status == BranchStatus::Succeed
                }
            })
            .collect();

        if runnable.is_empty() {
            if (0..steps).all(|k| action_of(&branches, k).status != BranchStatus::Prepared) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
            continue;
        }

        for &k in &runnable {
            started[k] = true;
        }

        let mut joins = JoinSet::new();
        for &k in &runnable {
            let branch = action_of(&branches, k).clone();
            let global = global.clone();
            let ctx = ctx.clone();
            joins.spawn(async move {
                let outcome = dispatch_with_tick(&ctx, global, branch.clone(), Duration::from_secs(3)).await;
                (k, branch, outcome)
            });
        }

        while let Some(joined) = joins.join_next().await {
            let (k, mut branch, outcome) = joined.map_err(|e| dtm_types::DtmError::driver(e.to_string()))?;
            branch.status = match &outcome {
                Ok(DispatchOutcome::Succeed) => BranchStatus::Succeed,
                Ok(DispatchOutcome::Failure) => {
                    any_failed = true;
                    BranchStatus::Failed
                }
                Ok(DispatchOutcome::Ongoing) | Err(_) => BranchStatus::Prepared,
            };
            if branch.status != BranchStatus::Prepared {
                branch.finish_time = Some(Utc::now());
                if ctx.writes_branch_status_synchronously(global) {
                    ctx.store.update_branches(std::slice::from_ref(&branch), &["status", "finish_time"]).await?;
                } else {
                    ctx.flusher.try_enqueue(branch.clone());
                }
            }
            branches[2 * k + 1] = branch;
        }

        if any_failed {
            break;
        }
    }

    if any_failed {
        ctx.store
            .change_global_status(&global.gid, GlobalStatus::Submitted, GlobalStatus::Aborting, StatusUpdate::default())
            .await
    } else if (0..steps).all(|k| action_of(&branches, k).status == BranchStatus::Succeed) {
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

async fn compensate_pass(ctx: &DriverContext, global: &Global, mut branches: Vec<Branch>, deadline: Instant) -> DtmResult<()> {
    let steps = branches.len() / 2;
    let corders = inverse_orders(&global.custom_data.orders);
    let concurrent = global.custom_data.concurrent;

    // Actions still `prepared` are treated as if they succeeded: we don't
    // know their true outcome, and "must be compensated" is the safe
    // assumption. This relies on participants being barrier-wrapped so a
    // late action response arriving during compensation is a no-op.
    for k in 0..steps {
        if action_of(&branches, k).status == BranchStatus::Prepared {
            branches[2 * k + 1].status = BranchStatus::Succeed;
        }
    }

    let is_rolled_back = |branches: &[Branch], k: usize| compensate_of(branches, k).status == BranchStatus::Succeed;

    let rs_c_to_start = (0..steps).filter(|&k| !is_rolled_back(&branches, k)).count();
    let mut rs_c_done = 0usize;
    let mut rs_c_succeed = 0usize;
    let mut started = vec![false; steps];

    while Instant::now() < deadline && rs_c_done < rs_c_to_start {
        let runnable: Vec<usize> = (0..steps)
            .rev()
            .filter(|&k| {
                if started[k] || is_rolled_back(&branches, k) {
                    return false;
                }
                if concurrent {
                    corders.get(&k).map(|deps| deps.iter().all(|&d| is_rolled_back(&branches, d))).unwrap_or(true)
                } else {
                    k == steps - 1 || is_rolled_back(&branches, k + 1)
                }
            })
            .collect();

        if runnable.is_empty() {
            tokio::time::sleep(Duration::from_millis(200)).await;
            continue;
        }

        for &k in &runnable {
            started[k] = true;
        }

        let mut joins = JoinSet::new();
        for &k in &runnable {
            let branch = compensate_of(&branches, k).clone();
            let global = global.clone();
            let ctx = ctx.clone();
            joins.spawn(async move {
                let outcome = dispatch_with_tick(&ctx, global, branch.clone(), Duration::from_secs(3)).await;
                (k, branch, outcome)
            });
        }

        while let Some(joined) = joins.join_next().await {
            let (k, mut branch, outcome) = joined.map_err(|e| dtm_types::DtmError::driver(e.to_string()))?;
            match outcome {
                Ok(DispatchOutcome::Succeed) => {
                    branch.status = BranchStatus::Succeed;
                    branch.finish_time = Some(Utc::now());
                    if ctx.writes_branch_status_synchronously(global) {
                        ctx.store.update_branches(std::slice::from_ref(&branch), &["status", "finish_time"]).await?;
                    } else {
                        ctx.flusher.try_enqueue(branch.clone());
                    }
                    rs_c_done += 1;
                    rs_c_succeed += 1;
                }
                Ok(DispatchOutcome::Ongoing) | Err(_) => {
                    // stays prepared; cron will retry this compensation
                }
                Ok(DispatchOutcome::Failure) => {
                    // compensation endpoints are not expected to signal
                    // business failure; treat as a transient error and retry.
                }
            }
            branches[2 * k] = branch;
        }
    }

    if rs_c_to_start == rs_c_succeed {
        ctx.store
            .change_global_status(
                &global.gid,
                GlobalStatus::Aborting,
                GlobalStatus::Failed,
                StatusUpdate { finish_time: None, rollback_time: Some(Utc::now()) },
            )
            .await
    } else {
        Ok(())
    }
}

async fn dispatch_with_tick(ctx: &DriverContext, global: Global, branch: Branch, tick: Duration) -> DtmResult<DispatchOutcome> {
    match tokio::time::timeout(tick, ctx.dispatcher.exec_branch_and_touch(&ctx.store, &global, &branch, ctx.request_timeout)).await {
        Ok(result) => result,
        Err(_) => Ok(DispatchOutcome::Ongoing),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtm_types::{Protocol, TransType};

    #[test]
    fn gen_branches_pairs_compensate_before_action() {
        let mut g = Global::new("g1".into(), TransType::Saga, Protocol::Http);
        g.steps = vec![
            dtm_types::Step { action: "http://a".into(), compensate: Some("http://ca".into()), payload: serde_json::json!({}) },
            dtm_types::Step { action: "http://b".into(), compensate: None, payload: serde_json::json!({}) },
        ];
        let branches = SagaDriver.gen_branches(&g);
        assert_eq!(branches.len(), 4);
        assert_eq!(branches[0].op, BranchOp::Compensate);
        assert_eq!(branches[1].op, BranchOp::Action);
        assert_eq!(branches[0].branch_id, "01");
        assert_eq!(branches[2].branch_id, "02");
        assert_eq!(branches[3].url, "http://b");
    }

    #[test]
    fn inverse_orders_computes_dependents() {
        let mut orders = HashMap::new();
        orders.insert(2, vec![0, 1]);
        orders.insert(3, vec![0, 1]);
        let inv = inverse_orders(&orders);
        assert_eq!(inv.get(&0).map(|v| v.len()), Some(2));
        assert_eq!(inv.get(&1).map(|v| v.len()), Some(2));
    }
}
