//! The async branch-status flusher (component C7), grounded on
//! `svr.go`'s `updateBranchAsync`: a background task batching branch
//! status writes so a busy driver loop never blocks on a store round trip
//! per branch. Drivers route a branch-status write here instead of
//! straight through the store unless `update_branch_sync` is set or the
//! global is running with SAGA concurrency hints, where the next poll
//! needs to see the status land immediately.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dtm_store::Store;
use dtm_types::Branch;
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 1000;
const FLUSH_WINDOW: Duration = Duration::from_millis(200);
const FLUSH_CHECK_INTERVAL: Duration = Duration::from_millis(20);
const FLUSH_BATCH_LIMIT: usize = 20;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// A handle producers use to enqueue a branch status update without
/// waiting for it to land in the store.
#[derive(Clone)]
pub struct FlushHandle {
    tx: mpsc::Sender<Branch>,
}

impl FlushHandle {
    /// Enqueues `branch`'s `status`/`finish_time` for the next flush batch.
    /// Drops the update with a log if the channel is full rather than
    /// blocking the caller: a lost async status update is corrected by the
    /// next cron pass reading the branch's true state from its endpoint.
    pub async fn enqueue(&self, branch: Branch) {
        if self.tx.send(branch).await.is_err() {
            tracing::warn!("branch status flusher is no longer running, update dropped");
        }
    }

    pub fn try_enqueue(&self, branch: Branch) {
        if let Err(e) = self.tx.try_send(branch) {
            tracing::warn!(error = %e, "branch status flush channel full or closed, update dropped");
        }
    }
}

/// Spawns the flusher loop and returns a handle to enqueue updates. The
/// loop runs until every `FlushHandle` clone is dropped.
pub fn spawn(store: Arc<dyn Store>) -> FlushHandle {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(run(store, rx));
    FlushHandle { tx }
}

async fn run(store: Arc<dyn Store>, mut rx: mpsc::Receiver<Branch>) {
    loop {
        let batch = collect_batch(&mut rx).await;
        if batch.is_empty() {
            // channel closed and drained
            if rx.is_closed() {
                return;
            }
            continue;
        }
        flush_with_retry(&store, batch).await;
    }
}

async fn collect_batch(rx: &mut mpsc::Receiver<Branch>) -> Vec<Branch> {
    let started = Instant::now();
    let mut updates = Vec::new();
    while started.elapsed() < FLUSH_WINDOW.saturating_sub(FLUSH_CHECK_INTERVAL) && updates.len() < FLUSH_BATCH_LIMIT {
        match tokio::time::timeout(FLUSH_CHECK_INTERVAL, rx.recv()).await {
            Ok(Some(branch)) => updates.push(branch),
            Ok(None) => break,
            Err(_timeout) => {}
        }
    }
    updates
}

async fn flush_with_retry(store: &Arc<dyn Store>, mut updates: Vec<Branch>) {
    while !updates.is_empty() {
        match store.update_branches(&updates, &["status", "finish_time", "update_time"]).await {
            Ok(affected) => {
                tracing::debug!(batch = updates.len(), affected, "flushed branch status batch");
                updates.clear();
            }
            Err(e) => {
                tracing::error!(error = %e, "async branch status flush failed, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtm_store::SqliteStore;
    use dtm_types::{BranchOp, BranchStatus, Global, Protocol, TransType};

    #[tokio::test]
    async fn enqueued_updates_eventually_land_in_the_store() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.ensure_schema().await.unwrap();
        let global = Global::new("gflush1".into(), TransType::Saga, Protocol::Http);
        let mut branch = Branch::new(&global.gid, "01", BranchOp::Action, "http://x", serde_json::json!({}));
        store.save_new(&global, &[branch.clone()]).await.unwrap();

        let saved = store.find_branches(&global.gid).await.unwrap();
        branch.id = saved[0].id;
        branch.status = BranchStatus::Succeed;

        let store: Arc<dyn Store> = Arc::new(store);
        let handle = spawn(store.clone());
        handle.enqueue(branch).await;

        for _ in 0..50 {
            let branches = store.find_branches("gflush1").await.unwrap();
            if branches[0].status == BranchStatus::Succeed {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("flusher did not persist the enqueued update in time");
    }
}
