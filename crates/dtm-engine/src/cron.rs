//! The lease-poll loop (component C6), grounded on `dtmsvr/cron.go`: acquire
//! one due global by lease, drive it through its driver, sleep a jittered
//! interval on a miss.

use std::sync::Arc;
use std::time::Duration;

use dtm_store::Store;
use dtm_types::DtmResult;
use rand::Rng;

use crate::dispatcher::Dispatcher;
use crate::drivers::{driver_for, DriverContext};
use crate::flusher::FlushHandle;

pub struct CronConfig {
    /// Selection window: a global is eligible once its `next_cron_time` is
    /// within this many seconds of now. Zero in production; tests widen it
    /// to pull forward globals that would otherwise not be due yet.
    pub expire_in: i64,
    /// How far a lease acquisition pushes `next_cron_time` forward, and the
    /// baseline sleep between polls when nothing is due.
    pub trans_cron_interval: i64,
    pub request_timeout: Duration,
    /// Forces branch-status writes through the synchronous store path on
    /// every cron pass rather than the async flusher.
    pub update_branch_sync: bool,
}

impl Default for CronConfig {
    fn default() -> Self {
        CronConfig { expire_in: 0, trans_cron_interval: 10, request_timeout: Duration::from_secs(10), update_branch_sync: false }
    }
}

/// Runs one lease-acquire-and-drive cycle, returning the gid it processed.
/// `None` means nothing was due.
pub async fn cron_once(store: &Arc<dyn Store>, dispatcher: &Dispatcher, flusher: &FlushHandle, config: &CronConfig) -> DtmResult<Option<String>> {
    let mut global = match store.lock_one_global(config.expire_in, config.trans_cron_interval).await? {
        Some(g) => g,
        None => return Ok(None),
    };

    let gid = global.gid.clone();
    tracing::info!(gid = %gid, trans_type = global.trans_type.as_str(), status = global.status.as_str(), "cron acquired lease");

    global.options.wait_result = true;
    let branches = store.find_branches(&gid).await?;
    let ctx = DriverContext {
        store: store.clone(),
        dispatcher: dispatcher.clone(),
        request_timeout: config.request_timeout,
        flusher: flusher.clone(),
        update_branch_sync: config.update_branch_sync,
    };

    match driver_for(global.trans_type).process_once(&ctx, &global, branches).await {
        Ok(()) => {}
        Err(dtm_types::DtmError::Failure) => {
            // a branch is business-authoritative-failed; the driver already
            // recorded whatever transition that implies.
        }
        Err(e) => {
            tracing::warn!(gid = %gid, error = %e, "cron pass failed, will retry on next lease");
        }
    }

    Ok(Some(gid))
}

/// Drives `cron_once` forever, sleeping a jittered `trans_cron_interval`
/// seconds (less up to one second of jitter) whenever nothing was due.
pub async fn run(store: Arc<dyn Store>, dispatcher: Dispatcher, flusher: FlushHandle, config: CronConfig) {
    loop {
        match cron_once(&store, &dispatcher, &flusher, &config).await {
            Ok(Some(_)) => continue,
            Ok(None) => sleep_cron_interval(config.trans_cron_interval).await,
            Err(e) => {
                tracing::error!(error = %e, "cron lease acquisition failed");
                sleep_cron_interval(config.trans_cron_interval).await;
            }
        }
    }
}

async fn sleep_cron_interval(trans_cron_interval: i64) {
    let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
    let seconds = (trans_cron_interval as f64 - jitter).max(0.1);
    tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtm_store::SqliteStore;
    use dtm_types::{BranchOp, Global, Protocol, Step, TransType};

    async fn fresh_store() -> Arc<dyn Store> {
        let store = SqliteStore::in_memory().await.unwrap();
        store.ensure_schema().await.unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn cron_once_returns_none_when_nothing_is_due() {
        let store = fresh_store().await;
        let dispatcher = Dispatcher::with_null_driver();
        let flusher = crate::flusher::spawn(store.clone());
        let config = CronConfig { expire_in: 0, ..Default::default() };
        let result = cron_once(&store, &dispatcher, &flusher, &config).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn cron_once_drives_a_due_msg_global_to_completion() {
        let store = fresh_store().await;
        let mut global = Global::new("gcron1".into(), TransType::Msg, Protocol::Http);
        global.status = dtm_types::GlobalStatus::Submitted;
        global.steps = vec![Step { action: String::new(), compensate: None, payload: serde_json::json!({}) }];
        let branch = dtm_types::Branch::new(&global.gid, "01", BranchOp::Msg, "", serde_json::json!({}));
        store.save_new(&global, &[branch]).await.unwrap();

        let dispatcher = Dispatcher::with_null_driver();
        let flusher = crate::flusher::spawn(store.clone());
        let config = CronConfig { expire_in: 3600, update_branch_sync: true, ..Default::default() };
        let processed = cron_once(&store, &dispatcher, &flusher, &config).await.unwrap();
        assert_eq!(processed.as_deref(), Some("gcron1"));

        let found = store.find_global("gcron1").await.unwrap().unwrap();
        assert_eq!(found.status, dtm_types::GlobalStatus::Succeed);
    }
}
