//! The branch dispatcher (component C3): invokes a branch endpoint,
//! interprets its status/error codes, and renews the global's lease by
//! applying the resulting backoff/reset rule to `next_cron_time`. Transport
//! dispatch is split in two: HTTP goes out
//! over `reqwest` directly; gRPC is modeled as a pluggable
//! `MicroserviceDriver` trait seam since compiling and dispatching to a live
//! gRPC service is a microservice-registry-adapter concern this workspace
//! does not own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dtm_store::Store;
use dtm_types::{Branch, DtmError, DtmResult, Global, Protocol};

/// The three-valued outcome every participant endpoint must honour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Succeed,
    Failure,
    Ongoing,
}

/// Resolves a `grpc://` branch URL to a server/method pair and invokes it.
/// The Rust counterpart of `dtmdriver.GetDriver()`; no wire codec is bundled
/// here, callers register a driver that knows how to reach their registry.
#[async_trait]
pub trait MicroserviceDriver: Send + Sync {
    fn parse_server_method(&self, url: &str) -> DtmResult<(String, String)>;

    async fn invoke(&self, server: &str, method: &str, headers: &HashMap<String, String>, body: &[u8]) -> DtmResult<DispatchOutcome>;
}

/// The default: any `grpc://` dispatch fails clearly instead of silently
/// succeeding. Tests and real deployments supply their own driver.
pub struct NullMicroserviceDriver;

#[async_trait]
impl MicroserviceDriver for NullMicroserviceDriver {
    fn parse_server_method(&self, url: &str) -> DtmResult<(String, String)> {
        Err(DtmError::driver(format!("no microservice driver registered for {url}")))
    }

    async fn invoke(&self, _server: &str, _method: &str, _headers: &HashMap<String, String>, _body: &[u8]) -> DtmResult<DispatchOutcome> {
        Err(DtmError::driver("no microservice driver registered"))
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    http: reqwest::Client,
    microservice: Arc<dyn MicroserviceDriver>,
}

impl Dispatcher {
    pub fn new(microservice: Arc<dyn MicroserviceDriver>) -> Self {
        Dispatcher { http: reqwest::Client::new(), microservice }
    }

    pub fn with_null_driver() -> Self {
        Self::new(Arc::new(NullMicroserviceDriver))
    }

    /// Invokes one branch endpoint and returns the three-valued outcome.
    /// An empty URL (common for omitted compensate/cancel endpoints) is
    /// treated as an immediate success without any network call.
    pub async fn exec_branch(&self, global: &Global, branch: &Branch, request_timeout: Duration) -> DtmResult<DispatchOutcome> {
        if branch.url.is_empty() {
            return Ok(DispatchOutcome::Succeed);
        }

        let mut headers = global.ext.headers.clone();
        headers.extend(global.options.branch_headers.clone());

        match global.protocol {
            Protocol::Http => self.exec_http(global, branch, &headers, request_timeout).await,
            Protocol::Grpc => {
                let (server, method) = self.microservice.parse_server_method(&branch.url)?;
                let body = serde_json::to_vec(&branch.bin_data).map_err(DtmError::driver)?;
                self.microservice.invoke(&server, &method, &headers, &body).await
            }
        }
    }

    /// `exec_branch`, followed by a `touch_cron_time` applying the
    /// baseline-reset/keep/double-backoff rule `adjust_cron_interval`
    /// computes from this dispatch's outcome. The lease is renewed
    /// implicitly by this call, so a long-running branch does not get
    /// preempted by a second cron pass mid-dispatch. A lost race on the
    /// touch (the lease has since moved on) is not this call's problem to
    /// report; the dispatch outcome is returned either way.
    pub async fn exec_branch_and_touch(
        &self,
        store: &Arc<dyn Store>,
        global: &Global,
        branch: &Branch,
        request_timeout: Duration,
    ) -> DtmResult<DispatchOutcome> {
        let elapsed_since_last_touch = (Utc::now() - global.update_time).to_std().unwrap_or(Duration::ZERO);
        let outcome = self.exec_branch(global, branch, request_timeout).await;
        let next_interval = adjust_cron_interval(&outcome, global.next_cron_interval, elapsed_since_last_touch);
        let next_cron_time = now_plus_seconds(next_interval);
        let _ = store.touch_cron_time(&global.gid, global.status, next_cron_time, next_interval).await;
        outcome
    }

    async fn exec_http(
        &self,
        global: &Global,
        branch: &Branch,
        headers: &HashMap<String, String>,
        request_timeout: Duration,
    ) -> DtmResult<DispatchOutcome> {
        let has_payload = !branch.bin_data.is_null();
        let mut req = if has_payload || global.protocol == Protocol::Http && global.trans_type == dtm_types::TransType::Xa {
            self.http.post(&branch.url).json(&branch.bin_data)
        } else {
            self.http.get(&branch.url)
        };

        req = req
            .query(&[
                ("gid", global.gid.as_str()),
                ("trans_type", global.trans_type.as_str()),
                ("branch_id", branch.branch_id.as_str()),
                ("op", branch.op.as_str()),
            ])
            .timeout(request_timeout)
            .header("Content-Type", "application/json");
        for (k, v) in headers {
            req = req.header(k, v);
        }

        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => return Err(DtmError::driver(format!("branch request failed: {e}"))),
        };
        interpret_response(resp).await
    }
}

async fn interpret_response(resp: reqwest::Response) -> DtmResult<DispatchOutcome> {
    let status = resp.status();
    if status.as_u16() == 409 {
        return Ok(DispatchOutcome::Failure);
    }
    if status.as_u16() == 425 {
        return Ok(DispatchOutcome::Ongoing);
    }
    if !status.is_success() {
        return Err(DtmError::driver(format!("branch endpoint returned {status}")));
    }

    let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
    match body.get("dtm_result").and_then(|v| v.as_str()) {
        Some("SUCCESS") | None => Ok(DispatchOutcome::Succeed),
        Some("FAILURE") => Ok(DispatchOutcome::Failure),
        Some("ONGOING") => Ok(DispatchOutcome::Ongoing),
        Some(other) => Err(DtmError::driver(format!("unrecognised dtm_result: {other}"))),
    }
}

/// Backoff baseline the cron-interval adjustment compares against.
pub const BASELINE_CRON_INTERVAL_SECS: i64 = 10;

/// Decides the next `next_cron_interval` for a global after one branch
/// dispatch, per the success/ongoing/error rules of the dispatcher's
/// cron-time adjustment.
pub fn adjust_cron_interval(outcome: &DtmResult<DispatchOutcome>, current_interval: i64, elapsed_since_last_touch: Duration) -> i64 {
    match outcome {
        Ok(DispatchOutcome::Succeed) => {
            if elapsed_since_last_touch >= Duration::from_millis(1500) || current_interval > BASELINE_CRON_INTERVAL_SECS {
                BASELINE_CRON_INTERVAL_SECS
            } else {
                current_interval
            }
        }
        Ok(DispatchOutcome::Ongoing) => current_interval,
        Ok(DispatchOutcome::Failure) => current_interval,
        Err(_) => (current_interval * 2).min(3600),
    }
}

pub fn now_plus_seconds(seconds: i64) -> chrono::DateTime<Utc> {
    Utc::now() + chrono::Duration::seconds(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_on_error() {
        let next = adjust_cron_interval(&Err(DtmError::driver("boom")), 10, Duration::from_secs(5));
        assert_eq!(next, 20);
    }

    #[test]
    fn ongoing_keeps_interval() {
        let next = adjust_cron_interval(&Ok(DispatchOutcome::Ongoing), 40, Duration::from_secs(5));
        assert_eq!(next, 40);
    }

    #[test]
    fn success_resets_to_baseline_after_elapsed_threshold() {
        let next = adjust_cron_interval(&Ok(DispatchOutcome::Succeed), 40, Duration::from_millis(2000));
        assert_eq!(next, BASELINE_CRON_INTERVAL_SECS);
    }

    #[test]
    fn success_keeps_interval_when_elapsed_is_short_and_already_baseline() {
        let next = adjust_cron_interval(&Ok(DispatchOutcome::Succeed), BASELINE_CRON_INTERVAL_SECS, Duration::from_millis(100));
        assert_eq!(next, BASELINE_CRON_INTERVAL_SECS);
    }

    #[tokio::test]
    async fn exec_branch_and_touch_renews_the_lease() {
        use dtm_types::{BranchOp, Protocol, TransType};

        let store = dtm_store::SqliteStore::in_memory().await.unwrap();
        store.ensure_schema().await.unwrap();
        let mut global = Global::new(dtm_types::gen_gid(), TransType::Saga, Protocol::Http);
        global.next_cron_interval = 40;
        store.save_new(&global, &[]).await.unwrap();

        // An empty URL is an immediate success without a network call.
        let branch = Branch::new(&global.gid, "01", BranchOp::Action, "", serde_json::json!({}));
        let dispatcher = Dispatcher::with_null_driver();
        let store: Arc<dyn Store> = Arc::new(store);
        let outcome = dispatcher.exec_branch_and_touch(&store, &global, &branch, Duration::from_secs(5)).await;
        assert_eq!(outcome.unwrap(), DispatchOutcome::Succeed);

        let refreshed = store.find_global(&global.gid).await.unwrap().unwrap();
        assert_eq!(refreshed.next_cron_interval, BASELINE_CRON_INTERVAL_SECS);
    }
}
