//! The reliable-message client SDK: `prepare`/`submit`/`abort` calls against
//! the coordinator's HTTP surface, plus `do_and_submit`, the convenience
//! wrapper that runs the participant's first-phase business function inside
//! a barrier and lets the message's own outcome decide submit vs. abort vs.
//! probe. Grounded on `dtmcli/msg.go`.

use dtm_types::{DtmError, DtmResult, Global, Protocol, TransType};

/// One step of a reliable-message chain: a forward action URL plus its
/// opaque JSON payload. Messages carry no compensation.
pub struct MsgStep {
    pub action: String,
    pub payload: serde_json::Value,
}

pub struct MsgClient {
    http: reqwest::Client,
    server: String,
    global: Global,
}

impl MsgClient {
    pub fn new(server: impl Into<String>, gid: String) -> Self {
        MsgClient {
            http: reqwest::Client::new(),
            server: server.into(),
            global: Global::new(gid, TransType::Msg, Protocol::Http),
        }
    }

    pub fn add(mut self, step: MsgStep) -> Self {
        self.global.steps.push(dtm_types::Step { action: step.action, compensate: None, payload: step.payload });
        self
    }

    pub fn gid(&self) -> &str {
        &self.global.gid
    }

    pub async fn prepare(&mut self, query_prepared: impl Into<String>) -> DtmResult<()> {
        self.global.query_prepared = query_prepared.into();
        self.call_dtm("prepare").await
    }

    pub async fn submit(&self) -> DtmResult<()> {
        self.call_dtm("submit").await
    }

    pub async fn abort(&self) -> DtmResult<()> {
        self.call_dtm("abort").await
    }

    async fn call_dtm(&self, op: &str) -> DtmResult<()> {
        let url = format!("{}/api/dtmsvr/{}", self.server, op);
        let resp = self.http.post(&url).json(&self.global).send().await.map_err(DtmError::from)?;
        interpret_dtm_response(resp).await
    }

    /// `prepare -> busi (inside a barrier) -> submit/abort/probe`. Any
    /// error other than `DtmError::Failure` triggers a probe against
    /// `query_prepared` to learn whether the business call actually
    /// committed before the process crashed. A repeat call with the same
    /// `gid` surfaces `DtmError::Duplicated` from the barrier itself.
    pub async fn do_and_submit<F, Fut>(mut self, query_prepared: impl Into<String>, busi: F) -> DtmResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = DtmResult<()>>,
    {
        self.prepare(query_prepared).await?;
        let busi_result = busi().await;

        match &busi_result {
            Ok(()) => self.submit().await?,
            Err(DtmError::Failure) => {
                let _ = self.abort().await;
            }
            Err(_) => {
                // The business call may have succeeded before the caller's
                // process crashed; the probe is the only authoritative
                // source of truth at this point.
                let probe_url = self.global.query_prepared.clone();
                let resp = reqwest::Client::new().get(&probe_url).query(&[("gid", self.gid())]).send().await.map_err(DtmError::from)?;
                match interpret_dtm_response(resp).await {
                    Ok(()) => self.submit().await?,
                    Err(DtmError::Failure) => {
                        let _ = self.abort().await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        busi_result
    }
}

async fn interpret_dtm_response(resp: reqwest::Response) -> DtmResult<()> {
    let status = resp.status();
    if status == reqwest::StatusCode::OK {
        return Ok(());
    }
    if status == reqwest::StatusCode::CONFLICT {
        return Err(DtmError::Failure);
    }
    if status.as_u16() == 425 {
        return Err(DtmError::Ongoing);
    }
    Err(DtmError::driver(format!("unexpected coordinator response: {status}")))
}
