use std::collections::HashMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::status::{GlobalStatus, Protocol, TransType};

/// One user-declared step of a SAGA transaction: an action URL and its
/// optional compensation URL, paired with the step's opaque JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Step {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensate: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// SAGA concurrency hints: `orders[k]` lists the step indices that step `k`'s
/// action must wait for. The compensation-pass inverse (`cOrders`) is
/// derived from this at prepare time, not stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CustomData {
    #[serde(default)]
    pub orders: HashMap<usize, Vec<usize>>,
    #[serde(default)]
    pub concurrent: bool,
}

/// Passthrough header snapshot carried from the originating request to every
/// branch call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Ext {
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Per-transaction knobs supplied by the caller at `prepare`/`submit` time.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TransOptions {
    #[serde(default)]
    pub wait_result: bool,
    #[serde(default = "TransOptions::default_timeout_to_fail")]
    pub timeout_to_fail: i64,
    #[serde(default = "TransOptions::default_retry_interval")]
    pub retry_interval: i64,
    #[serde(default)]
    pub passthrough_headers: Vec<String>,
    #[serde(default)]
    pub branch_headers: HashMap<String, String>,
    #[serde(default)]
    pub request_timeout: i64,
}

impl TransOptions {
    fn default_timeout_to_fail() -> i64 {
        35
    }

    fn default_retry_interval() -> i64 {
        10
    }
}

impl Default for TransOptions {
    fn default() -> Self {
        TransOptions {
            wait_result: false,
            timeout_to_fail: Self::default_timeout_to_fail(),
            retry_interval: Self::default_retry_interval(),
            passthrough_headers: Vec::new(),
            branch_headers: HashMap::new(),
            request_timeout: 10,
        }
    }
}

/// A global transaction row. `id` is the store-assigned primary key used for
/// keyset pagination; it is `0` for a transaction not yet persisted.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Global {
    #[serde(default)]
    pub id: i64,
    pub gid: String,
    pub trans_type: TransType,
    pub status: GlobalStatus,
    pub protocol: Protocol,
    #[serde(default)]
    pub query_prepared: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub options: TransOptions,
    #[serde(default)]
    pub custom_data: CustomData,
    #[serde(default)]
    pub ext: Ext,
    #[serde(default)]
    pub owner: String,
    pub next_cron_time: DateTime<Utc>,
    pub next_cron_interval: i64,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub finish_time: Option<DateTime<Utc>>,
    pub rollback_time: Option<DateTime<Utc>>,
}

impl Global {
    pub fn new(gid: String, trans_type: TransType, protocol: Protocol) -> Self {
        let now = Utc::now();
        Global {
            id: 0,
            gid,
            trans_type,
            status: GlobalStatus::Prepared,
            protocol,
            query_prepared: String::new(),
            steps: Vec::new(),
            options: TransOptions::default(),
            custom_data: CustomData::default(),
            ext: Ext::default(),
            owner: String::new(),
            next_cron_time: now,
            next_cron_interval: 10,
            create_time: now,
            update_time: now,
            finish_time: None,
            rollback_time: None,
        }
    }
}

/// One branch row: a single operation a participant performs, uniquely
/// keyed by `(gid, branch_id, op)`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Branch {
    #[serde(default)]
    pub id: i64,
    pub gid: String,
    pub branch_id: String,
    pub op: crate::status::BranchOp,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub bin_data: serde_json::Value,
    pub status: crate::status::BranchStatus,
    pub finish_time: Option<DateTime<Utc>>,
    pub rollback_time: Option<DateTime<Utc>>,
}

impl Branch {
    pub fn new(gid: &str, branch_id: impl Into<String>, op: crate::status::BranchOp, url: impl Into<String>, bin_data: serde_json::Value) -> Self {
        Branch {
            id: 0,
            gid: gid.to_string(),
            branch_id: branch_id.into(),
            op,
            url: url.into(),
            bin_data,
            status: crate::status::BranchStatus::Prepared,
            finish_time: None,
            rollback_time: None,
        }
    }

    pub fn format_branch_id(i: usize) -> String {
        format!("{:02}", i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{BranchOp, Protocol as Proto, TransType as TT};

    #[test]
    fn branch_id_is_zero_padded_two_digits() {
        assert_eq!(Branch::format_branch_id(1), "01");
        assert_eq!(Branch::format_branch_id(12), "12");
    }

    #[test]
    fn new_global_starts_prepared() {
        let g = Global::new("g1".into(), TT::Saga, Proto::Http);
        assert_eq!(g.status, GlobalStatus::Prepared);
        assert!(g.ext.headers.is_empty());
    }

    #[test]
    fn new_branch_defaults_to_prepared() {
        let b = Branch::new("g1", "01", BranchOp::Action, "http://x", serde_json::json!({}));
        assert_eq!(b.status, crate::status::BranchStatus::Prepared);
    }
}
