use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle of a global transaction. Monotonic: `prepared -> submitted ->
/// succeed|aborting`, `aborting -> failed`, `prepared -> failed` (message),
/// `prepared -> succeed` (one-shot).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum GlobalStatus {
    Prepared,
    Submitted,
    Aborting,
    Succeed,
    Failed,
}

impl GlobalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GlobalStatus::Prepared => "prepared",
            GlobalStatus::Submitted => "submitted",
            GlobalStatus::Aborting => "aborting",
            GlobalStatus::Succeed => "succeed",
            GlobalStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, GlobalStatus::Succeed | GlobalStatus::Failed)
    }
}

impl std::str::FromStr for GlobalStatus {
    type Err = crate::DtmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prepared" => Ok(GlobalStatus::Prepared),
            "submitted" => Ok(GlobalStatus::Submitted),
            "aborting" => Ok(GlobalStatus::Aborting),
            "succeed" => Ok(GlobalStatus::Succeed),
            "failed" => Ok(GlobalStatus::Failed),
            other => Err(crate::DtmError::driver(format!("unknown global status: {other}"))),
        }
    }
}

/// A branch never transitions out of `succeed`. `failed` only appears on
/// SAGA forward branches whose endpoint explicitly signalled failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BranchStatus {
    Prepared,
    Succeed,
    Failed,
}

impl BranchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BranchStatus::Prepared => "prepared",
            BranchStatus::Succeed => "succeed",
            BranchStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for BranchStatus {
    type Err = crate::DtmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prepared" => Ok(BranchStatus::Prepared),
            "succeed" => Ok(BranchStatus::Succeed),
            "failed" => Ok(BranchStatus::Failed),
            other => Err(crate::DtmError::driver(format!("unknown branch status: {other}"))),
        }
    }
}

/// The operation a branch row represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BranchOp {
    Action,
    Compensate,
    Try,
    Confirm,
    Cancel,
    Commit,
    Rollback,
    Msg,
}

impl BranchOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BranchOp::Action => "action",
            BranchOp::Compensate => "compensate",
            BranchOp::Try => "try",
            BranchOp::Confirm => "confirm",
            BranchOp::Cancel => "cancel",
            BranchOp::Commit => "commit",
            BranchOp::Rollback => "rollback",
            BranchOp::Msg => "msg",
        }
    }

    /// The op whose barrier row a `cancel`/`compensate` call also inserts
    /// against, so a late-arriving forward call self-cancels. `None` for
    /// forward ops: they have no origin to guard against.
    pub fn origin_op(self) -> Option<BranchOp> {
        match self {
            BranchOp::Cancel => Some(BranchOp::Try),
            BranchOp::Compensate => Some(BranchOp::Action),
            _ => None,
        }
    }
}

impl std::str::FromStr for BranchOp {
    type Err = crate::DtmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "action" => Ok(BranchOp::Action),
            "compensate" => Ok(BranchOp::Compensate),
            "try" => Ok(BranchOp::Try),
            "confirm" => Ok(BranchOp::Confirm),
            "cancel" => Ok(BranchOp::Cancel),
            "commit" => Ok(BranchOp::Commit),
            "rollback" => Ok(BranchOp::Rollback),
            "msg" => Ok(BranchOp::Msg),
            other => Err(crate::DtmError::driver(format!("unknown branch op: {other}"))),
        }
    }
}

/// Which protocol driver owns a global transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransType {
    Saga,
    Tcc,
    Msg,
    Xa,
}

impl TransType {
    pub fn as_str(self) -> &'static str {
        match self {
            TransType::Saga => "saga",
            TransType::Tcc => "tcc",
            TransType::Msg => "msg",
            TransType::Xa => "xa",
        }
    }
}

impl std::str::FromStr for TransType {
    type Err = crate::DtmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "saga" => Ok(TransType::Saga),
            "tcc" => Ok(TransType::Tcc),
            "msg" => Ok(TransType::Msg),
            "xa" => Ok(TransType::Xa),
            other => Err(crate::DtmError::driver(format!("unknown trans type: {other}"))),
        }
    }
}

/// Transport used to reach a branch endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Grpc,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Grpc => "grpc",
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = crate::DtmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Protocol::Http),
            "grpc" => Ok(Protocol::Grpc),
            other => Err(crate::DtmError::driver(format!("unknown protocol: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_op_maps_backward_ops_to_their_forward_counterpart() {
        assert_eq!(BranchOp::Cancel.origin_op(), Some(BranchOp::Try));
        assert_eq!(BranchOp::Compensate.origin_op(), Some(BranchOp::Action));
        assert_eq!(BranchOp::Action.origin_op(), None);
        assert_eq!(BranchOp::Msg.origin_op(), None);
    }

    #[test]
    fn global_status_round_trips_through_str() {
        for s in ["prepared", "submitted", "aborting", "succeed", "failed"] {
            let parsed: GlobalStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), s);
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(GlobalStatus::Succeed.is_terminal());
        assert!(GlobalStatus::Failed.is_terminal());
        assert!(!GlobalStatus::Aborting.is_terminal());
    }
}
