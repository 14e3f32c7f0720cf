//! Protocol drivers (component C4): one per transaction kind, each
//! implementing `gen_branches()` and `process_once()`. Polymorphism across
//! SAGA/TCC/MSG is a small capability set with a registry keyed by
//! `TransType`, not an inheritance hierarchy.

pub mod msg;
pub mod saga;
pub mod tcc;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dtm_store::Store;
use dtm_types::{Branch, DtmResult, Global, TransType};

use crate::dispatcher::Dispatcher;
use crate::flusher::FlushHandle;

/// Shared collaborators every driver needs: the store it persists through,
/// the dispatcher it calls branches through, and the async flusher it may
/// offload terminal branch-status writes to.
#[derive(Clone)]
pub struct DriverContext {
    pub store: Arc<dyn Store>,
    pub dispatcher: Dispatcher,
    pub request_timeout: Duration,
    pub flusher: FlushHandle,
    /// Forces every branch-status write through the synchronous store path,
    /// bypassing the flusher, per `update_branch_sync` in the config.
    pub update_branch_sync: bool,
}

impl DriverContext {
    /// Whether a branch-status write for `global` should go straight
    /// through the store rather than the async flusher: `update_branch_sync`
    /// is set, or this global's SAGA concurrency hints are in use, both of
    /// which want the persisted status visible to the very next poll rather
    /// than batched.
    pub fn writes_branch_status_synchronously(&self, global: &Global) -> bool {
        self.update_branch_sync || global.custom_data.concurrent
    }
}

#[async_trait]
pub trait Driver: Send + Sync {
    /// Branches implied by a global's declared steps, not yet persisted.
    fn gen_branches(&self, global: &Global) -> Vec<Branch>;

    /// Drives one bounded pass of work for `global`, given its current
    /// persisted `branches`. Implementations own all store writes; the
    /// caller only supplies fresh reads.
    async fn process_once(&self, ctx: &DriverContext, global: &Global, branches: Vec<Branch>) -> DtmResult<()>;
}

pub fn driver_for(trans_type: TransType) -> Arc<dyn Driver> {
    match trans_type {
        TransType::Saga => Arc::new(saga::SagaDriver),
        TransType::Tcc | TransType::Xa => Arc::new(tcc::TccDriver),
        TransType::Msg => Arc::new(msg::MsgDriver),
    }
}
