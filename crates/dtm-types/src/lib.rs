//! Shared vocabulary for the distributed transaction coordinator: the
//! persisted data model, the status enums that drive every protocol driver,
//! and the sentinel error taxonomy every other crate in the workspace
//! propagates.

pub mod error;
pub mod gid;
pub mod model;
pub mod status;

pub use error::{DtmError, DtmResult};
pub use gid::gen_gid;
pub use model::{Branch, CustomData, Ext, Global, Step, TransOptions};
pub use status::{BranchOp, BranchStatus, GlobalStatus, Protocol, TransType};
