//! The transaction state engine: the branch dispatcher, the per-protocol
//! drivers, the four public coordinator operations, the lease-based cron
//! poller, and the async branch-status flusher.

pub mod cron;
pub mod dispatcher;
pub mod drivers;
pub mod engine;
pub mod flusher;

pub use cron::{cron_once, run as run_cron, CronConfig};
pub use dispatcher::{adjust_cron_interval, DispatchOutcome, Dispatcher, MicroserviceDriver, NullMicroserviceDriver};
pub use drivers::{driver_for, Driver, DriverContext};
pub use engine::TransactionEngine;
pub use flusher::{spawn as spawn_flusher, FlushHandle};
