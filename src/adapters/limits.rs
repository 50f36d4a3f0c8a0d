//! Per-protocol concurrency limits shared across all adapter invocations.
//! BACnet scans contend for UDP sockets, so at most five run at once
//! regardless of how wide the dispatcher fans out.

use lazy_static::lazy_static;
use tokio::sync::Semaphore;

pub const BACNET_MAX_CONCURRENT: usize = 5;

lazy_static! {
    pub static ref BACNET_SLOTS: Semaphore = Semaphore::new(BACNET_MAX_CONCURRENT);
}
