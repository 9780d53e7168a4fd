//! OS facility seam for resource groups

use std::time::Duration;

use crate::error::OsError;

use super::limits::{CpuRateControl, ExtendedLimits};

/// Basic accounting record; times are in 100ns ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BasicAccounting {
    pub total_user_time: u64,
    pub total_kernel_time: u64,
    pub total_processes: u32,
    pub active_processes: u32,
}

/// Raw completion port packet: message code plus its payload (a pid for
/// process-scoped messages)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionPacket {
    pub code: u32,
    pub data: usize,
}

/// Operations on one open resource group handle.
///
/// Implementations own the OS handles and release them on `Drop`; the
/// owning `ResourceGroup` guarantees that happens exactly once.
pub trait JobBackend: Send + Sync {
    fn query_extended_limits(&self) -> Result<ExtendedLimits, OsError>;

    fn set_extended_limits(&self, limits: &ExtendedLimits) -> Result<(), OsError>;

    fn query_cpu_rate(&self) -> Result<CpuRateControl, OsError>;

    fn set_cpu_rate(&self, rate: CpuRateControl) -> Result<(), OsError>;

    fn query_accounting(&self) -> Result<BasicAccounting, OsError>;

    /// Query member pids with room for `capacity` entries. Fails with
    /// `ERROR_MORE_DATA` when the group has more members than that.
    fn query_process_ids(&self, capacity: usize) -> Result<Vec<u32>, OsError>;

    fn assign_process(&self, pid: u32) -> Result<(), OsError>;

    fn terminate(&self, exit_code: u32) -> Result<(), OsError>;

    /// Wait at most `timeout` for the next completion packet.
    /// `Ok(None)` on timeout or when no completion port is attached.
    fn poll_completion(&self, timeout: Duration) -> Result<Option<CompletionPacket>, OsError>;

    /// Wait for one process to exit; `None` waits forever. Returns false on
    /// timeout. A pid that no longer exists counts as exited.
    fn wait_for_process(&self, pid: u32, timeout: Option<Duration>) -> Result<bool, OsError>;

    /// Wait for the group handle itself to become signaled
    fn wait_until_signaled(&self, timeout: Option<Duration>) -> Result<bool, OsError>;
}

/// Run `query` with a growing capacity until it stops reporting
/// "more data".
///
/// The capacity grows by at least one on every retry, and the OS only
/// reports "more data" while the capacity is below the (finite) true
/// answer size, so the loop terminates.
pub fn query_with_growing_buffer<T, F>(initial: usize, step: usize, mut query: F) -> Result<T, OsError>
where
    F: FnMut(usize) -> Result<T, OsError>,
{
    let step = step.max(1);
    let mut capacity = initial.max(1);
    loop {
        match query(capacity) {
            Err(e) if e.is_more_data() => capacity += step,
            other => return other,
        }
    }
}
