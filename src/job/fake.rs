//! In-memory resource group used by unit tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{OsError, ERROR_MORE_DATA};

use super::backend::{BasicAccounting, CompletionPacket, JobBackend};
use super::limits::{CpuRateControl, ExtendedLimits};

#[derive(Default)]
struct FakeState {
    limits: ExtendedLimits,
    cpu: CpuRateControl,
    accounting: BasicAccounting,
    peak_memory: u64,
    members: Vec<u32>,
    members_after_terminate: Option<Vec<u32>>,
    terminated: bool,
    completions: VecDeque<CompletionPacket>,
    capacities: Vec<usize>,
    os_calls: usize,
    fail_set_limits: Option<u32>,
    waited_pids: Vec<u32>,
    wait_timeouts: Vec<Option<Duration>>,
    group_waits: usize,
    stuck_pids: Vec<u32>,
    terminate_calls: usize,
    release_count: usize,
    assigned: Vec<u32>,
    fail_assign: Option<u32>,
    fail_enumeration_until_terminated: Option<u32>,
}

/// Test handle onto a fake group; `backend()` hands out the owned side
#[derive(Clone, Default)]
pub(crate) struct FakeJob {
    state: Arc<Mutex<FakeState>>,
}

impl FakeJob {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(&self) -> Box<dyn JobBackend> {
        Box::new(FakeBackend {
            state: self.state.clone(),
        })
    }

    fn with<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn limits(&self) -> ExtendedLimits {
        self.with(|s| s.limits)
    }

    pub fn set_peak_memory(&self, bytes: u64) {
        self.with(|s| s.peak_memory = bytes)
    }

    pub fn set_accounting(&self, accounting: BasicAccounting) {
        self.with(|s| s.accounting = accounting)
    }

    pub fn set_members(&self, pids: Vec<u32>) {
        self.with(|s| s.members = pids)
    }

    pub fn set_members_after_terminate(&self, pids: Vec<u32>) {
        self.with(|s| s.members_after_terminate = Some(pids))
    }

    pub fn set_stuck_pids(&self, pids: Vec<u32>) {
        self.with(|s| s.stuck_pids = pids)
    }

    pub fn fail_set_limits(&self, code: u32) {
        self.with(|s| s.fail_set_limits = Some(code))
    }

    pub fn fail_assign(&self, code: u32) {
        self.with(|s| s.fail_assign = Some(code))
    }

    pub fn fail_enumeration_until_terminated(&self, code: u32) {
        self.with(|s| s.fail_enumeration_until_terminated = Some(code))
    }

    pub fn push_completion(&self, packet: CompletionPacket) {
        self.with(|s| s.completions.push_back(packet))
    }

    pub fn os_calls(&self) -> usize {
        self.with(|s| s.os_calls)
    }

    pub fn process_id_capacities(&self) -> Vec<usize> {
        self.with(|s| s.capacities.clone())
    }

    pub fn waited_pids(&self) -> Vec<u32> {
        self.with(|s| s.waited_pids.clone())
    }

    pub fn wait_timeouts(&self) -> Vec<Option<Duration>> {
        self.with(|s| s.wait_timeouts.clone())
    }

    pub fn group_waits(&self) -> usize {
        self.with(|s| s.group_waits)
    }

    pub fn terminate_calls(&self) -> usize {
        self.with(|s| s.terminate_calls)
    }

    pub fn release_count(&self) -> usize {
        self.with(|s| s.release_count)
    }

    pub fn assigned(&self) -> Vec<u32> {
        self.with(|s| s.assigned.clone())
    }
}

struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    fn with<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        state.os_calls += 1;
        f(&mut state)
    }
}

impl JobBackend for FakeBackend {
    fn query_extended_limits(&self) -> Result<ExtendedLimits, OsError> {
        self.with(|s| {
            let mut limits = s.limits;
            limits.peak_job_memory_used = s.peak_memory;
            Ok(limits)
        })
    }

    fn set_extended_limits(&self, limits: &ExtendedLimits) -> Result<(), OsError> {
        self.with(|s| match s.fail_set_limits {
            Some(code) => Err(OsError::new(code)),
            None => {
                s.limits = *limits;
                Ok(())
            }
        })
    }

    fn query_cpu_rate(&self) -> Result<CpuRateControl, OsError> {
        self.with(|s| Ok(s.cpu))
    }

    fn set_cpu_rate(&self, rate: CpuRateControl) -> Result<(), OsError> {
        self.with(|s| {
            s.cpu = rate;
            Ok(())
        })
    }

    fn query_accounting(&self) -> Result<BasicAccounting, OsError> {
        self.with(|s| Ok(s.accounting))
    }

    fn query_process_ids(&self, capacity: usize) -> Result<Vec<u32>, OsError> {
        self.with(|s| {
            s.capacities.push(capacity);
            if let (Some(code), false) = (s.fail_enumeration_until_terminated, s.terminated) {
                return Err(OsError::new(code));
            }
            let members = match (&s.members_after_terminate, s.terminated) {
                (Some(after), true) => after.clone(),
                _ => s.members.clone(),
            };
            if members.len() > capacity {
                Err(OsError::new(ERROR_MORE_DATA))
            } else {
                Ok(members)
            }
        })
    }

    fn assign_process(&self, pid: u32) -> Result<(), OsError> {
        self.with(|s| {
            if let Some(code) = s.fail_assign {
                return Err(OsError::new(code));
            }
            s.assigned.push(pid);
            s.members.push(pid);
            Ok(())
        })
    }

    fn terminate(&self, _exit_code: u32) -> Result<(), OsError> {
        self.with(|s| {
            s.terminate_calls += 1;
            s.terminated = true;
            Ok(())
        })
    }

    fn poll_completion(&self, timeout: Duration) -> Result<Option<CompletionPacket>, OsError> {
        if let Some(packet) = self.with(|s| s.completions.pop_front()) {
            return Ok(Some(packet));
        }
        std::thread::sleep(timeout);
        Ok(None)
    }

    fn wait_for_process(&self, pid: u32, timeout: Option<Duration>) -> Result<bool, OsError> {
        self.with(|s| {
            s.waited_pids.push(pid);
            s.wait_timeouts.push(timeout);
            Ok(!s.stuck_pids.contains(&pid))
        })
    }

    fn wait_until_signaled(&self, timeout: Option<Duration>) -> Result<bool, OsError> {
        self.with(|s| {
            s.group_waits += 1;
            s.wait_timeouts.push(timeout);
            Ok(true)
        })
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.release_count += 1;
        }
    }
}
