//! Resource groups (Job Objects): the confinement boundary of a container
//!
//! A `ResourceGroup` owns one group handle and its completion port. It
//! handles:
//! - CPU weight, memory ceiling, active process and priority limits
//! - CPU time and peak memory accounting
//! - Member enumeration and termination
//! - Bounded polling of lifecycle and limit notifications

mod backend;
mod limits;
mod notification;

#[cfg(windows)]
mod windows;

#[cfg(test)]
pub(crate) mod fake;

use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{ContainmentError, Result};

pub use backend::{query_with_growing_buffer, BasicAccounting, CompletionPacket, JobBackend};
pub use limits::{
    apply_limit, CpuRateControl, ExtendedLimits, LimitConfiguration, LimitField, LimitFlags,
    PriorityClass, MAX_CPU_WEIGHT, MIN_CPU_WEIGHT,
};
pub use notification::{NotificationEvent, NotificationMonitor};

#[cfg(windows)]
pub use self::windows::WindowsJob;

/// Default bound on a single notification poll
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

const PROCESS_ID_INITIAL_CAPACITY: usize = 5;
const PROCESS_ID_CAPACITY_STEP: usize = 5;

/// Cumulative CPU time consumed by all processes ever in the group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuStatistics {
    pub total_kernel_time: Duration,
    pub total_user_time: Duration,
}

impl CpuStatistics {
    pub fn total(&self) -> Duration {
        self.total_kernel_time + self.total_user_time
    }
}

fn ticks_to_duration(ticks: u64) -> Duration {
    Duration::from_nanos(ticks.saturating_mul(100))
}

/// Owned resource group handle
pub struct ResourceGroup {
    name: String,
    backend: RwLock<Option<Box<dyn JobBackend>>>,
    poll_interval: Duration,
}

impl std::fmt::Debug for ResourceGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGroup")
            .field("name", &self.name)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl ResourceGroup {
    /// Create a new group, optionally named
    #[cfg(windows)]
    pub fn create(name: Option<&str>) -> Result<Self> {
        let backend =
            WindowsJob::create(name).map_err(ContainmentError::ResourceGroupCreationFailed)?;
        Self::from_created_backend(name.unwrap_or("anonymous"), Box::new(backend))
    }

    /// Open an existing named group
    #[cfg(windows)]
    pub fn open_existing(name: &str) -> Result<Self> {
        let backend =
            WindowsJob::open(name).map_err(ContainmentError::ResourceGroupCreationFailed)?;
        Ok(Self::from_backend(name, Box::new(backend)))
    }

    /// Wrap an already opened group without changing its policy
    pub fn from_backend(name: &str, backend: Box<dyn JobBackend>) -> Self {
        Self {
            name: name.to_string(),
            backend: RwLock::new(Some(backend)),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Wrap a freshly created group and install the kill-on-close policy
    pub fn from_created_backend(name: &str, backend: Box<dyn JobBackend>) -> Result<Self> {
        let group = Self::from_backend(name, backend);
        group
            .update_limits(LimitField::Flags(LimitFlags::KILL_ON_JOB_CLOSE))
            .map_err(|e| match e {
                ContainmentError::Os { source, .. } => {
                    ContainmentError::ResourceGroupCreationFailed(source)
                }
                other => other,
            })?;
        info!(group = %name, "Resource group created");
        Ok(group)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn is_disposed(&self) -> bool {
        self.backend
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn with_backend<T>(&self, f: impl FnOnce(&dyn JobBackend) -> Result<T>) -> Result<T> {
        let guard = self.backend.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_deref() {
            Some(backend) => f(backend),
            None => Err(ContainmentError::ObjectDisposed("ResourceGroup")),
        }
    }

    fn limits(&self) -> Result<ExtendedLimits> {
        self.with_backend(|b| {
            b.query_extended_limits()
                .map_err(|e| ContainmentError::os("QueryInformationJobObject(ExtendedLimit)", e))
        })
    }

    /// Read the current record, apply one field and write the whole record back
    fn update_limits(&self, field: LimitField) -> Result<()> {
        self.with_backend(|b| {
            let current = b
                .query_extended_limits()
                .map_err(|e| ContainmentError::os("QueryInformationJobObject(ExtendedLimit)", e))?;
            let updated = apply_limit(current, field);
            b.set_extended_limits(&updated)
                .map_err(|e| ContainmentError::os("SetInformationJobObject(ExtendedLimit)", e))
        })
    }

    pub fn set_cpu_limit(&self, weight: u32) -> Result<()> {
        if !(MIN_CPU_WEIGHT..=MAX_CPU_WEIGHT).contains(&weight) {
            return Err(ContainmentError::ArgumentOutOfRange {
                name: "cpu_weight",
                value: weight as i64,
                min: MIN_CPU_WEIGHT as i64,
                max: MAX_CPU_WEIGHT as i64,
            });
        }
        self.with_backend(|b| {
            b.set_cpu_rate(CpuRateControl::weight_based(weight))
                .map_err(|e| ContainmentError::os("SetInformationJobObject(CpuRateControl)", e))
        })?;
        debug!(group = %self.name, weight, "CPU weight set");
        Ok(())
    }

    pub fn cpu_limit(&self) -> Result<u32> {
        self.with_backend(|b| {
            b.query_cpu_rate()
                .map(|rate| rate.value)
                .map_err(|e| ContainmentError::os("QueryInformationJobObject(CpuRateControl)", e))
        })
    }

    /// Set the job-wide memory ceiling; 0 removes it
    pub fn set_memory_limit(&self, bytes: u64) -> Result<()> {
        self.update_limits(LimitField::JobMemory(bytes))?;
        debug!(group = %self.name, bytes, "Memory limit set");
        Ok(())
    }

    pub fn memory_limit(&self) -> Result<u64> {
        let limits = self.limits()?;
        if limits.flags.contains(LimitFlags::JOB_MEMORY) {
            Ok(limits.job_memory_limit)
        } else {
            Ok(0)
        }
    }

    pub fn peak_memory_used(&self) -> Result<u64> {
        let limits = self.limits()?;
        if limits.flags.contains(LimitFlags::JOB_MEMORY) {
            Ok(limits.peak_job_memory_used)
        } else {
            Ok(0)
        }
    }

    /// Cap simultaneously active processes; 0 removes the cap
    pub fn set_active_process_limit(&self, count: u32) -> Result<()> {
        self.update_limits(LimitField::ActiveProcesses(count))?;
        debug!(group = %self.name, count, "Active process limit set");
        Ok(())
    }

    pub fn active_process_limit(&self) -> Result<u32> {
        let limits = self.limits()?;
        if limits.flags.contains(LimitFlags::ACTIVE_PROCESS) {
            Ok(limits.active_process_limit)
        } else {
            Ok(0)
        }
    }

    pub fn set_priority_class(&self, class: PriorityClass) -> Result<()> {
        self.update_limits(LimitField::PriorityClass(class))?;
        debug!(group = %self.name, ?class, "Priority class set");
        Ok(())
    }

    pub fn priority_class(&self) -> Result<Option<PriorityClass>> {
        let limits = self.limits()?;
        if limits.flags.contains(LimitFlags::PRIORITY_CLASS) {
            Ok(PriorityClass::from_raw(limits.priority_class))
        } else {
            Ok(None)
        }
    }

    /// Apply every configured limit, skipping the unset ones
    pub fn apply_configuration(&self, config: &LimitConfiguration) -> Result<()> {
        if let Some(weight) = config.cpu_weight {
            self.set_cpu_limit(weight)?;
        }
        if config.memory_limit_bytes > 0 {
            self.set_memory_limit(config.memory_limit_bytes)?;
        }
        if config.active_process_limit > 0 {
            self.set_active_process_limit(config.active_process_limit)?;
        }
        if let Some(class) = config.priority_class {
            self.set_priority_class(class)?;
        }
        if config.kill_on_group_close {
            self.update_limits(LimitField::Flags(LimitFlags::KILL_ON_JOB_CLOSE))?;
        }
        Ok(())
    }

    pub fn cpu_statistics(&self) -> Result<CpuStatistics> {
        let accounting = self.with_backend(|b| {
            b.query_accounting()
                .map_err(|e| ContainmentError::os("QueryInformationJobObject(BasicAccounting)", e))
        })?;
        Ok(CpuStatistics {
            total_kernel_time: ticks_to_duration(accounting.total_kernel_time),
            total_user_time: ticks_to_duration(accounting.total_user_time),
        })
    }

    pub fn member_process_ids(&self) -> Result<Vec<u32>> {
        self.with_backend(|b| {
            query_with_growing_buffer(
                PROCESS_ID_INITIAL_CAPACITY,
                PROCESS_ID_CAPACITY_STEP,
                |capacity| b.query_process_ids(capacity),
            )
            .map_err(|e| ContainmentError::os("QueryInformationJobObject(ProcessIdList)", e))
        })
    }

    pub fn assign_process(&self, pid: u32) -> Result<()> {
        self.with_backend(|b| {
            b.assign_process(pid)
                .map_err(|e| ContainmentError::os("AssignProcessToJobObject", e))
        })?;
        debug!(group = %self.name, pid, "Process assigned");
        Ok(())
    }

    /// Block for at most the poll interval waiting for the next event
    pub fn next_notification(&self) -> Result<NotificationEvent> {
        let packet = self.with_backend(|b| {
            b.poll_completion(self.poll_interval)
                .map_err(|e| ContainmentError::os("GetQueuedCompletionStatus", e))
        })?;
        Ok(packet
            .map(NotificationEvent::from_packet)
            .unwrap_or(NotificationEvent::None))
    }

    /// Lazy, endless sequence of polls; ends once the group is disposed
    pub fn notifications(&self) -> Notifications<'_> {
        Notifications {
            group: self,
            done: false,
        }
    }

    pub fn terminate(&self) -> Result<()> {
        self.with_backend(|b| {
            b.terminate(0)
                .map_err(|e| ContainmentError::os("TerminateJobObject", e))
        })?;
        info!(group = %self.name, "Resource group terminated");
        Ok(())
    }

    /// Terminate every member and wait for them to exit.
    ///
    /// Members are enumerated both before and after termination and the
    /// union is waited on, followed by the group's own signaled state. All
    /// waits share one deadline; `None` or a zero timeout waits forever.
    /// Returns false when the deadline passed first.
    pub fn terminate_and_wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout
            .filter(|t| !t.is_zero())
            .map(|t| Instant::now() + t);

        // The kill must happen even when the group cannot be listed
        let mut pids: BTreeSet<u32> = match self.member_process_ids() {
            Ok(pids) => pids.into_iter().collect(),
            Err(e) => {
                warn!(group = %self.name, error = %e, "Could not list members before terminating");
                BTreeSet::new()
            }
        };
        self.terminate()?;
        pids.extend(self.member_process_ids()?);

        let exited = self.with_backend(|b| {
            let mut all_exited = true;
            for pid in &pids {
                let exited = b
                    .wait_for_process(*pid, remaining(deadline))
                    .map_err(|e| ContainmentError::os("WaitForSingleObject(process)", e))?;
                if !exited {
                    warn!(group = %self.name, pid, "Process did not exit before deadline");
                    all_exited = false;
                }
            }
            let signaled = b
                .wait_until_signaled(remaining(deadline))
                .map_err(|e| ContainmentError::os("WaitForSingleObject(job)", e))?;
            Ok(all_exited && signaled)
        })?;

        debug!(group = %self.name, members = pids.len(), exited, "Terminate and wait finished");
        Ok(exited)
    }

    /// Release the handle and completion port. Safe to call repeatedly.
    pub fn dispose(&self) {
        let backend = self
            .backend
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if backend.is_some() {
            debug!(group = %self.name, "Resource group disposed");
        }
        drop(backend);
    }
}

impl Drop for ResourceGroup {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}

/// Iterator returned by [`ResourceGroup::notifications`]
pub struct Notifications<'a> {
    group: &'a ResourceGroup,
    done: bool,
}

impl Iterator for Notifications<'_> {
    type Item = Result<NotificationEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = self.group.next_notification();
        if matches!(next, Err(ContainmentError::ObjectDisposed(_))) {
            self.done = true;
            return None;
        }
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OsError;
    use crate::job::fake::FakeJob;

    fn group(fake: &FakeJob) -> ResourceGroup {
        ResourceGroup::from_created_backend("test", fake.backend()).unwrap()
    }

    #[test]
    fn test_creation_installs_kill_on_close() {
        let fake = FakeJob::new();
        let _group = group(&fake);
        assert!(fake.limits().flags.contains(LimitFlags::KILL_ON_JOB_CLOSE));
    }

    #[test]
    fn test_creation_failure_maps_to_creation_error() {
        let fake = FakeJob::new();
        fake.fail_set_limits(5);
        let err = ResourceGroup::from_created_backend("test", fake.backend()).unwrap_err();
        assert!(matches!(err, ContainmentError::ResourceGroupCreationFailed(OsError { code: 5 })));
    }

    #[test]
    fn test_cpu_weight_round_trip() {
        let fake = FakeJob::new();
        let group = group(&fake);
        for weight in MIN_CPU_WEIGHT..=MAX_CPU_WEIGHT {
            group.set_cpu_limit(weight).unwrap();
            assert_eq!(group.cpu_limit().unwrap(), weight);
        }
    }

    #[test]
    fn test_cpu_weight_out_of_range_never_reaches_os() {
        let fake = FakeJob::new();
        let group = group(&fake);
        let calls_before = fake.os_calls();

        for weight in [0, 10, 100, u32::MAX] {
            let err = group.set_cpu_limit(weight).unwrap_err();
            assert!(matches!(err, ContainmentError::ArgumentOutOfRange { .. }));
        }
        assert_eq!(fake.os_calls(), calls_before);
    }

    #[test]
    fn test_memory_limit_survives_process_limit() {
        let fake = FakeJob::new();
        let group = group(&fake);

        group.set_memory_limit(256 << 20).unwrap();
        group.set_active_process_limit(4).unwrap();

        assert_eq!(group.memory_limit().unwrap(), 256 << 20);
        assert_eq!(group.active_process_limit().unwrap(), 4);
        assert!(fake.limits().flags.contains(LimitFlags::KILL_ON_JOB_CLOSE));
    }

    #[test]
    fn test_process_limit_survives_memory_and_priority() {
        let fake = FakeJob::new();
        let group = group(&fake);

        group.set_active_process_limit(7).unwrap();
        group.set_memory_limit(1 << 30).unwrap();
        group.set_priority_class(PriorityClass::BelowNormal).unwrap();

        assert_eq!(group.active_process_limit().unwrap(), 7);
        assert_eq!(group.memory_limit().unwrap(), 1 << 30);
        assert_eq!(group.priority_class().unwrap(), Some(PriorityClass::BelowNormal));
    }

    #[test]
    fn test_peak_memory_is_zero_without_memory_limit() {
        let fake = FakeJob::new();
        fake.set_peak_memory(4096);
        let group = group(&fake);

        assert_eq!(group.peak_memory_used().unwrap(), 0);
        group.set_memory_limit(1 << 20).unwrap();
        assert_eq!(group.peak_memory_used().unwrap(), 4096);
    }

    #[test]
    fn test_os_failure_is_wrapped_with_code() {
        let fake = FakeJob::new();
        let group = group(&fake);
        fake.fail_set_limits(87);

        let err = group.set_memory_limit(1024).unwrap_err();
        assert_eq!(err.os_code(), Some(87));
        assert!(err.to_string().contains("SetInformationJobObject"));
    }

    #[test]
    fn test_member_enumeration_grows_buffer() {
        let fake = FakeJob::new();
        let members: Vec<u32> = (1000..1013).collect();
        fake.set_members(members.clone());
        let group = group(&fake);

        let pids = group.member_process_ids().unwrap();

        assert_eq!(pids, members);
        assert_eq!(fake.process_id_capacities(), vec![5, 10, 15]);
    }

    #[test]
    fn test_member_enumeration_with_empty_group() {
        let fake = FakeJob::new();
        let group = group(&fake);
        assert!(group.member_process_ids().unwrap().is_empty());
        assert_eq!(fake.process_id_capacities(), vec![5]);
    }

    #[test]
    fn test_cpu_statistics_converts_ticks() {
        let fake = FakeJob::new();
        fake.set_accounting(BasicAccounting {
            total_user_time: 20_000_000,
            total_kernel_time: 10_000_000,
            ..Default::default()
        });
        let group = group(&fake);

        let stats = group.cpu_statistics().unwrap();
        assert_eq!(stats.total_user_time, Duration::from_secs(2));
        assert_eq!(stats.total_kernel_time, Duration::from_secs(1));
        assert_eq!(stats.total(), Duration::from_secs(3));
    }

    #[test]
    fn test_poll_yields_none_on_timeout() {
        let fake = FakeJob::new();
        let group = group(&fake).with_poll_interval(Duration::from_millis(1));

        assert_eq!(group.next_notification().unwrap(), NotificationEvent::None);

        fake.push_completion(CompletionPacket { code: 3, data: 0 });
        let events: Vec<_> = group.notifications().take(2).map(|e| e.unwrap()).collect();
        assert_eq!(
            events,
            vec![NotificationEvent::ActiveProcessLimit, NotificationEvent::None]
        );
    }

    #[test]
    fn test_terminate_and_wait_waits_on_members_seen_before_and_after() {
        let fake = FakeJob::new();
        fake.set_members(vec![1, 2]);
        fake.set_members_after_terminate(vec![3]);
        let group = group(&fake);

        let exited = group.terminate_and_wait(Some(Duration::from_secs(1))).unwrap();

        assert!(exited);
        assert_eq!(fake.terminate_calls(), 1);
        assert_eq!(fake.waited_pids(), vec![1, 2, 3]);
        assert_eq!(fake.group_waits(), 1);
    }

    #[test]
    fn test_terminate_and_wait_terminates_when_members_cannot_be_listed() {
        let fake = FakeJob::new();
        fake.set_members(vec![1, 2]);
        fake.set_members_after_terminate(vec![2]);
        fake.fail_enumeration_until_terminated(5);
        let group = group(&fake);

        let exited = group.terminate_and_wait(Some(Duration::from_secs(1))).unwrap();

        assert!(exited);
        assert_eq!(fake.terminate_calls(), 1);
        assert_eq!(fake.waited_pids(), vec![2]);
    }

    #[test]
    fn test_terminate_and_wait_zero_timeout_waits_forever() {
        let fake = FakeJob::new();
        fake.set_members(vec![9]);
        let group = group(&fake);

        group.terminate_and_wait(Some(Duration::ZERO)).unwrap();

        assert_eq!(fake.wait_timeouts(), vec![None, None]);
    }

    #[test]
    fn test_terminate_and_wait_reports_stragglers() {
        let fake = FakeJob::new();
        fake.set_members(vec![5]);
        fake.set_stuck_pids(vec![5]);
        let group = group(&fake);

        assert!(!group.terminate_and_wait(Some(Duration::from_millis(10))).unwrap());
    }

    #[test]
    fn test_dispose_twice_releases_once() {
        let fake = FakeJob::new();
        let group = group(&fake);

        group.dispose();
        group.dispose();
        drop(group);

        assert_eq!(fake.release_count(), 1);
    }

    #[test]
    fn test_operations_after_dispose_fail() {
        let fake = FakeJob::new();
        let group = group(&fake);
        group.dispose();

        assert!(matches!(
            group.set_memory_limit(1),
            Err(ContainmentError::ObjectDisposed(_))
        ));
        assert!(matches!(group.cpu_statistics(), Err(ContainmentError::ObjectDisposed(_))));
        assert!(matches!(group.terminate(), Err(ContainmentError::ObjectDisposed(_))));
        assert!(group.notifications().next().is_none());
        assert!(group.is_disposed());
    }

    #[test]
    fn test_apply_configuration_skips_unset_limits() {
        let fake = FakeJob::new();
        let group = group(&fake);

        group
            .apply_configuration(&LimitConfiguration {
                cpu_weight: Some(3),
                memory_limit_bytes: 0,
                active_process_limit: 12,
                priority_class: None,
                kill_on_group_close: true,
            })
            .unwrap();

        assert_eq!(group.cpu_limit().unwrap(), 3);
        assert_eq!(group.memory_limit().unwrap(), 0);
        assert_eq!(group.active_process_limit().unwrap(), 12);
        assert_eq!(group.priority_class().unwrap(), None);
    }
}
