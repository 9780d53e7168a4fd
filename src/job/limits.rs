//! In-memory mirror of the resource group limit records
//!
//! The OS accepts the extended limit record as a whole, so every change is
//! expressed as `apply_limit(current, field) -> updated` and written back in
//! one call.

use serde::{Deserialize, Serialize};

/// Limit flags of the extended limit record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LimitFlags(u32);

impl LimitFlags {
    pub const PROCESS_MEMORY: LimitFlags = LimitFlags(0x0000_0100);
    pub const JOB_MEMORY: LimitFlags = LimitFlags(0x0000_0200);
    pub const ACTIVE_PROCESS: LimitFlags = LimitFlags(0x0000_0008);
    pub const PRIORITY_CLASS: LimitFlags = LimitFlags(0x0000_0020);
    pub const KILL_ON_JOB_CLOSE: LimitFlags = LimitFlags(0x0000_2000);

    pub const fn empty() -> Self {
        LimitFlags(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        LimitFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: LimitFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: LimitFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: LimitFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for LimitFlags {
    type Output = LimitFlags;

    fn bitor(self, rhs: LimitFlags) -> LimitFlags {
        LimitFlags(self.0 | rhs.0)
    }
}

/// Scheduling priority class applied to every member process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    Idle,
    BelowNormal,
    #[default]
    Normal,
    AboveNormal,
    High,
    RealTime,
}

impl PriorityClass {
    pub fn as_raw(self) -> u32 {
        match self {
            PriorityClass::Idle => 0x0000_0040,
            PriorityClass::BelowNormal => 0x0000_4000,
            PriorityClass::Normal => 0x0000_0020,
            PriorityClass::AboveNormal => 0x0000_8000,
            PriorityClass::High => 0x0000_0080,
            PriorityClass::RealTime => 0x0000_0100,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0x0000_0040 => Some(PriorityClass::Idle),
            0x0000_4000 => Some(PriorityClass::BelowNormal),
            0x0000_0020 => Some(PriorityClass::Normal),
            0x0000_8000 => Some(PriorityClass::AboveNormal),
            0x0000_0080 => Some(PriorityClass::High),
            0x0000_0100 => Some(PriorityClass::RealTime),
            _ => None,
        }
    }
}

/// Extended limit record as read from and written to the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtendedLimits {
    pub flags: LimitFlags,
    pub active_process_limit: u32,
    pub priority_class: u32,
    pub job_memory_limit: u64,
    pub peak_job_memory_used: u64,
}

/// One field of the extended limit record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitField {
    /// Flag-only policies such as kill-on-job-close
    Flags(LimitFlags),
    /// Job-wide committed memory ceiling in bytes, 0 clears the limit
    JobMemory(u64),
    /// Maximum simultaneously active processes, 0 clears the limit
    ActiveProcesses(u32),
    PriorityClass(PriorityClass),
}

/// Apply one field to a limit record, leaving every other limit untouched
pub fn apply_limit(current: ExtendedLimits, field: LimitField) -> ExtendedLimits {
    let mut updated = current;
    match field {
        LimitField::Flags(flags) => updated.flags.insert(flags),
        LimitField::JobMemory(0) => {
            updated.flags.remove(LimitFlags::JOB_MEMORY);
            updated.job_memory_limit = 0;
        }
        LimitField::JobMemory(bytes) => {
            updated.flags.insert(LimitFlags::JOB_MEMORY);
            updated.job_memory_limit = bytes;
        }
        LimitField::ActiveProcesses(0) => {
            updated.flags.remove(LimitFlags::ACTIVE_PROCESS);
            updated.active_process_limit = 0;
        }
        LimitField::ActiveProcesses(count) => {
            updated.flags.insert(LimitFlags::ACTIVE_PROCESS);
            updated.active_process_limit = count;
        }
        LimitField::PriorityClass(class) => {
            updated.flags.insert(LimitFlags::PRIORITY_CLASS);
            updated.priority_class = class.as_raw();
        }
    }
    updated
}

/// CPU rate control flags
pub const CPU_RATE_CONTROL_ENABLE: u32 = 0x1;
pub const CPU_RATE_CONTROL_WEIGHT_BASED: u32 = 0x2;

pub const MIN_CPU_WEIGHT: u32 = 1;
pub const MAX_CPU_WEIGHT: u32 = 9;

/// CPU rate control record; `value` is the weight when weight based
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuRateControl {
    pub control_flags: u32,
    pub value: u32,
}

impl CpuRateControl {
    pub fn weight_based(weight: u32) -> Self {
        Self {
            control_flags: CPU_RATE_CONTROL_ENABLE | CPU_RATE_CONTROL_WEIGHT_BASED,
            value: weight,
        }
    }
}

/// Limits a container is configured with, 0 meaning unset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitConfiguration {
    #[serde(default)]
    pub cpu_weight: Option<u32>,

    #[serde(default)]
    pub memory_limit_bytes: u64,

    #[serde(default)]
    pub active_process_limit: u32,

    #[serde(default)]
    pub priority_class: Option<PriorityClass>,

    #[serde(default = "default_true")]
    pub kill_on_group_close: bool,
}

fn default_true() -> bool {
    true
}

impl Default for LimitConfiguration {
    fn default() -> Self {
        Self {
            cpu_weight: None,
            memory_limit_bytes: 0,
            active_process_limit: 0,
            priority_class: None,
            kill_on_group_close: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_memory_then_process_limit_keeps_memory() {
        let limits = apply_limit(ExtendedLimits::default(), LimitField::JobMemory(64 << 20));
        let limits = apply_limit(limits, LimitField::ActiveProcesses(10));

        assert!(limits.flags.contains(LimitFlags::JOB_MEMORY));
        assert!(limits.flags.contains(LimitFlags::ACTIVE_PROCESS));
        assert_eq!(limits.job_memory_limit, 64 << 20);
        assert_eq!(limits.active_process_limit, 10);
    }

    #[test]
    fn test_process_then_memory_limit_keeps_process_limit() {
        let limits = apply_limit(ExtendedLimits::default(), LimitField::ActiveProcesses(3));
        let limits = apply_limit(limits, LimitField::JobMemory(1024));

        assert_eq!(limits.active_process_limit, 3);
        assert!(limits.flags.contains(LimitFlags::ACTIVE_PROCESS));
    }

    #[test]
    fn test_zero_clears_instead_of_limiting_to_zero() {
        let limits = apply_limit(ExtendedLimits::default(), LimitField::JobMemory(4096));
        let limits = apply_limit(limits, LimitField::JobMemory(0));
        assert!(!limits.flags.contains(LimitFlags::JOB_MEMORY));
        assert_eq!(limits.job_memory_limit, 0);

        let limits = apply_limit(limits, LimitField::ActiveProcesses(0));
        assert!(!limits.flags.contains(LimitFlags::ACTIVE_PROCESS));
    }

    #[test]
    fn test_flags_are_additive() {
        let start = ExtendedLimits {
            flags: LimitFlags::JOB_MEMORY,
            job_memory_limit: 1,
            ..Default::default()
        };
        let limits = apply_limit(start, LimitField::Flags(LimitFlags::KILL_ON_JOB_CLOSE));
        assert_eq!(
            limits.flags,
            LimitFlags::JOB_MEMORY | LimitFlags::KILL_ON_JOB_CLOSE
        );
        assert_eq!(limits.job_memory_limit, 1);
    }

    #[test]
    fn test_priority_class_round_trips_through_raw_value() {
        let limits = apply_limit(
            ExtendedLimits::default(),
            LimitField::PriorityClass(PriorityClass::BelowNormal),
        );
        assert!(limits.flags.contains(LimitFlags::PRIORITY_CLASS));
        assert_eq!(
            PriorityClass::from_raw(limits.priority_class),
            Some(PriorityClass::BelowNormal)
        );
    }
}
