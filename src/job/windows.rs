//! Job Object backend over the Win32 API

use std::ffi::{c_void, OsStr};
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::ptr;
use std::time::Duration;

use tracing::warn;
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, HANDLE, INVALID_HANDLE_VALUE, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JobObjectAssociateCompletionPortInformation,
    JobObjectBasicAccountingInformation, JobObjectBasicProcessIdList,
    JobObjectCpuRateControlInformation, JobObjectExtendedLimitInformation, OpenJobObjectW,
    QueryInformationJobObject, SetInformationJobObject, TerminateJobObject,
    JOBOBJECTINFOCLASS, JOBOBJECT_ASSOCIATE_COMPLETION_PORT,
    JOBOBJECT_BASIC_ACCOUNTING_INFORMATION, JOBOBJECT_BASIC_PROCESS_ID_LIST,
    JOBOBJECT_CPU_RATE_CONTROL_INFORMATION, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    JOB_OBJECT_ALL_ACCESS,
};
use windows_sys::Win32::System::Threading::{
    OpenProcess, WaitForSingleObject, INFINITE, PROCESS_SET_QUOTA, PROCESS_SYNCHRONIZE,
    PROCESS_TERMINATE,
};
use windows_sys::Win32::System::IO::{CreateIoCompletionPort, GetQueuedCompletionStatus, OVERLAPPED};

use crate::error::OsError;

use super::backend::{BasicAccounting, CompletionPacket, JobBackend};
use super::limits::{CpuRateControl, ExtendedLimits, LimitFlags};

fn wide(s: &str) -> Vec<u16> {
    OsStr::new(s).encode_wide().chain(std::iter::once(0)).collect()
}

fn timeout_ms(timeout: Option<Duration>) -> u32 {
    match timeout {
        None => INFINITE,
        Some(t) => t.as_millis().min((INFINITE - 1) as u128) as u32,
    }
}

fn check(ok: i32) -> Result<(), OsError> {
    if ok == 0 {
        Err(OsError::last())
    } else {
        Ok(())
    }
}

/// Owned Job Object handle plus its (optional) completion port
pub struct WindowsJob {
    handle: HANDLE,
    port: HANDLE,
}

impl WindowsJob {
    pub fn create(name: Option<&str>) -> Result<Self, OsError> {
        let name = name.map(wide);
        let name_ptr = name.as_ref().map(|n| n.as_ptr()).unwrap_or(ptr::null());
        let handle = unsafe { CreateJobObjectW(ptr::null(), name_ptr) };
        if handle == 0 || handle == INVALID_HANDLE_VALUE {
            return Err(OsError::last());
        }

        let mut job = Self { handle, port: 0 };
        if let Err(e) = job.attach_completion_port() {
            warn!(error = %e, "Resource group created without notifications");
        }
        Ok(job)
    }

    pub fn open(name: &str) -> Result<Self, OsError> {
        let name = wide(name);
        let handle = unsafe { OpenJobObjectW(JOB_OBJECT_ALL_ACCESS, 0, name.as_ptr()) };
        if handle == 0 || handle == INVALID_HANDLE_VALUE {
            return Err(OsError::last());
        }
        Ok(Self { handle, port: 0 })
    }

    fn attach_completion_port(&mut self) -> Result<(), OsError> {
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, 0, 0, 1) };
        if port == 0 {
            return Err(OsError::last());
        }

        let association = JOBOBJECT_ASSOCIATE_COMPLETION_PORT {
            CompletionKey: ptr::null_mut(),
            CompletionPort: port,
        };
        if let Err(e) = self.set(JobObjectAssociateCompletionPortInformation, &association) {
            unsafe { CloseHandle(port) };
            return Err(e);
        }
        self.port = port;
        Ok(())
    }

    fn query<T: Copy>(&self, class: JOBOBJECTINFOCLASS) -> Result<T, OsError> {
        let mut info: T = unsafe { mem::zeroed() };
        check(unsafe {
            QueryInformationJobObject(
                self.handle,
                class,
                &mut info as *mut T as *mut c_void,
                mem::size_of::<T>() as u32,
                ptr::null_mut(),
            )
        })?;
        Ok(info)
    }

    fn set<T>(&self, class: JOBOBJECTINFOCLASS, info: &T) -> Result<(), OsError> {
        check(unsafe {
            SetInformationJobObject(
                self.handle,
                class,
                info as *const T as *const c_void,
                mem::size_of::<T>() as u32,
            )
        })
    }
}

impl JobBackend for WindowsJob {
    fn query_extended_limits(&self) -> Result<ExtendedLimits, OsError> {
        let info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION =
            self.query(JobObjectExtendedLimitInformation)?;
        Ok(ExtendedLimits {
            flags: LimitFlags::from_bits(info.BasicLimitInformation.LimitFlags),
            active_process_limit: info.BasicLimitInformation.ActiveProcessLimit,
            priority_class: info.BasicLimitInformation.PriorityClass,
            job_memory_limit: info.JobMemoryLimit as u64,
            peak_job_memory_used: info.PeakJobMemoryUsed as u64,
        })
    }

    fn set_extended_limits(&self, limits: &ExtendedLimits) -> Result<(), OsError> {
        // Keep the fields the mirror does not carry (time limits, working set)
        let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION =
            self.query(JobObjectExtendedLimitInformation)?;
        info.BasicLimitInformation.LimitFlags = limits.flags.bits();
        info.BasicLimitInformation.ActiveProcessLimit = limits.active_process_limit;
        info.BasicLimitInformation.PriorityClass = limits.priority_class;
        info.JobMemoryLimit = limits.job_memory_limit as usize;
        self.set(JobObjectExtendedLimitInformation, &info)
    }

    fn query_cpu_rate(&self) -> Result<CpuRateControl, OsError> {
        let info: JOBOBJECT_CPU_RATE_CONTROL_INFORMATION =
            self.query(JobObjectCpuRateControlInformation)?;
        Ok(CpuRateControl {
            control_flags: info.ControlFlags,
            value: unsafe { info.Anonymous.Weight },
        })
    }

    fn set_cpu_rate(&self, rate: CpuRateControl) -> Result<(), OsError> {
        let mut info: JOBOBJECT_CPU_RATE_CONTROL_INFORMATION = unsafe { mem::zeroed() };
        info.ControlFlags = rate.control_flags;
        info.Anonymous.Weight = rate.value;
        self.set(JobObjectCpuRateControlInformation, &info)
    }

    fn query_accounting(&self) -> Result<BasicAccounting, OsError> {
        let info: JOBOBJECT_BASIC_ACCOUNTING_INFORMATION =
            self.query(JobObjectBasicAccountingInformation)?;
        Ok(BasicAccounting {
            total_user_time: info.TotalUserTime.max(0) as u64,
            total_kernel_time: info.TotalKernelTime.max(0) as u64,
            total_processes: info.TotalProcesses,
            active_processes: info.ActiveProcesses,
        })
    }

    fn query_process_ids(&self, capacity: usize) -> Result<Vec<u32>, OsError> {
        let header = mem::size_of::<JOBOBJECT_BASIC_PROCESS_ID_LIST>() - mem::size_of::<usize>();
        let words = header.div_ceil(mem::size_of::<usize>()) + capacity;
        let mut buffer = vec![0usize; words];
        let list = buffer.as_mut_ptr() as *mut JOBOBJECT_BASIC_PROCESS_ID_LIST;

        unsafe {
            (*list).NumberOfAssignedProcesses = capacity as u32;
            (*list).NumberOfProcessIdsInList = 0;
        }

        check(unsafe {
            QueryInformationJobObject(
                self.handle,
                JobObjectBasicProcessIdList,
                list as *mut c_void,
                (words * mem::size_of::<usize>()) as u32,
                ptr::null_mut(),
            )
        })?;

        let count = unsafe { (*list).NumberOfProcessIdsInList } as usize;
        let ids = unsafe { std::slice::from_raw_parts((*list).ProcessIdList.as_ptr(), count) };
        Ok(ids.iter().map(|id| *id as u32).collect())
    }

    fn assign_process(&self, pid: u32) -> Result<(), OsError> {
        let process = unsafe { OpenProcess(PROCESS_SET_QUOTA | PROCESS_TERMINATE, 0, pid) };
        if process == 0 {
            return Err(OsError::last());
        }
        let result = check(unsafe { AssignProcessToJobObject(self.handle, process) });
        unsafe { CloseHandle(process) };
        result
    }

    fn terminate(&self, exit_code: u32) -> Result<(), OsError> {
        check(unsafe { TerminateJobObject(self.handle, exit_code) })
    }

    fn poll_completion(&self, timeout: Duration) -> Result<Option<CompletionPacket>, OsError> {
        if self.port == 0 {
            std::thread::sleep(timeout);
            return Ok(None);
        }

        let mut code = 0u32;
        let mut key = 0usize;
        let mut overlapped: *mut OVERLAPPED = ptr::null_mut();
        let ok = unsafe {
            GetQueuedCompletionStatus(
                self.port,
                &mut code,
                &mut key,
                &mut overlapped,
                timeout_ms(Some(timeout)),
            )
        };
        if ok == 0 {
            let error = unsafe { GetLastError() };
            if error == WAIT_TIMEOUT {
                return Ok(None);
            }
            return Err(OsError::new(error));
        }
        Ok(Some(CompletionPacket {
            code,
            data: overlapped as usize,
        }))
    }

    fn wait_for_process(&self, pid: u32, timeout: Option<Duration>) -> Result<bool, OsError> {
        let process = unsafe { OpenProcess(PROCESS_SYNCHRONIZE, 0, pid) };
        if process == 0 {
            return Ok(true);
        }
        let status = unsafe { WaitForSingleObject(process, timeout_ms(timeout)) };
        unsafe { CloseHandle(process) };
        match status {
            WAIT_OBJECT_0 => Ok(true),
            WAIT_TIMEOUT => Ok(false),
            _ => Err(OsError::last()),
        }
    }

    fn wait_until_signaled(&self, timeout: Option<Duration>) -> Result<bool, OsError> {
        match unsafe { WaitForSingleObject(self.handle, timeout_ms(timeout)) } {
            WAIT_OBJECT_0 => Ok(true),
            WAIT_TIMEOUT => Ok(false),
            _ => Err(OsError::last()),
        }
    }
}

impl Drop for WindowsJob {
    fn drop(&mut self) {
        unsafe {
            if self.handle != 0 {
                CloseHandle(self.handle);
            }
            if self.port != 0 {
                CloseHandle(self.port);
            }
        }
    }
}
