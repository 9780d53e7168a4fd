//! Windows plumbing: starting the host process and the processes it runs

use std::collections::HashMap;
use std::os::windows::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::windows::named_pipe::ClientOptions;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};
use windows_sys::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
};
use windows_sys::Win32::System::Threading::{
    OpenThread, ResumeThread, CREATE_NEW_PROCESS_GROUP, CREATE_SUSPENDED, THREAD_SUSPEND_RESUME,
};

use crate::config::HostConfig;
use crate::error::{ContainmentError, OsError, Result};
use crate::job::ResourceGroup;

use super::confine::{start_confined, SuspendedProcess};
use super::server::ProcessLauncher;
use super::{CreateProcessParams, HostChannel};

const ERROR_FILE_NOT_FOUND: i32 = 2;
const ERROR_PIPE_BUSY: i32 = 231;
const ERROR_INVALID_PARAMETER: u32 = 87;

/// Launches processes straight into a resource group
pub struct JobProcessLauncher {
    group: Arc<ResourceGroup>,
    children: Mutex<HashMap<u32, Child>>,
}

impl JobProcessLauncher {
    pub fn new(group: Arc<ResourceGroup>) -> Self {
        Self {
            group,
            children: Mutex::new(HashMap::new()),
        }
    }

    fn children(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Child>> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ProcessLauncher for JobProcessLauncher {
    fn launch(&self, params: &CreateProcessParams) -> Result<u32> {
        let mut command = Command::new(&params.executable_path);
        command
            .args(&params.arguments)
            .env_clear()
            .envs(&params.environment)
            .stdin(Stdio::null())
            .creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_SUSPENDED);
        if !params.working_directory.is_empty() {
            command.current_dir(&params.working_directory);
        }

        let SuspendedChild(child) = start_confined(&self.group, SuspendedChild(command.spawn()?))?;
        let pid = child.id();

        self.children().insert(pid, child);
        Ok(pid)
    }

    fn is_running(&self, pid: u32) -> bool {
        let mut children = self.children();
        let Some(child) = children.get_mut(&pid) else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(pid, %status, "Process exited");
                children.remove(&pid);
                false
            }
            Err(_) => false,
        }
    }

    fn request_stop(&self, pid: u32) -> Result<()> {
        // Each child leads its own console process group, so its pid is the group id
        if unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) } == 0 {
            return Err(ContainmentError::os("GenerateConsoleCtrlEvent", OsError::last()));
        }
        Ok(())
    }

    fn terminate_all(&self) -> Result<()> {
        self.group.terminate()?;
        self.children().clear();
        Ok(())
    }
}

/// A child spawned with `CREATE_SUSPENDED`
struct SuspendedChild(Child);

impl SuspendedProcess for SuspendedChild {
    fn pid(&self) -> u32 {
        self.0.id()
    }

    fn resume(&mut self) -> Result<()> {
        resume_threads(self.0.id())
    }

    fn kill(&mut self) {
        if let Err(e) = self.0.kill() {
            warn!(pid = self.0.id(), error = %e, "Failed to kill process");
            return;
        }
        let _ = self.0.wait();
    }
}

/// Resume every thread owned by `pid`
fn resume_threads(pid: u32) -> Result<()> {
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) };
    if snapshot == INVALID_HANDLE_VALUE {
        return Err(ContainmentError::os("CreateToolhelp32Snapshot", OsError::last()));
    }

    let result = resume_from_snapshot(snapshot, pid);
    unsafe { CloseHandle(snapshot) };
    match result? {
        0 => Err(ContainmentError::os(
            "ResumeThread",
            OsError::new(ERROR_INVALID_PARAMETER),
        )),
        _ => Ok(()),
    }
}

fn resume_from_snapshot(snapshot: HANDLE, pid: u32) -> Result<usize> {
    let mut entry: THREADENTRY32 = unsafe { std::mem::zeroed() };
    entry.dwSize = std::mem::size_of::<THREADENTRY32>() as u32;

    let mut resumed = 0;
    let mut more = unsafe { Thread32First(snapshot, &mut entry) } != 0;
    while more {
        if entry.th32OwnerProcessID == pid {
            let thread = unsafe { OpenThread(THREAD_SUSPEND_RESUME, 0, entry.th32ThreadID) };
            if thread == 0 {
                return Err(ContainmentError::os("OpenThread", OsError::last()));
            }
            let previous = unsafe { ResumeThread(thread) };
            let error = OsError::last();
            unsafe { CloseHandle(thread) };
            if previous == u32::MAX {
                return Err(ContainmentError::os("ResumeThread", error));
            }
            debug!(pid, thread = entry.th32ThreadID, "Thread resumed");
            resumed += 1;
        }
        more = unsafe { Thread32Next(snapshot, &mut entry) } != 0;
    }
    Ok(resumed)
}

/// A running host process and the channel connected to it
pub struct SpawnedHost {
    pub process: tokio::process::Child,
    pub channel: HostChannel,
}

/// Start `wincage-host` for one container and connect to its pipe
pub async fn spawn_host(
    config: &HostConfig,
    container_handle: &str,
    group_name: &str,
) -> Result<SpawnedHost> {
    let pipe = config.pipe_name(container_handle);
    info!(pipe = %pipe, executable = %config.executable.display(), "Starting container host");

    let process = tokio::process::Command::new(&config.executable)
        .arg("--pipe")
        .arg(&pipe)
        .arg("--group")
        .arg(group_name)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    let deadline = Instant::now() + config.connect_timeout();
    let client = loop {
        match ClientOptions::new().open(&pipe) {
            Ok(client) => break client,
            Err(e)
                if matches!(e.raw_os_error(), Some(ERROR_FILE_NOT_FOUND | ERROR_PIPE_BUSY))
                    && Instant::now() < deadline =>
            {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            Err(e) => {
                return Err(ContainmentError::HostCommunicationFailed(format!(
                    "Unable to connect to {}: {}",
                    pipe, e
                )))
            }
        }
    };

    let (reader, writer) = tokio::io::split(client);
    debug!(pipe = %pipe, "Connected to container host");
    Ok(SpawnedHost {
        process,
        channel: HostChannel::new(reader, writer),
    })
}
