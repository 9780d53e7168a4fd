//! Starting a process so that none of its code runs outside its group

use tracing::warn;

use crate::error::Result;
use crate::job::ResourceGroup;

/// A process created suspended: it exists but its first thread has not run
pub trait SuspendedProcess {
    fn pid(&self) -> u32;

    fn resume(&mut self) -> Result<()>;

    fn kill(&mut self);
}

/// Assign a suspended process to `group`, then let it run.
///
/// The process is killed if either step fails, so nothing it could spawn
/// ever starts outside the group.
pub fn start_confined<P: SuspendedProcess>(group: &ResourceGroup, mut process: P) -> Result<P> {
    let pid = process.pid();

    if let Err(e) = group.assign_process(pid) {
        warn!(pid, error = %e, "Could not place process in resource group, killing it");
        process.kill();
        return Err(e);
    }

    if let Err(e) = process.resume() {
        warn!(pid, error = %e, "Could not resume confined process, killing it");
        process.kill();
        return Err(e);
    }

    Ok(process)
}
