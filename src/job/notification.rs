//! Resource group notifications and the monitoring task that forwards them

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::CompletionPacket;
use super::ResourceGroup;

// Completion port message codes
const MSG_END_OF_JOB_TIME: u32 = 1;
const MSG_END_OF_PROCESS_TIME: u32 = 2;
const MSG_ACTIVE_PROCESS_LIMIT: u32 = 3;
const MSG_ACTIVE_PROCESS_ZERO: u32 = 4;
const MSG_NEW_PROCESS: u32 = 6;
const MSG_EXIT_PROCESS: u32 = 7;
const MSG_ABNORMAL_EXIT_PROCESS: u32 = 8;
const MSG_PROCESS_MEMORY_LIMIT: u32 = 9;
const MSG_JOB_MEMORY_LIMIT: u32 = 10;

/// Lifecycle or limit event reported by a resource group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    NewProcess { pid: u32 },
    ExitProcess { pid: u32 },
    AbnormalExitProcess { pid: u32 },
    ActiveProcessLimit,
    ActiveProcessZero,
    MemoryLimit { pid: Option<u32> },
    EndOfProcessTime { pid: u32 },
    EndOfJobTime,
    /// Codes this runtime does not interpret
    Other { code: u32 },
    /// The poll interval elapsed without an event
    None,
}

impl NotificationEvent {
    pub fn from_packet(packet: CompletionPacket) -> Self {
        let pid = packet.data as u32;
        match packet.code {
            MSG_END_OF_JOB_TIME => NotificationEvent::EndOfJobTime,
            MSG_END_OF_PROCESS_TIME => NotificationEvent::EndOfProcessTime { pid },
            MSG_ACTIVE_PROCESS_LIMIT => NotificationEvent::ActiveProcessLimit,
            MSG_ACTIVE_PROCESS_ZERO => NotificationEvent::ActiveProcessZero,
            MSG_NEW_PROCESS => NotificationEvent::NewProcess { pid },
            MSG_EXIT_PROCESS => NotificationEvent::ExitProcess { pid },
            MSG_ABNORMAL_EXIT_PROCESS => NotificationEvent::AbnormalExitProcess { pid },
            MSG_PROCESS_MEMORY_LIMIT => NotificationEvent::MemoryLimit { pid: Some(pid) },
            MSG_JOB_MEMORY_LIMIT => NotificationEvent::MemoryLimit { pid: None },
            code => NotificationEvent::Other { code },
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, NotificationEvent::None)
    }

    /// True for events that report a limit being hit
    pub fn is_limit_violation(&self) -> bool {
        matches!(
            self,
            NotificationEvent::ActiveProcessLimit
                | NotificationEvent::MemoryLimit { .. }
                | NotificationEvent::EndOfProcessTime { .. }
                | NotificationEvent::EndOfJobTime
        )
    }
}

/// Dedicated task polling a resource group and broadcasting its events.
///
/// Events published while nobody is subscribed are dropped, matching the
/// at-most-once nature of the underlying completion port.
pub struct NotificationMonitor {
    sender: broadcast::Sender<NotificationEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl NotificationMonitor {
    /// Start polling `group` on a blocking thread
    pub fn spawn(group: Arc<ResourceGroup>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        let cancel = CancellationToken::new();

        let task_sender = sender.clone();
        let task_cancel = cancel.clone();
        let task = tokio::task::spawn_blocking(move || {
            info!(group = %group.name(), "Notification monitor started");
            while !task_cancel.is_cancelled() {
                match group.next_notification() {
                    Ok(NotificationEvent::None) => continue,
                    Ok(event) => {
                        if event.is_limit_violation() {
                            warn!(group = %group.name(), ?event, "Resource group limit reached");
                        } else {
                            debug!(group = %group.name(), ?event, "Resource group event");
                        }
                        let _ = task_sender.send(event);
                    }
                    Err(e) => {
                        debug!(group = %group.name(), error = %e, "Stopping notification monitor");
                        break;
                    }
                }
            }
            info!(group = %group.name(), "Notification monitor stopped");
        });

        Self {
            sender,
            cancel,
            task: Some(task),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.sender.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Signal the polling loop and wait for it to exit
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for NotificationMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
