//! Containers: the composition root of the runtime
//!
//! A `Container` owns one resource group, one process supervisor and one
//! port manager, plus the user identity, disk quota and directory that
//! scope them. It handles:
//! - Running and stopping processes through the privileged host
//! - CPU, memory, disk, process-count and priority limits
//! - Port reservation and outbound firewall rules
//! - Metrics and limit notifications ("guard")
//! - Teardown of everything above

mod disk;
mod user;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::error::{ContainmentError, Result};
use crate::job::{NotificationEvent, NotificationMonitor, PriorityClass, ResourceGroup};
use crate::network::{FirewallRuleSpec, LocalTcpPortManager, PortReservation};
use crate::process::{ProcessRunSpec, ProcessSupervisor, SupervisedProcess};

pub use disk::{directory_size, parse_quota_limit, DiskQuota, FsutilDiskQuota};
pub use user::{ContainerUser, ImpersonationGuard};

#[cfg(windows)]
pub use user::LocalUser;

/// Container lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Active,
    /// Processes were stopped; the container can still be inspected
    Stopped,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CpuMetrics {
    pub total_kernel_time: Duration,
    pub total_user_time: Duration,
    pub total_time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryMetrics {
    pub peak_committed_bytes: u64,
    /// 0 when unlimited
    pub limit_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiskMetrics {
    pub used_bytes: u64,
    /// 0 when no quota is set
    pub limit_bytes: u64,
}

/// Point-in-time usage snapshot of one container
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerMetrics {
    pub handle: String,
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    pub disk: DiskMetrics,
    pub collected_at: DateTime<Utc>,
}

/// Everything a container is built from
pub struct ContainerParts {
    pub handle: String,
    pub directory: PathBuf,
    pub group: Arc<ResourceGroup>,
    pub supervisor: ProcessSupervisor,
    pub ports: LocalTcpPortManager,
    pub user: Arc<dyn ContainerUser>,
    pub disk_quota: Arc<dyn DiskQuota>,
    pub monitor: MonitorConfig,
    pub terminate_timeout: Option<Duration>,
    /// The `wincage-host` process serving `supervisor`, when this side
    /// started it
    pub host_process: Option<tokio::process::Child>,
}

pub struct Container {
    /// Short identifier, also used to name the group and the host pipe
    handle: String,

    /// Working directory; removed on destroy
    directory: PathBuf,

    created_at: DateTime<Utc>,

    group: Arc<ResourceGroup>,
    supervisor: ProcessSupervisor,
    ports: LocalTcpPortManager,
    user: Arc<dyn ContainerUser>,
    disk_quota: Arc<dyn DiskQuota>,
    monitor_config: MonitorConfig,
    terminate_timeout: Option<Duration>,

    state: RwLock<ContainerState>,

    /// At most one live port reservation
    reservation: Mutex<Option<PortReservation>>,

    monitor: Mutex<Option<NotificationMonitor>>,
    host_process: Mutex<Option<tokio::process::Child>>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("handle", &self.handle)
            .field("directory", &self.directory)
            .field("principal", &self.user.principal())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Collects teardown failures so every step runs
struct Teardown<'a> {
    handle: &'a str,
    first_error: Option<ContainmentError>,
}

impl<'a> Teardown<'a> {
    fn new(handle: &'a str) -> Self {
        Self {
            handle,
            first_error: None,
        }
    }

    fn step(&mut self, name: &'static str, result: Result<()>) {
        if let Err(e) = result {
            warn!(handle = %self.handle, step = name, error = %e, "Teardown step failed");
            if self.first_error.is_none() {
                self.first_error = Some(e);
            }
        }
    }

    fn finish(self) -> Result<()> {
        match self.first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Container {
    pub fn from_parts(parts: ContainerParts) -> Self {
        Self {
            handle: parts.handle,
            directory: parts.directory,
            created_at: Utc::now(),
            group: parts.group,
            supervisor: parts.supervisor,
            ports: parts.ports,
            user: parts.user,
            disk_quota: parts.disk_quota,
            monitor_config: parts.monitor,
            terminate_timeout: parts.terminate_timeout,
            state: RwLock::new(ContainerState::Active),
            reservation: Mutex::new(None),
            monitor: Mutex::new(None),
            host_process: Mutex::new(parts.host_process),
        }
    }

    /// Create a container under `config.container_root`: directory,
    /// configured resource group, host process and disk quota
    #[cfg(windows)]
    pub async fn create(
        config: &crate::config::AppConfig,
        handle: &str,
        user: Arc<dyn ContainerUser>,
    ) -> Result<Self> {
        use crate::host::{launcher, HostClient};
        use crate::process::Environment;

        let directory = config.container_root.join(handle);
        tokio::fs::create_dir_all(directory.join("tmp")).await?;
        info!(handle = %handle, directory = %directory.display(), "Creating container");

        let group_name = format!("wincage-{}", handle);
        let group = Arc::new(
            ResourceGroup::create(Some(group_name.as_str()))?
                .with_poll_interval(config.monitor.poll_interval()),
        );
        group.apply_configuration(&config.limits)?;

        let host = launcher::spawn_host(&config.host, handle, &group_name).await?;
        let client: Arc<dyn HostClient> = Arc::new(host.channel);
        let supervisor = ProcessSupervisor::with_default_environment(
            client,
            Environment::container_block(&directory),
        );

        let disk_quota = Arc::new(FsutilDiskQuota::for_path(&directory)?);
        if config.disk_quota_bytes > 0 {
            disk_quota
                .set_quota(user.principal(), config.disk_quota_bytes)
                .await?;
        }

        Ok(Self::from_parts(ContainerParts {
            handle: handle.to_string(),
            directory,
            group,
            supervisor,
            ports: LocalTcpPortManager::system(),
            user,
            disk_quota,
            monitor: config.monitor.clone(),
            terminate_timeout: config.terminate_timeout(),
            host_process: Some(host.process),
        }))
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn principal(&self) -> &str {
        self.user.principal()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn resource_group(&self) -> &Arc<ResourceGroup> {
        &self.group
    }

    pub async fn state(&self) -> ContainerState {
        *self.state.read().await
    }

    async fn ensure_active(&self) -> Result<()> {
        match *self.state.read().await {
            ContainerState::Active => Ok(()),
            ContainerState::Stopped => Err(ContainmentError::InvalidState(format!(
                "container {} is stopped",
                self.handle
            ))),
            ContainerState::Destroyed => Err(ContainmentError::ObjectDisposed("Container")),
        }
    }

    async fn ensure_not_destroyed(&self) -> Result<()> {
        if *self.state.read().await == ContainerState::Destroyed {
            return Err(ContainmentError::ObjectDisposed("Container"));
        }
        Ok(())
    }

    // Processes

    /// Run a process inside the container. An empty working directory
    /// means the container directory.
    pub async fn run(&self, mut spec: ProcessRunSpec) -> Result<SupervisedProcess> {
        self.ensure_active().await?;

        if spec.working_directory.is_empty() {
            spec.working_directory = self.directory.display().to_string();
        }
        self.supervisor.run(spec).await
    }

    pub async fn find_process_by_id(&self, id: u32) -> Result<Option<SupervisedProcess>> {
        self.ensure_not_destroyed().await?;
        self.supervisor.find_process_by_id(id).await
    }

    /// Stop every process; `kill` skips the grace period. The container is
    /// left stopped.
    pub async fn stop(&self, kill: bool) -> Result<()> {
        self.ensure_not_destroyed().await?;

        self.supervisor.stop_all(kill).await?;
        *self.state.write().await = ContainerState::Stopped;
        info!(handle = %self.handle, kill, "Container stopped");
        Ok(())
    }

    // Network

    /// Reserve `port` (0 for any free port) for the container user. A
    /// container holds a single reservation; later calls return it.
    pub async fn reserve_port(&self, port: u16) -> Result<u16> {
        self.ensure_active().await?;

        let mut reservation = self.reservation.lock().await;
        if let Some(existing) = reservation.as_ref() {
            debug!(handle = %self.handle, port = existing.port, "Port already reserved");
            return Ok(existing.port);
        }

        let principal = self.user.principal();
        let port = self.ports.reserve_local_port(port, principal).await?;
        *reservation = Some(PortReservation {
            port,
            principal: principal.to_string(),
        });
        Ok(port)
    }

    pub async fn reserved_port(&self) -> Option<u16> {
        self.reservation.lock().await.as_ref().map(|r| r.port)
    }

    pub async fn create_outbound_firewall_rule(&self, spec: &FirewallRuleSpec) -> Result<()> {
        self.ensure_active().await?;
        self.ports
            .create_outbound_firewall_rule(self.user.principal(), spec)
            .await
    }

    // Limits

    pub async fn limit_cpu(&self, weight: u32) -> Result<()> {
        self.ensure_active().await?;
        self.group.set_cpu_limit(weight)
    }

    pub async fn current_cpu_limit(&self) -> Result<u32> {
        self.group.cpu_limit()
    }

    pub async fn limit_memory(&self, bytes: u64) -> Result<()> {
        self.ensure_active().await?;
        self.group.set_memory_limit(bytes)
    }

    pub async fn current_memory_limit(&self) -> Result<u64> {
        self.group.memory_limit()
    }

    pub async fn limit_active_processes(&self, count: u32) -> Result<()> {
        self.ensure_active().await?;
        self.group.set_active_process_limit(count)
    }

    pub async fn current_active_process_limit(&self) -> Result<u32> {
        self.group.active_process_limit()
    }

    pub async fn set_priority_class(&self, class: PriorityClass) -> Result<()> {
        self.ensure_active().await?;
        self.group.set_priority_class(class)
    }

    pub async fn current_priority_class(&self) -> Result<Option<PriorityClass>> {
        self.group.priority_class()
    }

    pub async fn limit_disk(&self, bytes: u64) -> Result<()> {
        self.ensure_active().await?;
        self.disk_quota.set_quota(self.user.principal(), bytes).await
    }

    pub async fn current_disk_limit(&self) -> Result<u64> {
        self.disk_quota.quota(self.user.principal()).await
    }

    pub async fn current_disk_usage(&self) -> Result<u64> {
        let directory = self.directory.clone();
        tokio::task::spawn_blocking(move || directory_size(&directory))
            .await
            .map_err(|e| ContainmentError::InvalidState(format!("disk usage task failed: {}", e)))?
    }

    pub async fn metrics(&self) -> Result<ContainerMetrics> {
        self.ensure_not_destroyed().await?;

        let cpu = self.group.cpu_statistics()?;
        let memory = MemoryMetrics {
            peak_committed_bytes: self.group.peak_memory_used()?,
            limit_bytes: self.group.memory_limit()?,
        };
        let disk = DiskMetrics {
            used_bytes: self.current_disk_usage().await?,
            limit_bytes: self.current_disk_limit().await?,
        };

        Ok(ContainerMetrics {
            handle: self.handle.clone(),
            cpu: CpuMetrics {
                total_kernel_time: cpu.total_kernel_time,
                total_user_time: cpu.total_user_time,
                total_time: cpu.total(),
            },
            memory,
            disk,
            collected_at: Utc::now(),
        })
    }

    /// Run `f` on the calling thread as the container user
    pub async fn impersonate<T>(&self, f: impl FnOnce() -> T) -> Result<T> {
        self.ensure_active().await?;

        let _guard = self.user.impersonate()?;
        Ok(f())
    }

    // Guard

    /// Start forwarding group notifications, or join the running monitor
    pub async fn start_guard(&self) -> Result<broadcast::Receiver<NotificationEvent>> {
        self.ensure_active().await?;

        let mut monitor = self.monitor.lock().await;
        let monitor = monitor.get_or_insert_with(|| {
            info!(handle = %self.handle, "Starting guard");
            NotificationMonitor::spawn(self.group.clone(), self.monitor_config.event_buffer)
        });
        Ok(monitor.subscribe())
    }

    pub async fn is_guarded(&self) -> bool {
        self.monitor
            .lock()
            .await
            .as_ref()
            .map(NotificationMonitor::is_running)
            .unwrap_or(false)
    }

    pub async fn stop_guard(&self) {
        let monitor = self.monitor.lock().await.take();
        if let Some(monitor) = monitor {
            monitor.shutdown().await;
            info!(handle = %self.handle, "Guard stopped");
        }
    }

    /// Release everything the container holds. Every step is attempted;
    /// the first failure is returned. Destroying twice is a no-op.
    pub async fn destroy(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == ContainerState::Destroyed {
                return Ok(());
            }
            *state = ContainerState::Destroyed;
        }
        info!(handle = %self.handle, "Destroying container");

        let mut teardown = Teardown::new(&self.handle);
        let principal = self.user.principal();

        self.stop_guard().await;

        if !self.supervisor.is_closed() {
            teardown.step("stop processes", self.supervisor.stop_all(true).await);
        }
        self.supervisor.dispose().await;

        let host = self.host_process.lock().await.take();
        if let Some(mut child) = host {
            let result = match child.try_wait() {
                Ok(Some(_)) => Ok(()),
                _ => child.kill().await.map_err(ContainmentError::from),
            };
            teardown.step("stop host", result);
        }

        let reservation = self.reservation.lock().await.take();
        teardown.step(
            "release port",
            self.ports
                .release_local_port(reservation.map(|r| r.port), principal)
                .await,
        );
        teardown.step(
            "remove firewall rules",
            self.ports.remove_firewall_rules(principal).await,
        );

        let group = self.group.clone();
        let timeout = self.terminate_timeout;
        let terminated = tokio::task::spawn_blocking(move || group.terminate_and_wait(timeout))
            .await
            .map_err(|e| ContainmentError::InvalidState(format!("terminate task failed: {}", e)))
            .and_then(|r| r);
        teardown.step(
            "terminate processes",
            terminated.map(|exited| {
                if !exited {
                    warn!(handle = %self.handle, "Processes still running after terminate timeout");
                }
            }),
        );
        self.group.dispose();

        if self.directory.exists() {
            teardown.step(
                "remove directory",
                tokio::fs::remove_dir_all(&self.directory)
                    .await
                    .map_err(ContainmentError::from),
            );
        }

        let result = teardown.finish();
        match &result {
            Ok(()) => info!(handle = %self.handle, "Container destroyed"),
            Err(e) => warn!(handle = %self.handle, error = %e, "Container destroyed with errors"),
        }
        result
    }
}
