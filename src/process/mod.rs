//! Running, finding and stopping processes inside a container
//!
//! The supervisor never creates processes itself: every operation is one
//! request to the container's privileged host through a `HostClient`.

mod environment;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ContainmentError, Result};
use crate::host::{CreateProcessParams, FindProcessByIdParams, HostClient, StopAllProcessesParams};

pub use environment::Environment;

/// Milliseconds processes get to exit cooperatively on a non-kill stop
pub const STOP_GRACE_PERIOD_MS: u64 = 10_000;

/// What to run. The correlation key is generated on construction, and a
/// clone gets a fresh one so two runs never share a key.
#[derive(Debug)]
pub struct ProcessRunSpec {
    pub executable_path: String,
    pub arguments: Vec<String>,
    pub working_directory: String,
    pub environment: Environment,
    key: Uuid,
}

impl ProcessRunSpec {
    pub fn new(executable_path: impl Into<String>) -> Self {
        Self {
            executable_path: executable_path.into(),
            arguments: Vec::new(),
            working_directory: String::new(),
            environment: Environment::new(),
            key: Uuid::new_v4(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = dir.into();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key, value);
        self
    }

    pub fn key(&self) -> Uuid {
        self.key
    }
}

impl Clone for ProcessRunSpec {
    fn clone(&self) -> Self {
        Self {
            executable_path: self.executable_path.clone(),
            arguments: self.arguments.clone(),
            working_directory: self.working_directory.clone(),
            environment: self.environment.clone(),
            key: Uuid::new_v4(),
        }
    }
}

/// A process the host reported as running in the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisedProcess {
    pub id: u32,
    pub environment: Environment,
}

/// Client-side process supervision for one container
pub struct ProcessSupervisor {
    client: Arc<dyn HostClient>,
    default_environment: Environment,
    closed: AtomicBool,
    processes: Mutex<HashMap<u32, SupervisedProcess>>,
}

impl ProcessSupervisor {
    pub fn new(client: Arc<dyn HostClient>) -> Self {
        Self::with_default_environment(client, Environment::default_block())
    }

    pub fn with_default_environment(client: Arc<dyn HostClient>, defaults: Environment) -> Self {
        Self {
            client,
            default_environment: defaults,
            closed: AtomicBool::new(false),
            processes: Mutex::new(HashMap::new()),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ContainmentError::ChannelClosed);
        }
        Ok(())
    }

    fn processes(&self) -> std::sync::MutexGuard<'_, HashMap<u32, SupervisedProcess>> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Pids started or found through this supervisor and not yet stopped
    pub fn tracked_process_ids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.processes().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub async fn run(&self, spec: ProcessRunSpec) -> Result<SupervisedProcess> {
        self.ensure_open()?;

        let environment = spec.environment.merged_over(&self.default_environment);
        let params = CreateProcessParams {
            executable_path: spec.executable_path.clone(),
            arguments: spec.arguments.clone(),
            working_directory: spec.working_directory.clone(),
            environment: environment.to_map(),
            key: spec.key,
        };

        let result = self.client.create_process(params).await?;
        info!(pid = result.id, key = %spec.key, executable = %spec.executable_path, "Process started");

        let process = SupervisedProcess {
            id: result.id,
            environment,
        };
        self.processes().insert(process.id, process.clone());
        Ok(process)
    }

    pub async fn find_process_by_id(&self, id: u32) -> Result<Option<SupervisedProcess>> {
        self.ensure_open()?;

        match self
            .client
            .find_process_by_id(FindProcessByIdParams { id })
            .await?
        {
            Some(found) => {
                let process = SupervisedProcess {
                    id: found.id,
                    environment: found.environment.into(),
                };
                self.processes().insert(process.id, process.clone());
                Ok(Some(process))
            }
            None => {
                debug!(pid = id, "Host does not know process");
                self.processes().remove(&id);
                Ok(None)
            }
        }
    }

    /// Stop every process; `kill` skips the cooperative grace period
    pub async fn stop_all(&self, kill: bool) -> Result<()> {
        self.ensure_open()?;

        let timeout = if kill { 0 } else { STOP_GRACE_PERIOD_MS };
        info!(kill, timeout_ms = timeout, "Stopping all processes");
        self.client
            .stop_all_processes(StopAllProcessesParams { timeout })
            .await?;
        self.processes().clear();
        Ok(())
    }

    /// Close the host channel. Running processes are left alone.
    pub async fn dispose(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.client.shutdown().await;
        debug!("Process supervisor disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{CreateProcessResult, FindProcessByIdResult, MockHostClient};
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn supervisor(client: MockHostClient) -> ProcessSupervisor {
        let defaults: Environment = [("TEMP", r"C:\tmp"), ("PATH", r"C:\Windows")]
            .into_iter()
            .collect();
        ProcessSupervisor::with_default_environment(Arc::new(client), defaults)
    }

    fn spec() -> ProcessRunSpec {
        ProcessRunSpec::new("exe")
            .args(["arg1", "arg2"])
            .working_directory(r"\WorkdirDir")
            .env("env1", "val1")
    }

    #[tokio::test]
    async fn test_run_sends_create_process_request() {
        let mut client = MockHostClient::new();
        client
            .expect_create_process()
            .withf(|p| {
                p.executable_path == "exe"
                    && p.arguments == ["arg1", "arg2"]
                    && p.working_directory == r"\WorkdirDir"
                    && p.environment.get("env1").map(String::as_str) == Some("val1")
                    && !p.key.is_nil()
            })
            .times(1)
            .returning(|_| Ok(CreateProcessResult { id: 123 }));

        let process = supervisor(client).run(spec()).await.unwrap();
        assert_eq!(process.id, 123);
    }

    #[tokio::test]
    async fn test_run_sends_the_spec_key() {
        let spec = spec();
        let key = spec.key();

        let mut client = MockHostClient::new();
        client
            .expect_create_process()
            .withf(move |p| p.key == key)
            .times(1)
            .returning(|_| Ok(CreateProcessResult { id: 1 }));

        supervisor(client).run(spec).await.unwrap();
    }

    #[tokio::test]
    async fn test_cloned_spec_runs_under_its_own_key() {
        let original = spec();
        let copy = original.clone();
        assert_ne!(original.key(), copy.key());
        assert_eq!(copy.executable_path, original.executable_path);
        assert_eq!(copy.arguments, original.arguments);

        let keys = Arc::new(Mutex::new(Vec::new()));
        let mut client = MockHostClient::new();
        client.expect_create_process().times(2).returning({
            let keys = keys.clone();
            move |p| {
                keys.lock().unwrap().push(p.key);
                Ok(CreateProcessResult { id: 1 })
            }
        });

        let supervisor = supervisor(client);
        supervisor.run(original.clone()).await.unwrap();
        supervisor.run(original).await.unwrap();

        let keys = keys.lock().unwrap();
        assert_ne!(keys[0], keys[1]);
    }

    #[tokio::test]
    async fn test_run_merges_default_environment() {
        let mut client = MockHostClient::new();
        client
            .expect_create_process()
            .withf(|p| {
                p.environment
                    == BTreeMap::from([
                        ("PATH".to_string(), r"C:\Windows".to_string()),
                        ("TEMP".to_string(), r"C:\tmp".to_string()),
                        ("env1".to_string(), "val1".to_string()),
                    ])
            })
            .times(1)
            .returning(|_| Ok(CreateProcessResult { id: 7 }));

        let process = supervisor(client).run(spec()).await.unwrap();
        assert_eq!(process.environment.get("ENV1"), Some("val1"));
        assert_eq!(process.environment.get("temp"), Some(r"C:\tmp"));
    }

    #[tokio::test]
    async fn test_empty_environment_still_gets_defaults() {
        let mut client = MockHostClient::new();
        client
            .expect_create_process()
            .withf(|p| p.environment.contains_key("TEMP") && p.environment.contains_key("PATH"))
            .times(1)
            .returning(|_| Ok(CreateProcessResult { id: 7 }));

        supervisor(client)
            .run(ProcessRunSpec::new("exe"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_caller_overrides_default_case_insensitively() {
        let mut client = MockHostClient::new();
        client
            .expect_create_process()
            .withf(|p| {
                p.environment.get("temp").map(String::as_str) == Some(r"D:\scratch")
                    && !p.environment.contains_key("TEMP")
            })
            .times(1)
            .returning(|_| Ok(CreateProcessResult { id: 7 }));

        supervisor(client)
            .run(ProcessRunSpec::new("exe").env("temp", r"D:\scratch"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_find_returns_process_with_id() {
        let mut client = MockHostClient::new();
        client
            .expect_find_process_by_id()
            .with(eq(FindProcessByIdParams { id: 4321 }))
            .times(1)
            .returning(|p| {
                Ok(Some(FindProcessByIdResult {
                    id: p.id,
                    environment: BTreeMap::from([("FOO".to_string(), "BAR".to_string())]),
                }))
            });

        let supervisor = supervisor(client);
        let process = supervisor.find_process_by_id(4321).await.unwrap().unwrap();
        assert_eq!(process.id, 4321);
        assert_eq!(process.environment.get("foo"), Some("BAR"));
        assert_eq!(supervisor.tracked_process_ids(), vec![4321]);
    }

    #[tokio::test]
    async fn test_find_unknown_process_returns_none() {
        let mut client = MockHostClient::new();
        client
            .expect_find_process_by_id()
            .times(1)
            .returning(|_| Ok(None));

        let found = supervisor(client).find_process_by_id(99).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_stop_all_graceful_uses_grace_period() {
        let mut client = MockHostClient::new();
        client
            .expect_stop_all_processes()
            .with(eq(StopAllProcessesParams { timeout: 10_000 }))
            .times(1)
            .returning(|_| Ok(()));

        supervisor(client).stop_all(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_all_kill_uses_zero_timeout() {
        let mut client = MockHostClient::new();
        client
            .expect_create_process()
            .returning(|_| Ok(CreateProcessResult { id: 5 }));
        client
            .expect_stop_all_processes()
            .with(eq(StopAllProcessesParams { timeout: 0 }))
            .times(1)
            .returning(|_| Ok(()));

        let supervisor = supervisor(client);
        supervisor.run(spec()).await.unwrap();
        supervisor.stop_all(true).await.unwrap();
        assert!(supervisor.tracked_process_ids().is_empty());
    }

    #[tokio::test]
    async fn test_host_errors_propagate_without_retry() {
        let mut client = MockHostClient::new();
        client
            .expect_create_process()
            .times(1)
            .returning(|_| Err(ContainmentError::HostCommunicationFailed("pipe broken".into())));

        let err = supervisor(client).run(spec()).await.unwrap_err();
        assert!(matches!(err, ContainmentError::HostCommunicationFailed(_)));
    }

    #[tokio::test]
    async fn test_dispose_shuts_client_down_once() {
        let mut client = MockHostClient::new();
        client.expect_shutdown().times(1).returning(|| ());

        let supervisor = supervisor(client);
        supervisor.dispose().await;
        supervisor.dispose().await;

        assert!(supervisor.is_closed());
        assert!(matches!(
            supervisor.run(spec()).await,
            Err(ContainmentError::ChannelClosed)
        ));
        assert!(matches!(
            supervisor.find_process_by_id(1).await,
            Err(ContainmentError::ChannelClosed)
        ));
        assert!(matches!(
            supervisor.stop_all(true).await,
            Err(ContainmentError::ChannelClosed)
        ));
    }
}
