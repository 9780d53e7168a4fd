//! Host side of the protocol: launches and tracks processes for one container

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ContainmentError, Result};

use super::{
    codes, methods, CreateProcessParams, CreateProcessResult, FindProcessByIdParams,
    FindProcessByIdResult, HostRequest, HostResponse, StopAllProcessesParams,
};

const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Starts and stops the processes a host is responsible for
pub trait ProcessLauncher: Send + Sync + 'static {
    /// Start a process inside the container's resource group; returns its pid
    fn launch(&self, params: &CreateProcessParams) -> Result<u32>;

    fn is_running(&self, pid: u32) -> bool;

    /// Ask a process to exit on its own
    fn request_stop(&self, pid: u32) -> Result<()>;

    /// Forcibly end every process in the container
    fn terminate_all(&self) -> Result<()>;
}

/// Serves supervisor requests for one container
pub struct HostServer<L: ProcessLauncher> {
    launcher: L,
    processes: Mutex<HashMap<u32, BTreeMap<String, String>>>,
}

impl<L: ProcessLauncher> HostServer<L> {
    pub fn new(launcher: L) -> Self {
        Self {
            launcher,
            processes: Mutex::new(HashMap::new()),
        }
    }

    fn processes(&self) -> std::sync::MutexGuard<'_, HashMap<u32, BTreeMap<String, String>>> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer requests from `reader` until it reaches EOF.
    ///
    /// Requests are handled concurrently and each response is written as
    /// soon as it is ready.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let writer = Arc::new(tokio::sync::Mutex::new(writer));
        let mut in_flight = JoinSet::new();

        info!("Host serving supervisor");
        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    error!(error = %e, "Failed to read supervisor request");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let server = self.clone();
            let writer = writer.clone();
            in_flight.spawn(async move {
                let response = server.handle_line(&line).await;
                let mut text = match serde_json::to_string(&response) {
                    Ok(text) => text,
                    Err(e) => {
                        error!(error = %e, "Failed to encode response");
                        return;
                    }
                };
                text.push('\n');

                let mut writer = writer.lock().await;
                if let Err(e) = writer.write_all(text.as_bytes()).await {
                    warn!(error = %e, "Failed to write response");
                    return;
                }
                let _ = writer.flush().await;
            });

            // Reap finished handlers so the set does not grow without bound
            while let Some(Some(_)) = in_flight.join_next().now_or_never() {}
        }

        while in_flight.join_next().await.is_some() {}
        info!("Supervisor disconnected");
        Ok(())
    }

    /// Decode one request line and produce its response
    pub async fn handle_line(&self, line: &str) -> HostResponse {
        let request: HostRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                return HostResponse::error(None, codes::PARSE_ERROR, format!("Parse error: {}", e))
            }
        };
        self.handle_request(request).await
    }

    pub async fn handle_request(&self, request: HostRequest) -> HostResponse {
        let id = request.id;
        debug!(%id, method = %request.method, "Host request");

        match request.method.as_str() {
            methods::CREATE_PROCESS => match params::<CreateProcessParams>(id, request.params) {
                Ok(params) => respond(id, self.create_process(params)),
                Err(response) => response,
            },
            methods::FIND_PROCESS_BY_ID => {
                match params::<FindProcessByIdParams>(id, request.params) {
                    Ok(params) => respond(id, Ok(self.find_process_by_id(params))),
                    Err(response) => response,
                }
            }
            methods::STOP_ALL_PROCESSES => {
                match params::<StopAllProcessesParams>(id, request.params) {
                    Ok(params) => {
                        let outcome = self.stop_all_processes(params).await;
                        respond(id, outcome.map(|_| Value::Null))
                    }
                    Err(response) => response,
                }
            }
            other => HostResponse::error(
                Some(id),
                codes::METHOD_NOT_FOUND,
                format!("Method not found: {}", other),
            ),
        }
    }

    fn create_process(&self, params: CreateProcessParams) -> Result<CreateProcessResult> {
        let pid = self.launcher.launch(&params)?;
        info!(pid, key = %params.key, executable = %params.executable_path, "Process launched");
        self.processes().insert(pid, params.environment);
        Ok(CreateProcessResult { id: pid })
    }

    fn find_process_by_id(&self, params: FindProcessByIdParams) -> Option<FindProcessByIdResult> {
        let mut processes = self.processes();
        let environment = processes.get(&params.id)?.clone();
        if !self.launcher.is_running(params.id) {
            processes.remove(&params.id);
            return None;
        }
        Some(FindProcessByIdResult {
            id: params.id,
            environment,
        })
    }

    async fn stop_all_processes(&self, params: StopAllProcessesParams) -> Result<()> {
        let pids: Vec<u32> = self.processes().keys().copied().collect();
        info!(count = pids.len(), timeout_ms = params.timeout, "Stopping all processes");

        if params.timeout > 0 {
            for pid in &pids {
                if let Err(e) = self.launcher.request_stop(*pid) {
                    warn!(pid, error = %e, "Cooperative stop request failed");
                }
            }

            let deadline = Instant::now() + Duration::from_millis(params.timeout);
            while pids.iter().any(|pid| self.launcher.is_running(*pid)) {
                if Instant::now() >= deadline {
                    warn!("Processes still running at stop deadline");
                    break;
                }
                tokio::time::sleep(STOP_POLL_INTERVAL).await;
            }
        }

        let result = self.launcher.terminate_all();
        self.processes().clear();
        result
    }
}

fn params<T: DeserializeOwned>(
    id: Uuid,
    params: Option<Value>,
) -> std::result::Result<T, HostResponse> {
    serde_json::from_value(params.unwrap_or(Value::Null)).map_err(|e| {
        HostResponse::error(
            Some(id),
            codes::INVALID_PARAMS,
            format!("Invalid params: {}", e),
        )
    })
}

fn respond<T: serde::Serialize>(id: Uuid, outcome: Result<T>) -> HostResponse {
    match outcome.and_then(|value| {
        serde_json::to_value(value)
            .map_err(|e| ContainmentError::InvalidState(format!("Unencodable result: {}", e)))
    }) {
        Ok(value) => HostResponse::success(id, value),
        Err(e) => {
            warn!(%id, error = %e, "Host request failed");
            HostResponse::error(Some(id), codes::HOST_FAILURE, e.to_string())
        }
    }
}
