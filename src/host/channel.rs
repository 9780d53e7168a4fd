//! Correlation-keyed RPC channel to a container host

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ContainmentError, Result};

use super::{
    methods, CreateProcessParams, CreateProcessResult, FindProcessByIdParams,
    FindProcessByIdResult, HostClient, HostRequest, HostResponse, StopAllProcessesParams,
};

/// Longest line accepted from the host
const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Completion = oneshot::Sender<Result<Value>>;

#[derive(Default)]
struct Pending {
    closed: bool,
    waiters: HashMap<Uuid, Completion>,
    /// Requests whose caller stopped waiting; a late response is dropped
    abandoned: HashSet<Uuid>,
}

#[derive(Clone, Default)]
struct PendingMap(Arc<Mutex<Pending>>);

impl PendingMap {
    fn lock(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, id: Uuid) -> Result<oneshot::Receiver<Result<Value>>> {
        let mut pending = self.lock();
        if pending.closed {
            return Err(ContainmentError::ChannelClosed);
        }
        let (tx, rx) = oneshot::channel();
        pending.waiters.insert(id, tx);
        Ok(rx)
    }

    fn abandon(&self, id: &Uuid) {
        let mut pending = self.lock();
        if pending.waiters.remove(id).is_some() && !pending.closed {
            pending.abandoned.insert(*id);
        }
    }

    /// Hand a response to its caller. A response that matches no request
    /// means the stream can no longer be trusted.
    fn complete(&self, response: HostResponse) -> std::result::Result<(), String> {
        let Some(id) = response.id else {
            return Err(match response.error {
                Some(error) => format!(
                    "Host could not decode a request: {} ({})",
                    error.message, error.code
                ),
                None => "Host response without correlation id".to_string(),
            });
        };

        let waiter = {
            let mut pending = self.lock();
            match pending.waiters.remove(&id) {
                Some(waiter) => waiter,
                None if pending.abandoned.remove(&id) => {
                    debug!(%id, "Dropping response to abandoned request");
                    return Ok(());
                }
                None => return Err(format!("Host response for unknown request {}", id)),
            }
        };

        let outcome = match response.error {
            Some(error) => Err(ContainmentError::HostRejected {
                code: error.code,
                message: error.message,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = waiter.send(outcome);
        Ok(())
    }

    /// Mark closed and fail every outstanding request
    fn close_with(&self, error: impl Fn() -> ContainmentError) -> bool {
        let waiters = {
            let mut pending = self.lock();
            let was_open = !pending.closed;
            pending.closed = true;
            pending.abandoned.clear();
            if !was_open && pending.waiters.is_empty() {
                return false;
            }
            std::mem::take(&mut pending.waiters)
        };
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(error()));
        }
        true
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Forgets a pending request when its caller goes away before the response
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.abandon(&self.id);
    }
}

/// Client end of the host protocol over any byte stream pair.
///
/// Calls may be issued concurrently; each one waits for the response
/// carrying its own id. A dispatch task reads responses; writes are
/// serialized through an async mutex.
pub struct HostChannel {
    writer: tokio::sync::Mutex<Option<Writer>>,
    pending: PendingMap,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl HostChannel {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending = PendingMap::default();
        let dispatcher = tokio::spawn(dispatch(reader, pending.clone()));

        Self {
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            pending,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.pending.is_closed()
    }

    /// Send one request and wait for its response
    pub async fn call<P, T>(&self, method: &str, params: P) -> Result<T>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        let params = serde_json::to_value(params)
            .map_err(|e| ContainmentError::InvalidArgument(format!("Unencodable params: {}", e)))?;
        let request = HostRequest::new(method, params);
        let mut line = serde_json::to_string(&request)
            .map_err(|e| ContainmentError::InvalidArgument(format!("Unencodable request: {}", e)))?;
        line.push('\n');

        let response = self.pending.register(request.id)?;
        let _guard = PendingGuard {
            pending: &self.pending,
            id: request.id,
        };
        debug!(id = %request.id, method, "Sending host request");

        self.write_line(&line).await?;

        let value = match response.await {
            Ok(outcome) => outcome?,
            Err(_) => {
                return Err(ContainmentError::HostCommunicationFailed(
                    "Response dropped".to_string(),
                ))
            }
        };

        serde_json::from_value(value).map_err(|e| {
            ContainmentError::HostCommunicationFailed(format!(
                "Unexpected {} result: {}",
                method, e
            ))
        })
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(ContainmentError::ChannelClosed);
        };

        let written = async {
            stream.write_all(line.as_bytes()).await?;
            stream.flush().await
        }
        .await;

        if let Err(e) = written {
            warn!(error = %e, "Host channel write failed");
            *writer = None;
            let message = e.to_string();
            self.pending
                .close_with(|| ContainmentError::HostCommunicationFailed(message.clone()));
            return Err(ContainmentError::HostCommunicationFailed(e.to_string()));
        }
        Ok(())
    }

    /// Close the channel; outstanding calls fail with `ChannelClosed`
    pub async fn close(&self) {
        if self.pending.close_with(|| ContainmentError::ChannelClosed) {
            debug!("Host channel closed");
        }

        if let Some(mut stream) = self.writer.lock().await.take() {
            let _ = stream.shutdown().await;
        }
        if let Some(task) = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

impl Drop for HostChannel {
    fn drop(&mut self) {
        if let Some(task) = self
            .dispatcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

async fn dispatch<R>(reader: R, pending: PendingMap)
where
    R: AsyncRead + Send + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    let reason = loop {
        match lines.next().await {
            Some(Ok(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<HostResponse>(&line) {
                    Ok(response) => {
                        if let Err(reason) = pending.complete(response) {
                            break reason;
                        }
                    }
                    Err(e) => break format!("Malformed host response: {}", e),
                }
            }
            Some(Err(e)) => break format!("Host channel read failed: {}", e),
            None => break "Host closed the channel".to_string(),
        }
    };

    warn!(reason = %reason, "Host channel dispatcher stopped");
    pending.close_with(|| ContainmentError::HostCommunicationFailed(reason.clone()));
}

#[async_trait]
impl HostClient for HostChannel {
    async fn create_process(&self, params: CreateProcessParams) -> Result<CreateProcessResult> {
        self.call(methods::CREATE_PROCESS, params).await
    }

    async fn find_process_by_id(
        &self,
        params: FindProcessByIdParams,
    ) -> Result<Option<FindProcessByIdResult>> {
        self.call(methods::FIND_PROCESS_BY_ID, params).await
    }

    async fn stop_all_processes(&self, params: StopAllProcessesParams) -> Result<()> {
        let _: Value = self.call(methods::STOP_ALL_PROCESSES, params).await?;
        Ok(())
    }

    async fn shutdown(&self) {
        self.close().await
    }
}
