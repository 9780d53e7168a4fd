//! Protocol spoken between a container's supervisor and its privileged host
//!
//! One JSON-RPC 2.0 object per line. Every request carries a fresh Uuid as
//! its correlation key and is answered by exactly one response with the
//! same id. Responses may arrive in any order.

pub mod channel;
pub mod confine;
#[cfg(windows)]
pub mod launcher;
pub mod server;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;

pub use channel::HostChannel;
pub use server::{HostServer, ProcessLauncher};

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error codes used on the host protocol
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// The host understood the request but could not carry it out
    pub const HOST_FAILURE: i32 = -32000;
}

/// Method names
pub mod methods {
    pub const CREATE_PROCESS: &str = "CreateProcess";
    pub const FIND_PROCESS_BY_ID: &str = "FindProcessById";
    pub const STOP_ALL_PROCESSES: &str = "StopAllProcesses";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRequest {
    pub jsonrpc: String,
    pub id: Uuid,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl HostRequest {
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Uuid::new_v4(),
            method: method.to_string(),
            params: Some(params),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostResponse {
    pub jsonrpc: String,
    /// Null only when the request itself could not be decoded
    pub id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<HostErrorObject>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostErrorObject {
    pub code: i32,
    pub message: String,
}

impl HostResponse {
    pub fn success(id: Uuid, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Uuid>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(HostErrorObject { code, message }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProcessParams {
    pub executable_path: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub working_directory: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub key: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateProcessResult {
    pub id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindProcessByIdParams {
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindProcessByIdResult {
    pub id: u32,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopAllProcessesParams {
    /// Milliseconds to wait for a cooperative exit; 0 kills immediately
    pub timeout: u64,
}

/// Client side of the host protocol
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HostClient: Send + Sync {
    async fn create_process(&self, params: CreateProcessParams) -> Result<CreateProcessResult>;

    /// `Ok(None)` when the host does not know the id
    async fn find_process_by_id(
        &self,
        params: FindProcessByIdParams,
    ) -> Result<Option<FindProcessByIdResult>>;

    async fn stop_all_processes(&self, params: StopAllProcessesParams) -> Result<()>;

    /// Close the channel. Safe to call more than once.
    async fn shutdown(&self);
}
