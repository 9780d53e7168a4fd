//! wincage library
//!
//! Lightweight containers for Windows built from Job Objects: resource
//! limits and accounting, processes launched by a privileged host over
//! JSON-RPC, and per-container port and firewall isolation.

pub mod config;
pub mod container;
pub mod error;
pub mod host;
pub mod job;
pub mod logging;
pub mod network;
pub mod process;
pub mod tool;

pub use container::{Container, ContainerMetrics, ContainerState};
pub use error::{ContainmentError, Result};
pub use job::{LimitConfiguration, NotificationEvent, PriorityClass, ResourceGroup};
pub use network::{FirewallRuleSpec, LocalTcpPortManager};
pub use process::{ProcessRunSpec, ProcessSupervisor, SupervisedProcess};
