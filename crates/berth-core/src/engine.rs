//! Container engine trait and container/process types.
//!
//! The engine runs containers on a worker (Garden, containerd, ...). The
//! orchestration layer creates containers with fully resolved bind mounts and
//! only afterwards starts processes in them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::AsyncWrite;

use crate::{ByteStream, Handle, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindMountMode {
    ReadOnly,
    ReadWrite,
}

/// A host path made visible inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub src_path: String,
    pub dst_path: String,
    pub mode: BindMountMode,
}

/// Resource limits. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub cpu_shares: u64,
    pub memory_bytes: u64,
}

/// What the engine needs to create a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineContainerSpec {
    pub handle: Handle,
    pub rootfs_url: String,
    pub privileged: bool,
    pub bind_mounts: Vec<BindMount>,
    pub limits: Limits,
    /// `KEY=value` entries.
    pub env: Vec<String>,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtySpec {
    pub columns: u32,
    pub rows: u32,
}

/// A process to run inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Caller-chosen process id, used to re-attach later.
    pub id: Option<String>,
    pub path: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub dir: String,
    pub user: Option<String>,
    pub tty: Option<TtySpec>,
}

/// Output sink for a process stream.
pub type OutputSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Standard streams wired to a process.
#[derive(Default)]
pub struct ProcessIo {
    pub stdin: Option<ByteStream>,
    pub stdout: Option<OutputSink>,
    pub stderr: Option<OutputSink>,
}

/// A process running (or finished) inside an engine container.
#[async_trait]
pub trait EngineProcess: Send + Sync {
    fn id(&self) -> &str;

    /// Wait for the process to exit and return its exit status.
    async fn wait(&self) -> Result<i32>;

    async fn set_tty(&self, tty: TtySpec) -> Result<()>;
}

/// A container managed by the engine.
#[async_trait]
pub trait EngineContainer: Send + Sync {
    fn handle(&self) -> &Handle;

    async fn run(&self, spec: ProcessSpec, io: ProcessIo) -> Result<Box<dyn EngineProcess>>;

    async fn attach(&self, process_id: &str, io: ProcessIo) -> Result<Box<dyn EngineProcess>>;

    async fn property(&self, name: &str) -> Result<Option<String>>;

    async fn set_property(&self, name: &str, value: &str) -> Result<()>;
}

/// Trait for container execution engines.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn create(&self, spec: EngineContainerSpec) -> Result<Arc<dyn EngineContainer>>;

    async fn lookup(&self, handle: &Handle) -> Result<Option<Arc<dyn EngineContainer>>>;

    async fn destroy(&self, handle: &Handle) -> Result<()>;
}
