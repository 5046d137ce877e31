//! Container: a created bookkeeping record paired with its engine container.

use berth_core::{EngineContainer, EngineProcess, Handle, ProcessIo, ProcessSpec, TtySpec};
use berth_db::ContainerRecord;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::Result;

/// Container property holding the default user for processes.
pub const USER_PROPERTY: &str = "user";

/// Container property holding the exit status of a finished step.
pub const EXIT_STATUS_PROPERTY: &str = "exit-status";

#[derive(Clone)]
pub struct Container {
    record: ContainerRecord,
    inner: Arc<dyn EngineContainer>,
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("handle", &self.record.handle)
            .field("worker", &self.record.worker_name)
            .finish()
    }
}

impl Container {
    pub fn new(record: ContainerRecord, inner: Arc<dyn EngineContainer>) -> Self {
        Self { record, inner }
    }

    pub fn handle(&self) -> &Handle {
        &self.record.handle
    }

    pub fn record(&self) -> &ContainerRecord {
        &self.record
    }

    /// Start a process. Without an explicit user the container's `user`
    /// property is used.
    pub async fn run(&self, mut spec: ProcessSpec, io: ProcessIo) -> Result<Process> {
        if spec.user.is_none() {
            spec.user = self
                .property(USER_PROPERTY)
                .await?
                .filter(|user| !user.is_empty());
        }

        debug!(container = %self.handle(), path = %spec.path, "Running process");

        // Run on its own task: dropping the caller must not cut off output
        // another attached client may still be reading.
        let inner = self.inner.clone();
        let process = tokio::spawn(async move { inner.run(spec, io).await })
            .await
            .map_err(|e| berth_core::Error::Internal(format!("process start task: {}", e)))??;
        Ok(Process::Running(process))
    }

    /// Attach to a process started earlier. A recorded exit status
    /// short-circuits the engine.
    pub async fn attach(&self, process_id: &str, io: ProcessIo) -> Result<Process> {
        if let Some(status) = self.property(EXIT_STATUS_PROPERTY).await? {
            if let Ok(status) = status.parse::<i32>() {
                debug!(container = %self.handle(), status, "Process already exited");
                return Ok(Process::Exited {
                    id: process_id.to_string(),
                    status,
                });
            }
        }

        let inner = self.inner.clone();
        let id = process_id.to_string();
        let process = tokio::spawn(async move { inner.attach(&id, io).await })
            .await
            .map_err(|e| berth_core::Error::Internal(format!("process attach task: {}", e)))??;
        Ok(Process::Running(process))
    }

    pub async fn property(&self, name: &str) -> Result<Option<String>> {
        Ok(self.inner.property(name).await?)
    }

    pub async fn set_property(&self, name: &str, value: &str) -> Result<()> {
        Ok(self.inner.set_property(name, value).await?)
    }

    /// Persist a finished step's exit status so later attaches skip the
    /// engine.
    pub async fn record_exit_status(&self, status: i32) -> Result<()> {
        self.set_property(EXIT_STATUS_PROPERTY, &status.to_string())
            .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessResult {
    pub exit_status: i32,
}

pub enum Process {
    Running(Box<dyn EngineProcess>),
    Exited { id: String, status: i32 },
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Process::Running(p) => f.debug_tuple("Running").field(&p.id()).finish(),
            Process::Exited { id, status } => f
                .debug_struct("Exited")
                .field("id", id)
                .field("status", status)
                .finish(),
        }
    }
}

impl Process {
    pub fn id(&self) -> &str {
        match self {
            Process::Running(p) => p.id(),
            Process::Exited { id, .. } => id,
        }
    }

    pub async fn wait(&self) -> Result<ProcessResult> {
        let exit_status = match self {
            Process::Running(p) => p.wait().await?,
            Process::Exited { status, .. } => *status,
        };
        Ok(ProcessResult { exit_status })
    }

    pub async fn set_tty(&self, tty: TtySpec) -> Result<()> {
        match self {
            Process::Running(p) => Ok(p.set_tty(tty).await?),
            Process::Exited { .. } => Ok(()),
        }
    }
}
