//! Worker description and tuning knobs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A resource type whose image is installed on the worker host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResourceType {
    pub type_name: String,
    /// Host path of the unpacked rootfs.
    pub image_path: String,
    pub version: String,
    pub privileged: bool,
}

/// What a worker advertises about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub name: String,
    pub resource_types: Vec<WorkerResourceType>,
    /// Host directory holding CA certificates, if the worker provides one.
    pub certs_path: Option<String>,
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
}

impl WorkerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn resource_type(&self, type_name: &str) -> Option<&WorkerResourceType> {
        self.resource_types
            .iter()
            .find(|rt| rt.type_name == type_name)
    }

    /// Proxy settings as `KEY=value` environment entries.
    pub fn proxy_env(&self) -> Vec<String> {
        let mut env = Vec::new();
        if let Some(proxy) = &self.http_proxy {
            env.push(format!("http_proxy={}", proxy));
        }
        if let Some(proxy) = &self.https_proxy {
            env.push(format!("https_proxy={}", proxy));
        }
        if let Some(no_proxy) = &self.no_proxy {
            env.push(format!("no_proxy={}", no_proxy));
        }
        env
    }
}

/// Runtime settings for volume and container orchestration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// How long to wait before retrying when another caller holds a
    /// volume creation lock.
    pub lock_retry_interval: Duration,
    /// Maximum number of inputs streamed concurrently for one container.
    pub stream_concurrency: usize,
    /// Cache streamed resource-cache volumes on the destination worker.
    pub cache_streamed_volumes: bool,
    /// Stream directly between workers instead of through this process.
    pub p2p_streaming: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            lock_retry_interval: Duration::from_secs(1),
            stream_concurrency: 8,
            cache_streamed_volumes: true,
            p2p_streaming: false,
        }
    }
}
