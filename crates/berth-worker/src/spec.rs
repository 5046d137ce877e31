//! What callers ask a worker to build.

use berth_core::Limits;
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::Volume;

/// An artifact mounted into a container.
#[derive(Debug, Clone)]
pub struct InputSpec {
    /// Volume holding the artifact. It may live on another worker.
    pub artifact: Volume,
    pub destination_path: String,
}

/// Where a container's root filesystem comes from.
#[derive(Debug, Clone)]
pub enum ImageSpec {
    /// An artifact volume with `metadata.json` and a `rootfs/` directory.
    Artifact { volume: Volume, privileged: bool },
    /// A base resource type installed on the worker.
    ResourceType(String),
    /// A rootfs URL handed to the engine untouched.
    Url { url: String, privileged: bool },
}

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub team_id: i32,
    /// Job and step scoping for task caches. Caches are only looked up when
    /// both are set.
    pub job_id: Option<i64>,
    pub step_name: Option<String>,
    /// Working directory. Relative cache paths are resolved against it.
    pub dir: String,
    pub inputs: Vec<InputSpec>,
    /// Output name to mount path.
    pub outputs: BTreeMap<String, String>,
    pub caches: Vec<String>,
    pub image: ImageSpec,
    pub limits: Limits,
    /// `KEY=value` entries appended after the image environment.
    pub env: Vec<String>,
    pub certs_bind_mount: bool,
}

impl ContainerSpec {
    pub fn new(team_id: i32, image: ImageSpec) -> Self {
        Self {
            team_id,
            job_id: None,
            step_name: None,
            dir: String::new(),
            inputs: Vec::new(),
            outputs: BTreeMap::new(),
            caches: Vec::new(),
            image,
            limits: Limits::default(),
            env: Vec::new(),
            certs_bind_mount: false,
        }
    }
}

/// Image metadata read from an artifact's `metadata.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ImageMetadata {
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub user: String,
}

/// A resolved container image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedImage {
    pub metadata: ImageMetadata,
    pub url: String,
    pub privileged: bool,
}
