//! Core domain types and traits for the Berth worker.
//!
//! This crate contains:
//! - Volume and container handles
//! - Volume driver trait and volume strategies
//! - Container engine trait and process types
//! - Stream compression and tar helpers
//! - Metrics sink and worker description

pub mod archive;
pub mod compression;
pub mod engine;
pub mod error;
pub mod id;
pub mod metrics;
pub mod volume;
pub mod worker;

pub use compression::Compression;
pub use engine::{
    BindMount, BindMountMode, ContainerEngine, EngineContainer, EngineContainerSpec,
    EngineProcess, Limits, ProcessIo, ProcessSpec, TtySpec,
};
pub use error::{Error, Result};
pub use id::Handle;
pub use metrics::{CountingMetrics, MetricsSink, NoopMetrics};
pub use volume::{ByteStream, DriverVolume, Encoding, Strategy, VolumeDriver, VolumeSpec};
pub use worker::{WorkerInfo, WorkerResourceType, WorkerSettings};
