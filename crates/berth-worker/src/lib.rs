//! Volume and container orchestration for Berth workers.
//!
//! Finds or creates the container for a build step along with its image and
//! every volume it mounts, streaming inputs from other workers as needed.
//! Creation is idempotent and safe to race across processes sharing one
//! bookkeeping store.

pub mod container;
pub mod error;
mod locator;
pub mod metrics;
pub mod paths;
pub mod spec;
pub mod streamer;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod volume;
pub mod worker;

pub use container::{Container, Process, ProcessResult};
pub use error::{Result, WorkerError};
pub use metrics::{MetricsError, PrometheusMetrics};
pub use spec::{ContainerSpec, FetchedImage, ImageMetadata, ImageSpec, InputSpec};
pub use streamer::{Streamer, VolumeStreamer};
pub use volume::{Volume, VolumeMount};
pub use worker::Worker;
