//! KDL configuration parsing for Berth workers.
//!
//! This crate handles parsing of the worker file: the worker's name, the
//! resource types and certificates it provides, proxy settings, and the
//! orchestration tuning knobs.

pub mod error;
pub mod worker;

pub use error::{ConfigError, ConfigResult};
pub use worker::{WorkerConfig, load_worker_config, parse_worker_config};
