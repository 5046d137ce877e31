//! HTTP client for the Berth volume storage service.
//!
//! Implements the `VolumeDriver` and `DriverVolume` traits against the
//! service's REST API. Volume content travels as tar streams whose encoding
//! is carried in the `Content-Encoding` and `Accept-Encoding` headers.

pub mod error;
pub mod http;

pub use error::{DriverError, DriverResult};
pub use http::{HttpVolume, HttpVolumeDriver};
