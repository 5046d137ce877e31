//! Volume driver trait and volume creation types.
//!
//! A volume driver manages the actual filesystem volumes on a worker. The
//! orchestration layer only ever talks to it through [`VolumeDriver`] and
//! [`DriverVolume`].

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{Handle, Result};

/// A stream of raw bytes flowing in or out of a volume.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// How a new volume is populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Strategy {
    /// A fresh empty volume.
    Empty,
    /// A volume populated from a host path.
    Import { path: String, follow_symlinks: bool },
    /// A copy-on-write clone of an existing volume.
    Cow { parent: Handle },
}

/// Everything the driver needs to create a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub strategy: Strategy,
    pub privileged: bool,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl VolumeSpec {
    pub fn new(strategy: Strategy, privileged: bool) -> Self {
        Self {
            strategy,
            privileged,
            properties: BTreeMap::new(),
        }
    }

    pub fn empty(privileged: bool) -> Self {
        Self::new(Strategy::Empty, privileged)
    }

    pub fn cow(parent: Handle, privileged: bool) -> Self {
        Self::new(Strategy::Cow { parent }, privileged)
    }

    pub fn import(path: impl Into<String>, follow_symlinks: bool, privileged: bool) -> Self {
        Self::new(
            Strategy::Import {
                path: path.into(),
                follow_symlinks,
            },
            privileged,
        )
    }
}

/// Encoding used when streaming volume content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Gzip,
    Raw,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Gzip => "gzip",
            Encoding::Raw => "raw",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gzip" => Some(Encoding::Gzip),
            "raw" => Some(Encoding::Raw),
            _ => None,
        }
    }
}

/// A live volume as seen by the storage driver.
#[async_trait]
pub trait DriverVolume: Send + Sync {
    fn handle(&self) -> &Handle;

    /// Filesystem path of the volume on the worker host.
    fn path(&self) -> &str;

    async fn properties(&self) -> Result<BTreeMap<String, String>>;

    async fn set_property(&self, name: &str, value: &str) -> Result<()>;

    async fn privileged(&self) -> Result<bool>;

    async fn set_privileged(&self, privileged: bool) -> Result<()>;

    /// Write a tar stream into `path` inside the volume.
    async fn stream_in(&self, path: &str, encoding: Encoding, content: ByteStream) -> Result<()>;

    /// Read `path` inside the volume as a tar stream.
    async fn stream_out(&self, path: &str, encoding: Encoding) -> Result<ByteStream>;

    /// URL another worker can push content to for `path` in this volume.
    async fn stream_in_p2p_url(&self, path: &str) -> Result<String>;

    /// Push `path` of this volume directly to another worker's stream-in URL.
    async fn stream_p2p_out(&self, path: &str, dest_url: &str, encoding: Encoding) -> Result<()>;
}

/// Trait for volume storage drivers.
#[async_trait]
pub trait VolumeDriver: Send + Sync {
    async fn create_volume(&self, handle: &Handle, spec: &VolumeSpec)
    -> Result<Arc<dyn DriverVolume>>;

    async fn lookup_volume(&self, handle: &Handle) -> Result<Option<Arc<dyn DriverVolume>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_wire_format() {
        let empty = serde_json::to_value(Strategy::Empty).unwrap();
        assert_eq!(empty, serde_json::json!({"type": "empty"}));

        let cow = serde_json::to_value(Strategy::Cow {
            parent: Handle::from("parent-1"),
        })
        .unwrap();
        assert_eq!(cow, serde_json::json!({"type": "cow", "parent": "parent-1"}));

        let import = serde_json::to_value(Strategy::Import {
            path: "/etc/ssl/certs".to_string(),
            follow_symlinks: true,
        })
        .unwrap();
        assert_eq!(
            import,
            serde_json::json!({"type": "import", "path": "/etc/ssl/certs", "follow_symlinks": true})
        );
    }

    #[test]
    fn test_encoding_parse() {
        assert_eq!(Encoding::parse("gzip"), Some(Encoding::Gzip));
        assert_eq!(Encoding::parse("raw"), Some(Encoding::Raw));
        assert_eq!(Encoding::parse("zstd"), None);
        assert_eq!(Encoding::Gzip.as_str(), "gzip");
    }
}
