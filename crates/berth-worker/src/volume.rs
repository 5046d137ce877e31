//! Volume: a bookkeeping record paired with its live driver volume.

use berth_core::{ByteStream, DriverVolume, Encoding, Handle, Strategy};
use berth_db::VolumeRecord;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::Result;

/// A created volume on a worker.
///
/// The record is a snapshot taken when the volume was found or created. It
/// is never written back; state changes go through the store.
#[derive(Clone)]
pub struct Volume {
    record: VolumeRecord,
    inner: Arc<dyn DriverVolume>,
}

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("handle", &self.record.handle)
            .field("worker", &self.record.worker_name)
            .field("path", &self.inner.path())
            .finish()
    }
}

impl Volume {
    pub fn new(record: VolumeRecord, inner: Arc<dyn DriverVolume>) -> Self {
        Self { record, inner }
    }

    pub fn handle(&self) -> &Handle {
        &self.record.handle
    }

    /// Host path of the volume.
    pub fn path(&self) -> &str {
        self.inner.path()
    }

    pub fn worker_name(&self) -> &str {
        &self.record.worker_name
    }

    pub fn record(&self) -> &VolumeRecord {
        &self.record
    }

    pub fn resource_cache_id(&self) -> Option<i64> {
        self.record.resource_cache_id
    }

    /// Strategy for creating a copy-on-write child of this volume.
    pub fn cow_strategy(&self) -> Strategy {
        Strategy::Cow {
            parent: self.record.handle.clone(),
        }
    }

    pub async fn stream_in(&self, path: &str, encoding: Encoding, content: ByteStream) -> Result<()> {
        Ok(self.inner.stream_in(path, encoding, content).await?)
    }

    pub async fn stream_out(&self, path: &str, encoding: Encoding) -> Result<ByteStream> {
        Ok(self.inner.stream_out(path, encoding).await?)
    }

    pub async fn stream_in_p2p_url(&self, path: &str) -> Result<String> {
        Ok(self.inner.stream_in_p2p_url(path).await?)
    }

    pub async fn stream_p2p_out(&self, path: &str, dest_url: &str, encoding: Encoding) -> Result<()> {
        Ok(self.inner.stream_p2p_out(path, dest_url, encoding).await?)
    }

    pub async fn properties(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.inner.properties().await?)
    }

    pub async fn set_property(&self, name: &str, value: &str) -> Result<()> {
        Ok(self.inner.set_property(name, value).await?)
    }

    pub async fn set_privileged(&self, privileged: bool) -> Result<()> {
        Ok(self.inner.set_privileged(privileged).await?)
    }
}

/// A volume and where it is mounted in a container.
#[derive(Debug, Clone)]
pub struct VolumeMount {
    pub volume: Volume,
    pub mount_path: String,
}
