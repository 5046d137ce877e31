//! Moving volume content between workers.

use async_trait::async_trait;
use berth_core::Compression;
use berth_core::archive;
use bytes::Bytes;
use futures::TryStreamExt;
use std::sync::Arc;
use tracing::debug;

use crate::{Result, Volume, WorkerError};

/// Copies content between volumes, usually on different workers.
#[async_trait]
pub trait Streamer: Send + Sync {
    /// Copy the whole of `src` into `dst`.
    async fn stream(&self, src: &Volume, dst: &Volume) -> Result<()>;

    /// Read a single file out of `src`.
    async fn stream_file(&self, src: &Volume, path: &str) -> Result<Bytes>;
}

/// Streams tar archives through this process, or directly between workers
/// when peer-to-peer streaming is enabled.
pub struct VolumeStreamer {
    compression: Arc<dyn Compression>,
    p2p: bool,
}

impl VolumeStreamer {
    pub fn new(compression: Arc<dyn Compression>, p2p: bool) -> Self {
        Self { compression, p2p }
    }
}

#[async_trait]
impl Streamer for VolumeStreamer {
    async fn stream(&self, src: &Volume, dst: &Volume) -> Result<()> {
        let encoding = self.compression.encoding();
        debug!(
            src = %src.handle(),
            src_worker = src.worker_name(),
            dst = %dst.handle(),
            dst_worker = dst.worker_name(),
            p2p = self.p2p,
            "Streaming volume"
        );

        if self.p2p {
            let url = dst.stream_in_p2p_url(".").await?;
            return src.stream_p2p_out(".", &url, encoding).await;
        }

        let content = src.stream_out(".", encoding).await?;
        dst.stream_in(".", encoding, content).await
    }

    async fn stream_file(&self, src: &Volume, path: &str) -> Result<Bytes> {
        let content = src.stream_out(path, self.compression.encoding()).await?;
        let chunks: Vec<Bytes> = content
            .try_collect()
            .await
            .map_err(berth_core::Error::from)?;
        let compressed = chunks.concat();

        let tarball = self
            .compression
            .decompress(&compressed)
            .map_err(berth_core::Error::from)?;
        let file = archive::first_entry(&tarball).map_err(berth_core::Error::from)?;
        file.map(Bytes::from)
            .ok_or_else(|| WorkerError::FileNotFound {
                handle: src.handle().clone(),
                path: path.to_string(),
            })
    }
}
