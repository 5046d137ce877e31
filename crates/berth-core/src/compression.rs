//! Stream compression used when moving volume content between workers.

use flate2::Compression as GzLevel;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::Encoding;

/// Compression applied to volume streams.
pub trait Compression: Send + Sync {
    fn encoding(&self) -> Encoding;

    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> io::Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GzipCompression;

impl Compression for GzipCompression {
    fn encoding(&self) -> Encoding {
        Encoding::Gzip
    }

    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
        encoder.write_all(data)?;
        encoder.finish()
    }

    fn decompress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RawCompression;

impl Compression for RawCompression {
    fn encoding(&self) -> Encoding {
        Encoding::Raw
    }

    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Compression implementation for a wire encoding.
pub fn for_encoding(encoding: Encoding) -> Arc<dyn Compression> {
    match encoding {
        Encoding::Gzip => Arc::new(GzipCompression),
        Encoding::Raw => Arc::new(RawCompression),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_output_is_gzip() {
        let compressed = GzipCompression.compress(b"hello world").unwrap();
        // gzip magic
        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);
        assert_eq!(
            GzipCompression.decompress(&compressed).unwrap(),
            b"hello world"
        );
    }

    #[test]
    fn test_gzip_rejects_garbage() {
        assert!(GzipCompression.decompress(b"not gzip").is_err());
    }

    #[test]
    fn test_for_encoding() {
        assert_eq!(for_encoding(Encoding::Raw).encoding(), Encoding::Raw);
        assert_eq!(for_encoding(Encoding::Gzip).encoding(), Encoding::Gzip);
    }
}
