/*!
Compression adapters for wire payloads.

The agent gzip-compresses every outbound batch and the collector accepts
gzip request bodies. The trait keeps the algorithm pluggable; its name is
what goes into the `Content-Encoding` header.
*/

use crate::{Result, TelemetronError};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{Read, Write};

/// Compression abstraction for request bodies
pub trait CompressionAdapter: Send + Sync {
    /// Compress the input data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress the input data
    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>>;

    /// Name of the algorithm as used in `Content-Encoding`
    fn algorithm_name(&self) -> &str;
}

/// Gzip compression adapter
///
/// # Example
/// ```rust
/// use telemetron_core::{CompressionAdapter, GzipCompressor};
///
/// let compressor = GzipCompressor::new();
/// let data = br#"[{"id":"PollCount","type":"counter","delta":1}]"#;
/// let compressed = compressor.compress(data).unwrap();
/// let decompressed = compressor.decompress(&compressed).unwrap();
/// assert_eq!(data, &decompressed[..]);
/// ```
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    compression_level: Compression,
}

impl GzipCompressor {
    /// Create a new gzip compressor with default compression level (6)
    pub fn new() -> Self {
        Self {
            compression_level: Compression::default(),
        }
    }

    /// Create a new gzip compressor with the specified level (0-9)
    pub fn with_level(level: u32) -> Self {
        Self {
            compression_level: Compression::new(level),
        }
    }

    /// Fastest compression (level 1); batches are small and sent often
    pub fn fast() -> Self {
        Self::with_level(1)
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), self.compression_level);

        encoder.write_all(data).map_err(|e| {
            TelemetronError::compression(format!("Failed to write data for compression: {e}"))
        })?;

        encoder
            .finish()
            .map_err(|e| TelemetronError::compression(format!("Failed to finish compression: {e}")))
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(compressed_data);
        let mut decompressed = Vec::new();

        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| TelemetronError::compression(format!("Failed to decompress data: {e}")))?;

        Ok(decompressed)
    }

    fn algorithm_name(&self) -> &str {
        "gzip"
    }
}
