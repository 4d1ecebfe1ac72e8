use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;

/// One downstream HTTP endpoint receiving JSON bodies.
#[derive(Debug, Clone)]
pub struct HttpTarget {
    client: reqwest::Client,
    address: String,
    headers: HashMap<String, String>,
    compression: String,
}

impl HttpTarget {
    pub fn new(
        address: &str,
        headers: &HashMap<String, String>,
        compression: &str,
        timeout: Duration,
    ) -> Result<Self> {
        if address.is_empty() {
            bail!("address is required");
        }
        // Surface an unknown algorithm at construction rather than per write.
        compress(b"", compression)?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            client,
            address: address.to_string(),
            headers: headers.clone(),
            compression: compression.to_string(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Serializes `body` as JSON and POSTs it.
    pub async fn post_json<T: Serialize + ?Sized>(&self, body: &T) -> Result<()> {
        let buf = serde_json::to_vec(body).context("serializing request body")?;
        let raw_len = buf.len();

        let compressed = compress(&buf, &self.compression).context("compressing request body")?;

        let mut request = self
            .client
            .post(&self.address)
            .header("Content-Type", "application/json")
            .body(compressed);

        if let Some(encoding) = content_encoding(&self.compression) {
            request = request.header("Content-Encoding", encoding);
        }

        for (k, v) in &self.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let resp = request
            .send()
            .await
            .with_context(|| format!("posting to {}", self.address))?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            bail!("{} returned unexpected status: {status}", self.address);
        }

        tracing::debug!(address = %self.address, bytes = raw_len, "posted JSON body");

        Ok(())
    }
}

/// Compresses data using the specified algorithm.
pub(crate) fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => compress_gzip(data),
        "zstd" => compress_zstd(data),
        "zlib" => compress_zlib(data),
        "snappy" => compress_snappy(data),
        other => bail!("unsupported compression: {other}"),
    }
}

/// Returns the Content-Encoding header value for the algorithm.
fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        "zstd" => Some("zstd"),
        "zlib" => Some("deflate"),
        "snappy" => Some("snappy"),
        _ => None,
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}

fn compress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    zstd::encode_all(data, 0).context("zstd encode")
}

fn compress_zlib(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("zlib write")?;
    encoder.finish().context("zlib finish")
}

fn compress_snappy(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = snap::raw::Encoder::new();
    encoder.compress_vec(data).context("snappy encode")
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    #[test]
    fn test_compress_gzip_roundtrip() {
        let data = br#"{"instances":[],"file_systems":[]}"#;
        let compressed = compress(data, "gzip").expect("gzip compress");

        let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .expect("gzip decompress");
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_compress_zstd_and_snappy() {
        let data = b"snapshot body";
        let zstd_out = compress(data, "zstd").expect("zstd compress");
        assert_eq!(
            zstd::decode_all(zstd_out.as_slice()).expect("zstd decompress"),
            data
        );

        let snappy_out = compress(data, "snappy").expect("snappy compress");
        let mut decoder = snap::raw::Decoder::new();
        assert_eq!(
            decoder
                .decompress_vec(&snappy_out)
                .expect("snappy decompress"),
            data
        );
    }

    #[test]
    fn test_compress_unknown() {
        assert!(compress(b"x", "brotli").is_err());
        assert_eq!(compress(b"x", "").expect("none"), b"x");
    }

    #[test]
    fn test_content_encoding() {
        assert_eq!(content_encoding("zlib"), Some("deflate"));
        assert_eq!(content_encoding("none"), None);
    }

    #[test]
    fn test_new_rejects_bad_config() {
        let headers = HashMap::new();
        assert!(HttpTarget::new("", &headers, "none", Duration::from_secs(1)).is_err());
        assert!(
            HttpTarget::new("http://localhost:1", &headers, "lz4", Duration::from_secs(1))
                .is_err()
        );
        let target = HttpTarget::new("http://localhost:1", &headers, "gzip", Duration::from_secs(1))
            .expect("valid target");
        assert_eq!(target.address(), "http://localhost:1");
    }
}
