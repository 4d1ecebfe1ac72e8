use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::pipeline::Snapshot;

use super::http::HttpTarget;
use super::SnapshotWrite;

/// Contents of one sink's writer file (e.g. `billing.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct WriterConfig {
    /// Log what would be written instead of sending it.
    #[serde(default)]
    pub dry_run: bool,

    #[serde(default)]
    pub address: String,

    /// Extra headers sent with every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// none, gzip, zstd, zlib, or snappy.
    #[serde(default = "default_compression")]
    pub compression: String,

    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

impl WriterConfig {
    /// Parses and validates writer YAML.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(contents).context("parsing writer config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        if self.address.is_empty() {
            bail!("address is required unless dry_run is set");
        }
        if self.timeout.is_zero() {
            bail!("timeout must be positive");
        }
        Ok(())
    }

    /// Builds the HTTP target, or None in dry-run mode.
    pub fn http_target(&self) -> Result<Option<HttpTarget>> {
        if self.dry_run {
            return Ok(None);
        }
        HttpTarget::new(&self.address, &self.headers, &self.compression, self.timeout).map(Some)
    }
}

/// Writer for sinks that take one snapshot per call.
pub enum SnapshotWriter {
    Http(HttpTarget),
    DryRun { sink: String },
}

impl SnapshotWriter {
    pub fn from_config(sink: &str, cfg: &WriterConfig) -> Result<Self> {
        Ok(match cfg.http_target()? {
            Some(target) => Self::Http(target),
            None => Self::DryRun {
                sink: sink.to_string(),
            },
        })
    }

    /// Parses writer YAML and builds the writer in one step.
    pub fn from_yaml(sink: &str, contents: &str) -> Result<Self> {
        Self::from_config(sink, &WriterConfig::from_yaml(contents)?)
    }
}

impl SnapshotWrite for SnapshotWriter {
    async fn write(&self, snapshot: &Snapshot) -> Result<()> {
        match self {
            Self::Http(target) => target.post_json(snapshot).await,
            Self::DryRun { sink } => {
                info!(
                    sink = %sink,
                    instance = %snapshot.instance_id,
                    samples = snapshot.sample_count,
                    "dry run: would write snapshot",
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_yaml_defaults() {
        let cfg = WriterConfig::from_yaml("address: http://localhost:8080/ingest\n")
            .expect("valid config");
        assert!(!cfg.dry_run);
        assert_eq!(cfg.compression, "none");
        assert_eq!(cfg.timeout, Duration::from_secs(30));
        assert!(cfg.headers.is_empty());
    }

    #[test]
    fn test_from_yaml_full() {
        let yaml = r#"
address: http://collector:9000/snapshots
compression: zstd
timeout: 5s
headers:
  Authorization: Bearer abc
"#;
        let cfg = WriterConfig::from_yaml(yaml).expect("valid config");
        assert_eq!(cfg.compression, "zstd");
        assert_eq!(cfg.timeout, Duration::from_secs(5));
        assert_eq!(
            cfg.headers.get("Authorization").map(String::as_str),
            Some("Bearer abc")
        );
    }

    #[test]
    fn test_missing_address_rejected() {
        let err = WriterConfig::from_yaml("compression: gzip\n").expect_err("should fail");
        assert!(err.to_string().contains("address is required"));
    }

    #[test]
    fn test_dry_run_needs_no_address() {
        let writer = SnapshotWriter::from_yaml("billing", "dry_run: true\n").expect("dry run");
        assert!(matches!(writer, SnapshotWriter::DryRun { .. }));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(SnapshotWriter::from_yaml("billing", "address: [unclosed").is_err());
    }
}
