use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Builds a writer from the raw contents of its configuration file.
pub type BuildFn<W> = Box<dyn Fn(&str) -> Result<W> + Send + Sync>;

struct Source<W> {
    path: PathBuf,
    build: BuildFn<W>,
    /// Hash of the contents last acted on, successful or not.
    fingerprint: Mutex<Vec<u8>>,
}

/// Atomically swappable writer backed by a watched configuration file.
///
/// Readers always see a fully constructed writer. A configuration change
/// that fails to build is logged once and the previous writer stays active.
pub struct WriterHandle<W> {
    name: &'static str,
    current: ArcSwap<W>,
    source: Option<Source<W>>,
}

impl<W: Send + Sync + 'static> WriterHandle<W> {
    /// Builds the initial writer from `path`. Failure here is fatal for the
    /// sink.
    pub fn load(name: &'static str, path: &Path, build: BuildFn<W>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {name} writer config {}", path.display()))?;
        let writer = build(&contents)
            .with_context(|| format!("building {name} writer from {}", path.display()))?;

        Ok(Self {
            name,
            current: ArcSwap::from_pointee(writer),
            source: Some(Source {
                path: path.to_path_buf(),
                build,
                fingerprint: Mutex::new(fingerprint(&contents)),
            }),
        })
    }

    /// A handle that never reloads.
    pub fn fixed(name: &'static str, writer: W) -> Self {
        Self {
            name,
            current: ArcSwap::from_pointee(writer),
            source: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the current writer.
    pub fn get(&self) -> Arc<W> {
        self.current.load_full()
    }

    /// Re-reads the configuration file and swaps in a new writer if its
    /// contents changed. Returns true when a new writer was installed.
    pub fn reload(&self) -> bool {
        let Some(source) = &self.source else {
            return false;
        };

        let contents = match std::fs::read_to_string(&source.path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!(
                    sink = self.name,
                    path = %source.path.display(),
                    error = %e,
                    "reading writer config, keeping current writer",
                );
                return false;
            }
        };

        let new_fingerprint = fingerprint(&contents);
        {
            let mut last = source.fingerprint.lock();
            if *last == new_fingerprint {
                return false;
            }
            *last = new_fingerprint;
        }

        match (source.build)(&contents) {
            Ok(writer) => {
                self.current.store(Arc::new(writer));
                info!(sink = self.name, path = %source.path.display(), "writer reloaded");
                true
            }
            Err(e) => {
                warn!(
                    sink = self.name,
                    path = %source.path.display(),
                    error = %format!("{e:#}"),
                    "invalid writer config, keeping current writer",
                );
                false
            }
        }
    }

    /// Polls the configuration file every `interval` until cancelled.
    pub fn spawn_watcher(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let handle = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; the initial load covered it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        handle.reload();
                    }
                }
            }
        })
    }
}

fn fingerprint(contents: &str) -> Vec<u8> {
    Sha256::digest(contents.as_bytes()).to_vec()
}
