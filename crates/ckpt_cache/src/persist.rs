//! Durable storage writer.
//!
//! One file per checkpoint, named exactly `metadata.filename` under the
//! configured storage root, no header or framing. When persistence is
//! disabled an empty placeholder file keeps downstream readers that stat the
//! path working.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};

use crate::memory::Region;

pub struct Persistence {
    root: PathBuf,
    enabled: bool,
}

impl Persistence {
    pub fn new(root: impl Into<PathBuf>, enabled: bool) -> Arc<Self> {
        Arc::new(Persistence {
            root: root.into(),
            enabled,
        })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Resolve a checkpoint filename to its durable path. Filenames arrive as
    /// absolute paths from the trainer; they are re-rooted under the storage
    /// root so one mount holds the whole job.
    pub fn path_for(&self, filename: &str) -> PathBuf {
        let relative = Path::new(filename)
            .strip_prefix("/")
            .unwrap_or_else(|_| Path::new(filename));
        self.root.join(relative)
    }

    /// Write the region's bytes to durable storage, or just the placeholder
    /// when persistence is off.
    pub async fn write(&self, filename: &str, region: Arc<Region>) -> Result<()> {
        if !self.enabled {
            tracing::debug!(file = %filename, "persistence disabled, writing placeholder");
            return self.write_placeholder(filename).await;
        }
        let path = self.path_for(filename);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create storage dir {}", parent.display()))?;
        }
        let start = Instant::now();
        let size = region.len();
        let target = path.clone();
        // Large checkpoints take a while; keep the write off the async
        // workers.
        tokio::task::spawn_blocking(move || -> Result<()> {
            let bytes = region.bytes(0, region.len())?;
            std::fs::write(&target, bytes)
                .with_context(|| format!("write durable file {}", target.display()))
        })
        .await
        .context("persistence task panicked")??;
        tracing::info!(
            file = %filename,
            bytes = size,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "persisted checkpoint"
        );
        Ok(())
    }

    /// Create an empty file at the durable path, leaving existing content
    /// alone.
    pub async fn write_placeholder(&self, filename: &str) -> Result<()> {
        let path = self.path_for(filename);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create storage dir {}", parent.display()))?;
        }
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("create placeholder {}", path.display()))?;
        Ok(())
    }

    /// Fill a freshly allocated region from the durable file. Bootstrap
    /// fallback path when neither ring neighbour has the bytes.
    pub async fn load_into_region(&self, filename: &str, region: Arc<Region>) -> Result<()> {
        let path = self.path_for(filename);
        let start = Instant::now();
        let expected = region.len();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("read durable file {}", path.display()))?;
            if bytes.len() != expected {
                return Err(anyhow!(
                    "durable file {} holds {} bytes, metadata says {}",
                    path.display(),
                    bytes.len(),
                    expected
                ));
            }
            region.write_at(0, &bytes)
        })
        .await
        .context("file load task panicked")??;
        tracing::info!(
            file = %filename,
            bytes = expected,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "loaded checkpoint from durable storage"
        );
        Ok(())
    }
}
