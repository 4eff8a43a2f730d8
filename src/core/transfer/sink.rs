//! Byte sinks for received files.
//!
//! The engine asks a [`SinkProvider`] for a sink only after the local side
//! accepted an offer. [`DirectorySinkProvider`] writes into a directory with
//! a write-to-`.part`-then-rename scheme; an aborted transfer keeps its bytes
//! under an `.incomplete` name.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, error, warn};
use uuid::Uuid;

#[async_trait]
pub trait Sink: Send + Sync {
    async fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Finish successfully.
    async fn close(&mut self) -> Result<()>;

    /// Give up; whatever was written is flagged incomplete.
    async fn abort(&mut self) -> Result<()>;

    /// Where the bytes ended up, for display.
    fn location(&self) -> Option<String> {
        None
    }
}

#[async_trait]
pub trait SinkProvider: Send + Sync {
    /// `Ok(None)` means the request was cancelled (e.g. the user closed the
    /// save dialog); the offer is then declined.
    async fn request_sink(&self, suggested_name: &str, mime_type: &str)
        -> Result<Option<Box<dyn Sink>>>;
}

/// Reduce a remote-supplied name to one safe path component.
pub fn sanitize_file_name(name: &str) -> String {
    let normalized = name.replace('\\', "/");
    let last = normalized
        .split('/')
        .filter(|s| !s.is_empty() && !matches!(*s, "." | ".."))
        .next_back()
        .unwrap_or_default();

    let safe: String = last
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ' | '(' | ')'))
        .collect();
    let safe = safe.trim_start_matches('.').trim().to_string();

    if safe.is_empty() {
        "file".to_string()
    } else {
        safe
    }
}

/// First of `name`, `stem (1).ext`, `stem (2).ext`, ... that does not exist in `dir`.
fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    (1u32..)
        .map(|n| dir.join(format!("{stem} ({n}){ext}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

// ── Directory sink ───────────────────────────────────────────────────────────

pub struct DirectorySinkProvider {
    dir: PathBuf,
}

impl DirectorySinkProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SinkProvider for DirectorySinkProvider {
    async fn request_sink(
        &self,
        suggested_name: &str,
        _mime_type: &str,
    ) -> Result<Option<Box<dyn Sink>>> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("cannot create {}", self.dir.display()))?;

        let name = sanitize_file_name(suggested_name);
        let tag = Uuid::new_v4().simple().to_string();
        let part_path = self.dir.join(format!(".{name}.{}.part", &tag[..8]));
        let file = File::create(&part_path)
            .await
            .with_context(|| format!("cannot create {}", part_path.display()))?;

        debug!(event = "sink_created", path = %part_path.display(), "Receiving into part file");
        Ok(Some(Box::new(DirectorySink {
            dir: self.dir.clone(),
            name,
            part_path,
            writer: Some(BufWriter::new(file)),
            final_path: None,
        })))
    }
}

pub struct DirectorySink {
    dir: PathBuf,
    name: String,
    part_path: PathBuf,
    writer: Option<BufWriter<File>>,
    final_path: Option<PathBuf>,
}

impl DirectorySink {
    /// Flush and move the part file to `target_name`. With `keep_on_error`
    /// a failing flush is logged and the rename still happens, so a partial
    /// file is never left behind under its hidden name.
    async fn finish(&mut self, target_name: &str, keep_on_error: bool) -> Result<PathBuf> {
        if let Some(mut writer) = self.writer.take() {
            let flushed = match writer.flush().await {
                Ok(()) => writer.get_mut().sync_all().await,
                Err(e) => Err(e),
            };
            if let Err(e) = flushed {
                if !keep_on_error {
                    return Err(e.into());
                }
                warn!(event = "sink_flush_failure", path = %self.part_path.display(), error = %e, "Flush failed, keeping what reached the disk");
            }
        }
        let target = unique_path(&self.dir, target_name);
        tokio::fs::rename(&self.part_path, &target).await.map_err(|e| {
            error!(
                event = "sink_rename_failure",
                from = %self.part_path.display(),
                to = %target.display(),
                error = %e,
                "Failed to move received file into place"
            );
            e
        })?;
        self.final_path = Some(target.clone());
        Ok(target)
    }
}

#[async_trait]
impl Sink for DirectorySink {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .context("sink already finished")?;
        writer.write_all(bytes).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let name = self.name.clone();
        self.finish(&name, false).await?;
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        let name = format!("{}.incomplete", self.name);
        let target = self.finish(&name, true).await?;
        warn!(event = "sink_incomplete", path = %target.display(), "Partial file kept as incomplete");
        Ok(())
    }

    fn location(&self) -> Option<String> {
        self.final_path.as_ref().map(|p| p.display().to_string())
    }
}

// ── In-memory sink (tests) ───────────────────────────────────────────────────

#[cfg(test)]
pub use memory::{MemorySinkProvider, SinkRecord};
