//! Downloaded book files
//!
//! Files are streamed into `<name>.part` next to their final location and
//! renamed once complete, so a crash or cancellation never leaves a
//! truncated file under the final name.

use crate::core::error::Result;
use crate::db::models::Book;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

const PARTIAL_SUFFIX: &str = "part";

/// How a streamed download ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Completed { path: PathBuf, bytes: u64 },
    Cancelled,
}

/// Local store for downloaded book files
#[derive(Debug, Clone)]
pub struct DownloadStore {
    root: PathBuf,
}

impl DownloadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final location of a book file: `<root>/<library>/<series>/<book>.<ext>`
    pub fn target_path(&self, book: &Book) -> PathBuf {
        self.root
            .join(sanitize(&book.library_id))
            .join(sanitize(&book.series_id))
            .join(format!("{}.{}", sanitize(&book.id), file_extension(book)))
    }

    pub fn partial_path(target: &Path) -> PathBuf {
        let mut name = target.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".");
        name.push(PARTIAL_SUFFIX);
        target.with_file_name(name)
    }

    /// Stream `body` into `target`, reporting the running byte count every
    /// `progress_interval` bytes. Cancellation deletes the partial file.
    pub async fn write_stream<S, F>(
        &self,
        target: &Path,
        mut body: S,
        progress_interval: u64,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<WriteOutcome>
    where
        S: Stream<Item = Result<Bytes>> + Unpin,
        F: FnMut(u64),
    {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let partial = Self::partial_path(target);
        let mut file = File::create(&partial).await?;

        let mut written: u64 = 0;
        let mut last_reported: u64 = 0;
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    drop(file);
                    self.discard(&partial).await;
                    return Ok(WriteOutcome::Cancelled);
                }
                chunk = body.next() => chunk,
            };

            let Some(chunk) = chunk else { break };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    self.discard(&partial).await;
                    return Err(e);
                }
            };

            if let Err(e) = file.write_all(&chunk).await {
                drop(file);
                self.discard(&partial).await;
                return Err(e.into());
            }
            written += chunk.len() as u64;
            if written - last_reported >= progress_interval.max(1) {
                last_reported = written;
                on_progress(written);
            }
        }

        if let Err(e) = Self::persist(file, &partial, target).await {
            self.discard(&partial).await;
            return Err(e.into());
        }
        if written != last_reported {
            on_progress(written);
        }

        Ok(WriteOutcome::Completed {
            path: target.to_path_buf(),
            bytes: written,
        })
    }

    async fn persist(mut file: File, partial: &Path, target: &Path) -> std::io::Result<()> {
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(partial, target).await
    }

    async fn discard(&self, partial: &Path) {
        if let Err(e) = tokio::fs::remove_file(partial).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %partial.display(), error = %e, "Failed to remove partial download");
            }
        }
    }

    /// Delete a downloaded file; a missing file is not an error
    pub async fn remove(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Extension for a book file: the server file name's extension, else one
/// derived from the media type
fn file_extension(book: &Book) -> String {
    let from_url = Path::new(&book.url)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 8)
        .map(str::to_lowercase);
    if let Some(ext) = from_url {
        return ext;
    }

    let media_type = book.media.media_type.split(';').next().unwrap_or("").trim();
    mime_guess::get_mime_extensions_str(media_type)
        .and_then(|exts| exts.first())
        .map(|e| e.to_string())
        .unwrap_or_else(|| "bin".to_string())
}

fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
