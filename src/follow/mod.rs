use std::io::SeekFrom;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregate::HostByteAggregator;
use crate::parse::{parse_record, LineBuffer};

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Where a follower begins reading when it first opens its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Seek to the current end of file; only new appends are counted.
    End,
    /// Read from the beginning of the file.
    Start,
    /// Resume from a previously recorded byte offset. An offset beyond the
    /// current file length is treated as truncation and falls back to the
    /// start of the file.
    Offset(u64),
}

/// Per-follower tuning, shared by every follower built from one config.
#[derive(Debug, Clone)]
pub struct FollowerOptions {
    pub start: StartPosition,
    pub poll_interval: Duration,
    pub retry_backoff: Duration,
    pub max_line_bytes: usize,
}

/// What ended a following session on an open file handle.
enum FollowOutcome {
    Cancelled,
    Reopen,
}

/// Tails one growing log file and feeds parsed records into the shared
/// aggregator.
///
/// Runs as its own task: open failures retry with backoff, read errors and
/// truncation reopen the file, and none of it propagates to other followers
/// or the flusher. The offset and partial-line buffer are owned here and
/// never shared.
pub struct FileFollower {
    path: PathBuf,
    opts: FollowerOptions,
    aggregator: Arc<HostByteAggregator>,
    offset: u64,
    /// `(dev, ino)` of the open handle, used to notice when the path has
    /// been pointed at a different file.
    identity: (u64, u64),
    lines: LineBuffer,
    chunk: Vec<u8>,
}

impl FileFollower {
    pub fn new(path: PathBuf, opts: FollowerOptions, aggregator: Arc<HostByteAggregator>) -> Self {
        let lines = LineBuffer::new(opts.max_line_bytes);

        Self {
            path,
            opts,
            aggregator,
            offset: 0,
            identity: (0, 0),
            lines,
            chunk: vec![0u8; READ_CHUNK_BYTES],
        }
    }

    /// Follows the file until the token is cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(path = %self.path.display(), "following file");

        let mut start = self.opts.start;

        loop {
            let file = tokio::select! {
                _ = cancel.cancelled() => break,
                file = self.open_with_retry(start) => file,
            };

            match self.follow(file, &cancel).await {
                FollowOutcome::Cancelled => break,
                FollowOutcome::Reopen => {
                    // Truncated or rotated; whatever replaced the file is new
                    // content, so read it from the beginning.
                    start = StartPosition::Start;
                }
            }
        }

        info!(path = %self.path.display(), "follower stopped");
    }

    /// Opens the file and seeks to the requested position, retrying with
    /// backoff for as long as it takes.
    async fn open_with_retry(&mut self, start: StartPosition) -> File {
        loop {
            match self.try_open(start).await {
                Ok(file) => {
                    debug!(
                        path = %self.path.display(),
                        offset = self.offset,
                        "opened file",
                    );
                    return file;
                }
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        error = %e,
                        backoff = ?self.opts.retry_backoff,
                        "open failed, retrying",
                    );
                    tokio::time::sleep(self.opts.retry_backoff).await;
                }
            }
        }
    }

    async fn try_open(&mut self, start: StartPosition) -> Result<File> {
        let mut file = File::open(&self.path).await.context("opening log file")?;
        let meta = file.metadata().await.context("reading file metadata")?;
        let len = meta.len();
        self.identity = (meta.dev(), meta.ino());

        self.offset = match start {
            StartPosition::End => len,
            StartPosition::Start => 0,
            StartPosition::Offset(pos) if pos <= len => pos,
            StartPosition::Offset(_) => 0,
        };

        if self.offset > 0 {
            file.seek(SeekFrom::Start(self.offset))
                .await
                .context("seeking to start offset")?;
        }

        self.lines.clear();

        Ok(file)
    }

    /// Polls for appended bytes until cancellation or an event that requires
    /// reopening the file.
    async fn follow(&mut self, mut file: File, cancel: &CancellationToken) -> FollowOutcome {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return FollowOutcome::Cancelled,
                _ = tokio::time::sleep(self.opts.poll_interval) => {}
            }

            let meta = match tokio::fs::metadata(&self.path).await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        error = %e,
                        "stat failed, reopening",
                    );
                    return FollowOutcome::Reopen;
                }
            };

            // Rotation: the path now names a different file, even if it is
            // no shorter than the one this handle still reads from.
            if (meta.dev(), meta.ino()) != self.identity {
                info!(
                    path = %self.path.display(),
                    "file replaced, reopening from start",
                );
                return FollowOutcome::Reopen;
            }

            let len = meta.len();

            if len < self.offset {
                info!(
                    path = %self.path.display(),
                    offset = self.offset,
                    new_len = len,
                    "file truncated, reopening from start",
                );
                return FollowOutcome::Reopen;
            }

            if len == self.offset {
                continue;
            }

            if let Err(e) = self.consume_appended(&mut file).await {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "read failed, reopening",
                );
                return FollowOutcome::Reopen;
            }
        }
    }

    /// Reads everything currently appended past the offset and runs it
    /// through the line/record pipeline.
    async fn consume_appended(&mut self, file: &mut File) -> Result<()> {
        loop {
            let n = file
                .read(&mut self.chunk)
                .await
                .context("reading appended bytes")?;

            if n == 0 {
                return Ok(());
            }

            self.offset += n as u64;

            for line in self.lines.extract(&self.chunk[..n]) {
                if line.is_empty() {
                    continue;
                }

                match parse_record(&line) {
                    Ok(record) => {
                        self.aggregator.increment(&record.hostname, record.byte_count);
                    }
                    Err(e) => {
                        warn!(
                            path = %self.path.display(),
                            error = %e,
                            line = %String::from_utf8_lossy(&line),
                            "skipping unparseable line",
                        );
                    }
                }
            }
        }
    }
}
