//! Per-process log files.
//!
//! The supervisor copies a child's stdout/stderr into a [`LogSink`]; the
//! instance log operation reads the same file back line by line.

use std::io;
use std::path::{Path, PathBuf};

use futures_core::Stream;
use futures_util::{stream, StreamExt};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tonic::Status;

use crate::backend::LogStream;

/// Append-only destination for a process's output.
///
/// Writes after [`LogSink::close`] are dropped.
pub struct LogSink {
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
}

impl LogSink {
    /// Open (or create) the log file at `path` in append mode.
    pub async fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path: Some(path),
            file: Mutex::new(Some(file)),
        })
    }

    /// A sink that discards everything.
    pub fn discard() -> Self {
        Self {
            path: None,
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock().await;
        match file.as_mut() {
            Some(f) => f.write_all(bytes).await,
            None => Ok(()),
        }
    }

    /// Flush and release the file handle.
    pub async fn close(&self) -> io::Result<()> {
        let file = self.file.lock().await.take();
        match file {
            Some(mut f) => f.flush().await,
            None => Ok(()),
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.file.lock().await.is_none()
    }
}

/// Stream the lines of a log file as it is now.
pub async fn read_lines(path: &Path) -> io::Result<LogStream> {
    let file = File::open(path).await?;
    let stream = lossy_lines(BufReader::new(file)).map(|line| {
        line.map_err(|e| Status::internal(format!("failed to read log line: {e}")))
    });
    Ok(Box::pin(stream))
}

/// Split `reader` into lines without the trailing `\n` or `\r\n`.
///
/// Bytes that are not valid UTF-8 are replaced with U+FFFD instead of failing
/// the line. The stream ends after the first read error.
pub fn lossy_lines<R>(reader: R) -> impl Stream<Item = io::Result<String>> + Send
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    stream::unfold(Some(reader), |reader| async move {
        let mut reader = reader?;
        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => None,
            Ok(_) => {
                if buf.ends_with(b"\n") {
                    buf.pop();
                    if buf.ends_with(b"\r") {
                        buf.pop();
                    }
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                Some((Ok(line), Some(reader)))
            }
            Err(e) => Some((Err(e), None)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_read_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("vol-a-r-0.log");

        let sink = LogSink::open(&path).await.unwrap();
        sink.write(b"starting replica\n").await.unwrap();
        sink.write(b"listening on 10000\n").await.unwrap();
        sink.close().await.unwrap();

        let lines: Vec<String> = read_lines(&path)
            .await
            .unwrap()
            .map(|l| l.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["starting replica", "listening on 10000"]);
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_does_not_end_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol-a-e-0.log");
        tokio::fs::write(&path, b"first\n\xff\xfe binary\r\nthird\nno newline")
            .await
            .unwrap();

        let lines: Vec<String> = read_lines(&path)
            .await
            .unwrap()
            .map(|l| l.unwrap())
            .collect()
            .await;
        assert_eq!(
            lines,
            vec!["first", "\u{FFFD}\u{FFFD} binary", "third", "no newline"]
        );
    }

    #[tokio::test]
    async fn test_closed_sink_drops_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.log");

        let sink = LogSink::open(&path).await.unwrap();
        sink.close().await.unwrap();
        assert!(sink.is_closed().await);
        sink.write(b"late\n").await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(contents.is_empty());
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_lines(&dir.path().join("nope.log")).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
