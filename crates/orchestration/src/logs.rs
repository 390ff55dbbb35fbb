//! Per-task log files: rotation, the output-draining worker and tail reads.

use chrono::Local;
use std::borrow::Cow;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::types::LogLine;

/// `<data_dir>/<device_id>/logs`
pub fn log_dir(data_dir: &Path, device_id: &str) -> PathBuf {
    data_dir.join(device_id).join("logs")
}

pub fn log_path(dir: &Path, task_id: &str) -> PathBuf {
    dir.join(format!("{task_id}.log"))
}

pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".old");
    name.into()
}

/// Ensure the log directory exists and rotate `path` when it exceeds `threshold` bytes.
///
/// Exactly one `.old` generation is kept. Returns true when a rotation happened.
pub async fn prepare(path: &Path, threshold: u64) -> io::Result<bool> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).await?;
    }
    let size = match fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    if size <= threshold {
        return Ok(false);
    }
    let backup = backup_path(path);
    match fs::remove_file(&backup).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    fs::rename(path, &backup).await?;
    debug!(path = %path.display(), size, "rotated task log");
    Ok(true)
}

/// Decode one raw output line: UTF-8, then GBK, then lossy UTF-8.
pub fn decode_line(raw: &[u8]) -> Cow<'_, str> {
    if let Ok(text) = std::str::from_utf8(raw) {
        return Cow::Borrowed(text);
    }
    if let Some(text) = encoding_rs::GBK.decode_without_bom_handling_and_without_replacement(raw) {
        return text;
    }
    String::from_utf8_lossy(raw)
}

fn trim_line_ending(raw: &[u8]) -> &[u8] {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    raw.strip_suffix(b"\r").unwrap_or(raw)
}

/// Header written at the top of every run.
#[derive(Debug, Clone)]
pub struct RunHeader {
    pub argv: Vec<String>,
    pub cwd: Option<String>,
}

impl RunHeader {
    fn render(&self) -> String {
        format!(
            "\n--- Starting task at {} ---\nCommand: {:?}\nCWD: {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            self.argv,
            self.cwd.as_deref().unwrap_or("-"),
        )
    }
}

/// Forward raw lines from one child pipe into the writer channel.
pub fn spawn_pump<R>(reader: R, tx: mpsc::Sender<Vec<u8>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        loop {
            let mut buf = Vec::new();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(buf).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!(error = %err, "output pipe closed with error");
                    break;
                }
            }
        }
    })
}

/// Sole writer of a task's current log file for one run.
///
/// Writes the header, then appends and flushes every line received until
/// all pumps have hung up. Each decoded line is also offered to `sink`;
/// a full sink drops the live copy, never the file copy.
pub async fn run_writer(
    task_id: String,
    path: PathBuf,
    header: RunHeader,
    mut lines: mpsc::Receiver<Vec<u8>>,
    sink: Option<mpsc::Sender<LogLine>>,
) {
    let mut file = match OpenOptions::new().create(true).append(true).open(&path).await {
        Ok(file) => Some(file),
        Err(err) => {
            warn!(%task_id, path = %path.display(), error = %err, "cannot open task log");
            None
        }
    };

    if let Some(handle) = file.as_mut() {
        if let Err(err) = write_flush(handle, header.render().as_bytes()).await {
            warn!(%task_id, error = %err, "failed to write log header");
        }
    }

    while let Some(raw) = lines.recv().await {
        let text = decode_line(trim_line_ending(&raw)).into_owned();

        if let Some(handle) = file.as_mut() {
            let mut record = text.clone().into_bytes();
            record.push(b'\n');
            if let Err(err) = write_flush(handle, &record).await {
                warn!(%task_id, error = %err, "failed to append to task log");
                file = None;
            }
        }

        if let Some(sink) = &sink {
            match sink.try_send(LogLine {
                task_id: task_id.clone(),
                line: text,
            }) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => debug!(%task_id, "live log channel full, line dropped"),
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }
    debug!(%task_id, "log writer finished");
}

async fn write_flush(file: &mut fs::File, bytes: &[u8]) -> io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await
}

/// Last `n` lines of the log at `path`. A missing file yields no lines.
pub async fn tail(path: &Path, n: usize) -> io::Result<Vec<String>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].iter().map(|line| line.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn decodes_gbk_when_not_utf8() {
        // "中文" in GBK
        let raw = [0xD6, 0xD0, 0xCE, 0xC4];
        assert_eq!(decode_line(&raw), "中文");
        assert_eq!(decode_line("plain".as_bytes()), "plain");
    }

    #[test]
    fn undecodable_bytes_fall_back_to_replacement() {
        let raw = [b'o', b'k', 0xFF];
        assert!(decode_line(&raw).starts_with("ok"));
    }

    #[tokio::test]
    async fn rotation_keeps_single_backup() {
        let dir = TempDir::new().unwrap();
        let path = log_path(dir.path(), "job");

        assert!(!prepare(&path, 8).await.unwrap());

        std::fs::write(&path, b"first generation").unwrap();
        assert!(prepare(&path, 8).await.unwrap());
        assert!(!path.exists());

        std::fs::write(&path, b"second generation").unwrap();
        assert!(prepare(&path, 8).await.unwrap());
        let backup = std::fs::read_to_string(backup_path(&path)).unwrap();
        assert_eq!(backup, "second generation");

        std::fs::write(&path, b"tiny").unwrap();
        assert!(!prepare(&path, 8).await.unwrap());
    }

    #[tokio::test]
    async fn writer_emits_header_then_lines() {
        let dir = TempDir::new().unwrap();
        let path = log_path(dir.path(), "job");
        let (tx, rx) = mpsc::channel(8);
        let (sink_tx, mut sink_rx) = mpsc::channel(8);

        tx.send(b"hello\n".to_vec()).await.unwrap();
        tx.send(b"world\r\n".to_vec()).await.unwrap();
        drop(tx);

        run_writer(
            "job".into(),
            path.clone(),
            RunHeader {
                argv: vec!["echo".into(), "hello".into()],
                cwd: None,
            },
            rx,
            Some(sink_tx),
        )
        .await;

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("--- Starting task at"));
        assert!(content.contains("Command: [\"echo\", \"hello\"]"));
        assert!(content.ends_with("hello\nworld\n"));

        assert_eq!(sink_rx.recv().await.unwrap().line, "hello");
        assert_eq!(sink_rx.recv().await.unwrap().line, "world");
    }

    #[tokio::test]
    async fn tail_returns_last_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.log");
        assert!(tail(&path, 5).await.unwrap().is_empty());

        std::fs::write(&path, "a\nb\nc\nd\n").unwrap();
        assert_eq!(tail(&path, 2).await.unwrap(), vec!["c", "d"]);
        assert_eq!(tail(&path, 10).await.unwrap().len(), 4);
    }
}
